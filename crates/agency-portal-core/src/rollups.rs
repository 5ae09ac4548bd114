use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{Cents, PortalRecord};

/// Total and count of records sharing one value of a categorical field.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Rollup {
    pub key: String,
    pub total: Cents,
    pub records: u64,
}

/// Group by `field` and sum amounts, largest total first. Records without the field
/// are skipped; a missing amount adds nothing but still counts.
#[must_use]
pub fn rollup_by<'a>(records: impl IntoIterator<Item = &'a PortalRecord>, field: &str) -> Vec<Rollup> {
    let mut groups: BTreeMap<String, (Cents, u64)> = BTreeMap::new();
    for record in records {
        let Some(key) = record.text(field) else {
            continue;
        };
        let entry = groups.entry(key).or_insert((Cents::ZERO, 0));
        entry.0 = entry.0.saturating_add(record.amount.unwrap_or(Cents::ZERO));
        entry.1 += 1;
    }
    let mut rollups = groups
        .into_iter()
        .map(|(key, (total, records))| Rollup { key, total, records })
        .collect::<Vec<_>>();
    rollups.sort_by(|lhs, rhs| rhs.total.cmp(&lhs.total).then_with(|| lhs.key.cmp(&rhs.key)));
    rollups
}

/// Every configured rollup of a view, keyed by field.
#[must_use]
pub fn compute_rollups(records: &[PortalRecord], fields: &[String]) -> BTreeMap<String, Vec<Rollup>> {
    fields.iter().map(|field| (field.clone(), rollup_by(records, field))).collect()
}
