use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::model::{CategorySummary, PortalRecord, RecordKey, SummaryReport, TenantBatch};
use crate::tenancy::TenantId;

/// Field deciding that two per-tenant summary entries are the same category.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MergeKey {
    /// Display label. Ids are only tenant-local, labels are canonical.
    #[default]
    Label,
    /// Category id, for backends that guarantee globally stable ids.
    Id,
}

impl MergeKey {
    fn key_of(self, entry: &CategorySummary) -> &str {
        match self {
            Self::Label => &entry.label,
            Self::Id => &entry.id,
        }
    }
}

/// Merge per-tenant category summaries by label.
///
/// Totals and record counts are summed; the id of the first tenant reporting a label
/// wins; output keeps first-appearance order.
#[must_use]
pub fn merge_summaries(results: &[Vec<CategorySummary>]) -> Vec<CategorySummary> {
    merge_summaries_by(results, MergeKey::Label)
}

#[must_use]
pub fn merge_summaries_by(results: &[Vec<CategorySummary>], key: MergeKey) -> Vec<CategorySummary> {
    let mut merged: Vec<CategorySummary> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for entries in results {
        for entry in entries {
            let merge_key = key.key_of(entry);
            if let Some(&position) = positions.get(merge_key) {
                let accumulator = &mut merged[position];
                accumulator.total = accumulator.total.saturating_add(entry.total);
                accumulator.records = accumulator.records.saturating_add(entry.records);
            } else {
                positions.insert(merge_key.to_string(), merged.len());
                merged.push(entry.clone());
            }
        }
    }

    merged
}

/// Merge whole per-dimension reports. A dimension absent from every tenant is absent
/// from the result.
#[must_use]
pub fn merge_reports(reports: &[SummaryReport], key: MergeKey) -> SummaryReport {
    let mut by_dimension: BTreeMap<_, Vec<Vec<CategorySummary>>> = BTreeMap::new();
    for report in reports {
        for (dimension, entries) in report {
            by_dimension.entry(*dimension).or_default().push(entries.clone());
        }
    }
    by_dimension
        .into_iter()
        .map(|(dimension, results)| (dimension, merge_summaries_by(&results, key)))
        .collect()
}

/// Concatenate per-tenant records, tagging each with its tenant's display name and a
/// tenant-qualified key. No dedup: a record belongs to exactly one tenant.
#[must_use]
pub fn merge_records(
    batches: Vec<TenantBatch<Vec<PortalRecord>>>,
    tenant_names: &BTreeMap<TenantId, String>,
) -> Vec<PortalRecord> {
    let capacity = batches.iter().map(|batch| batch.payload.len()).sum();
    let mut merged = Vec::with_capacity(capacity);
    for batch in batches {
        let name = tenant_names.get(&batch.tenant_id).cloned();
        for mut record in batch.payload {
            record.key = RecordKey::qualified(&batch.tenant_id, &record.record_id);
            record.tenant_id = batch.tenant_id.clone();
            record.origin_tenant_name.clone_from(&name);
            merged.push(record);
        }
    }
    merged
}
