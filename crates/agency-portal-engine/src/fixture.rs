//! JSON-file backed tenant backend for local runs and tests.
//!
//! A summary is either one report that holds for any date range, or a list of
//! calendar periods; a fetch then sums every period overlapping the range.
//!
//! ```json
//! {
//!   "tenants": [{ "id": "north", "name": "North Agency", "features": ["commissions"] }],
//!   "summaries": {
//!     "north": { "commissions": { "status": [{ "id": "1", "label": "Paid", "total": 100.0, "records": 2 }] } },
//!     "south": { "commissions": [{ "from": "2026-03-01", "to": "2026-03-31", "report": { "status": [] } }] }
//!   },
//!   "records": { "north": { "commissions": [{ "id": "c-1", "amount": 50.0, "created_at": "2026-03-02T10:00:00Z" }] } },
//!   "failing_tenants": ["south"],
//!   "read_only_tenants": ["west"]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use agency_portal_core::{
    merge_reports, DateRange, FeatureKey, MergeKey, QueryContext, SummaryReport, Tenant, TenantId,
    ViewKind,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime};

use crate::error::{EngineError, SourceError};
use crate::source::{AccessGrant, TenantDataSource};

const CREATED_KEYS: [&str; 4] = ["created_at", "createdAt", "created", "creationDate"];
const CATEGORY_KEYS: [&str; 4] = ["category_id", "categoryId", "status_id", "statusId"];

time::serde::format_description!(calendar_day, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, Deserialize)]
struct RawTenant {
    id: String,
    name: String,
    #[serde(default)]
    features: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FixtureSummary {
    Periods(Vec<SummaryPeriod>),
    Report(SummaryReport),
}

#[derive(Debug, Clone, Deserialize)]
struct SummaryPeriod {
    #[serde(with = "calendar_day")]
    from: Date,
    #[serde(with = "calendar_day")]
    to: Date,
    report: SummaryReport,
}

impl SummaryPeriod {
    fn overlaps(&self, range: &DateRange) -> bool {
        DateRange::for_days(self.from, self.to, range.start.offset())
            .is_ok_and(|period| period.start <= range.end && period.end >= range.start)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FixtureData {
    tenants: Vec<RawTenant>,
    summaries: BTreeMap<String, BTreeMap<ViewKind, FixtureSummary>>,
    records: BTreeMap<String, BTreeMap<ViewKind, Vec<Value>>>,
    failing_tenants: BTreeSet<String>,
    read_only_tenants: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct FixtureSource {
    data: Mutex<FixtureData>,
}

impl FixtureSource {
    /// # Errors
    /// Returns [`EngineError::Validation`] when the document is not a valid fixture.
    pub fn from_json_str(raw: &str) -> Result<Self, EngineError> {
        let data: FixtureData = serde_json::from_str(raw)
            .map_err(|err| EngineError::Validation(format!("invalid fixture: {err}")))?;
        let reversed = data
            .summaries
            .values()
            .flat_map(BTreeMap::values)
            .filter_map(|summary| match summary {
                FixtureSummary::Periods(periods) => Some(periods),
                FixtureSummary::Report(_) => None,
            })
            .flatten()
            .find(|period| period.from > period.to);
        if let Some(period) = reversed {
            return Err(EngineError::Validation(format!(
                "invalid fixture: summary period {} ends before it starts",
                period.from
            )));
        }
        Ok(Self { data: Mutex::new(data) })
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Validation(format!("failed to read fixture {}: {err}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Tenant grant with unknown feature strings ignored.
    #[must_use]
    pub fn catalog(&self) -> Vec<Tenant> {
        self.data
            .lock()
            .tenants
            .iter()
            .map(|raw| {
                Tenant::new(
                    raw.id.clone(),
                    raw.name.clone(),
                    raw.features.iter().filter_map(|feature| FeatureKey::parse(feature)),
                )
            })
            .collect()
    }

    /// Make every fetch for `tenant` fail from now on.
    pub fn fail_tenant(&self, tenant: &TenantId) {
        self.data.lock().failing_tenants.insert(tenant.to_string());
    }

    pub fn restore_tenant(&self, tenant: &TenantId) {
        self.data.lock().failing_tenants.remove(tenant.as_str());
    }

    /// Replace the raw rows one tenant serves for `view`.
    pub fn set_records(&self, tenant: &TenantId, view: ViewKind, rows: Vec<Value>) {
        self.data.lock().records.entry(tenant.to_string()).or_default().insert(view, rows);
    }

    fn ensure_reachable(data: &FixtureData, tenant: &TenantId) -> Result<(), SourceError> {
        if data.failing_tenants.contains(tenant.as_str()) {
            return Err(SourceError::Unavailable(format!("tenant {tenant} is unreachable")));
        }
        Ok(())
    }

    fn ensure_writable(data: &FixtureData, tenant: &TenantId) -> Result<(), SourceError> {
        Self::ensure_reachable(data, tenant)?;
        if data.read_only_tenants.contains(tenant.as_str()) {
            return Err(SourceError::Unauthorized(format!("tenant {tenant} is read-only")));
        }
        Ok(())
    }

    fn summary_for(
        &self,
        tenant: &TenantId,
        view: ViewKind,
        range: &DateRange,
    ) -> Result<SummaryReport, SourceError> {
        let data = self.data.lock();
        Self::ensure_reachable(&data, tenant)?;
        let summary = data.summaries.get(tenant.as_str()).and_then(|views| views.get(&view));
        Ok(match summary {
            None => SummaryReport::new(),
            Some(FixtureSummary::Report(report)) => report.clone(),
            Some(FixtureSummary::Periods(periods)) => {
                let reports = periods
                    .iter()
                    .filter(|period| period.overlaps(range))
                    .map(|period| period.report.clone())
                    .collect::<Vec<_>>();
                merge_reports(&reports, MergeKey::Id)
            }
        })
    }

    fn records_for(
        &self,
        tenant: &TenantId,
        view: ViewKind,
        context: &QueryContext,
    ) -> Result<Vec<Value>, SourceError> {
        let data = self.data.lock();
        Self::ensure_reachable(&data, tenant)?;
        Ok(data
            .records
            .get(tenant.as_str())
            .and_then(|views| views.get(&view))
            .map(|rows| rows.iter().filter(|row| row_in_context(row, context)).cloned().collect())
            .unwrap_or_default())
    }

    fn remove_row(&self, tenant: &TenantId, view: ViewKind, record_id: &str) -> Result<(), SourceError> {
        let mut data = self.data.lock();
        Self::ensure_writable(&data, tenant)?;
        let rows = data
            .records
            .get_mut(tenant.as_str())
            .and_then(|views| views.get_mut(&view))
            .ok_or_else(|| SourceError::NotFound(format!("record {record_id}")))?;
        let position = rows
            .iter()
            .position(|row| row_id(row).as_deref() == Some(record_id))
            .ok_or_else(|| SourceError::NotFound(format!("record {record_id}")))?;
        rows.remove(position);
        Ok(())
    }

    fn patch_row(
        &self,
        tenant: &TenantId,
        view: ViewKind,
        record_id: &str,
        patch: &Map<String, Value>,
    ) -> Result<(), SourceError> {
        if patch.contains_key("id") {
            return Err(SourceError::Rejected("record id cannot be changed".to_string()));
        }
        let mut data = self.data.lock();
        Self::ensure_writable(&data, tenant)?;
        let row = data
            .records
            .get_mut(tenant.as_str())
            .and_then(|views| views.get_mut(&view))
            .and_then(|rows| rows.iter_mut().find(|row| row_id(row).as_deref() == Some(record_id)))
            .ok_or_else(|| SourceError::NotFound(format!("record {record_id}")))?;
        let Value::Object(object) = row else {
            return Err(SourceError::Rejected(format!("record {record_id} is not an object")));
        };
        for (key, value) in patch {
            object.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

impl TenantDataSource for FixtureSource {
    async fn fetch_summary(
        &self,
        tenant: &TenantId,
        view: ViewKind,
        range: &DateRange,
    ) -> Result<SummaryReport, SourceError> {
        self.summary_for(tenant, view, range)
    }

    async fn fetch_records(
        &self,
        tenant: &TenantId,
        view: ViewKind,
        context: &QueryContext,
    ) -> Result<Vec<Value>, SourceError> {
        self.records_for(tenant, view, context)
    }

    async fn delete_record(
        &self,
        tenant: &TenantId,
        view: ViewKind,
        record_id: &str,
        _reason: &str,
    ) -> Result<(), SourceError> {
        self.remove_row(tenant, view, record_id)
    }

    async fn update_record(
        &self,
        tenant: &TenantId,
        view: ViewKind,
        record_id: &str,
        patch: &Map<String, Value>,
    ) -> Result<(), SourceError> {
        self.patch_row(tenant, view, record_id, patch)
    }
}

impl AccessGrant for FixtureSource {
    async fn tenant_catalog(&self) -> Result<Vec<Tenant>, SourceError> {
        Ok(self.catalog())
    }
}

fn row_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(id) => Some(id.trim().to_string()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Rows without a parseable creation date are served regardless of range; the
/// normalizer decides what to do with them.
fn row_in_context(row: &Value, context: &QueryContext) -> bool {
    let Value::Object(object) = row else {
        return true;
    };
    let created = CREATED_KEYS.iter().find_map(|key| object.get(*key)).and_then(instant);
    if created.is_some_and(|at| !context.range.contains(at)) {
        return false;
    }
    match &context.category_filter {
        None => true,
        Some(category) => CATEGORY_KEYS
            .iter()
            .find_map(|key| object.get(*key))
            .and_then(|value| match value {
                Value::String(id) => Some(id.clone()),
                Value::Number(id) => Some(id.to_string()),
                _ => None,
            })
            .is_some_and(|id| &id == category),
    }
}

fn instant(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::String(text) => OffsetDateTime::parse(text.trim(), &Rfc3339).ok(),
        Value::Number(number) => number
            .as_i64()
            .and_then(|millis| OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::{date, offset};

    use agency_portal_core::{Cents, SummaryDimension};

    use super::*;

    fn fixture() -> FixtureSource {
        let raw = json!({
            "tenants": [
                {"id": "north", "name": "North Agency", "features": ["commissions", "teleportation"]},
                {"id": "west", "name": "West Agency", "features": ["commissions"]}
            ],
            "summaries": {
                "north": {"commissions": {"status": [{"id": "1", "label": "Paid", "total": 10.0, "records": 1}]}}
            },
            "records": {
                "north": {"commissions": [
                    {"id": "c-1", "created_at": "2026-03-02T10:00:00Z", "category_id": 1},
                    {"id": "c-2", "created_at": "2026-04-02T10:00:00Z", "category_id": 2},
                    {"id": "c-3"}
                ]},
                "west": {"commissions": [{"id": 9}]}
            },
            "read_only_tenants": ["west"]
        });
        match FixtureSource::from_json_str(&raw.to_string()) {
            Ok(source) => source,
            Err(err) => panic!("fixture should parse: {err}"),
        }
    }

    fn march() -> QueryContext {
        match DateRange::for_days(date!(2026 - 03 - 01), date!(2026 - 03 - 31), offset!(UTC)) {
            Ok(range) => QueryContext::new(range),
            Err(err) => panic!("range should build: {err}"),
        }
    }

    #[test]
    fn catalog_ignores_unknown_features() {
        let catalog = fixture().catalog();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].features.len(), 1);
        assert!(catalog[0].has_feature(FeatureKey::Commissions));
    }

    #[tokio::test]
    async fn records_are_filtered_by_range_and_category() -> Result<(), SourceError> {
        let source = fixture();
        let north = TenantId::new("north");
        let rows = source.fetch_records(&north, ViewKind::Commissions, &march()).await?;
        assert_eq!(rows.len(), 2);

        let seeded = march().with_category("1");
        let rows = source.fetch_records(&north, ViewKind::Commissions, &seeded).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(row_id(&rows[0]).as_deref(), Some("c-1"));

        let summary = source.fetch_summary(&north, ViewKind::Commissions, &march().range).await?;
        assert_eq!(summary.len(), 1);
        assert!(source.fetch_summary(&north, ViewKind::Debts, &march().range).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn period_summaries_follow_the_requested_range() -> Result<(), SourceError> {
        let raw = json!({
            "tenants": [{"id": "north", "name": "North Agency", "features": ["commissions"]}],
            "summaries": {"north": {"commissions": [
                {"from": "2026-03-01", "to": "2026-03-15",
                 "report": {"status": [{"id": "1", "label": "Paid", "total": 10.0, "records": 1}]}},
                {"from": "2026-03-16", "to": "2026-03-31",
                 "report": {"status": [{"id": "1", "label": "Paid", "total": 5.0, "records": 2}]}},
                {"from": "2026-04-01", "to": "2026-04-30",
                 "report": {"status": [{"id": "2", "label": "Pending", "total": 7.0, "records": 1}]}}
            ]}}
        });
        let source = match FixtureSource::from_json_str(&raw.to_string()) {
            Ok(source) => source,
            Err(err) => panic!("fixture should parse: {err}"),
        };
        let north = TenantId::new("north");

        let summary = source.fetch_summary(&north, ViewKind::Commissions, &march().range).await?;
        let status = &summary[&SummaryDimension::Status];
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].total, Cents(1_500));
        assert_eq!(status[0].records, 3);

        let early = match DateRange::for_days(date!(2026 - 03 - 01), date!(2026 - 03 - 02), offset!(UTC)) {
            Ok(range) => range,
            Err(err) => panic!("range should build: {err}"),
        };
        let summary = source.fetch_summary(&north, ViewKind::Commissions, &early).await?;
        assert_eq!(summary[&SummaryDimension::Status][0].total, Cents(1_000));

        let late = match DateRange::for_days(date!(2026 - 05 - 01), date!(2026 - 05 - 31), offset!(UTC)) {
            Ok(range) => range,
            Err(err) => panic!("range should build: {err}"),
        };
        assert!(source.fetch_summary(&north, ViewKind::Commissions, &late).await?.is_empty());
        Ok(())
    }

    #[test]
    fn reversed_summary_period_is_rejected() {
        let raw = json!({
            "summaries": {"north": {"commissions": [
                {"from": "2026-03-31", "to": "2026-03-01", "report": {}}
            ]}}
        });
        assert!(matches!(
            FixtureSource::from_json_str(&raw.to_string()),
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn mutations_respect_read_only_and_missing_records() -> Result<(), SourceError> {
        let source = fixture();
        let north = TenantId::new("north");
        let west = TenantId::new("west");

        let denied = source.delete_record(&west, ViewKind::Commissions, "9", "dup").await;
        assert!(matches!(denied, Err(SourceError::Unauthorized(_))));

        let missing = source.delete_record(&north, ViewKind::Commissions, "nope", "dup").await;
        assert!(matches!(missing, Err(SourceError::NotFound(_))));

        let mut patch = Map::new();
        patch.insert("status".to_string(), json!("paid"));
        source.update_record(&north, ViewKind::Commissions, "c-3", &patch).await?;
        source.delete_record(&north, ViewKind::Commissions, "c-1", "duplicate").await?;

        let rows = source.fetch_records(&north, ViewKind::Commissions, &march()).await?;
        let ids = rows.iter().filter_map(row_id).collect::<Vec<_>>();
        assert_eq!(ids, vec!["c-3"]);
        assert_eq!(rows[0]["status"], json!("paid"));
        Ok(())
    }

    #[tokio::test]
    async fn failing_tenants_are_unavailable() {
        let source = fixture();
        let north = TenantId::new("north");
        source.fail_tenant(&north);
        let result = source.fetch_records(&north, ViewKind::Commissions, &march()).await;
        assert!(matches!(result, Err(SourceError::Unavailable(_))));
        source.restore_tenant(&north);
        assert!(source.fetch_records(&north, ViewKind::Commissions, &march()).await.is_ok());
    }
}
