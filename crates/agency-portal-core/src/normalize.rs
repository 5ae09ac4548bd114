//! Fetch-boundary adapter: turns raw per-tenant payloads into [`PortalRecord`]s and
//! canonical summary labels.
//!
//! Fallback table applied to every raw row:
//!
//! | raw input | normalized |
//! |---|---|
//! | `id` string or integer | `record_id`; row skipped when absent or blank |
//! | `amount`, `totalAmount`, `total` | `amount` in cents; unparseable → absent |
//! | `created_at`, `createdAt`, `created`, `creationDate` | `created_at`; RFC 3339 or epoch millis |
//! | camelCase keys | snake_case keys (`agentName` → `agent_name`) |
//! | `carrierName`, `statusLabel`, `isLocked` | `carrier`, `status`, `locked` |
//! | keys ending `_amount` | money |
//! | keys ending `_at` / `_date` | timestamp when parseable, text otherwise |
//! | `status` text | canonical label via [`canonical_status_label`] |
//! | `null`, arrays, objects | dropped (treated as absent) |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::model::{
    Cents, CategorySummary, FieldValue, PortalRecord, SummaryDimension, SummaryReport,
    FIELD_AMOUNT, FIELD_CREATED_AT,
};
use crate::tenancy::TenantId;

const AMOUNT_ALIASES: [&str; 3] = ["amount", "total_amount", "total"];
const CREATED_AT_ALIASES: [&str; 3] = ["created_at", "created", "creation_date"];
const KEY_ALIASES: [(&str, &str); 4] = [
    ("carrier_name", "carrier"),
    ("status_label", "status"),
    ("status_name", "status"),
    ("is_locked", "locked"),
];
const STATUS_LABELS: [(&str, &str); 11] = [
    ("paid", "Paid"),
    ("pending", "Pending"),
    ("in_process", "Pending"),
    ("cancelled", "Cancelled"),
    ("canceled", "Cancelled"),
    ("chargeback", "Chargeback"),
    ("active", "Active"),
    ("inactive", "Inactive"),
    ("lapsed", "Lapsed"),
    ("open", "Open"),
    ("settled", "Settled"),
];

pub const UNKNOWN_LABEL: &str = "Unknown";

/// Why a raw row was not turned into a record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SkippedRow {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NormalizeOutcome {
    pub records: Vec<PortalRecord>,
    pub skipped: Vec<SkippedRow>,
}

/// Canonical status label; unknown statuses keep their trimmed text.
#[must_use]
pub fn canonical_status_label(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return UNKNOWN_LABEL.to_string();
    }
    let key = trimmed.to_ascii_lowercase().replace([' ', '-'], "_");
    STATUS_LABELS
        .iter()
        .find(|(alias, _)| *alias == key)
        .map_or_else(|| trimmed.to_string(), |(_, label)| (*label).to_string())
}

/// Canonicalize labels of a tenant summary so that merge keys line up across tenants.
#[must_use]
pub fn normalize_summary(report: SummaryReport) -> SummaryReport {
    report
        .into_iter()
        .map(|(dimension, entries)| {
            let entries = entries
                .into_iter()
                .map(|entry| CategorySummary {
                    label: normalize_label(dimension, &entry.label),
                    ..entry
                })
                .collect();
            (dimension, entries)
        })
        .collect()
}

fn normalize_label(dimension: SummaryDimension, raw: &str) -> String {
    match dimension {
        SummaryDimension::Status => canonical_status_label(raw),
        SummaryDimension::Carrier | SummaryDimension::Agent => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                UNKNOWN_LABEL.to_string()
            } else {
                trimmed.to_string()
            }
        }
    }
}

/// Normalize one tenant's raw rows. Never fails: malformed rows are skipped with a
/// reason and malformed fields are dropped.
#[must_use]
pub fn normalize_records(tenant_id: &TenantId, rows: &[Value]) -> NormalizeOutcome {
    let mut outcome = NormalizeOutcome::default();
    for (index, row) in rows.iter().enumerate() {
        let Value::Object(object) = row else {
            outcome.skipped.push(SkippedRow { index, reason: "row is not an object".to_string() });
            continue;
        };
        match normalize_row(tenant_id, object) {
            Ok(record) => outcome.records.push(record),
            Err(reason) => outcome.skipped.push(SkippedRow { index, reason }),
        }
    }
    outcome
}

fn normalize_row(tenant_id: &TenantId, object: &Map<String, Value>) -> Result<PortalRecord, String> {
    let record_id = match object.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err("missing record id".to_string()),
    };
    let mut record = PortalRecord::new(tenant_id.clone(), record_id);

    for (raw_key, value) in object {
        let key = canonical_key(raw_key);
        if key == "id" {
            continue;
        }
        if AMOUNT_ALIASES.contains(&key.as_str()) {
            if record.amount.is_none() {
                record.amount = money(value);
            }
            continue;
        }
        if CREATED_AT_ALIASES.contains(&key.as_str()) {
            if record.created_at.is_none() {
                record.created_at = timestamp(value);
            }
            continue;
        }
        if key == FIELD_AMOUNT || key == FIELD_CREATED_AT {
            continue;
        }
        if let Some(field) = field_value(&key, value) {
            record.fields.insert(key, field);
        }
    }
    Ok(record)
}

fn canonical_key(raw: &str) -> String {
    let snake = to_snake_case(raw.trim());
    KEY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == snake)
        .map_or(snake, |(_, canonical)| (*canonical).to_string())
}

fn to_snake_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut previous_lower = false;
    for ch in raw.chars() {
        if ch.is_ascii_uppercase() {
            if previous_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            previous_lower = false;
        } else if ch == '-' || ch == ' ' {
            out.push('_');
            previous_lower = false;
        } else {
            out.push(ch);
            previous_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

fn field_value(key: &str, value: &Value) -> Option<FieldValue> {
    if key.ends_with("_amount") {
        return money(value).map(FieldValue::Money);
    }
    if key.ends_with("_at") || key.ends_with("_date") {
        if let Some(at) = timestamp(value) {
            return Some(FieldValue::Timestamp(at));
        }
    }
    match value {
        Value::String(text) if key == "status" => {
            Some(FieldValue::Text(canonical_status_label(text)))
        }
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| FieldValue::Text(trimmed.to_string()))
        }
        Value::Number(number) => number.as_f64().map(FieldValue::Number),
        Value::Bool(flag) => Some(FieldValue::Flag(*flag)),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn money(value: &Value) -> Option<Cents> {
    match value {
        Value::Number(number) => number.as_f64().filter(|v| v.is_finite()).map(Cents::from_major),
        Value::String(text) => {
            let cleaned: String =
                text.trim().chars().filter(|ch| !matches!(ch, '$' | ',' | ' ')).collect();
            cleaned.parse::<f64>().ok().filter(|v| v.is_finite()).map(Cents::from_major)
        }
        _ => None,
    }
}

fn timestamp(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::String(text) => OffsetDateTime::parse(text.trim(), &Rfc3339).ok(),
        Value::Number(number) => number
            .as_i64()
            .and_then(|millis| {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn status_labels_fold_into_canonical_forms() {
        assert_eq!(canonical_status_label(" PAID "), "Paid");
        assert_eq!(canonical_status_label("canceled"), "Cancelled");
        assert_eq!(canonical_status_label("In Process"), "Pending");
        assert_eq!(canonical_status_label("Under review"), "Under review");
        assert_eq!(canonical_status_label(""), UNKNOWN_LABEL);
    }

    #[test]
    fn rows_without_id_are_skipped_not_fatal() {
        let tenant = TenantId::new("north");
        let outcome = normalize_records(
            &tenant,
            &[json!({"amount": 10}), json!("garbage"), json!({"id": 7, "amount": "1,250.50"})],
        );
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.skipped.len(), 2);
        assert_eq!(outcome.skipped[0].reason, "missing record id");
        assert_eq!(outcome.records[0].record_id, "7");
        assert_eq!(outcome.records[0].amount, Some(Cents(125_050)));
    }

    #[test]
    fn aliases_and_types_are_normalized() {
        let tenant = TenantId::new("north");
        let outcome = normalize_records(
            &tenant,
            &[json!({
                "id": "c-1",
                "createdAt": "2026-02-03T10:00:00Z",
                "clientName": "  Ada Lovelace ",
                "carrierName": "Acme Life",
                "statusLabel": "pending",
                "isLocked": true,
                "commissionAmount": 12.5,
                "effectiveDate": 1_767_225_600_000_i64,
                "notes": null,
                "tags": ["a"]
            })],
        );
        let Some(record) = outcome.records.first() else {
            panic!("row should normalize");
        };
        assert_eq!(record.created_at, Some(datetime!(2026-02-03 10:00 UTC)));
        assert_eq!(record.text("client_name").as_deref(), Some("Ada Lovelace"));
        assert_eq!(record.text("carrier").as_deref(), Some("Acme Life"));
        assert_eq!(record.text("status").as_deref(), Some("Pending"));
        assert_eq!(record.value("locked"), Some(FieldValue::Flag(true)));
        assert_eq!(record.value("commission_amount"), Some(FieldValue::Money(Cents(1_250))));
        assert_eq!(
            record.value("effective_date"),
            Some(FieldValue::Timestamp(datetime!(2026-01-01 00:00 UTC)))
        );
        assert!(record.value("notes").is_none());
        assert!(record.value("tags").is_none());
    }

    #[test]
    fn unparseable_amount_is_absent() {
        let tenant = TenantId::new("north");
        let outcome = normalize_records(&tenant, &[json!({"id": "x", "amount": "n/a"})]);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].amount, None);
    }

    #[test]
    fn summary_labels_are_canonicalized_per_dimension() {
        let mut report = SummaryReport::new();
        report.insert(
            SummaryDimension::Status,
            vec![CategorySummary {
                id: "1".to_string(),
                label: "paid".to_string(),
                total: Cents(100),
                records: 1,
            }],
        );
        report.insert(
            SummaryDimension::Carrier,
            vec![CategorySummary {
                id: "9".to_string(),
                label: " Acme ".to_string(),
                total: Cents(100),
                records: 1,
            }],
        );
        let normalized = normalize_summary(report);
        assert_eq!(normalized[&SummaryDimension::Status][0].label, "Paid");
        assert_eq!(normalized[&SummaryDimension::Carrier][0].label, "Acme");
    }
}
