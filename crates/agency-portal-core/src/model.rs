use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::tenancy::TenantId;

/// Monetary amount in minor units (cents).
///
/// JSON carries amounts as decimal numbers; conversion rounds `value * 100` so that
/// summing across tenants is exact and order independent.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(from = "f64", into = "f64")]
pub struct Cents(pub i64);

impl Cents {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn from_major(value: f64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let cents = (value * 100.0).round() as i64;
        Self(cents)
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_major(self) -> f64 {
        self.0 as f64 / 100.0
    }

    #[must_use]
    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl From<f64> for Cents {
    fn from(value: f64) -> Self {
        Self::from_major(value)
    }
}

impl From<Cents> for f64 {
    fn from(value: Cents) -> Self {
        value.as_major()
    }
}

impl std::iter::Sum for Cents {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Self::saturating_add)
    }
}

impl Display for Cents {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// Summary dimension reported by a tenant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SummaryDimension {
    Status,
    Carrier,
    Agent,
}

impl SummaryDimension {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Carrier => "carrier",
            Self::Agent => "agent",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "status" => Some(Self::Status),
            "carrier" => Some(Self::Carrier),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategorySummary {
    pub id: String,
    pub label: String,
    pub total: Cents,
    pub records: u64,
}

/// Per-dimension category summaries for one tenant, or merged across tenants.
pub type SummaryReport = BTreeMap<SummaryDimension, Vec<CategorySummary>>;

/// Result payload tagged with the tenant it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantBatch<T> {
    pub tenant_id: TenantId,
    pub payload: T,
}

impl<T> TenantBatch<T> {
    #[must_use]
    pub fn new(tenant_id: TenantId, payload: T) -> Self {
        Self { tenant_id, payload }
    }
}

/// Selection-safe identity of a merged record: `tenantId:recordId`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordKey(pub String);

impl RecordKey {
    #[must_use]
    pub fn qualified(tenant_id: &TenantId, record_id: &str) -> Self {
        Self(format!("{}:{record_id}", tenant_id.as_str()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scalar attribute of a normalized record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Money(Cents),
    #[serde(with = "time::serde::rfc3339")]
    Timestamp(OffsetDateTime),
    Flag(bool),
}

impl FieldValue {
    /// Numeric view used by range filters. Timestamps map to unix milliseconds, money to
    /// major units, text is parsed as a number and then as an RFC 3339 timestamp.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => value.is_finite().then_some(*value),
            Self::Money(cents) => Some(cents.as_major()),
            Self::Timestamp(at) => Some(unix_millis_f64(*at)),
            Self::Text(text) => {
                let trimmed = text.trim();
                if let Ok(value) = trimmed.parse::<f64>() {
                    return value.is_finite().then_some(value);
                }
                OffsetDateTime::parse(trimmed, &time::format_description::well_known::Rfc3339)
                    .ok()
                    .map(unix_millis_f64)
            }
            Self::Flag(_) => None,
        }
    }

    #[must_use]
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(value) => Some(*value),
            Self::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            Self::Number(value) => Some(*value != 0.0),
            Self::Money(_) | Self::Timestamp(_) => None,
        }
    }

    /// Display form used for facet matching and search.
    #[must_use]
    pub fn display_value(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Number(value) => value.to_string(),
            Self::Money(cents) => cents.to_string(),
            Self::Timestamp(at) => at
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| at.unix_timestamp().to_string()),
            Self::Flag(value) => value.to_string(),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Self::Flag(_) => 0,
            Self::Number(_) | Self::Money(_) => 1,
            Self::Timestamp(_) => 2,
            Self::Text(_) => 3,
        }
    }

    /// Natural ordering per value type; values of unrelated types order by type.
    #[must_use]
    pub fn natural_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Text(lhs), Self::Text(rhs)) => lhs.cmp(rhs),
            (Self::Money(lhs), Self::Money(rhs)) => lhs.cmp(rhs),
            (Self::Timestamp(lhs), Self::Timestamp(rhs)) => lhs.cmp(rhs),
            (Self::Flag(lhs), Self::Flag(rhs)) => lhs.cmp(rhs),
            (Self::Number(_) | Self::Money(_), Self::Number(_) | Self::Money(_)) => {
                let lhs = self.as_number().unwrap_or(f64::NAN);
                let rhs = other.as_number().unwrap_or(f64::NAN);
                lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal)
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn unix_millis_f64(at: OffsetDateTime) -> f64 {
    (at.unix_timestamp_nanos() / 1_000_000) as f64
}

/// Reserved field names resolved from the typed columns of [`PortalRecord`].
pub const FIELD_AMOUNT: &str = "amount";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_ORIGIN_TENANT: &str = "origin_tenant_name";
pub const FIELD_ID: &str = "id";

/// One commission, debt or policy row after normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortalRecord {
    pub key: RecordKey,
    pub record_id: String,
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_tenant_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Cents>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl PortalRecord {
    #[must_use]
    pub fn new(tenant_id: TenantId, record_id: impl Into<String>) -> Self {
        let record_id = record_id.into();
        Self {
            key: RecordKey::qualified(&tenant_id, &record_id),
            record_id,
            tenant_id,
            origin_tenant_name: None,
            amount: None,
            created_at: None,
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_amount(mut self, amount: Cents) -> Self {
        self.amount = Some(amount);
        self
    }

    #[must_use]
    pub fn with_created_at(mut self, created_at: OffsetDateTime) -> Self {
        self.created_at = Some(created_at);
        self
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_field(name, FieldValue::Text(value.into()))
    }

    /// Resolve a field by name, covering the typed columns and the attribute map.
    #[must_use]
    pub fn value(&self, field: &str) -> Option<FieldValue> {
        match field {
            FIELD_AMOUNT => self.amount.map(FieldValue::Money),
            FIELD_CREATED_AT => self.created_at.map(FieldValue::Timestamp),
            FIELD_ORIGIN_TENANT => self.origin_tenant_name.clone().map(FieldValue::Text),
            FIELD_ID => Some(FieldValue::Text(self.record_id.clone())),
            _ => self.fields.get(field).cloned(),
        }
    }

    /// String view of a field for search and facet matching.
    #[must_use]
    pub fn text(&self, field: &str) -> Option<String> {
        match field {
            FIELD_ORIGIN_TENANT => self.origin_tenant_name.clone(),
            FIELD_ID => Some(self.record_id.clone()),
            _ => self.value(field).map(|value| value.display_value()),
        }
    }
}
