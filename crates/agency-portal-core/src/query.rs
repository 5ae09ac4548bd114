use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::PortalError;

/// Inclusive instant range built from whole calendar days.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DateRange {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl DateRange {
    /// Range covering `first` 00:00:00.000 through `last` 23:59:59.999 at `offset`.
    ///
    /// # Errors
    /// Returns [`PortalError::Validation`] when `last` precedes `first`.
    pub fn for_days(first: Date, last: Date, offset: UtcOffset) -> Result<Self, PortalError> {
        if last < first {
            return Err(PortalError::Validation(format!(
                "date range end {last} precedes start {first}"
            )));
        }
        let start = PrimitiveDateTime::new(first, Time::MIDNIGHT).assume_offset(offset);
        let end_of_day = Time::from_hms_milli(23, 59, 59, 999)
            .map_err(|err| PortalError::Validation(format!("invalid end of day: {err}")))?;
        let end = PrimitiveDateTime::new(last, end_of_day).assume_offset(offset);
        Ok(Self { start, end })
    }

    /// Calendar month containing `now` at `offset`.
    ///
    /// # Errors
    /// Returns [`PortalError::Validation`] when the month boundaries cannot be computed.
    pub fn month_of(now: OffsetDateTime, offset: UtcOffset) -> Result<Self, PortalError> {
        let local = now.to_offset(offset).date();
        let first = local
            .replace_day(1)
            .map_err(|err| PortalError::Validation(format!("invalid month start: {err}")))?;
        let next_month_first = if local.month() == time::Month::December {
            Date::from_calendar_date(local.year() + 1, time::Month::January, 1)
        } else {
            Date::from_calendar_date(local.year(), local.month().next(), 1)
        }
        .map_err(|err| PortalError::Validation(format!("invalid month end: {err}")))?;
        Self::for_days(first, next_month_first - Duration::days(1), offset)
    }

    #[must_use]
    pub fn start_ms(&self) -> i64 {
        millis(self.start)
    }

    #[must_use]
    pub fn end_ms(&self) -> i64 {
        millis(self.end)
    }

    #[must_use]
    pub fn contains(&self, at: OffsetDateTime) -> bool {
        self.start <= at && at <= self.end
    }
}

fn millis(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Per-view fetch context: date range plus an optional seeded category filter.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QueryContext {
    pub range: DateRange,
    #[serde(default)]
    pub category_filter: Option<String>,
}

impl QueryContext {
    #[must_use]
    pub fn new(range: DateRange) -> Self {
        Self { range, category_filter: None }
    }

    /// Seed the category filter, as when a summary card on one view opens another.
    #[must_use]
    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        let category_id = category_id.into();
        self.category_filter = (!category_id.trim().is_empty()).then_some(category_id);
        self
    }
}
