use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::pipeline::{SortDirection, SortSpec, ViewConfig, DEFAULT_ROWS_PER_PAGE, MAX_ROWS_PER_PAGE};
use crate::query::DateRange;
use crate::PortalError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TriState {
    #[default]
    All,
    Yes,
    No,
}

impl TriState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Yes => "yes",
            Self::No => "no",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" | "any" => Some(Self::All),
            "yes" | "true" | "with" | "locked" => Some(Self::Yes),
            "no" | "false" | "without" | "unlocked" => Some(Self::No),
            _ => None,
        }
    }
}

/// Inclusive numeric bounds. Dates are compared as unix milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct RangeFilter {
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
}

impl RangeFilter {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn dates(range: &DateRange) -> Self {
        Self { lower: Some(range.start_ms() as f64), upper: Some(range.end_ms() as f64) }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lower.is_some() || self.upper.is_some()
    }
}

/// Per-view filter, sort and paging state. Persisted per user, view and tenant set.
///
/// Every setter that changes what matches resets `page` to 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewState {
    pub search_term: String,
    pub facets: BTreeMap<String, BTreeSet<String>>,
    pub toggles: BTreeMap<String, TriState>,
    pub ranges: BTreeMap<String, RangeFilter>,
    pub sort: Option<SortSpec>,
    pub page: usize,
    pub rows_per_page: usize,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            search_term: String::new(),
            facets: BTreeMap::new(),
            toggles: BTreeMap::new(),
            ranges: BTreeMap::new(),
            sort: None,
            page: 1,
            rows_per_page: DEFAULT_ROWS_PER_PAGE,
        }
    }
}

impl ViewState {
    #[must_use]
    pub fn defaults(config: &ViewConfig) -> Self {
        Self { rows_per_page: config.rows_per_page.clamp(1, MAX_ROWS_PER_PAGE), ..Self::default() }
    }

    pub fn set_search_term(&mut self, term: impl Into<String>) {
        self.search_term = term.into();
        self.page = 1;
    }

    /// Replace the allowed values of one facet; an empty set removes the facet.
    pub fn set_facet(&mut self, field: impl Into<String>, values: BTreeSet<String>) {
        let field = field.into();
        if values.is_empty() {
            self.facets.remove(&field);
        } else {
            self.facets.insert(field, values);
        }
        self.page = 1;
    }

    pub fn toggle_facet_value(&mut self, field: impl Into<String>, value: impl Into<String>) {
        let field = field.into();
        let value = value.into();
        let mut values = self.facets.get(&field).cloned().unwrap_or_default();
        if !values.remove(&value) {
            values.insert(value);
        }
        self.set_facet(field, values);
    }

    pub fn set_toggle(&mut self, field: impl Into<String>, mode: TriState) {
        let field = field.into();
        if mode == TriState::All {
            self.toggles.remove(&field);
        } else {
            self.toggles.insert(field, mode);
        }
        self.page = 1;
    }

    pub fn set_range(&mut self, field: impl Into<String>, range: RangeFilter) {
        let field = field.into();
        if range.is_active() {
            self.ranges.insert(field, range);
        } else {
            self.ranges.remove(&field);
        }
        self.page = 1;
    }

    pub fn set_date_range(&mut self, field: impl Into<String>, range: &DateRange) {
        self.set_range(field, RangeFilter::dates(range));
    }

    pub fn clear_range(&mut self, field: &str) {
        self.ranges.remove(field);
        self.page = 1;
    }

    pub fn set_sort(&mut self, sort: Option<SortSpec>) {
        self.sort = sort;
        self.page = 1;
    }

    /// Column-header click: the same key flips direction, a new key starts ascending.
    pub fn sort_by_column(&mut self, config: &ViewConfig, key: &str) {
        let current = self.sort.as_ref().unwrap_or(&config.default_sort);
        let next = if current.key == key {
            SortSpec::new(key, current.direction.flipped())
        } else {
            SortSpec::new(key, SortDirection::Asc)
        };
        self.set_sort(Some(next));
    }

    /// Pages are 1-based; 0 is treated as 1. Overshoot is clamped when the window is built.
    pub fn set_page(&mut self, page: usize) {
        self.page = page.max(1);
    }

    /// # Errors
    /// Returns [`PortalError::Validation`] when `rows` is 0 or above the page-size cap.
    pub fn set_rows_per_page(&mut self, rows: usize) -> Result<(), PortalError> {
        if rows == 0 || rows > MAX_ROWS_PER_PAGE {
            return Err(PortalError::Validation(format!(
                "rows per page must be between 1 and {MAX_ROWS_PER_PAGE}, got {rows}"
            )));
        }
        self.rows_per_page = rows;
        self.page = 1;
        Ok(())
    }

    pub fn reset(&mut self, config: &ViewConfig) {
        *self = Self::defaults(config);
    }

    #[must_use]
    pub fn has_active_filters(&self) -> bool {
        !self.search_term.trim().is_empty()
            || !self.facets.is_empty()
            || !self.toggles.is_empty()
            || self.ranges.values().any(RangeFilter::is_active)
    }

    /// Repair a restored state so it can drive `config`: page and page size are brought
    /// into range, and facets, toggles or a sort key the view does not offer are dropped.
    #[must_use]
    pub fn sanitized(mut self, config: &ViewConfig) -> Self {
        self.page = self.page.max(1);
        if self.rows_per_page == 0 || self.rows_per_page > MAX_ROWS_PER_PAGE {
            self.rows_per_page = config.rows_per_page.clamp(1, MAX_ROWS_PER_PAGE);
        }
        if self.sort.as_ref().is_some_and(|sort| !config.is_sortable(&sort.key)) {
            self.sort = None;
        }
        self.facets.retain(|field, values| {
            !values.is_empty() && config.facet_fields.iter().any(|facet| facet == field)
        });
        self.toggles.retain(|field, mode| {
            *mode != TriState::All && config.toggles.iter().any(|toggle| &toggle.field == field)
        });
        self.ranges.retain(|_, range| range.is_active());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ViewKind;

    fn config() -> ViewConfig {
        ViewConfig::preset(ViewKind::Commissions)
    }

    #[test]
    fn filter_changes_reset_page() {
        let mut state = ViewState::defaults(&config());
        let changes: Vec<Box<dyn Fn(&mut ViewState)>> = vec![
            Box::new(|state: &mut ViewState| state.set_search_term("ada")),
            Box::new(|state: &mut ViewState| state.toggle_facet_value("carrier", "Acme")),
            Box::new(|state: &mut ViewState| state.set_toggle("locked", TriState::Yes)),
            Box::new(|state: &mut ViewState| state.set_range("amount", RangeFilter { lower: Some(1.0), upper: None })),
            Box::new(|state: &mut ViewState| state.clear_range("amount")),
            Box::new(|state: &mut ViewState| state.set_sort(Some(SortSpec::new("amount", SortDirection::Asc)))),
        ];
        for change in changes {
            state.set_page(4);
            change(&mut state);
            assert_eq!(state.page, 1);
        }
    }

    #[test]
    fn toggling_a_facet_value_twice_removes_the_facet() {
        let mut state = ViewState::defaults(&config());
        state.toggle_facet_value("carrier", "Acme");
        assert_eq!(state.facets["carrier"].len(), 1);
        state.toggle_facet_value("carrier", "Acme");
        assert!(!state.facets.contains_key("carrier"));
        assert!(!state.has_active_filters());
    }

    #[test]
    fn column_sort_flips_same_key_and_starts_new_key_ascending() {
        let config = config();
        let mut state = ViewState::defaults(&config);
        state.sort_by_column(&config, "created_at");
        assert_eq!(state.sort, Some(SortSpec::new("created_at", SortDirection::Asc)));
        state.sort_by_column(&config, "created_at");
        assert_eq!(state.sort, Some(SortSpec::new("created_at", SortDirection::Desc)));
        state.sort_by_column(&config, "amount");
        assert_eq!(state.sort, Some(SortSpec::new("amount", SortDirection::Asc)));
    }

    #[test]
    fn rows_per_page_is_validated() {
        let mut state = ViewState::defaults(&config());
        assert!(state.set_rows_per_page(0).is_err());
        assert!(state.set_rows_per_page(MAX_ROWS_PER_PAGE + 1).is_err());
        state.set_page(3);
        assert!(state.set_rows_per_page(50).is_ok());
        assert_eq!((state.rows_per_page, state.page), (50, 1));
    }

    #[test]
    fn sanitized_repairs_restored_state() {
        let restored = ViewState {
            page: 0,
            rows_per_page: 0,
            sort: Some(SortSpec::new("not_a_column", SortDirection::Asc)),
            ..ViewState::default()
        };
        let repaired = restored.sanitized(&config());
        assert_eq!(repaired.page, 1);
        assert_eq!(repaired.rows_per_page, DEFAULT_ROWS_PER_PAGE);
        assert_eq!(repaired.sort, None);
    }

    #[test]
    fn sanitized_drops_facets_and_toggles_the_view_does_not_offer() {
        let mut restored = ViewState::defaults(&config());
        restored.toggle_facet_value("carrier", "Acme");
        restored.toggle_facet_value("effective_date", "2026-03-01");
        restored.set_facet("status", BTreeSet::new());
        restored.set_toggle("locked", TriState::Yes);
        restored.set_toggle("commission_amount", TriState::No);

        let repaired = restored.sanitized(&config());
        assert_eq!(repaired.facets.keys().collect::<Vec<_>>(), vec!["carrier"]);
        assert_eq!(repaired.toggles.keys().collect::<Vec<_>>(), vec!["locked"]);
    }

    #[test]
    fn tri_state_parses_ui_words() {
        assert_eq!(TriState::parse("Locked"), Some(TriState::Yes));
        assert_eq!(TriState::parse("without"), Some(TriState::No));
        assert_eq!(TriState::parse("all"), Some(TriState::All));
        assert_eq!(TriState::parse("maybe"), None);
    }
}
