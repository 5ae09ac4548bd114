use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::model::{FieldValue, PortalRecord, RecordKey, FIELD_CREATED_AT};
use crate::tenancy::FeatureKey;
use crate::view_state::{RangeFilter, TriState, ViewState};

pub const DEFAULT_ROWS_PER_PAGE: usize = 20;
pub const MAX_ROWS_PER_PAGE: usize = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Commissions,
    Policies,
    Debts,
    PolicyRecords,
}

impl ViewKind {
    pub const ALL: [Self; 4] = [Self::Commissions, Self::Policies, Self::Debts, Self::PolicyRecords];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commissions => "commissions",
            Self::Policies => "policies",
            Self::Debts => "debts",
            Self::PolicyRecords => "policy_records",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().replace('-', "_").as_str() {
            "commissions" => Some(Self::Commissions),
            "policies" => Some(Self::Policies),
            "debts" => Some(Self::Debts),
            "policy_records" => Some(Self::PolicyRecords),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    #[must_use]
    pub fn flipped(self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Some(Self::Asc),
            "desc" | "descending" => Some(Self::Desc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SortSpec {
    pub key: String,
    pub direction: SortDirection,
}

impl SortSpec {
    #[must_use]
    pub fn new(key: impl Into<String>, direction: SortDirection) -> Self {
        Self { key: key.into(), direction }
    }

    #[must_use]
    pub fn newest_first() -> Self {
        Self::new(FIELD_CREATED_AT, SortDirection::Desc)
    }
}

/// How a tri-state filter inspects its field.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ToggleKind {
    /// Boolean attribute such as lock state.
    #[default]
    Flag,
    /// Whether a value is present and non-zero, such as "with commission".
    Presence,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ToggleSpec {
    pub field: String,
    #[serde(default)]
    pub kind: ToggleKind,
}

/// Per-view parameters of the shared query engine.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ViewConfig {
    pub view: ViewKind,
    pub feature: FeatureKey,
    pub search_fields: Vec<String>,
    pub facet_fields: Vec<String>,
    #[serde(default)]
    pub toggles: Vec<ToggleSpec>,
    pub sortable_fields: Vec<String>,
    #[serde(default = "SortSpec::newest_first")]
    pub default_sort: SortSpec,
    #[serde(default)]
    pub rollup_fields: Vec<String>,
    #[serde(default = "default_rows_per_page")]
    pub rows_per_page: usize,
}

fn default_rows_per_page() -> usize {
    DEFAULT_ROWS_PER_PAGE
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

impl ViewConfig {
    #[must_use]
    pub fn preset(kind: ViewKind) -> Self {
        match kind {
            ViewKind::Commissions => Self {
                view: kind,
                feature: FeatureKey::Commissions,
                search_fields: strings(&["client_name", "policy_number", "agent_name", "carrier"]),
                facet_fields: strings(&["status", "carrier", "agent_name", "origin_tenant_name"]),
                toggles: vec![ToggleSpec { field: "locked".to_string(), kind: ToggleKind::Flag }],
                sortable_fields: strings(&[
                    "created_at",
                    "amount",
                    "client_name",
                    "agent_name",
                    "carrier",
                    "status",
                ]),
                default_sort: SortSpec::newest_first(),
                rollup_fields: strings(&["agent_name", "carrier"]),
                rows_per_page: DEFAULT_ROWS_PER_PAGE,
            },
            ViewKind::Policies => Self {
                view: kind,
                feature: FeatureKey::Policies,
                search_fields: strings(&["client_name", "policy_number", "agent_name"]),
                facet_fields: strings(&["status", "carrier", "agent_name"]),
                toggles: vec![ToggleSpec {
                    field: "commission_amount".to_string(),
                    kind: ToggleKind::Presence,
                }],
                sortable_fields: strings(&[
                    "created_at",
                    "effective_date",
                    "amount",
                    "client_name",
                    "carrier",
                ]),
                default_sort: SortSpec::newest_first(),
                rollup_fields: strings(&["carrier", "agent_name"]),
                rows_per_page: DEFAULT_ROWS_PER_PAGE,
            },
            ViewKind::Debts => Self {
                view: kind,
                feature: FeatureKey::Debts,
                search_fields: strings(&["client_name", "agent_name", "reason"]),
                facet_fields: strings(&["status", "agent_name"]),
                toggles: vec![ToggleSpec { field: "locked".to_string(), kind: ToggleKind::Flag }],
                sortable_fields: strings(&["created_at", "amount", "agent_name", "status"]),
                default_sort: SortSpec::newest_first(),
                rollup_fields: strings(&["agent_name"]),
                rows_per_page: DEFAULT_ROWS_PER_PAGE,
            },
            ViewKind::PolicyRecords => Self {
                view: kind,
                feature: FeatureKey::Policies,
                search_fields: strings(&["policy_number", "client_name", "carrier"]),
                facet_fields: strings(&["carrier", "status"]),
                toggles: Vec::new(),
                sortable_fields: strings(&["created_at", "policy_number", "carrier", "amount"]),
                default_sort: SortSpec::newest_first(),
                rollup_fields: strings(&["carrier"]),
                rows_per_page: 50,
            },
        }
    }

    #[must_use]
    pub fn view_id(&self) -> &'static str {
        self.view.as_str()
    }

    #[must_use]
    pub fn toggle_kind(&self, field: &str) -> ToggleKind {
        self.toggles
            .iter()
            .find(|toggle| toggle.field == field)
            .map_or(ToggleKind::Flag, |toggle| toggle.kind)
    }

    #[must_use]
    pub fn is_sortable(&self, key: &str) -> bool {
        key == self.default_sort.key || self.sortable_fields.iter().any(|field| field == key)
    }
}

/// Filtered and sorted records plus the requested page.
#[derive(Debug, Clone)]
pub struct QueryWindow<'a> {
    matching: Vec<&'a PortalRecord>,
    page: usize,
    page_size: usize,
}

impl<'a> QueryWindow<'a> {
    #[must_use]
    pub fn total_matching(&self) -> usize {
        self.matching.len()
    }

    /// At least one page, so an empty result still renders page 1 of 1.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.matching.len().div_ceil(self.page_size).max(1)
    }

    /// Requested page clamped into `1..=page_count`.
    #[must_use]
    pub fn page(&self) -> usize {
        self.page.clamp(1, self.page_count())
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn matching(&self) -> &[&'a PortalRecord] {
        &self.matching
    }

    #[must_use]
    pub fn page_rows(&self) -> &[&'a PortalRecord] {
        &self.matching[page_bounds(self.matching.len(), self.page(), self.page_size)]
    }

    #[must_use]
    pub fn matching_keys(&self) -> Vec<RecordKey> {
        self.matching.iter().map(|record| record.key.clone()).collect()
    }

    #[must_use]
    pub fn page_keys(&self) -> Vec<RecordKey> {
        self.page_rows().iter().map(|record| record.key.clone()).collect()
    }
}

/// Run search, facet, tri-state and range filters, sort, then window the result.
#[must_use]
pub fn run_query<'a>(
    records: &'a [PortalRecord],
    config: &ViewConfig,
    state: &ViewState,
) -> QueryWindow<'a> {
    let mut matching = filter_records(records, config, state);
    let sort = state.sort.as_ref().unwrap_or(&config.default_sort);
    sort_records(&mut matching, sort);
    QueryWindow { matching, page: state.page.max(1), page_size: state.rows_per_page.max(1) }
}

#[must_use]
pub fn filter_records<'a>(
    records: &'a [PortalRecord],
    config: &ViewConfig,
    state: &ViewState,
) -> Vec<&'a PortalRecord> {
    let needle = state.search_term.trim().to_lowercase();
    records
        .iter()
        .filter(|record| matches_search(record, &config.search_fields, &needle))
        .filter(|record| {
            state.facets.iter().all(|(field, allowed)| matches_facet(record, field, allowed))
        })
        .filter(|record| {
            state.toggles.iter().all(|(field, mode)| {
                matches_toggle(record, field, config.toggle_kind(field), *mode)
            })
        })
        .filter(|record| {
            state.ranges.iter().all(|(field, range)| matches_range(record, field, range))
        })
        .collect()
}

/// Case-insensitive substring match on any of `fields`. `needle` must already be
/// lowercased; an empty needle matches everything.
#[must_use]
pub fn matches_search(record: &PortalRecord, fields: &[String], needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    fields.iter().any(|field| {
        record.text(field).is_some_and(|value| value.to_lowercase().contains(needle))
    })
}

/// An empty allowed set is no restriction.
#[must_use]
pub fn matches_facet(record: &PortalRecord, field: &str, allowed: &BTreeSet<String>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    record.text(field).is_some_and(|value| allowed.contains(&value))
}

#[must_use]
pub fn matches_toggle(record: &PortalRecord, field: &str, kind: ToggleKind, mode: TriState) -> bool {
    let wanted = match mode {
        TriState::All => return true,
        TriState::Yes => true,
        TriState::No => false,
    };
    match kind {
        ToggleKind::Flag => {
            record.value(field).and_then(|value| value.as_flag()).is_some_and(|flag| flag == wanted)
        }
        ToggleKind::Presence => is_present(record.value(field).as_ref()) == wanted,
    }
}

fn is_present(value: Option<&FieldValue>) -> bool {
    match value {
        None => false,
        Some(FieldValue::Money(cents)) => cents.0 != 0,
        Some(FieldValue::Number(number)) => *number != 0.0,
        Some(FieldValue::Text(text)) => !text.trim().is_empty(),
        Some(FieldValue::Timestamp(_) | FieldValue::Flag(_)) => true,
    }
}

/// Inclusive bounds; a missing or unparseable value fails an active range.
#[must_use]
pub fn matches_range(record: &PortalRecord, field: &str, range: &RangeFilter) -> bool {
    if !range.is_active() {
        return true;
    }
    let Some(value) = record.value(field).and_then(|value| value.as_number()) else {
        return false;
    };
    range.lower.map_or(true, |lower| value >= lower) && range.upper.map_or(true, |upper| value <= upper)
}

/// Stable sort by one key. Records missing the key sort last in either direction.
pub fn sort_records(rows: &mut Vec<&PortalRecord>, sort: &SortSpec) {
    let mut keyed = rows.drain(..).map(|record| (record.value(&sort.key), record)).collect::<Vec<_>>();
    keyed.sort_by(|(lhs, _), (rhs, _)| compare_sort_values(lhs.as_ref(), rhs.as_ref(), sort.direction));
    rows.extend(keyed.into_iter().map(|(_, record)| record));
}

fn compare_sort_values(
    lhs: Option<&FieldValue>,
    rhs: Option<&FieldValue>,
    direction: SortDirection,
) -> Ordering {
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => {
            let ordering = lhs.natural_cmp(rhs);
            match direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Index range of `page` (1-based) for `total` items; empty when out of range.
#[must_use]
pub fn page_bounds(total: usize, page: usize, page_size: usize) -> Range<usize> {
    let page_size = page_size.max(1);
    let start = page.saturating_sub(1).saturating_mul(page_size).min(total);
    let end = start.saturating_add(page_size).min(total);
    start..end
}

#[must_use]
pub fn paginate<T>(items: &[T], page: usize, page_size: usize) -> &[T] {
    &items[page_bounds(items.len(), page, page_size)]
}

/// Distinct observed values of `field`, sorted, for facet pickers.
#[must_use]
pub fn facet_options(records: &[PortalRecord], field: &str) -> Vec<String> {
    records
        .iter()
        .filter_map(|record| record.text(field))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::macros::datetime;
    use time::Duration;

    use super::*;
    use crate::model::Cents;
    use crate::query::DateRange;
    use crate::selection::SelectionSet;
    use crate::tenancy::TenantId;

    fn commissions() -> ViewConfig {
        ViewConfig::preset(ViewKind::Commissions)
    }

    fn fixture_records(count: usize) -> Vec<PortalRecord> {
        let tenant = TenantId::new("north");
        let carriers = ["Acme Life", "Blue Shield", "Cigna"];
        let statuses = ["Paid", "Pending"];
        (0..count)
            .map(|index| {
                let offset = i64::try_from(index).unwrap_or(i64::MAX);
                PortalRecord::new(tenant.clone(), format!("r{index}"))
                    .with_amount(Cents(1_000 + offset))
                    .with_created_at(datetime!(2026-01-01 00:00 UTC) + Duration::hours(offset))
                    .with_text("client_name", format!("Client {index}"))
                    .with_text("carrier", carriers[index % carriers.len()])
                    .with_text("status", statuses[index % statuses.len()])
                    .with_field("locked", FieldValue::Flag(index % 4 == 0))
            })
            .collect()
    }

    fn ids(rows: &[&PortalRecord]) -> Vec<String> {
        rows.iter().map(|record| record.record_id.clone()).collect()
    }

    #[test]
    fn empty_inputs_return_everything_newest_first() {
        let records = fixture_records(5);
        let mut state = ViewState::defaults(&commissions());
        state.set_facet("carrier", BTreeSet::new());
        let range = match DateRange::for_days(
            time::macros::date!(2025 - 12 - 01),
            time::macros::date!(2026 - 12 - 31),
            time::macros::offset!(UTC),
        ) {
            Ok(range) => range,
            Err(err) => panic!("range should build: {err}"),
        };
        state.set_date_range("created_at", &range);

        let window = run_query(&records, &commissions(), &state);

        assert_eq!(window.total_matching(), 5);
        assert_eq!(ids(window.page_rows()), vec!["r4", "r3", "r2", "r1", "r0"]);
    }

    #[test]
    fn search_is_case_insensitive_across_fields() {
        let records = fixture_records(6);
        let mut state = ViewState::defaults(&commissions());
        state.set_search_term("blue SHIELD");
        let window = run_query(&records, &commissions(), &state);
        assert_eq!(ids(window.matching()), vec!["r4", "r1"]);

        state.set_search_term("client 5");
        let window = run_query(&records, &commissions(), &state);
        assert_eq!(ids(window.matching()), vec!["r5"]);
    }

    #[test]
    fn facets_combine_across_fields_and_within_a_field() {
        let records = fixture_records(6);
        let mut state = ViewState::defaults(&commissions());
        state.set_facet(
            "carrier",
            ["Acme Life".to_string(), "Cigna".to_string()].into_iter().collect(),
        );
        state.set_facet("status", ["Paid".to_string()].into_iter().collect());

        let window = run_query(&records, &commissions(), &state);

        assert_eq!(ids(window.matching()), vec!["r2", "r0"]);
    }

    #[test]
    fn missing_field_fails_only_its_own_predicate() {
        let mut records = fixture_records(2);
        records.push(PortalRecord::new(TenantId::new("north"), "bare"));
        let mut state = ViewState::defaults(&commissions());

        assert_eq!(run_query(&records, &commissions(), &state).total_matching(), 3);

        state.set_facet("carrier", ["Acme Life".to_string()].into_iter().collect());
        assert_eq!(ids(run_query(&records, &commissions(), &state).matching()), vec!["r0"]);

        state.set_facet("carrier", BTreeSet::new());
        state.set_range("amount", RangeFilter { lower: Some(0.0), upper: None });
        assert_eq!(run_query(&records, &commissions(), &state).total_matching(), 2);
    }

    #[test]
    fn tri_state_flag_and_presence() {
        let records = fixture_records(8);
        let mut state = ViewState::defaults(&commissions());
        state.set_toggle("locked", TriState::Yes);
        assert_eq!(ids(run_query(&records, &commissions(), &state).matching()), vec!["r4", "r0"]);
        state.set_toggle("locked", TriState::No);
        assert_eq!(run_query(&records, &commissions(), &state).total_matching(), 6);
        state.set_toggle("locked", TriState::All);
        assert_eq!(run_query(&records, &commissions(), &state).total_matching(), 8);

        let policies = ViewConfig::preset(ViewKind::Policies);
        let tenant = TenantId::new("north");
        let with = PortalRecord::new(tenant.clone(), "with")
            .with_field("commission_amount", FieldValue::Money(Cents(10)));
        let zero = PortalRecord::new(tenant.clone(), "zero")
            .with_field("commission_amount", FieldValue::Money(Cents(0)));
        let without = PortalRecord::new(tenant, "without");
        let records = vec![with, zero, without];
        let mut state = ViewState::defaults(&policies);
        state.set_toggle("commission_amount", TriState::Yes);
        assert_eq!(ids(run_query(&records, &policies, &state).matching()), vec!["with"]);
        state.set_toggle("commission_amount", TriState::No);
        assert_eq!(ids(run_query(&records, &policies, &state).matching()), vec!["zero", "without"]);
    }

    #[test]
    fn sort_is_stable_and_puts_missing_last() {
        let tenant = TenantId::new("north");
        let records = vec![
            PortalRecord::new(tenant.clone(), "a").with_text("carrier", "Cigna"),
            PortalRecord::new(tenant.clone(), "b"),
            PortalRecord::new(tenant.clone(), "c").with_text("carrier", "Acme"),
            PortalRecord::new(tenant, "d").with_text("carrier", "Cigna"),
        ];
        let mut rows = records.iter().collect::<Vec<_>>();
        sort_records(&mut rows, &SortSpec::new("carrier", SortDirection::Asc));
        assert_eq!(ids(&rows), vec!["c", "a", "d", "b"]);

        let mut rows = records.iter().collect::<Vec<_>>();
        sort_records(&mut rows, &SortSpec::new("carrier", SortDirection::Desc));
        assert_eq!(ids(&rows), vec!["a", "d", "c", "b"]);
    }

    #[test]
    fn forty_seven_rows_paginate_into_twenty_twenty_seven() {
        let records = fixture_records(47);
        let mut state = ViewState::defaults(&commissions());
        let sizes = (1..=3)
            .map(|page| {
                state.set_page(page);
                run_query(&records, &commissions(), &state).page_rows().len()
            })
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![20, 20, 7]);
        assert_eq!(run_query(&records, &commissions(), &state).page_count(), 3);
    }

    #[test]
    fn last_page_selection_escalates_and_survives_removal() {
        let records = fixture_records(47);
        let mut state = ViewState::defaults(&commissions());
        state.set_page(3);
        let window = run_query(&records, &commissions(), &state);
        let page_keys = window.page_keys();
        let matching_keys = window.matching_keys();
        assert_eq!(page_keys.len(), 7);

        let mut selection = SelectionSet::new();
        selection.toggle_page(&page_keys);
        assert!(selection.is_page_selected(&page_keys));
        assert!(!selection.is_all_matching_selected(&matching_keys));

        selection.select_all_matching(&matching_keys);
        assert_eq!(selection.len(), 47);
        assert!(selection.is_all_matching_selected(&matching_keys));

        let remaining = matching_keys[1..].to_vec();
        let dropped = selection.reconcile(&remaining);
        assert_eq!(dropped, vec![matching_keys[0].clone()]);
        assert_eq!(selection.len(), 46);
        assert!(selection.is_all_matching_selected(&remaining));
    }

    #[test]
    fn out_of_range_page_is_clamped_in_window() {
        let records = fixture_records(5);
        let mut state = ViewState::defaults(&commissions());
        state.set_page(9);
        let window = run_query(&records, &commissions(), &state);
        assert_eq!(window.page(), 1);
        assert_eq!(window.page_rows().len(), 5);
    }

    #[test]
    fn facet_options_are_sorted_and_distinct() {
        let records = fixture_records(6);
        assert_eq!(facet_options(&records, "carrier"), vec!["Acme Life", "Blue Shield", "Cigna"]);
        assert!(facet_options(&records, "agent_name").is_empty());
    }

    #[test]
    fn presets_parse_and_round_trip_names() {
        for kind in ViewKind::ALL {
            assert_eq!(ViewKind::parse(kind.as_str()), Some(kind));
            assert_eq!(ViewConfig::preset(kind).view, kind);
        }
        assert_eq!(ViewKind::parse("policy-records"), Some(ViewKind::PolicyRecords));
    }

    proptest! {
        #[test]
        fn property_pages_cover_filtered_set_exactly(count in 0_usize..120, page_size in 1_usize..30) {
            let records = fixture_records(count);
            let mut state = ViewState::defaults(&commissions());
            state.rows_per_page = page_size;
            let full = run_query(&records, &commissions(), &state);
            let expected = ids(full.matching());

            let mut collected = Vec::new();
            for page in 1..=count.div_ceil(page_size) {
                state.page = page;
                collected.extend(ids(run_query(&records, &commissions(), &state).page_rows()));
            }
            prop_assert_eq!(collected, expected);
        }

        #[test]
        fn property_empty_facet_equals_no_facet(count in 0_usize..60, field_index in 0_usize..4) {
            let records = fixture_records(count);
            let config = commissions();
            let field = config.facet_fields[field_index].clone();
            let omitted = ViewState::defaults(&config);
            let mut empty = ViewState::defaults(&config);
            empty.facets.insert(field, BTreeSet::new());

            prop_assert_eq!(
                ids(run_query(&records, &config, &omitted).matching()),
                ids(run_query(&records, &config, &empty).matching())
            );
        }
    }
}
