use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::{PortalRecord, RecordKey};

/// Offer shown when the visible page is fully selected but the wider match set is not.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct SelectionBanner {
    pub selected_on_page: usize,
    pub total_matching: usize,
}

/// Bulk-selection set of tenant-qualified record keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SelectionSet {
    keys: BTreeSet<RecordKey>,
}

impl SelectionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.keys.contains(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.keys.iter()
    }

    /// Returns whether `key` is selected afterwards.
    pub fn toggle(&mut self, key: RecordKey) -> bool {
        if self.keys.remove(&key) {
            false
        } else {
            self.keys.insert(key);
            true
        }
    }

    #[must_use]
    pub fn is_page_selected(&self, page: &[RecordKey]) -> bool {
        !page.is_empty() && page.iter().all(|key| self.keys.contains(key))
    }

    #[must_use]
    pub fn is_all_matching_selected(&self, matching: &[RecordKey]) -> bool {
        !matching.is_empty()
            && self.keys.len() == matching.len()
            && matching.iter().all(|key| self.keys.contains(key))
    }

    pub fn toggle_page(&mut self, page: &[RecordKey]) {
        if self.is_page_selected(page) {
            for key in page {
                self.keys.remove(key);
            }
        } else {
            self.keys.extend(page.iter().cloned());
        }
    }

    pub fn select_all_matching(&mut self, matching: &[RecordKey]) {
        self.keys = matching.iter().cloned().collect();
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    /// Drop keys that no longer exist in the merged record list. Returns the dropped keys.
    pub fn reconcile<'a>(&mut self, current: impl IntoIterator<Item = &'a RecordKey>) -> Vec<RecordKey> {
        let live = current.into_iter().collect::<BTreeSet<_>>();
        let stale = self.keys.iter().filter(|key| !live.contains(key)).cloned().collect::<Vec<_>>();
        for key in &stale {
            self.keys.remove(key);
        }
        stale
    }

    #[must_use]
    pub fn banner(&self, page: &[RecordKey], matching: &[RecordKey]) -> Option<SelectionBanner> {
        (self.is_page_selected(page) && !self.is_all_matching_selected(matching)).then(|| {
            SelectionBanner { selected_on_page: page.len(), total_matching: matching.len() }
        })
    }

    /// Selected records that still resolve in `records`, in record order.
    #[must_use]
    pub fn resolve_selected<'a>(&self, records: &'a [PortalRecord]) -> Vec<&'a PortalRecord> {
        records.iter().filter(|record| self.keys.contains(&record.key)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenancy::TenantId;

    fn keys(ids: &[&str]) -> Vec<RecordKey> {
        ids.iter().map(|id| RecordKey::qualified(&TenantId::new("north"), id)).collect()
    }

    #[test]
    fn page_selection_toggles_whole_page() {
        let page = keys(&["1", "2", "3"]);
        let mut selection = SelectionSet::new();
        assert!(!selection.is_page_selected(&[]));

        selection.toggle(page[0].clone());
        selection.toggle_page(&page);
        assert!(selection.is_page_selected(&page));
        assert_eq!(selection.len(), 3);

        selection.toggle_page(&page);
        assert!(selection.is_empty());
    }

    #[test]
    fn all_matching_requires_exact_non_empty_set() {
        let matching = keys(&["1", "2"]);
        let mut selection = SelectionSet::new();
        assert!(!selection.is_all_matching_selected(&[]));

        selection.select_all_matching(&matching);
        assert!(selection.is_all_matching_selected(&matching));

        selection.toggle(keys(&["9"])[0].clone());
        assert!(!selection.is_all_matching_selected(&matching));
    }

    #[test]
    fn banner_offers_escalation_only_for_partial_selection() {
        let matching = keys(&["1", "2", "3", "4"]);
        let page = matching[..2].to_vec();
        let mut selection = SelectionSet::new();
        assert_eq!(selection.banner(&page, &matching), None);

        selection.toggle_page(&page);
        assert_eq!(
            selection.banner(&page, &matching),
            Some(SelectionBanner { selected_on_page: 2, total_matching: 4 })
        );

        selection.select_all_matching(&matching);
        assert_eq!(selection.banner(&page, &matching), None);
    }

    #[test]
    fn reconcile_after_delete_drops_missing_keys() {
        let mut selection = SelectionSet::new();
        selection.select_all_matching(&keys(&["1", "2", "3"]));

        let remaining = keys(&["1", "3"]);
        let dropped = selection.reconcile(&remaining);

        assert_eq!(dropped, keys(&["2"]));
        assert_eq!(selection.keys().cloned().collect::<Vec<_>>(), remaining);
    }

    #[test]
    fn resolve_selected_skips_keys_without_records() {
        let tenant = TenantId::new("north");
        let records = vec![PortalRecord::new(tenant.clone(), "1"), PortalRecord::new(tenant, "2")];
        let mut selection = SelectionSet::new();
        selection.select_all_matching(&keys(&["2", "ghost"]));

        let resolved = selection.resolve_selected(&records);

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].record_id, "2");
    }
}
