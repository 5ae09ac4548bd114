use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::PortalError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKey {
    Policies,
    Commissions,
    Debts,
    Users,
    Contracting,
    Ticketing,
    Settings,
}

impl FeatureKey {
    pub const ALL: [Self; 7] = [
        Self::Policies,
        Self::Commissions,
        Self::Debts,
        Self::Users,
        Self::Contracting,
        Self::Ticketing,
        Self::Settings,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Policies => "policies",
            Self::Commissions => "commissions",
            Self::Debts => "debts",
            Self::Users => "users",
            Self::Contracting => "contracting",
            Self::Ticketing => "ticketing",
            Self::Settings => "settings",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "policies" => Some(Self::Policies),
            "commissions" => Some(Self::Commissions),
            "debts" => Some(Self::Debts),
            "users" => Some(Self::Users),
            "contracting" => Some(Self::Contracting),
            "ticketing" => Some(Self::Ticketing),
            "settings" => Some(Self::Settings),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    #[serde(default)]
    pub features: BTreeSet<FeatureKey>,
}

impl Tenant {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        features: impl IntoIterator<Item = FeatureKey>,
    ) -> Self {
        Self { id: TenantId::new(id), name: name.into(), features: features.into_iter().collect() }
    }

    #[must_use]
    pub fn has_feature(&self, feature: FeatureKey) -> bool {
        self.features.contains(&feature)
    }
}

/// Tenants the signed-in user may access. Immutable for the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TenantCatalog {
    tenants: Vec<Tenant>,
}

impl TenantCatalog {
    /// Build a catalog from an access grant, keeping the first entry for a repeated id.
    #[must_use]
    pub fn new(tenants: Vec<Tenant>) -> Self {
        let mut seen = BTreeSet::new();
        let tenants =
            tenants.into_iter().filter(|tenant| seen.insert(tenant.id.clone())).collect();
        Self { tenants }
    }

    #[must_use]
    pub fn get(&self, id: &TenantId) -> Option<&Tenant> {
        self.tenants.iter().find(|tenant| &tenant.id == id)
    }

    #[must_use]
    pub fn contains(&self, id: &TenantId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tenant> {
        self.tenants.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

/// Currently active tenants. Insertion ordered so the first selected tenant is the
/// "active" one; every id is guaranteed to exist in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantSelection {
    catalog: TenantCatalog,
    selected: Vec<TenantId>,
}

impl TenantSelection {
    #[must_use]
    pub fn new(catalog: TenantCatalog) -> Self {
        Self { catalog, selected: Vec::new() }
    }

    #[must_use]
    pub fn catalog(&self) -> &TenantCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn selected_ids(&self) -> &[TenantId] {
        &self.selected
    }

    #[must_use]
    pub fn is_selected(&self, id: &TenantId) -> bool {
        self.selected.contains(id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    /// Add one tenant to the selection.
    ///
    /// # Errors
    /// Returns [`PortalError::UnknownTenant`] when the id is not in the catalog.
    pub fn select(&mut self, id: &TenantId) -> Result<(), PortalError> {
        if !self.catalog.contains(id) {
            return Err(PortalError::UnknownTenant(id.to_string()));
        }
        if !self.selected.contains(id) {
            self.selected.push(id.clone());
        }
        Ok(())
    }

    /// Toggle one tenant; returns whether it is selected afterwards.
    ///
    /// # Errors
    /// Returns [`PortalError::UnknownTenant`] when the id is not in the catalog.
    pub fn toggle(&mut self, id: &TenantId) -> Result<bool, PortalError> {
        if let Some(position) = self.selected.iter().position(|selected| selected == id) {
            self.selected.remove(position);
            return Ok(false);
        }
        self.select(id)?;
        Ok(true)
    }

    /// Replace the selection. Either every id is known and the selection changes, or
    /// nothing changes.
    ///
    /// # Errors
    /// Returns [`PortalError::UnknownTenant`] for the first id missing from the catalog.
    pub fn replace(&mut self, ids: &[TenantId]) -> Result<(), PortalError> {
        if let Some(unknown) = ids.iter().find(|id| !self.catalog.contains(id)) {
            return Err(PortalError::UnknownTenant(unknown.to_string()));
        }
        self.selected.clear();
        for id in ids {
            if !self.selected.contains(id) {
                self.selected.push(id.clone());
            }
        }
        Ok(())
    }

    /// Restore a persisted selection, dropping ids the catalog no longer grants.
    /// Returns the dropped ids.
    pub fn restore(&mut self, ids: &[TenantId]) -> Vec<TenantId> {
        self.selected.clear();
        let mut dropped = Vec::new();
        for id in ids {
            if !self.catalog.contains(id) {
                dropped.push(id.clone());
            } else if !self.selected.contains(id) {
                self.selected.push(id.clone());
            }
        }
        dropped
    }

    pub fn select_all(&mut self) {
        self.selected = self.catalog.iter().map(|tenant| tenant.id.clone()).collect();
    }

    pub fn clear(&mut self) {
        self.selected.clear();
    }

    #[must_use]
    pub fn active_tenant(&self) -> Option<&Tenant> {
        self.selected.first().and_then(|id| self.catalog.get(id))
    }

    pub fn selected_tenants(&self) -> impl Iterator<Item = &Tenant> {
        self.selected.iter().filter_map(|id| self.catalog.get(id))
    }

    /// Union of feature flags enabled on any selected tenant.
    #[must_use]
    pub fn enabled_features(&self) -> BTreeSet<FeatureKey> {
        self.selected_tenants().flat_map(|tenant| tenant.features.iter().copied()).collect()
    }

    /// Selected tenants that enable `feature`, in selection order.
    #[must_use]
    pub fn selected_with_feature(&self, feature: FeatureKey) -> Vec<TenantId> {
        self.selected_tenants()
            .filter(|tenant| tenant.has_feature(feature))
            .map(|tenant| tenant.id.clone())
            .collect()
    }

    #[must_use]
    pub fn tenant_names(&self) -> BTreeMap<TenantId, String> {
        self.selected_tenants().map(|tenant| (tenant.id.clone(), tenant.name.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> TenantCatalog {
        TenantCatalog::new(vec![
            Tenant::new("north", "North Agency", [FeatureKey::Commissions, FeatureKey::Policies]),
            Tenant::new("south", "South Agency", [FeatureKey::Debts]),
            Tenant::new("west", "West Agency", []),
        ])
    }

    #[test]
    fn select_rejects_unknown_tenant() {
        let mut selection = TenantSelection::new(catalog());
        let err = match selection.select(&TenantId::new("east")) {
            Ok(()) => panic!("unknown tenant should be rejected"),
            Err(err) => err,
        };
        assert_eq!(err, PortalError::UnknownTenant("east".to_string()));
        assert!(selection.is_empty());
    }

    #[test]
    fn active_tenant_is_first_selected() -> Result<(), PortalError> {
        let mut selection = TenantSelection::new(catalog());
        selection.select(&TenantId::new("south"))?;
        selection.select(&TenantId::new("north"))?;
        selection.select(&TenantId::new("south"))?;

        assert_eq!(selection.selected_ids().len(), 2);
        assert_eq!(selection.active_tenant().map(|tenant| tenant.name.as_str()), Some("South Agency"));

        assert!(!selection.toggle(&TenantId::new("south"))?);
        assert_eq!(selection.active_tenant().map(|tenant| tenant.name.as_str()), Some("North Agency"));
        Ok(())
    }

    #[test]
    fn enabled_features_is_union_over_selection() -> Result<(), PortalError> {
        let mut selection = TenantSelection::new(catalog());
        assert!(selection.enabled_features().is_empty());

        selection.replace(&[TenantId::new("north"), TenantId::new("south")])?;
        let features = selection.enabled_features();
        assert_eq!(
            features,
            [FeatureKey::Policies, FeatureKey::Commissions, FeatureKey::Debts]
                .into_iter()
                .collect()
        );
        assert_eq!(selection.selected_with_feature(FeatureKey::Debts), vec![TenantId::new("south")]);
        Ok(())
    }

    #[test]
    fn replace_is_all_or_nothing() -> Result<(), PortalError> {
        let mut selection = TenantSelection::new(catalog());
        selection.select(&TenantId::new("west"))?;
        let result = selection.replace(&[TenantId::new("north"), TenantId::new("ghost")]);
        assert!(result.is_err());
        assert_eq!(selection.selected_ids(), &[TenantId::new("west")]);
        Ok(())
    }

    #[test]
    fn restore_drops_revoked_tenants() {
        let mut selection = TenantSelection::new(catalog());
        let dropped = selection.restore(&[TenantId::new("ghost"), TenantId::new("north")]);
        assert_eq!(dropped, vec![TenantId::new("ghost")]);
        assert_eq!(selection.selected_ids(), &[TenantId::new("north")]);
    }

    #[test]
    fn select_all_then_clear() {
        let mut selection = TenantSelection::new(catalog());
        selection.select_all();
        assert_eq!(selection.selected_ids().len(), 3);
        assert_eq!(selection.tenant_names().len(), 3);
        selection.clear();
        assert!(selection.active_tenant().is_none());
    }
}
