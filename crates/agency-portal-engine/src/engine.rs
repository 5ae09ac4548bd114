use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agency_portal_core::session::{self, RestoreSource, SessionKey, SessionStore};
use agency_portal_core::{
    compute_rollups, facet_options, merge_records, merge_reports, normalize_records,
    normalize_summary, run_query, DateRange, FeatureKey, MergeKey, PortalError, PortalRecord,
    QueryContext, RangeFilter, RecordKey, Rollup, SelectionBanner, SelectionSet, SortSpec,
    SummaryReport, TenantBatch, TenantCatalog, TenantId, TenantSelection, TriState, ViewConfig,
    ViewKind, ViewState,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::coordinator::{FetchCoordinator, FetchOutcome, TenantFailure};
use crate::error::{EngineError, ErrorReport};
use crate::source::{AccessGrant, TenantDataSource};

/// Who is looking and which tenants they may see.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user: String,
    pub catalog: TenantCatalog,
}

impl SessionContext {
    #[must_use]
    pub fn new(user: impl Into<String>, catalog: TenantCatalog) -> Self {
        Self { user: user.into(), catalog }
    }

    /// # Errors
    /// Returns the grant failure attributed to the `access` pseudo-tenant.
    pub async fn from_grant<G: AccessGrant>(user: impl Into<String>, grant: &G) -> Result<Self, EngineError> {
        let tenants = grant
            .tenant_catalog()
            .await
            .map_err(|err| EngineError::from_source("access", err))?;
        Ok(Self::new(user, TenantCatalog::new(tenants)))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Applied {
        generation: u64,
        tenants: usize,
        records: usize,
        skipped_rows: usize,
        failed_tenants: usize,
    },
    /// A newer refresh or a tenant/context change was issued while this one ran.
    Superseded { generation: u64, latest: u64 },
}

/// Everything a view renders, detached from the engine lock.
#[derive(Debug, Clone, Serialize)]
pub struct ViewSnapshot {
    pub view: ViewKind,
    pub tenants: Vec<TenantId>,
    pub active_tenant: Option<String>,
    pub enabled_features: BTreeSet<FeatureKey>,
    pub context: QueryContext,
    pub summary: SummaryReport,
    pub rows: Vec<PortalRecord>,
    pub total_records: usize,
    pub total_matching: usize,
    pub page: usize,
    pub page_count: usize,
    pub rows_per_page: usize,
    pub view_state: ViewState,
    pub restore_source: RestoreSource,
    pub selected_count: usize,
    pub page_selected: bool,
    pub all_matching_selected: bool,
    pub banner: Option<SelectionBanner>,
    pub rollups: BTreeMap<String, Vec<Rollup>>,
    pub facet_options: BTreeMap<String, Vec<String>>,
    pub loading: bool,
    pub last_error: Option<ErrorReport>,
    pub failures: Vec<TenantFailure>,
    pub skipped_rows: usize,
    pub generation: u64,
}

struct EngineState {
    tenants: TenantSelection,
    context: QueryContext,
    view_state: ViewState,
    restore_source: RestoreSource,
    selection: SelectionSet,
    summary: SummaryReport,
    records: Vec<PortalRecord>,
    rollups: BTreeMap<String, Vec<Rollup>>,
    failures: Vec<TenantFailure>,
    skipped_rows: usize,
    last_error: Option<ErrorReport>,
    applied_generation: u64,
}

struct MergedView {
    tenants: usize,
    summary: SummaryReport,
    records: Vec<PortalRecord>,
    skipped_rows: usize,
    failures: Vec<TenantFailure>,
}

/// One view (commissions, policies, debts, policy records) over the selected tenants.
///
/// All state sits behind one lock that is never held across an `.await`; refresh
/// results are applied only if no newer refresh or scope change was issued meanwhile.
pub struct ViewEngine<S> {
    config: ViewConfig,
    merge_key: MergeKey,
    user: String,
    coordinator: FetchCoordinator<S>,
    store: Arc<dyn SessionStore>,
    generation: AtomicU64,
    state: Mutex<EngineState>,
}

impl<S: TenantDataSource> ViewEngine<S> {
    /// Build an engine and restore the user's tenant selection and view state.
    ///
    /// Without a persisted selection every granted tenant is selected.
    #[must_use]
    pub fn new(
        config: ViewConfig,
        settings: &EngineConfig,
        source: Arc<S>,
        store: Arc<dyn SessionStore>,
        session: SessionContext,
        context: QueryContext,
    ) -> Self {
        let SessionContext { user, catalog } = session;
        let mut tenants = TenantSelection::new(catalog);
        let persisted = session::load_tenant_selection(store.as_ref(), &user);
        match persisted.source {
            RestoreSource::Restored => {
                let dropped = tenants.restore(&persisted.state);
                if !dropped.is_empty() {
                    tracing::info!(user = %user, dropped = ?dropped, "dropped tenants no longer granted");
                }
            }
            RestoreSource::Defaulted { reason } => {
                tracing::debug!(user = %user, %reason, "tenant selection defaulted to every granted tenant");
                tenants.select_all();
            }
        }

        let key = SessionKey::view_state(&user, config.view_id(), tenants.selected_ids());
        let restored = session::load_view_state(store.as_ref(), &key, &config);
        if let RestoreSource::Defaulted { reason } = &restored.source {
            tracing::debug!(key = %key, %reason, "view state defaulted");
        }

        let coordinator =
            FetchCoordinator::new(source, settings.failure_policy, settings.fetch_timeout());
        Self {
            merge_key: settings.merge_key,
            user,
            coordinator,
            store,
            generation: AtomicU64::new(0),
            state: Mutex::new(EngineState {
                tenants,
                context,
                view_state: restored.state,
                restore_source: restored.source,
                selection: SelectionSet::new(),
                summary: SummaryReport::new(),
                records: Vec::new(),
                rollups: BTreeMap::new(),
                failures: Vec::new(),
                skipped_rows: 0,
                last_error: None,
                applied_generation: 0,
            }),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.coordinator.loading().is_loading()
    }

    #[must_use]
    pub fn view_state(&self) -> ViewState {
        self.state.lock().view_state.clone()
    }

    #[must_use]
    pub fn selected_tenants(&self) -> Vec<TenantId> {
        self.state.lock().tenants.selected_ids().to_vec()
    }

    #[must_use]
    pub fn catalog(&self) -> TenantCatalog {
        self.state.lock().tenants.catalog().clone()
    }

    #[must_use]
    pub fn query_context(&self) -> QueryContext {
        self.state.lock().context.clone()
    }

    #[must_use]
    pub fn records(&self) -> Vec<PortalRecord> {
        self.state.lock().records.clone()
    }

    /// Re-fetch every selected tenant that enables this view's feature, then merge,
    /// recompute rollups and reconcile the record selection.
    ///
    /// # Errors
    /// Returns the batch failure under fail-fast; it is also kept as `last_error` and
    /// the previously merged data stays in place.
    #[tracing::instrument(skip(self), fields(view = self.config.view_id()))]
    pub async fn refresh(&self) -> Result<RefreshOutcome, EngineError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tenants, context, names) = {
            let state = self.state.lock();
            (
                state.tenants.selected_with_feature(self.config.feature),
                state.context.clone(),
                state.tenants.tenant_names(),
            )
        };

        let result = self.coordinator.fetch_all(&tenants, self.config.view, &context).await;
        let merged = result.map(|outcome| self.merge_outcome(outcome, &names));

        let mut state = self.state.lock();
        let latest = self.generation.load(Ordering::SeqCst);
        if generation != latest {
            tracing::debug!(generation, latest, "discarding stale fetch result");
            return Ok(RefreshOutcome::Superseded { generation, latest });
        }

        let merged = match merged {
            Ok(merged) => merged,
            Err(err) => {
                state.last_error = Some(err.report());
                return Err(err);
            }
        };

        let dropped = state.selection.reconcile(merged.records.iter().map(|record| &record.key));
        if !dropped.is_empty() {
            tracing::debug!(dropped = dropped.len(), "selection reconciled");
        }
        let outcome = RefreshOutcome::Applied {
            generation,
            tenants: merged.tenants,
            records: merged.records.len(),
            skipped_rows: merged.skipped_rows,
            failed_tenants: merged.failures.len(),
        };
        state.rollups = compute_rollups(&merged.records, &self.config.rollup_fields);
        state.summary = merged.summary;
        state.records = merged.records;
        state.skipped_rows = merged.skipped_rows;
        state.failures = merged.failures;
        state.last_error = None;
        state.applied_generation = generation;
        tracing::debug!(generation, records = state.records.len(), "refresh applied");
        Ok(outcome)
    }

    fn merge_outcome(&self, outcome: FetchOutcome, names: &BTreeMap<TenantId, String>) -> MergedView {
        let tenants = outcome.batches.len();
        let mut skipped_rows = 0;
        let mut reports = Vec::with_capacity(tenants);
        let mut record_batches = Vec::with_capacity(tenants);
        for TenantBatch { tenant_id, payload } in outcome.batches {
            let normalized = normalize_records(&tenant_id, &payload.rows);
            if let Some(first) = normalized.skipped.first() {
                tracing::warn!(
                    tenant = %tenant_id,
                    skipped = normalized.skipped.len(),
                    first_reason = %first.reason,
                    "skipped malformed rows"
                );
            }
            skipped_rows += normalized.skipped.len();
            reports.push(normalize_summary(payload.summary));
            record_batches.push(TenantBatch::new(tenant_id, normalized.records));
        }
        MergedView {
            tenants,
            summary: merge_reports(&reports, self.merge_key),
            records: merge_records(record_batches, names),
            skipped_rows,
            failures: outcome.failures,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ViewSnapshot {
        let state = self.state.lock();
        let window = run_query(&state.records, &self.config, &state.view_state);
        let page_keys = window.page_keys();
        let matching_keys = window.matching_keys();
        ViewSnapshot {
            view: self.config.view,
            tenants: state.tenants.selected_ids().to_vec(),
            active_tenant: state.tenants.active_tenant().map(|tenant| tenant.name.clone()),
            enabled_features: state.tenants.enabled_features(),
            context: state.context.clone(),
            summary: state.summary.clone(),
            rows: window.page_rows().iter().map(|record| (*record).clone()).collect(),
            total_records: state.records.len(),
            total_matching: window.total_matching(),
            page: window.page(),
            page_count: window.page_count(),
            rows_per_page: window.page_size(),
            view_state: state.view_state.clone(),
            restore_source: state.restore_source.clone(),
            selected_count: state.selection.len(),
            page_selected: state.selection.is_page_selected(&page_keys),
            all_matching_selected: state.selection.is_all_matching_selected(&matching_keys),
            banner: state.selection.banner(&page_keys, &matching_keys),
            rollups: state.rollups.clone(),
            facet_options: self
                .config
                .facet_fields
                .iter()
                .map(|field| (field.clone(), facet_options(&state.records, field)))
                .collect(),
            loading: self.coordinator.loading().is_loading(),
            last_error: state.last_error.clone(),
            failures: state.failures.clone(),
            skipped_rows: state.skipped_rows,
            generation: state.applied_generation,
        }
    }

    fn scope_key(&self, state: &EngineState) -> SessionKey {
        SessionKey::view_state(&self.user, self.config.view_id(), state.tenants.selected_ids())
    }

    fn persist_view_state(&self, state: &EngineState) {
        let key = self.scope_key(state);
        if let Err(err) = session::save_view_state(self.store.as_ref(), &key, &state.view_state) {
            tracing::warn!(key = %key, error = %err, "failed to persist view state");
        }
    }

    fn update_view_state<R>(&self, change: impl FnOnce(&mut ViewState) -> R) -> R {
        let mut state = self.state.lock();
        let result = change(&mut state.view_state);
        self.persist_view_state(&state);
        result
    }

    pub fn set_search_term(&self, term: impl Into<String>) {
        let term = term.into();
        self.update_view_state(|view_state| view_state.set_search_term(term));
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when `field` is not a facet of this view.
    pub fn set_facet(&self, field: &str, values: BTreeSet<String>) -> Result<(), EngineError> {
        self.ensure_facet(field)?;
        self.update_view_state(|view_state| view_state.set_facet(field, values));
        Ok(())
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when `field` is not a facet of this view.
    pub fn toggle_facet_value(&self, field: &str, value: &str) -> Result<(), EngineError> {
        self.ensure_facet(field)?;
        self.update_view_state(|view_state| view_state.toggle_facet_value(field, value));
        Ok(())
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when `field` is not a tri-state filter of this view.
    pub fn set_toggle(&self, field: &str, mode: TriState) -> Result<(), EngineError> {
        if !self.config.toggles.iter().any(|toggle| toggle.field == field) {
            return Err(EngineError::Validation(format!(
                "{field} is not a tri-state filter of {}",
                self.config.view_id()
            )));
        }
        self.update_view_state(|view_state| view_state.set_toggle(field, mode));
        Ok(())
    }

    pub fn set_range(&self, field: &str, range: RangeFilter) {
        self.update_view_state(|view_state| view_state.set_range(field, range));
    }

    pub fn clear_range(&self, field: &str) {
        self.update_view_state(|view_state| view_state.clear_range(field));
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when the key is not sortable in this view.
    pub fn set_sort(&self, sort: Option<SortSpec>) -> Result<(), EngineError> {
        if let Some(spec) = &sort {
            self.ensure_sortable(&spec.key)?;
        }
        self.update_view_state(|view_state| view_state.set_sort(sort));
        Ok(())
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when the key is not sortable in this view.
    pub fn sort_by_column(&self, key: &str) -> Result<(), EngineError> {
        self.ensure_sortable(key)?;
        self.update_view_state(|view_state| view_state.sort_by_column(&self.config, key));
        Ok(())
    }

    pub fn set_page(&self, page: usize) {
        self.update_view_state(|view_state| view_state.set_page(page));
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] for a zero or oversized page size.
    pub fn set_rows_per_page(&self, rows: usize) -> Result<(), EngineError> {
        self.update_view_state(|view_state| view_state.set_rows_per_page(rows))?;
        Ok(())
    }

    pub fn reset_filters(&self) {
        self.update_view_state(|view_state| view_state.reset(&self.config));
    }

    fn ensure_facet(&self, field: &str) -> Result<(), EngineError> {
        if self.config.facet_fields.iter().any(|facet| facet == field) {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "{field} is not a facet of {}",
                self.config.view_id()
            )))
        }
    }

    fn ensure_sortable(&self, key: &str) -> Result<(), EngineError> {
        if self.config.is_sortable(key) {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "{key} is not sortable in {}",
                self.config.view_id()
            )))
        }
    }

    /// Apply a tenant-selection change, then see [`Self::tenants_changed`].
    fn change_tenants<R>(
        &self,
        change: impl FnOnce(&mut TenantSelection) -> Result<R, PortalError>,
    ) -> Result<R, EngineError> {
        let mut state = self.state.lock();
        let result = change(&mut state.tenants)?;
        self.tenants_changed(&mut state);
        Ok(result)
    }

    fn update_tenants(&self, change: impl FnOnce(&mut TenantSelection)) {
        let mut state = self.state.lock();
        change(&mut state.tenants);
        self.tenants_changed(&mut state);
    }

    /// Persist the selection, switch to the view state scoped to the new set and
    /// invalidate any in-flight refresh.
    fn tenants_changed(&self, state: &mut EngineState) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Err(err) =
            session::save_tenant_selection(self.store.as_ref(), &self.user, state.tenants.selected_ids())
        {
            tracing::warn!(user = %self.user, error = %err, "failed to persist tenant selection");
        }
        let key = self.scope_key(state);
        let restored = session::load_view_state(self.store.as_ref(), &key, &self.config);
        state.view_state = restored.state;
        state.restore_source = restored.source;
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when any id is outside the grant; the
    /// selection is left unchanged.
    pub fn select_tenants(&self, ids: &[TenantId]) -> Result<(), EngineError> {
        self.change_tenants(|tenants| tenants.replace(ids))
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when the id is outside the grant.
    pub fn toggle_tenant(&self, id: &TenantId) -> Result<bool, EngineError> {
        self.change_tenants(|tenants| tenants.toggle(id))
    }

    pub fn select_all_tenants(&self) {
        self.update_tenants(TenantSelection::select_all);
    }

    pub fn clear_tenants(&self) {
        self.update_tenants(TenantSelection::clear);
    }

    /// Replace the fetch context. Takes effect on the next refresh; an in-flight
    /// refresh for the old context is discarded.
    pub fn set_query_context(&self, context: QueryContext) {
        let mut state = self.state.lock();
        state.context = context;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_date_range(&self, range: DateRange) {
        let mut context = self.query_context();
        context.range = range;
        self.set_query_context(context);
    }

    pub fn set_category_filter(&self, category: Option<String>) {
        let context = self.query_context();
        let context = match category {
            Some(category) => context.with_category(category),
            None => QueryContext { category_filter: None, ..context },
        };
        self.set_query_context(context);
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when the key is not in the merged set.
    pub fn toggle_record(&self, key: &RecordKey) -> Result<bool, EngineError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.records.iter().any(|record| &record.key == key) {
            return Err(EngineError::Validation(format!("unknown record {key}")));
        }
        Ok(state.selection.toggle(key.clone()))
    }

    pub fn toggle_page(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let page_keys = run_query(&state.records, &self.config, &state.view_state).page_keys();
        state.selection.toggle_page(&page_keys);
    }

    /// Escalate to every record matching the current filters; returns how many.
    pub fn select_all_matching(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let matching = run_query(&state.records, &self.config, &state.view_state).matching_keys();
        state.selection.select_all_matching(&matching);
        matching.len()
    }

    pub fn clear_selection(&self) {
        self.state.lock().selection.clear();
    }

    #[must_use]
    pub fn selected_keys(&self) -> Vec<RecordKey> {
        self.state.lock().selection.keys().cloned().collect()
    }

    /// Selected records that still resolve, one JSON document per line.
    ///
    /// # Errors
    /// Returns [`EngineError::Internal`] when a record cannot be encoded.
    pub fn export_selected(&self) -> Result<String, EngineError> {
        let state = self.state.lock();
        let mut out = String::new();
        for record in state.selection.resolve_selected(&state.records) {
            let line = serde_json::to_string(record).map_err(|err| {
                EngineError::Internal(format!("failed to encode record {}: {err}", record.key))
            })?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    fn locate(&self, key: &RecordKey) -> Result<(TenantId, String), EngineError> {
        self.state
            .lock()
            .records
            .iter()
            .find(|record| &record.key == key)
            .map(|record| (record.tenant_id.clone(), record.record_id.clone()))
            .ok_or_else(|| EngineError::Validation(format!("unknown record {key}")))
    }

    /// Delete through the owning tenant's backend, then re-fetch.
    ///
    /// # Errors
    /// Rejects an empty reason or unknown record before calling the backend; backend
    /// refusals are returned with local state untouched.
    pub async fn delete_record(&self, key: &RecordKey, reason: &str) -> Result<RefreshOutcome, EngineError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::Validation("a delete reason is required".to_string()));
        }
        let (tenant, record_id) = self.locate(key)?;
        self.coordinator
            .source()
            .delete_record(&tenant, self.config.view, &record_id, reason)
            .await
            .map_err(|err| EngineError::from_source(tenant.as_str(), err))
            .inspect_err(|err| tracing::warn!(record = %key, error = %err, "delete rejected"))?;
        tracing::info!(record = %key, "record deleted");
        self.refresh().await
    }

    /// Patch through the owning tenant's backend, then re-fetch.
    ///
    /// # Errors
    /// Rejects a non-object or empty patch and unknown records before calling the
    /// backend; backend refusals are returned with local state untouched.
    pub async fn update_record(&self, key: &RecordKey, patch: Value) -> Result<RefreshOutcome, EngineError> {
        let Value::Object(patch) = patch else {
            return Err(EngineError::Validation("patch must be a JSON object".to_string()));
        };
        if patch.is_empty() {
            return Err(EngineError::Validation("patch must change at least one field".to_string()));
        }
        let (tenant, record_id) = self.locate(key)?;
        self.coordinator
            .source()
            .update_record(&tenant, self.config.view, &record_id, &patch)
            .await
            .map_err(|err| EngineError::from_source(tenant.as_str(), err))
            .inspect_err(|err| tracing::warn!(record = %key, error = %err, "update rejected"))?;
        tracing::info!(record = %key, fields = patch.len(), "record updated");
        self.refresh().await
    }
}
