use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agency_portal_core::{QueryContext, SummaryReport, TenantBatch, TenantId, ViewKind};
use futures::future::{join_all, try_join, try_join_all};
use serde::Serialize;
use serde_json::Value;

use crate::config::FailurePolicy;
use crate::error::{EngineError, ErrorReport};
use crate::source::TenantDataSource;

/// Raw per-tenant answer before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TenantPayload {
    pub summary: SummaryReport,
    pub rows: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TenantFailure {
    pub tenant_id: TenantId,
    pub error: ErrorReport,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub batches: Vec<TenantBatch<TenantPayload>>,
    pub failures: Vec<TenantFailure>,
}

/// Counts in-flight batches. The loading flag is up while any batch is running.
#[derive(Debug, Clone, Default)]
pub struct LoadingTracker {
    in_flight: Arc<AtomicUsize>,
}

impl LoadingTracker {
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Raise the flag until the returned guard drops, including on error or cancellation.
    #[must_use]
    pub fn begin(&self) -> LoadingGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        LoadingGuard { in_flight: Arc::clone(&self.in_flight) }
    }
}

#[derive(Debug)]
pub struct LoadingGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fans one summary and one record request per tenant out concurrently.
pub struct FetchCoordinator<S> {
    source: Arc<S>,
    policy: FailurePolicy,
    timeout: Option<Duration>,
    loading: LoadingTracker,
}

impl<S: TenantDataSource> FetchCoordinator<S> {
    #[must_use]
    pub fn new(source: Arc<S>, policy: FailurePolicy, timeout: Option<Duration>) -> Self {
        Self { source, policy, timeout, loading: LoadingTracker::default() }
    }

    #[must_use]
    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    #[must_use]
    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    #[must_use]
    pub fn loading(&self) -> &LoadingTracker {
        &self.loading
    }

    /// Fetch every tenant in parallel. Batches keep the order of `tenants`.
    ///
    /// # Errors
    /// Under [`FailurePolicy::FailFast`] the first tenant failure fails the batch.
    /// Under [`FailurePolicy::BestEffort`] tenant failures are listed in
    /// [`FetchOutcome::failures`] instead.
    pub async fn fetch_all(
        &self,
        tenants: &[TenantId],
        view: ViewKind,
        context: &QueryContext,
    ) -> Result<FetchOutcome, EngineError> {
        let _loading = self.loading.begin();
        tracing::debug!(tenants = tenants.len(), view = view.as_str(), policy = ?self.policy, "fetch batch started");

        let outcome = match self.policy {
            FailurePolicy::FailFast => {
                let payloads = try_join_all(
                    tenants.iter().map(|tenant| self.fetch_tenant(tenant, view, context)),
                )
                .await
                .inspect_err(|err| tracing::warn!(error = %err, "fetch batch failed"))?;
                FetchOutcome {
                    batches: tenants
                        .iter()
                        .cloned()
                        .zip(payloads)
                        .map(|(tenant, payload)| TenantBatch::new(tenant, payload))
                        .collect(),
                    failures: Vec::new(),
                }
            }
            FailurePolicy::BestEffort => {
                let results =
                    join_all(tenants.iter().map(|tenant| self.fetch_tenant(tenant, view, context)))
                        .await;
                let mut outcome = FetchOutcome::default();
                for (tenant, result) in tenants.iter().zip(results) {
                    match result {
                        Ok(payload) => outcome.batches.push(TenantBatch::new(tenant.clone(), payload)),
                        Err(err) => {
                            tracing::warn!(tenant = %tenant, error = %err, "tenant fetch failed; continuing");
                            outcome
                                .failures
                                .push(TenantFailure { tenant_id: tenant.clone(), error: err.report() });
                        }
                    }
                }
                outcome
            }
        };

        tracing::debug!(
            succeeded = outcome.batches.len(),
            failed = outcome.failures.len(),
            "fetch batch finished"
        );
        Ok(outcome)
    }

    async fn fetch_tenant(
        &self,
        tenant: &TenantId,
        view: ViewKind,
        context: &QueryContext,
    ) -> Result<TenantPayload, EngineError> {
        let both = try_join(
            self.source.fetch_summary(tenant, view, &context.range),
            self.source.fetch_records(tenant, view, context),
        );
        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, both).await {
                Ok(joined) => joined,
                Err(_) => {
                    return Err(EngineError::Timeout {
                        tenant: tenant.to_string(),
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            },
            None => both.await,
        };
        let (summary, rows) = joined.map_err(|err| EngineError::from_source(tenant.as_str(), err))?;
        Ok(TenantPayload { summary, rows })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use agency_portal_core::DateRange;
    use serde_json::json;
    use time::macros::{date, offset};

    use super::*;
    use crate::error::ErrorCategory;
    use crate::fixture::FixtureSource;

    fn context() -> QueryContext {
        match DateRange::for_days(date!(2026 - 01 - 01), date!(2026 - 12 - 31), offset!(UTC)) {
            Ok(range) => QueryContext::new(range),
            Err(err) => panic!("range should build: {err}"),
        }
    }

    fn source() -> Arc<FixtureSource> {
        let raw = json!({
            "tenants": [],
            "records": {
                "north": {"commissions": [{"id": "n-1"}]},
                "south": {"commissions": [{"id": "s-1"}, {"id": "s-2"}]}
            },
            "failing_tenants": ["east"]
        });
        match FixtureSource::from_json_str(&raw.to_string()) {
            Ok(source) => Arc::new(source),
            Err(err) => panic!("fixture should parse: {err}"),
        }
    }

    fn tenants(ids: &[&str]) -> Vec<TenantId> {
        ids.iter().map(|id| TenantId::new(*id)).collect()
    }

    #[tokio::test]
    async fn batches_keep_tenant_order_and_tags() -> Result<(), EngineError> {
        let coordinator = FetchCoordinator::new(source(), FailurePolicy::FailFast, None);
        let outcome = coordinator
            .fetch_all(&tenants(&["south", "north"]), ViewKind::Commissions, &context())
            .await?;
        let tags = outcome.batches.iter().map(|batch| batch.tenant_id.as_str()).collect::<Vec<_>>();
        assert_eq!(tags, vec!["south", "north"]);
        assert_eq!(outcome.batches[0].payload.rows.len(), 2);
        assert!(!coordinator.loading().is_loading());
        Ok(())
    }

    #[tokio::test]
    async fn fail_fast_fails_whole_batch() {
        let coordinator = FetchCoordinator::new(source(), FailurePolicy::FailFast, None);
        let result = coordinator
            .fetch_all(&tenants(&["north", "east"]), ViewKind::Commissions, &context())
            .await;
        let err = match result {
            Ok(_) => panic!("a failing tenant should fail the batch"),
            Err(err) => err,
        };
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert!(err.to_string().contains("east"));
        assert!(!coordinator.loading().is_loading());
    }

    #[tokio::test]
    async fn best_effort_reports_failures_and_keeps_successes() -> Result<(), EngineError> {
        let coordinator = FetchCoordinator::new(source(), FailurePolicy::BestEffort, None);
        let outcome = coordinator
            .fetch_all(&tenants(&["north", "east", "south"]), ViewKind::Commissions, &context())
            .await?;
        let succeeded = outcome.batches.iter().map(|batch| batch.tenant_id.clone()).collect::<BTreeSet<_>>();
        assert_eq!(succeeded, tenants(&["north", "south"]).into_iter().collect());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].tenant_id, TenantId::new("east"));
        assert!(outcome.failures[0].error.retryable);
        Ok(())
    }

    #[test]
    fn loading_guard_counts_overlapping_batches() {
        let tracker = LoadingTracker::default();
        let first = tracker.begin();
        let second = tracker.begin();
        drop(first);
        assert!(tracker.is_loading());
        drop(second);
        assert!(!tracker.is_loading());
    }
}
