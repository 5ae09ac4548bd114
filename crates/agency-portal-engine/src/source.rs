use std::future::Future;

use agency_portal_core::{DateRange, QueryContext, SummaryReport, Tenant, TenantId, ViewKind};
use serde_json::{Map, Value};

use crate::error::SourceError;

/// Per-tenant backend consumed by the engine. Implementations own transport and auth;
/// rows come back raw and are normalized by the engine.
pub trait TenantDataSource: Send + Sync {
    fn fetch_summary(
        &self,
        tenant: &TenantId,
        view: ViewKind,
        range: &DateRange,
    ) -> impl Future<Output = Result<SummaryReport, SourceError>> + Send;

    fn fetch_records(
        &self,
        tenant: &TenantId,
        view: ViewKind,
        context: &QueryContext,
    ) -> impl Future<Output = Result<Vec<Value>, SourceError>> + Send;

    fn delete_record(
        &self,
        tenant: &TenantId,
        view: ViewKind,
        record_id: &str,
        reason: &str,
    ) -> impl Future<Output = Result<(), SourceError>> + Send;

    fn update_record(
        &self,
        tenant: &TenantId,
        view: ViewKind,
        record_id: &str,
        patch: &Map<String, Value>,
    ) -> impl Future<Output = Result<(), SourceError>> + Send;
}

/// Tenants the signed-in user may access.
pub trait AccessGrant: Send + Sync {
    fn tenant_catalog(&self) -> impl Future<Output = Result<Vec<Tenant>, SourceError>> + Send;
}
