//! Pure building blocks of the multi-tenant agency portal: tenant selection, per-tenant
//! normalization and merge, the search/facet/sort/paginate pipeline, bulk selection,
//! rollups and session-scoped view state.

pub mod merge;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod query;
pub mod rollups;
pub mod selection;
pub mod session;
pub mod tenancy;
pub mod view_state;

pub use merge::{merge_records, merge_reports, merge_summaries, merge_summaries_by, MergeKey};
pub use model::{
    CategorySummary, Cents, FieldValue, PortalRecord, RecordKey, SummaryDimension, SummaryReport,
    TenantBatch,
};
pub use normalize::{normalize_records, normalize_summary, NormalizeOutcome, SkippedRow};
pub use pipeline::{
    facet_options, paginate, run_query, QueryWindow, SortDirection, SortSpec, ToggleKind,
    ToggleSpec, ViewConfig, ViewKind,
};
pub use query::{DateRange, QueryContext};
pub use rollups::{compute_rollups, rollup_by, Rollup};
pub use selection::{SelectionBanner, SelectionSet};
pub use session::{
    MemorySessionStore, RestoreSource, RestoredState, SessionKey, SessionStore,
};
pub use tenancy::{FeatureKey, Tenant, TenantCatalog, TenantId, TenantSelection};
pub use view_state::{RangeFilter, TriState, ViewState};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PortalError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown tenant: {0}")]
    UnknownTenant(String),
    #[error("storage error: {0}")]
    Storage(String),
}
