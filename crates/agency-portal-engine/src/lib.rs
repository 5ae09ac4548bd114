//! Async view engine for the agency portal.
//!
//! A [`ViewEngine`] owns one view over the user's selected tenants: it fans fetches
//! out through a [`TenantDataSource`], merges the answers, runs the query pipeline
//! and persists view state through a [`agency_portal_core::SessionStore`].

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod fixture;
pub mod source;

pub use config::{EngineConfig, FailurePolicy};
pub use coordinator::{
    FetchCoordinator, FetchOutcome, LoadingGuard, LoadingTracker, TenantFailure, TenantPayload,
};
pub use engine::{RefreshOutcome, SessionContext, ViewEngine, ViewSnapshot};
pub use error::{EngineError, ErrorCategory, ErrorReport, SourceError};
pub use fixture::FixtureSource;
pub use source::{AccessGrant, TenantDataSource};
