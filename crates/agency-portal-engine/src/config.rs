use std::path::Path;
use std::time::Duration;

use agency_portal_core::pipeline::MAX_ROWS_PER_PAGE;
use agency_portal_core::{MergeKey, ViewConfig, ViewKind};
use serde::{Deserialize, Serialize};
use time::UtcOffset;

use crate::error::EngineError;

/// What a refresh does when some tenants fail.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any tenant failure fails the whole batch.
    #[default]
    FailFast,
    /// Merge the tenants that answered and report the rest.
    BestEffort,
}

/// Runtime settings shared by every view engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub failure_policy: FailurePolicy,
    /// Overrides the per-view default page size.
    pub default_rows_per_page: Option<usize>,
    /// Per-tenant fetch timeout. `None` waits indefinitely.
    pub fetch_timeout_ms: Option<u64>,
    /// Offset used to turn calendar days into instants.
    pub utc_offset_minutes: i16,
    pub merge_key: MergeKey,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::FailFast,
            default_rows_per_page: None,
            fetch_timeout_ms: None,
            utc_offset_minutes: 0,
            merge_key: MergeKey::Label,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`EngineError::Validation`] when the YAML is malformed or out of range.
    pub fn from_yaml_str(raw: &str) -> Result<Self, EngineError> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|err| EngineError::Validation(format!("invalid engine config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Validation(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] for a zero or oversized page size, a zero
    /// timeout, or an offset outside +-23:59.
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(rows) = self.default_rows_per_page {
            if rows == 0 || rows > MAX_ROWS_PER_PAGE {
                return Err(EngineError::Validation(format!(
                    "default_rows_per_page must be between 1 and {MAX_ROWS_PER_PAGE}"
                )));
            }
        }
        if self.fetch_timeout_ms == Some(0) {
            return Err(EngineError::Validation("fetch_timeout_ms must be positive".to_string()));
        }
        self.utc_offset()?;
        Ok(())
    }

    /// # Errors
    /// Returns [`EngineError::Validation`] when the offset is out of range.
    pub fn utc_offset(&self) -> Result<UtcOffset, EngineError> {
        let seconds = i32::from(self.utc_offset_minutes) * 60;
        UtcOffset::from_whole_seconds(seconds)
            .map_err(|err| EngineError::Validation(format!("invalid utc_offset_minutes: {err}")))
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    /// Preset for `kind` with this config's page-size override applied.
    #[must_use]
    pub fn view_config(&self, kind: ViewKind) -> ViewConfig {
        let mut config = ViewConfig::preset(kind);
        if let Some(rows) = self.default_rows_per_page {
            config.rows_per_page = rows;
        }
        config
    }
}
