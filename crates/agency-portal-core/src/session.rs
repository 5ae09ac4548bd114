use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::pipeline::ViewConfig;
use crate::tenancy::TenantId;
use crate::view_state::ViewState;
use crate::PortalError;

pub const SESSION_NAMESPACE: &str = "agency-portal.v1";
pub const STATE_FORMAT_VERSION: u32 = 1;
const TENANT_DIGEST_LEN: usize = 16;

/// Key/value store for session-scoped UI state.
pub trait SessionStore: Send + Sync {
    /// # Errors
    /// Returns [`PortalError::Storage`] when the backing store cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, PortalError>;

    /// # Errors
    /// Returns [`PortalError::Storage`] when the backing store cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<(), PortalError>;

    /// # Errors
    /// Returns [`PortalError::Storage`] when the backing store cannot be written.
    fn remove(&self, key: &str) -> Result<(), PortalError>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Result<Option<String>, PortalError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PortalError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PortalError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Scoped store key. View state is scoped by user, view and tenant set so that
/// switching agencies never shows filters chosen for a different set.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    #[must_use]
    pub fn view_state(user: &str, view_id: &str, tenants: &[TenantId]) -> Self {
        Self(format!(
            "{SESSION_NAMESPACE}/{}/{}/{}",
            segment(user),
            segment(view_id),
            tenant_scope_digest(tenants)
        ))
    }

    #[must_use]
    pub fn tenant_selection(user: &str) -> Self {
        Self(format!("{SESSION_NAMESPACE}/{}/tenant-selection", segment(user)))
    }

    /// Prefix shared by every key of one user.
    #[must_use]
    pub fn user_prefix(user: &str) -> String {
        format!("{SESSION_NAMESPACE}/{}/", segment(user))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn segment(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "_".to_string();
    }
    trimmed.replace('/', "_")
}

/// Order-insensitive digest of a tenant set: hex SHA-256 of the sorted, deduplicated ids.
#[must_use]
pub fn tenant_scope_digest(tenants: &[TenantId]) -> String {
    let mut ids = tenants.iter().map(TenantId::as_str).collect::<Vec<_>>();
    ids.sort_unstable();
    ids.dedup();
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
        hasher.update([0_u8]);
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(TENANT_DIGEST_LEN);
    digest
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    #[serde(with = "time::serde::rfc3339")]
    saved_at: OffsetDateTime,
    state: T,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RestoreSource {
    Restored,
    Defaulted { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoredState<T> {
    pub state: T,
    pub source: RestoreSource,
}

impl<T> RestoredState<T> {
    fn defaulted(state: T, reason: impl Into<String>) -> Self {
        Self { state, source: RestoreSource::Defaulted { reason: reason.into() } }
    }
}

fn load_envelope<T: DeserializeOwned>(store: &dyn SessionStore, key: &SessionKey) -> Result<T, String> {
    let raw = match store.get(key.as_str()) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Err("no saved state".to_string()),
        Err(err) => return Err(format!("session store unavailable: {err}")),
    };
    let envelope: Envelope<serde_json::Value> =
        serde_json::from_str(&raw).map_err(|err| format!("malformed saved state: {err}"))?;
    if envelope.version != STATE_FORMAT_VERSION {
        return Err(format!(
            "saved state version {} does not match {STATE_FORMAT_VERSION}",
            envelope.version
        ));
    }
    serde_json::from_value(envelope.state).map_err(|err| format!("malformed saved state: {err}"))
}

fn save_envelope<T: Serialize>(
    store: &dyn SessionStore,
    key: &SessionKey,
    state: &T,
) -> Result<(), PortalError> {
    let envelope =
        Envelope { version: STATE_FORMAT_VERSION, saved_at: OffsetDateTime::now_utc(), state };
    let raw = serde_json::to_string(&envelope)
        .map_err(|err| PortalError::Storage(format!("failed to encode session state: {err}")))?;
    store.set(key.as_str(), &raw)
}

/// Load a view's persisted state. Never fails: anything unusable yields the view's
/// defaults and the reason.
#[must_use]
pub fn load_view_state(
    store: &dyn SessionStore,
    key: &SessionKey,
    config: &ViewConfig,
) -> RestoredState<ViewState> {
    match load_envelope::<ViewState>(store, key) {
        Ok(state) => RestoredState { state: state.sanitized(config), source: RestoreSource::Restored },
        Err(reason) => RestoredState::defaulted(ViewState::defaults(config), reason),
    }
}

/// # Errors
/// Returns [`PortalError::Storage`] when the state cannot be encoded or written.
pub fn save_view_state(
    store: &dyn SessionStore,
    key: &SessionKey,
    state: &ViewState,
) -> Result<(), PortalError> {
    save_envelope(store, key, state)
}

/// # Errors
/// Returns [`PortalError::Storage`] when the store cannot be written.
pub fn clear_view_state(store: &dyn SessionStore, key: &SessionKey) -> Result<(), PortalError> {
    store.remove(key.as_str())
}

#[must_use]
pub fn load_tenant_selection(store: &dyn SessionStore, user: &str) -> RestoredState<Vec<TenantId>> {
    match load_envelope::<Vec<TenantId>>(store, &SessionKey::tenant_selection(user)) {
        Ok(ids) => RestoredState { state: ids, source: RestoreSource::Restored },
        Err(reason) => RestoredState::defaulted(Vec::new(), reason),
    }
}

/// # Errors
/// Returns [`PortalError::Storage`] when the selection cannot be encoded or written.
pub fn save_tenant_selection(
    store: &dyn SessionStore,
    user: &str,
    ids: &[TenantId],
) -> Result<(), PortalError> {
    save_envelope(store, &SessionKey::tenant_selection(user), &ids)
}
