//! # Stream Abort Registry
//!
//! Process-wide map from request id to the cancellation handle of an
//! in-flight orchestration, so a separate "stop generation" call can reach it.
//!
//! Entries live only in memory. [`AbortRegistry::register`] hands back an
//! [`AbortGuard`]; dropping the guard removes the entry, which covers the
//! success, error and cancel paths alike.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use relay_core::ids::RequestId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

static GLOBAL: OnceLock<Arc<AbortRegistry>> = OnceLock::new();

/// Cancellation handle for one request.
#[derive(Clone, Debug, Default)]
pub struct AbortEntry {
    /// Token observed by the client and the orchestrator.
    pub controller: CancellationToken,
    /// Set once the request has been aborted.
    pub cancel_state: Arc<AtomicBool>,
    /// Only this owner may abort, when set.
    pub owner_id: Option<String>,
}

impl AbortEntry {
    /// Fresh entry owned by `owner_id`.
    #[must_use]
    pub fn new(owner_id: Option<String>) -> Self {
        Self {
            owner_id,
            ..Self::default()
        }
    }

    fn permits(&self, requester: Option<&str>) -> bool {
        match self.owner_id.as_deref() {
            None => true,
            Some(owner) => requester == Some(owner),
        }
    }
}

/// Concurrent request-id → [`AbortEntry`] map.
#[derive(Debug, Default)]
pub struct AbortRegistry {
    entries: DashMap<String, AbortEntry>,
}

impl AbortRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Register `entry` under `request_id`. The entry is removed when the
    /// returned guard drops.
    ///
    /// A second registration under the same id replaces the first; the
    /// earlier guard then leaves the new entry alone.
    pub fn register(self: &Arc<Self>, request_id: &RequestId, entry: AbortEntry) -> AbortGuard {
        let guard = AbortGuard {
            registry: Arc::clone(self),
            request_id: request_id.clone(),
            token: entry.controller.clone(),
            cancel_state: Arc::clone(&entry.cancel_state),
        };
        if self.entries.insert(request_id.to_string(), entry).is_some() {
            warn!(request_id = %request_id, "replaced existing abort entry");
        }
        guard
    }

    /// Remove the entry for `request_id`. Returns whether one existed.
    pub fn unregister(&self, request_id: &str) -> bool {
        self.entries.remove(request_id).is_some()
    }

    /// Cancel `request_id` on behalf of `requester`.
    ///
    /// Returns `false` for unknown ids and when the entry has an owner other
    /// than `requester`; in both cases nothing is touched.
    pub fn abort(&self, request_id: &str, requester: Option<&str>) -> bool {
        let Some((_, entry)) = self.entries.remove_if(request_id, |_, e| e.permits(requester)) else {
            if self.entries.contains_key(request_id) {
                warn!(request_id, "abort denied for non-owner");
            }
            return false;
        };
        entry.cancel_state.store(true, Ordering::SeqCst);
        entry.controller.cancel();
        debug!(request_id, "request aborted");
        true
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `request_id` is registered.
    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }
}

/// Unregisters its entry on drop.
#[derive(Debug)]
pub struct AbortGuard {
    registry: Arc<AbortRegistry>,
    request_id: RequestId,
    token: CancellationToken,
    cancel_state: Arc<AtomicBool>,
}

impl AbortGuard {
    /// Token to pass down to the provider client.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Registered id.
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Whether the request was aborted through the registry.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.cancel_state.load(Ordering::SeqCst)
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        let _ = self
            .registry
            .entries
            .remove_if(self.request_id.as_str(), |_, e| Arc::ptr_eq(&e.cancel_state, &self.cancel_state));
    }
}
