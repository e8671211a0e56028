//! Auth-session state for the current console operator.
//!
//! SYSTEM CONTEXT
//! ==============
//! Owned by the composition root and shared by `Arc` with route guards and
//! background verification tasks. Guards observe changes through
//! `subscribe`; nothing reads the session as ambient global state.
//!
//! DESIGN
//! ======
//! `is_authenticated` is derived from the fields on every read rather than
//! stored, so it cannot disagree with `token`/`user`/`invalidated`.
//! Listeners run after the state lock is released and receive an owned
//! snapshot, so a listener may call back into the store.

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::storage::{SessionStorage, StorageError};
use crate::net::types::UserProfile;

pub const DEFAULT_STORAGE_KEY: &str = "crm-auth";

// =============================================================================
// SESSION
// =============================================================================

/// Point-in-time view of the authentication state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Session {
    pub token: Option<String>,
    pub user: Option<UserProfile>,
    /// A restore or credential exchange is in flight.
    pub is_loading: bool,
    /// Persisted state has been restored for this process.
    pub is_hydrated: bool,
    /// The held token was rejected or expired and must not be used.
    pub invalidated: bool,
    /// Consecutive token checks that could not reach the backend. Persisted
    /// with the token so the bound holds across restarts.
    pub verify_failures: u32,
}

impl Session {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some() && self.user.is_some() && !self.invalidated
    }

    /// The token, unless it has been locally invalidated.
    #[must_use]
    pub fn active_token(&self) -> Option<&str> {
        if self.invalidated { None } else { self.token.as_deref() }
    }
}

/// On-disk shape of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct PersistedSession {
    token: Option<String>,
    user: Option<UserProfile>,
    #[serde(default)]
    verify_failures: u32,
}

impl PersistedSession {
    fn of(session: &Session) -> Self {
        Self {
            token: session.token.clone(),
            user: session.user.clone(),
            verify_failures: session.verify_failures,
        }
    }
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// Handle returned by [`SessionStore::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&Session) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(SubscriptionId, Listener)>,
}

// =============================================================================
// STORE
// =============================================================================

/// Mutable session holder with persistence and change notification.
pub struct SessionStore {
    storage: Arc<dyn SessionStorage>,
    key: String,
    state: Mutex<Session>,
    listeners: Mutex<Listeners>,
}

impl SessionStore {
    #[must_use]
    pub fn new(storage: Arc<dyn SessionStorage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
            state: Mutex::new(Session::default()),
            listeners: Mutex::new(Listeners::default()),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.state().clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated()
    }

    /// Restore token and user from storage. Hydrates once per store; later
    /// calls return the current snapshot without touching storage.
    pub fn initialize_auth(&self) -> Session {
        {
            let mut state = self.state();
            if state.is_hydrated {
                return state.clone();
            }
            state.is_loading = true;
        }
        self.notify();

        let restored = self.read_persisted();

        let snapshot = {
            let mut state = self.state();
            if state.is_hydrated {
                return state.clone();
            }
            // A login that landed while restoring wins over the stored record.
            if state.token.is_none() {
                if let Some(persisted) = restored {
                    state.token = persisted.token;
                    state.user = persisted.user;
                    state.verify_failures = persisted.verify_failures;
                    state.invalidated = false;
                }
            }
            state.is_loading = false;
            state.is_hydrated = true;
            state.clone()
        };
        tracing::info!(
            authenticated = snapshot.is_authenticated(),
            user_id = snapshot.user.as_ref().map_or("-", |u| u.id.as_str()),
            "session hydrated"
        );
        self.notify();
        snapshot
    }

    /// Enter the authenticated state and persist it.
    pub fn login(&self, token: impl Into<String>, user: UserProfile) {
        let persisted = {
            let mut state = self.state();
            state.token = Some(token.into());
            state.user = Some(user);
            state.invalidated = false;
            state.is_loading = false;
            state.verify_failures = 0;
            PersistedSession::of(&state)
        };
        tracing::info!(user_id = persisted.user.as_ref().map_or("-", |u| u.id.as_str()), "session login");
        self.write_persisted(&persisted);
        self.notify();
    }

    /// Clear in-memory state and the persisted record.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the persisted record could not be
    /// removed. In-memory state is cleared either way, but the record will
    /// be restored by the next hydration.
    pub fn logout(&self) -> Result<(), StorageError> {
        {
            let mut state = self.state();
            state.token = None;
            state.user = None;
            state.invalidated = false;
            state.is_loading = false;
            state.verify_failures = 0;
        }
        let removed = self.storage.remove_item(&self.key);
        match &removed {
            Ok(()) => tracing::info!("session logout"),
            Err(e) => tracing::warn!(error = %e, "session logout; persisted record not cleared"),
        }
        self.notify();
        removed
    }

    /// Mark the held token as unusable without clearing storage.
    /// Returns `false` when there is no token to invalidate.
    pub fn invalidate(&self) -> bool {
        {
            let mut state = self.state();
            if state.token.is_none() || state.invalidated {
                return false;
            }
            state.invalidated = true;
        }
        tracing::debug!("session token invalidated");
        self.notify();
        true
    }

    /// Replace the profile after a successful verification.
    /// Ignored when no usable token is held.
    pub fn set_user(&self, user: UserProfile) -> bool {
        let persisted = {
            let mut state = self.state();
            if state.active_token().is_none() {
                return false;
            }
            if state.user.as_ref() == Some(&user) {
                return true;
            }
            state.user = Some(user);
            PersistedSession::of(&state)
        };
        self.write_persisted(&persisted);
        self.notify();
        true
    }

    /// Count a token check that could not reach the backend and return the
    /// new consecutive total. Returns `0` when no usable token is held.
    pub fn record_verify_failure(&self) -> u32 {
        let (failures, persisted) = {
            let mut state = self.state();
            if state.active_token().is_none() {
                return 0;
            }
            state.verify_failures = state.verify_failures.saturating_add(1);
            (state.verify_failures, PersistedSession::of(&state))
        };
        self.write_persisted(&persisted);
        self.notify();
        failures
    }

    /// Reset the consecutive failure count after the backend answered.
    pub fn clear_verify_failures(&self) {
        let persisted = {
            let mut state = self.state();
            if state.verify_failures == 0 {
                return;
            }
            state.verify_failures = 0;
            PersistedSession::of(&state)
        };
        self.write_persisted(&persisted);
        self.notify();
    }

    pub fn set_loading(&self, loading: bool) {
        {
            let mut state = self.state();
            if state.is_loading == loading {
                return;
            }
            state.is_loading = loading;
        }
        self.notify();
    }

    /// Register `listener` to receive a snapshot after every mutation.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let id = SubscriptionId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.entries.len();
        listeners.entries.retain(|(entry, _)| *entry != id);
        listeners.entries.len() != before
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Session> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        let snapshot = self.snapshot();
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    fn read_persisted(&self) -> Option<PersistedSession> {
        let raw = match self.storage.get_item(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read persisted session");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(persisted) => Some(persisted),
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable persisted session");
                if let Err(e) = self.storage.remove_item(&self.key) {
                    tracing::warn!(error = %e, "failed to remove unreadable persisted session");
                }
                None
            }
        }
    }

    fn write_persisted(&self, persisted: &PersistedSession) {
        let result = serde_json::to_string(persisted)
            .map_err(StorageError::from)
            .and_then(|raw| self.storage.set_item(&self.key, &raw));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist session");
        }
    }
}
