//! Composition root: owns the session store, storage, backend client and
//! navigator for one console process.
//!
//! ARCHITECTURE
//! ============
//! Commands never reach the store through globals. `Console` builds one
//! `SessionStore`, hands `Arc` clones to each `RouteGuard` it mounts, and
//! keeps the navigation history so the binary can report redirects.

#[cfg(test)]
#[path = "console_test.rs"]
mod console_test;

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::config::ConsoleConfig;
use crate::guard::{GuardView, Navigator, RouteGuard, Verification};
use crate::net::api::{ApiError, AuthApi, HttpBackend};
use crate::net::types::{AuthResponse, Credentials, Registration, UserProfile};
use crate::state::session::{Session, SessionStore};
use crate::state::storage::{FileStorage, SessionStorage, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("backend client unavailable: {0}")]
    Client(ApiError),
    #[error("sign-in failed: {0}")]
    Auth(ApiError),
    #[error("could not load {path}; please try again")]
    Fetch {
        path: String,
        #[source]
        source: ApiError,
    },
    #[error("could not clear the saved session: {0}")]
    Storage(#[from] StorageError),
}

/// Result of opening a protected view.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewOutcome {
    /// The guard rendered children; the view's data.
    Rendered(Value),
    /// The guard redirected to login.
    Redirected(String),
    /// Hydration did not settle.
    Loading,
}

/// Navigator that records targets in order.
#[derive(Debug, Default)]
pub struct HistoryNavigator {
    visits: Mutex<Vec<String>>,
}

impl HistoryNavigator {
    #[must_use]
    pub fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn last(&self) -> Option<String> {
        self.visits.lock().unwrap_or_else(PoisonError::into_inner).last().cloned()
    }
}

impl Navigator for HistoryNavigator {
    fn navigate(&self, path: &str) {
        tracing::debug!(%path, "navigate");
        self.visits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.to_owned());
    }
}

pub struct Console {
    config: ConsoleConfig,
    store: Arc<SessionStore>,
    api: Arc<dyn AuthApi>,
    navigator: Arc<HistoryNavigator>,
}

impl Console {
    /// Wire file storage and the HTTP backend from `config`.
    ///
    /// # Errors
    ///
    /// Returns `Client` if the HTTP client cannot be built.
    pub fn from_config(config: ConsoleConfig) -> Result<Self, ConsoleError> {
        let storage = Arc::new(FileStorage::new(config.storage_path.clone()));
        let api = HttpBackend::new(&config.api_base_url, config.timeouts).map_err(ConsoleError::Client)?;
        tracing::debug!(base_url = %api.base_url(), storage = %storage.path().display(), "console wired");
        Ok(Self::new(config, storage, Arc::new(api)))
    }

    #[must_use]
    pub fn new(config: ConsoleConfig, storage: Arc<dyn SessionStorage>, api: Arc<dyn AuthApi>) -> Self {
        let store = Arc::new(SessionStore::new(storage, config.storage_key.clone()));
        Self { config, store, api, navigator: Arc::new(HistoryNavigator::default()) }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    #[must_use]
    pub fn navigator(&self) -> &HistoryNavigator {
        &self.navigator
    }

    /// A guard for `route`, not yet mounted.
    #[must_use]
    pub fn guard(&self, route: &str) -> RouteGuard {
        RouteGuard::new(
            Arc::clone(&self.store),
            Arc::clone(&self.api),
            self.navigator.clone(),
            route,
            self.config.guard_options(),
        )
    }

    /// Hydrated session state without contacting the backend.
    #[must_use]
    pub fn status(&self) -> Session {
        self.store.initialize_auth()
    }

    /// Exchange credentials for a session and persist it.
    ///
    /// # Errors
    ///
    /// Returns `Auth` if the backend refuses or cannot be reached.
    pub async fn login(&self, credentials: &Credentials) -> Result<UserProfile, ConsoleError> {
        self.exchange(self.api.login(credentials)).await
    }

    /// Create an account and sign in with it.
    ///
    /// # Errors
    ///
    /// Returns `Auth` if the backend refuses or cannot be reached.
    pub async fn register(&self, registration: &Registration) -> Result<UserProfile, ConsoleError> {
        self.exchange(self.api.register(registration)).await
    }

    /// Clear the session here and in storage.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the saved session could not be removed.
    pub fn logout(&self) -> Result<(), ConsoleError> {
        self.store.initialize_auth();
        self.store.logout()?;
        Ok(())
    }

    /// Mount a guard on `/` and check the held token.
    pub async fn verify(&self) -> Verification {
        let mut guard = self.guard("/");
        guard.mount();
        guard.verify().await
    }

    /// Open a protected view: gate it, then load its data.
    ///
    /// # Errors
    ///
    /// Returns `Fetch` with a generic message if the data cannot be loaded.
    pub async fn open(&self, route: &str) -> Result<ViewOutcome, ConsoleError> {
        let mut guard = self.guard(route);
        match guard.mount_and_verify().await {
            GuardView::Loading => Ok(ViewOutcome::Loading),
            GuardView::Nothing => Ok(ViewOutcome::Redirected(guard.redirect_target())),
            GuardView::Children => {
                let Some(token) = self.store.snapshot().active_token().map(str::to_owned) else {
                    return Ok(ViewOutcome::Redirected(guard.redirect_target()));
                };
                match self.api.fetch_json(route, &token).await {
                    Ok(data) => Ok(ViewOutcome::Rendered(data)),
                    Err(source) => {
                        tracing::warn!(%route, error = %source, "view data fetch failed");
                        Err(ConsoleError::Fetch { path: route.to_owned(), source })
                    }
                }
            }
        }
    }

    async fn exchange<F>(&self, request: F) -> Result<UserProfile, ConsoleError>
    where
        F: std::future::Future<Output = Result<AuthResponse, ApiError>>,
    {
        self.store.initialize_auth();
        self.store.set_loading(true);
        match request.await {
            Ok(AuthResponse { user, token }) => {
                self.store.login(token, user.clone());
                Ok(user)
            }
            Err(e) => {
                self.store.set_loading(false);
                tracing::warn!(error = %e, "credential exchange failed");
                Err(ConsoleError::Auth(e))
            }
        }
    }
}
