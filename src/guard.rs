//! Route guard gating protected views on the session.
//!
//! SYSTEM CONTEXT
//! ==============
//! A guard wraps one protected route. On mount it subscribes to the session
//! store, triggers hydration if needed, and decides between a loading
//! indicator, nothing (while redirecting to login), or the route's children.
//!
//! STATE MACHINE
//! =============
//! `Unhydrated -> Hydrating -> {Authenticated, Unauthenticated}`.
//! `Authenticated -> Unauthenticated` on token rejection or logout, and back
//! on a later login while mounted. A fresh process starts at `Unhydrated`.
//!
//! TRADE-OFFS
//! ==========
//! A verification that cannot reach the backend keeps the session (fail-open)
//! until `max_network_failures` consecutive failures, after which the token is
//! treated as rejected. `0` disables the bound. The count lives on the session,
//! not the guard, so it accumulates across guards and process restarts.

#[cfg(test)]
#[path = "guard_test.rs"]
mod guard_test;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::net::api::AuthApi;
use crate::state::session::{Session, SessionStore, SubscriptionId};

pub const DEFAULT_LOGIN_PATH: &str = "/login";
pub const DEFAULT_MAX_NETWORK_FAILURES: u32 = 3;

/// Client-side navigation sink. The composition root decides what "go to
/// `path`" means.
pub trait Navigator: Send + Sync {
    fn navigate(&self, path: &str);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardPhase {
    Unhydrated,
    Hydrating,
    Authenticated,
    Unauthenticated,
}

/// What the guarded route should render right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardView {
    Loading,
    /// Unauthenticated; a redirect has been issued.
    Nothing,
    Children,
}

/// Outcome of the background token check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verification {
    NotStarted,
    Pending,
    Verified,
    /// The backend refused the token; the session was logged out.
    Rejected,
    /// The backend could not be reached; the session was kept.
    Unreachable,
    /// No usable token at the time of the check.
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardOptions {
    pub login_path: String,
    pub verify_on_mount: bool,
    pub max_network_failures: u32,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self {
            login_path: DEFAULT_LOGIN_PATH.to_owned(),
            verify_on_mount: true,
            max_network_failures: DEFAULT_MAX_NETWORK_FAILURES,
        }
    }
}

/// Guard phase implied by a session snapshot.
#[must_use]
pub fn phase_of(session: &Session) -> GuardPhase {
    if !session.is_hydrated {
        if session.is_loading { GuardPhase::Hydrating } else { GuardPhase::Unhydrated }
    } else if session.is_authenticated() {
        GuardPhase::Authenticated
    } else {
        GuardPhase::Unauthenticated
    }
}

/// Login path carrying the protected route as `next`.
#[must_use]
pub fn login_redirect(login_path: &str, next: &str) -> String {
    if next.is_empty() || next == login_path {
        return login_path.to_owned();
    }
    let sep = if login_path.contains('?') { '&' } else { '?' };
    let encoded: String = url::form_urlencoded::byte_serialize(next.as_bytes()).collect();
    format!("{login_path}{sep}next={encoded}")
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct GuardState {
    mounted: bool,
    phase: GuardPhase,
    history: Vec<GuardPhase>,
    verification: Verification,
    redirected: bool,
}

struct GuardShared {
    store: Arc<SessionStore>,
    api: Arc<dyn AuthApi>,
    navigator: Arc<dyn Navigator>,
    route: String,
    options: GuardOptions,
    state: Mutex<GuardState>,
}

impl GuardShared {
    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold a session snapshot into the guard. Issues at most one redirect
    /// per entry into `Unauthenticated`.
    fn sync(&self, session: &Session) {
        let phase = phase_of(session);
        let redirect = {
            let mut state = self.state();
            if !state.mounted {
                return;
            }
            if state.phase != phase {
                tracing::debug!(route = %self.route, from = ?state.phase, to = ?phase, "guard phase change");
                state.phase = phase;
                state.history.push(phase);
                if phase == GuardPhase::Authenticated && state.verification == Verification::Rejected {
                    state.verification = Verification::NotStarted;
                }
            }
            match phase {
                GuardPhase::Authenticated => {
                    state.redirected = false;
                    false
                }
                GuardPhase::Unauthenticated if !state.redirected => {
                    state.redirected = true;
                    true
                }
                _ => false,
            }
        };
        if redirect {
            let target = login_redirect(&self.options.login_path, &self.route);
            tracing::info!(route = %self.route, %target, "unauthenticated; redirecting to login");
            self.navigator.navigate(&target);
        }
    }

    async fn verify(&self) -> Verification {
        let session = self.store.snapshot();
        let Some(token) = session.active_token().map(str::to_owned) else {
            return self.finish(Verification::Skipped);
        };
        if !session.is_authenticated() {
            return self.finish(Verification::Skipped);
        }
        self.state().verification = Verification::Pending;

        let result = self.api.verify_token(&token).await;

        // A logout or re-login while the request was in flight makes the
        // answer irrelevant to the current session.
        if self.store.snapshot().token.as_deref() != Some(token.as_str()) {
            tracing::debug!(route = %self.route, "token changed during verification; ignoring result");
            return self.finish(Verification::Skipped);
        }

        match result {
            Ok(user) => {
                self.store.clear_verify_failures();
                self.store.set_user(user);
                tracing::info!(route = %self.route, "token verified");
                self.finish(Verification::Verified)
            }
            Err(e) if e.is_rejection() => {
                tracing::warn!(route = %self.route, error = %e, "token rejected; logging out");
                self.reject()
            }
            Err(e) => {
                let failures = self.store.record_verify_failure();
                let bound = self.options.max_network_failures;
                if bound > 0 && failures >= bound {
                    tracing::warn!(route = %self.route, error = %e, failures, "verification failed too often; logging out");
                    return self.reject();
                }
                tracing::warn!(route = %self.route, error = %e, failures, "verification unreachable; keeping session");
                self.finish(Verification::Unreachable)
            }
        }
    }

    fn reject(&self) -> Verification {
        self.state().verification = Verification::Rejected;
        self.store.invalidate();
        if let Err(e) = self.store.logout() {
            tracing::warn!(route = %self.route, error = %e, "rejected token left in storage");
        }
        Verification::Rejected
    }

    fn finish(&self, outcome: Verification) -> Verification {
        self.state().verification = outcome;
        outcome
    }
}

// =============================================================================
// ROUTE GUARD
// =============================================================================

/// Gate for one protected route. Unsubscribes from the store on unmount or
/// drop.
pub struct RouteGuard {
    shared: Arc<GuardShared>,
    subscription: Option<SubscriptionId>,
}

impl RouteGuard {
    pub fn new(
        store: Arc<SessionStore>,
        api: Arc<dyn AuthApi>,
        navigator: Arc<dyn Navigator>,
        route: impl Into<String>,
        options: GuardOptions,
    ) -> Self {
        let state = GuardState {
            mounted: false,
            phase: GuardPhase::Unhydrated,
            history: vec![GuardPhase::Unhydrated],
            verification: Verification::NotStarted,
            redirected: false,
        };
        let shared = GuardShared {
            store,
            api,
            navigator,
            route: route.into(),
            options,
            state: Mutex::new(state),
        };
        Self { shared: Arc::new(shared), subscription: None }
    }

    /// Subscribe to the store and hydrate it if needed. Does not verify.
    pub fn mount(&mut self) -> GuardView {
        if self.subscription.is_none() {
            let shared = Arc::clone(&self.shared);
            let id = self.shared.store.subscribe(move |session| shared.sync(session));
            self.subscription = Some(id);
            self.shared.state().mounted = true;
            tracing::debug!(route = %self.shared.route, "guard mounted");
        }
        let session = self.shared.store.snapshot();
        self.shared.sync(&session);
        if !session.is_hydrated {
            self.shared.store.initialize_auth();
        }
        self.view()
    }

    /// Mount, then run the token check inline when configured to.
    pub async fn mount_and_verify(&mut self) -> GuardView {
        self.mount();
        if self.shared.options.verify_on_mount && self.phase() == GuardPhase::Authenticated {
            self.verify().await;
        }
        self.view()
    }

    /// Check the held token against the backend.
    pub async fn verify(&self) -> Verification {
        self.shared.verify().await
    }

    /// Run the token check on the tokio runtime without blocking rendering.
    pub fn spawn_verification(&self) -> tokio::task::JoinHandle<Verification> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.verify().await })
    }

    pub fn unmount(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.shared.store.unsubscribe(id);
            self.shared.state().mounted = false;
            tracing::debug!(route = %self.shared.route, "guard unmounted");
        }
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.subscription.is_some()
    }

    #[must_use]
    pub fn phase(&self) -> GuardPhase {
        self.shared.state().phase
    }

    /// Every phase entered since construction, in order.
    #[must_use]
    pub fn phase_history(&self) -> Vec<GuardPhase> {
        self.shared.state().history.clone()
    }

    #[must_use]
    pub fn verification(&self) -> Verification {
        self.shared.state().verification
    }

    #[must_use]
    pub fn route(&self) -> &str {
        &self.shared.route
    }

    #[must_use]
    pub fn redirect_target(&self) -> String {
        login_redirect(&self.shared.options.login_path, &self.shared.route)
    }

    #[must_use]
    pub fn view(&self) -> GuardView {
        let session = self.shared.store.snapshot();
        let (mounted, verification) = {
            let state = self.shared.state();
            (state.mounted, state.verification)
        };
        if !mounted || !session.is_hydrated || session.is_loading {
            GuardView::Loading
        } else if session.is_authenticated() && verification != Verification::Rejected {
            GuardView::Children
        } else {
            GuardView::Nothing
        }
    }

    /// Run `children` only when the view is [`GuardView::Children`].
    pub fn render<T>(&self, children: impl FnOnce(&Session) -> T) -> Option<T> {
        if self.view() == GuardView::Children {
            Some(children(&self.shared.store.snapshot()))
        } else {
            None
        }
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.unmount();
    }
}
