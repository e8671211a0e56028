use super::*;
use crate::net::api::ApiError;
use crate::net::types::{AuthResponse, Credentials, Registration, UserProfile};
use crate::state::session::DEFAULT_STORAGE_KEY;
use crate::state::storage::{MemoryStorage, SessionStorage};
use serde_json::Value;
use std::collections::VecDeque;

// =============================================================================
// test doubles
// =============================================================================

#[derive(Clone)]
enum Reply {
    User(UserProfile),
    Status(u16),
    Network,
}

struct MockApi {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<String>>,
}

impl MockApi {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self { replies: Mutex::new(replies.into()), calls: Mutex::new(Vec::new()) })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AuthApi for MockApi {
    async fn verify_token(&self, token: &str) -> Result<UserProfile, ApiError> {
        self.calls.lock().unwrap().push(token.to_owned());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Network);
        match reply {
            Reply::User(user) => Ok(user),
            Reply::Status(status) => Err(ApiError::Rejected { status, body: String::new() }),
            Reply::Network => Err(ApiError::Transport("connection refused".into())),
        }
    }

    async fn login(&self, _credentials: &Credentials) -> Result<AuthResponse, ApiError> {
        Err(ApiError::Transport("not scripted".into()))
    }

    async fn register(&self, _registration: &Registration) -> Result<AuthResponse, ApiError> {
        Err(ApiError::Transport("not scripted".into()))
    }

    async fn fetch_json(&self, _path: &str, _token: &str) -> Result<Value, ApiError> {
        Err(ApiError::Transport("not scripted".into()))
    }
}

#[derive(Default)]
struct RecordingNavigator {
    visits: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, path: &str) {
        self.visits.lock().unwrap().push(path.to_owned());
    }
}

struct Harness {
    storage: Arc<MemoryStorage>,
    store: Arc<SessionStore>,
    api: Arc<MockApi>,
    navigator: Arc<RecordingNavigator>,
}

impl Harness {
    fn new(replies: Vec<Reply>) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(SessionStore::new(storage.clone(), DEFAULT_STORAGE_KEY));
        Self { storage, store, api: MockApi::new(replies), navigator: Arc::new(RecordingNavigator::default()) }
    }

    fn with_stored_token(self, token: &str, user_id: &str) -> Self {
        let raw = serde_json::json!({ "token": token, "user": { "id": user_id } }).to_string();
        self.storage.set_item(DEFAULT_STORAGE_KEY, &raw).unwrap();
        self
    }

    fn guard(&self, options: GuardOptions) -> RouteGuard {
        RouteGuard::new(
            self.store.clone(),
            self.api.clone(),
            self.navigator.clone(),
            "/dashboard",
            options,
        )
    }
}

fn user(id: &str) -> UserProfile {
    UserProfile::new(id)
}

// =============================================================================
// pure helpers
// =============================================================================

#[test]
fn phase_of_maps_session_flags() {
    let mut session = Session::default();
    assert_eq!(phase_of(&session), GuardPhase::Unhydrated);
    session.is_loading = true;
    assert_eq!(phase_of(&session), GuardPhase::Hydrating);
    session.is_loading = false;
    session.is_hydrated = true;
    assert_eq!(phase_of(&session), GuardPhase::Unauthenticated);
    session.token = Some("t".into());
    session.user = Some(user("u1"));
    assert_eq!(phase_of(&session), GuardPhase::Authenticated);
}

#[test]
fn login_redirect_encodes_next() {
    assert_eq!(login_redirect("/login", "/dashboard"), "/login?next=%2Fdashboard");
    assert_eq!(login_redirect("/login", "/api/leads?page=2"), "/login?next=%2Fapi%2Fleads%3Fpage%3D2");
    assert_eq!(login_redirect("/login?x=1", "/a b"), "/login?x=1&next=%2Fa+b");
    assert_eq!(login_redirect("/login", ""), "/login");
    assert_eq!(login_redirect("/login", "/login"), "/login");
}

// =============================================================================
// mount
// =============================================================================

#[test]
fn unmounted_guard_renders_loading() {
    let h = Harness::new(vec![]);
    let guard = h.guard(GuardOptions::default());
    assert_eq!(guard.view(), GuardView::Loading);
    assert_eq!(guard.phase(), GuardPhase::Unhydrated);
}

#[test]
fn mount_without_stored_token_redirects_once() {
    let h = Harness::new(vec![]);
    let mut guard = h.guard(GuardOptions::default());

    assert_eq!(guard.mount(), GuardView::Nothing);
    assert_eq!(guard.phase(), GuardPhase::Unauthenticated);
    assert_eq!(h.navigator.visits(), vec!["/login?next=%2Fdashboard".to_owned()]);

    // Re-mounting and further store churn do not redirect again.
    guard.mount();
    h.store.logout().unwrap();
    assert_eq!(h.navigator.visits().len(), 1);
}

#[test]
fn mount_with_stored_token_walks_hydration_states() {
    let h = Harness::new(vec![]).with_stored_token("abc123", "u1");
    let mut guard = h.guard(GuardOptions { verify_on_mount: false, ..GuardOptions::default() });

    assert_eq!(guard.mount(), GuardView::Children);
    assert_eq!(
        guard.phase_history(),
        vec![GuardPhase::Unhydrated, GuardPhase::Hydrating, GuardPhase::Authenticated]
    );
    assert!(h.navigator.visits().is_empty());
    assert!(h.api.calls().is_empty());
    assert_eq!(guard.render(|s| s.user.clone().unwrap().id), Some("u1".to_owned()));
}

#[test]
fn guard_renders_loading_while_login_in_flight() {
    let h = Harness::new(vec![]).with_stored_token("abc123", "u1");
    let mut guard = h.guard(GuardOptions::default());
    guard.mount();
    h.store.set_loading(true);
    assert_eq!(guard.view(), GuardView::Loading);
    assert_eq!(guard.render(|_| ()), None);
    h.store.set_loading(false);
    assert_eq!(guard.view(), GuardView::Children);
}

#[test]
fn logout_while_mounted_redirects_and_login_restores_children() {
    let h = Harness::new(vec![]).with_stored_token("abc123", "u1");
    let mut guard = h.guard(GuardOptions::default());
    guard.mount();

    h.store.logout().unwrap();
    assert_eq!(guard.view(), GuardView::Nothing);
    assert_eq!(h.navigator.visits().len(), 1);

    h.store.login("fresh", user("u1"));
    assert_eq!(guard.phase(), GuardPhase::Authenticated);
    assert_eq!(guard.view(), GuardView::Children);

    h.store.logout().unwrap();
    assert_eq!(h.navigator.visits().len(), 2, "a new entry into Unauthenticated redirects again");
}

#[test]
fn unmount_unsubscribes_and_stops_redirects() {
    let h = Harness::new(vec![]).with_stored_token("abc123", "u1");
    let mut guard = h.guard(GuardOptions::default());
    guard.mount();
    assert_eq!(h.store.subscriber_count(), 1);

    guard.unmount();
    assert!(!guard.is_mounted());
    assert_eq!(h.store.subscriber_count(), 0);
    h.store.logout().unwrap();
    assert!(h.navigator.visits().is_empty());
}

#[test]
fn dropping_guard_unsubscribes() {
    let h = Harness::new(vec![]);
    {
        let mut guard = h.guard(GuardOptions::default());
        guard.mount();
        assert_eq!(h.store.subscriber_count(), 1);
    }
    assert_eq!(h.store.subscriber_count(), 0);
}

// =============================================================================
// verification
// =============================================================================

#[tokio::test]
async fn verified_token_renders_children_with_backend_user() {
    let mut verified = user("u1");
    verified.email = Some("ops@example.com".into());
    let h = Harness::new(vec![Reply::User(verified)]).with_stored_token("abc123", "u1");
    let mut guard = h.guard(GuardOptions::default());

    assert_eq!(guard.mount_and_verify().await, GuardView::Children);
    assert_eq!(guard.verification(), Verification::Verified);
    assert_eq!(h.api.calls(), vec!["abc123".to_owned()]);

    let session = h.store.snapshot();
    let stored = session.user.unwrap();
    assert_eq!(stored.id, "u1");
    assert_eq!(stored.email.as_deref(), Some("ops@example.com"));
}

#[tokio::test]
async fn rejected_token_logs_out_and_redirects_exactly_once() {
    let h = Harness::new(vec![Reply::Status(401)]).with_stored_token("stale", "u1");
    let mut guard = h.guard(GuardOptions::default());

    assert_eq!(guard.mount_and_verify().await, GuardView::Nothing);
    assert_eq!(guard.phase(), GuardPhase::Unauthenticated);
    assert_eq!(guard.verification(), Verification::Rejected);
    assert_eq!(h.navigator.visits(), vec!["/login?next=%2Fdashboard".to_owned()]);
    assert!(!h.store.is_authenticated());
    assert_eq!(h.storage.get_item(DEFAULT_STORAGE_KEY).unwrap(), None);
}

#[tokio::test]
async fn network_failure_keeps_session() {
    let h = Harness::new(vec![Reply::Network]).with_stored_token("abc123", "u1");
    let mut guard = h.guard(GuardOptions::default());

    assert_eq!(guard.mount_and_verify().await, GuardView::Children);
    assert_eq!(guard.verification(), Verification::Unreachable);
    assert!(h.store.is_authenticated());
    assert!(h.navigator.visits().is_empty());
    assert!(h.storage.get_item(DEFAULT_STORAGE_KEY).unwrap().is_some());
}

#[tokio::test]
async fn repeated_network_failures_hit_the_bound() {
    let h = Harness::new(vec![Reply::Network, Reply::Network, Reply::Network]).with_stored_token("abc123", "u1");
    let mut guard = h.guard(GuardOptions { max_network_failures: 3, ..GuardOptions::default() });

    guard.mount_and_verify().await;
    assert_eq!(guard.verify().await, Verification::Unreachable);
    assert!(h.store.is_authenticated());

    assert_eq!(guard.verify().await, Verification::Rejected);
    assert!(!h.store.is_authenticated());
    assert_eq!(h.navigator.visits().len(), 1);
}

#[tokio::test]
async fn failure_count_carries_across_guards() {
    let h = Harness::new(vec![Reply::Network; 3]).with_stored_token("abc123", "u1");
    let options = GuardOptions { max_network_failures: 3, ..GuardOptions::default() };

    for _ in 0..2 {
        let mut guard = h.guard(options.clone());
        assert_eq!(guard.mount_and_verify().await, GuardView::Children);
        assert_eq!(guard.verification(), Verification::Unreachable);
    }
    assert_eq!(h.store.snapshot().verify_failures, 2);

    let mut guard = h.guard(options);
    assert_eq!(guard.mount_and_verify().await, GuardView::Nothing);
    assert_eq!(guard.verification(), Verification::Rejected);
    assert_eq!(h.storage.get_item(DEFAULT_STORAGE_KEY).unwrap(), None);
}

#[tokio::test]
async fn success_resets_failure_count() {
    let h = Harness::new(vec![Reply::Network, Reply::User(user("u1")), Reply::Network])
        .with_stored_token("abc123", "u1");
    let mut guard = h.guard(GuardOptions { max_network_failures: 2, ..GuardOptions::default() });

    guard.mount_and_verify().await;
    assert_eq!(guard.verify().await, Verification::Verified);
    assert_eq!(guard.verify().await, Verification::Unreachable);
    assert!(h.store.is_authenticated());
}

#[tokio::test]
async fn unbounded_fail_open_never_logs_out() {
    let h = Harness::new(vec![Reply::Network; 10]).with_stored_token("abc123", "u1");
    let mut guard = h.guard(GuardOptions { max_network_failures: 0, ..GuardOptions::default() });
    guard.mount();
    for _ in 0..10 {
        assert_eq!(guard.verify().await, Verification::Unreachable);
    }
    assert!(h.store.is_authenticated());
}

#[tokio::test]
async fn verify_without_session_is_skipped() {
    let h = Harness::new(vec![]);
    let mut guard = h.guard(GuardOptions::default());
    guard.mount();
    assert_eq!(guard.verify().await, Verification::Skipped);
    assert!(h.api.calls().is_empty());
}

#[tokio::test]
async fn verify_on_mount_disabled_skips_backend() {
    let h = Harness::new(vec![Reply::Status(401)]).with_stored_token("abc123", "u1");
    let mut guard = h.guard(GuardOptions { verify_on_mount: false, ..GuardOptions::default() });
    assert_eq!(guard.mount_and_verify().await, GuardView::Children);
    assert_eq!(guard.verification(), Verification::NotStarted);
    assert!(h.api.calls().is_empty());
}

#[tokio::test]
async fn background_verification_rejects_while_children_render() {
    let h = Harness::new(vec![Reply::Status(401)]).with_stored_token("abc123", "u1");
    let mut guard = h.guard(GuardOptions::default());

    assert_eq!(guard.mount(), GuardView::Children);
    let outcome = guard.spawn_verification().await.unwrap();

    assert_eq!(outcome, Verification::Rejected);
    assert_eq!(guard.view(), GuardView::Nothing);
    assert_eq!(h.navigator.visits().len(), 1);
}

#[tokio::test]
async fn relogin_after_rejection_renders_children_again() {
    let h = Harness::new(vec![Reply::Status(401)]).with_stored_token("stale", "u1");
    let mut guard = h.guard(GuardOptions::default());
    guard.mount_and_verify().await;
    assert_eq!(guard.view(), GuardView::Nothing);

    h.store.login("fresh", user("u1"));
    assert_eq!(guard.verification(), Verification::NotStarted);
    assert_eq!(guard.view(), GuardView::Children);
}
