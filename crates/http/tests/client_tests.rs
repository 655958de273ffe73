//! Integration tests for the Canvass API client

use canvass_http::client::endpoints;
use canvass_http::{
    ApiClient, ClientError, MAX_REFRESH_FAILURES, NavigationDecision, Navigator, RouteGuard,
    SessionLostHandler,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> ApiClient {
    ApiClient::builder()
        .base_url(server.uri())
        .refresh_backoff(Duration::ZERO)
        .build()
        .unwrap()
}

fn user_body() -> serde_json::Value {
    json!({ "id": 7, "username": "aino", "email": "aino@example.com" })
}

#[derive(Default)]
struct CountingHandler {
    calls: AtomicUsize,
}

impl SessionLostHandler for CountingHandler {
    fn on_session_lost(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

struct FixedNavigator {
    current: String,
    visited: Mutex<Vec<String>>,
}

impl Navigator for FixedNavigator {
    fn current_path(&self) -> String {
        self.current.clone()
    }

    fn navigate(&self, target: &str) {
        self.visited.lock().unwrap().push(target.to_string());
    }
}

#[tokio::test]
async fn test_client_builder_requires_base_url() {
    let result = ApiClient::builder().build();
    assert!(matches!(result, Err(ClientError::Configuration(_))));
}

#[tokio::test]
async fn test_base_url_trailing_slash_is_trimmed() {
    let client = ApiClient::new("http://localhost:8000/api/").unwrap();
    assert_eq!(client.base_url(), "http://localhost:8000/api");
    assert_eq!(
        client.url(endpoints::HEALTH),
        "http://localhost:8000/api/health/"
    );
}

#[tokio::test]
async fn test_set_auth_tokens_updates_default_header() {
    let client = ApiClient::new("http://localhost:8000").unwrap();

    client.set_auth_tokens(Some("access-1"), None);
    assert_eq!(
        client.default_authorization().as_deref(),
        Some("Bearer access-1")
    );

    client.set_auth_tokens(None, None);
    assert!(client.default_authorization().is_none());
}

#[tokio::test]
async fn test_bearer_token_is_injected() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(endpoints::CURRENT_USER))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_body()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    client.set_auth_tokens(Some("access-1"), None);

    let user = client.fetch_current_user().await.unwrap();
    assert_eq!(user.username, "aino");

    let requests = mock_server.received_requests().await.unwrap();
    assert!(requests[0].headers.contains_key("x-request-id"));
}

#[tokio::test]
async fn test_explicit_authorization_is_not_overwritten() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/files/"))
        .and(header("authorization", "Bearer explicit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    client.set_auth_tokens(Some("stored"), None);

    let request = client
        .request(reqwest::Method::GET, "/files/")
        .header("authorization", "Bearer explicit");
    let files: Vec<serde_json::Value> = client.execute(request).await.unwrap();
    assert!(files.is_empty());
}

#[tokio::test]
async fn test_401_refreshes_once_and_replays_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(endpoints::CURRENT_USER))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(endpoints::CURRENT_USER))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_body()))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path(endpoints::TOKEN_REFRESH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access": "fresh" })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    client.set_auth_tokens(Some("stale"), None);

    let user = client.fetch_current_user().await.unwrap();
    assert_eq!(user.id, 7);
    assert_eq!(
        client.default_authorization().as_deref(),
        Some("Bearer fresh")
    );
}

#[tokio::test]
async fn test_401_on_replay_does_not_refresh_again() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(endpoints::CURRENT_USER))
        .respond_with(ResponseTemplate::new(401).set_body_string("token revoked"))
        .expect(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path(endpoints::TOKEN_REFRESH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access": "fresh" })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    client.set_auth_tokens(Some("stale"), None);

    let result = client.fetch_current_user().await;
    assert!(matches!(result, Err(ClientError::AuthenticationFailed(_))));
}

#[tokio::test]
async fn test_legacy_refresh_token_is_sent_in_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(endpoints::TOKEN_REFRESH))
        .and(body_json(json!({ "refresh": "legacy-r" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "access": "a2", "refresh": "r2" })),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    client.set_auth_tokens(None, Some("legacy-r"));

    assert_eq!(client.silent_refresh_access_token().await.as_deref(), Some("a2"));
    assert_eq!(client.tokens().legacy_refresh_token().as_deref(), Some("r2"));
}

#[tokio::test]
async fn test_refresh_without_credentials_makes_no_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(endpoints::TOKEN_REFRESH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access": "x" })))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    assert!(client.silent_refresh_access_token().await.is_none());
}

#[tokio::test]
async fn test_refresh_disabled_after_max_failures() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(endpoints::TOKEN_REFRESH))
        .respond_with(ResponseTemplate::new(500))
        .expect(u64::from(MAX_REFRESH_FAILURES))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    client.set_auth_tokens(Some("expired"), None);

    for _ in 0..MAX_REFRESH_FAILURES {
        assert!(client.silent_refresh_access_token().await.is_none());
    }
    assert!(client.refresh_policy().is_disabled());

    // The next attempt is refused locally
    assert!(client.silent_refresh_access_token().await.is_none());
    assert!(client.silent_refresh_access_token().await.is_none());
}

#[tokio::test]
async fn test_login_reset_reenables_refresh() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(endpoints::TOKEN_REFRESH))
        .respond_with(ResponseTemplate::new(400))
        .up_to_n_times(u64::from(MAX_REFRESH_FAILURES))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path(endpoints::TOKEN_REFRESH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access": "again" })))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    client.set_auth_tokens(Some("expired"), None);
    for _ in 0..MAX_REFRESH_FAILURES {
        client.silent_refresh_access_token().await;
    }
    assert!(client.refresh_policy().is_disabled());

    client.refresh_policy().reset_after_login();
    assert_eq!(
        client.silent_refresh_access_token().await.as_deref(),
        Some("again")
    );
}

#[tokio::test]
async fn test_backoff_window_suppresses_immediate_retry() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(endpoints::TOKEN_REFRESH))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = ApiClient::builder()
        .base_url(mock_server.uri())
        .refresh_backoff(Duration::from_secs(60))
        .build()
        .unwrap();
    client.set_auth_tokens(Some("expired"), None);

    assert!(client.silent_refresh_access_token().await.is_none());
    assert!(client.silent_refresh_access_token().await.is_none());
    assert_eq!(client.refresh_policy().failure_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_401s_share_one_refresh() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(endpoints::USER_PROFILE))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(endpoints::USER_PROFILE))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "department": "Ops" })))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path(endpoints::TOKEN_REFRESH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access": "fresh" }))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    client.set_auth_tokens(Some("stale"), None);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        handles.push(tokio::spawn(async move { client.fetch_user_profile().await }));
    }

    for handle in handles {
        let profile = handle.await.unwrap().unwrap();
        assert_eq!(profile.department.as_deref(), Some("Ops"));
    }
}

#[tokio::test]
async fn test_session_lost_handler_runs_when_refresh_fails() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(endpoints::CURRENT_USER))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path(endpoints::TOKEN_REFRESH))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let handler = Arc::new(CountingHandler::default());
    client.set_session_lost_handler(handler.clone());
    client.set_auth_tokens(Some("revoked"), None);

    let result = client.fetch_current_user().await;
    assert!(matches!(result, Err(ClientError::AuthenticationFailed(_))));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_public_survey_route_is_never_redirected() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(endpoints::CURRENT_USER))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path(endpoints::TOKEN_REFRESH))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let navigator = Arc::new(FixedNavigator {
        current: "/survey/public/abc123".to_string(),
        visited: Mutex::new(Vec::new()),
    });
    let client = client_for(&mock_server);
    client.set_session_lost_handler(Arc::new(RouteGuard::new(navigator.clone())));
    client.set_auth_tokens(Some("invalidated"), None);

    assert!(client.fetch_current_user().await.is_err());
    assert!(navigator.visited.lock().unwrap().is_empty());
    assert_eq!(
        RouteGuard::decide(&navigator.current_path()),
        NavigationDecision::Stay
    );
}

#[tokio::test]
async fn test_protected_route_redirects_with_destination() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(endpoints::CURRENT_USER))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path(endpoints::TOKEN_REFRESH))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;

    let navigator = Arc::new(FixedNavigator {
        current: "/surveys/42/results".to_string(),
        visited: Mutex::new(Vec::new()),
    });
    let client = client_for(&mock_server);
    client.set_session_lost_handler(Arc::new(RouteGuard::new(navigator.clone())));
    client.set_auth_tokens(Some("invalidated"), None);

    assert!(client.fetch_current_user().await.is_err());
    assert_eq!(
        *navigator.visited.lock().unwrap(),
        vec!["/login?redirect=%2Fsurveys%2F42%2Fresults".to_string()]
    );
}

#[tokio::test]
async fn test_public_survey_fetch_sends_no_credentials() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/survey/public/abc123/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "title": "Feedback" })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    client.set_auth_tokens(Some("access-1"), None);

    let survey = client.fetch_public_survey("abc123").await.unwrap();
    assert_eq!(survey["title"], "Feedback");

    let requests = mock_server.received_requests().await.unwrap();
    assert!(!requests[0].headers.contains_key("authorization"));
}

#[tokio::test]
async fn test_error_mapping() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(endpoints::USER_PROFILE))
        .respond_with(ResponseTemplate::new(404).set_body_string("no profile"))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    client.set_auth_tokens(Some("access-1"), None);

    let result = client.fetch_user_profile().await;
    assert!(matches!(result, Err(ClientError::NotFound(message)) if message == "no profile"));
}

#[tokio::test]
async fn test_logout_tolerates_an_expired_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(endpoints::LOGOUT))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(endpoints::TOKEN_REFRESH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access": "fresh" })))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.set_auth_tokens(Some("stale"), None);
    assert!(client.logout_backend().await.is_ok());
}

#[tokio::test]
async fn test_logout_reports_server_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(endpoints::LOGOUT))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.set_auth_tokens(Some("token"), None);
    let err = client.logout_backend().await.unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert!(!err.is_auth_expired());
}
