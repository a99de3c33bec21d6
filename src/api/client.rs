//! Authenticated API client with single-flight credential refresh.
//!
//! Every authenticated call goes through [`ApiClient::request`]:
//!
//! 1. Admission: if no refresh is running and the stored credentials are
//!    still valid, attach them and send. Otherwise park the call behind the
//!    (single) refresh cycle, starting one if needed.
//! 2. Send. A transport failure becomes a network error.
//! 3. A 401 on a fresh call joins the refresh cycle (or starts one) and the
//!    call is retried once with the new credentials. A 401 on the retry, or
//!    on the refresh endpoint itself, is terminal and clears the session.
//!
//! The refreshing flag is checked under the same lock by both the proactive
//! (expiry) and reactive (401) paths before any network call is made, so two
//! paths noticing staleness at once still produce one refresh.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::auth::{exchange_refresh, REFRESH_PATH};
use super::error::ApiError;
use super::refresh::{CycleGuard, PendingRefresh, RefreshOutcome, Ticket};
use super::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
use crate::auth::{CredentialSet, SessionStore};
use crate::config::Config;

/// Whether a call has already been retried after a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Fresh,
    Retried,
}

/// Per-call knobs for [`ApiClient::request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Extra headers. `Authorization` is always overwritten.
    pub headers: reqwest::header::HeaderMap,
    pub timeout: Option<Duration>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    store: SessionStore,
    pending: Mutex<PendingRefresh>,
}

/// Authenticated API client for one tab.
/// Clone is cheap; clones share the session and the refresh state.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, store: SessionStore) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                store,
                pending: Mutex::new(PendingRefresh::default()),
            }),
        }
    }

    /// Create a client over HTTP using `config`.
    pub fn from_config(config: &Config, store: SessionStore) -> Result<Self> {
        let transport = ReqwestTransport::from_config(config)?;
        Ok(Self::new(Arc::new(transport), store))
    }

    pub fn session(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.pending.lock().is_refreshing()
    }

    // ===== Authenticated calls =====

    /// Perform an authenticated call and decode its JSON body.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let request = build_request(method, path, body, options);
        let response = self.execute(request).await?;
        decode(response)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(Method::GET, path, None, RequestOptions::default())
            .await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = to_body(body)?;
        self.request(Method::POST, path, Some(body), RequestOptions::default())
            .await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = to_body(body)?;
        self.request(Method::PUT, path, Some(body), RequestOptions::default())
            .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(Method::DELETE, path, None, RequestOptions::default())
            .await
    }

    // ===== Unauthenticated calls =====

    /// Perform a call without credentials, refresh or retry.
    pub async fn request_public<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let request = build_request(method, path, body, options);
        let response = self.send_public(request).await?;
        decode(response)
    }

    pub(crate) async fn send_public(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let response = self.send(request).await?;
        check_response(response)
    }

    // ===== Refresh =====

    /// Refresh the session now, joining a refresh already in flight.
    pub async fn refresh_session(&self) -> Result<CredentialSet, ApiError> {
        let ticket = self.inner.pending.lock().park();
        self.wait(ticket).await
    }

    async fn execute(&self, mut request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let creds = self.admit().await?;
        request.set_authorization(&creds.authorization());

        let mut attempt = Attempt::Fresh;
        loop {
            let response = self.send(request.clone()).await?;
            if response.status != StatusCode::UNAUTHORIZED {
                return check_response(response);
            }

            if attempt == Attempt::Retried || is_refresh_call(&request) {
                warn!(path = %request.path, ?attempt, "Unauthorized after refresh, signing out");
                self.inner.store.clear();
                return Err(ApiError::from_response(response.status, &response.body).into_terminal());
            }

            debug!(path = %request.path, "Unauthorized, refreshing credentials");
            let creds = self.renew_after_rejection(request.authorization()).await?;
            request.set_authorization(&creds.authorization());
            attempt = Attempt::Retried;
        }
    }

    /// Credentials to send a new call with, waiting out any refresh.
    async fn admit(&self) -> Result<CredentialSet, ApiError> {
        let ticket = {
            let mut pending = self.inner.pending.lock();
            if !pending.is_refreshing() {
                if let Some(creds) = self.inner.store.read() {
                    if !creds.is_expired() {
                        return Ok(creds);
                    }
                }
                debug!("Credentials expired or missing, refreshing before send");
            }
            pending.park()
        };
        self.wait(ticket).await
    }

    /// New credentials for a call rejected with `sent_with`.
    async fn renew_after_rejection(&self, sent_with: Option<&str>) -> Result<CredentialSet, ApiError> {
        let ticket = {
            let mut pending = self.inner.pending.lock();
            if !pending.is_refreshing() {
                // Another call already refreshed since this one was sent
                if let Some(creds) = self.inner.store.read() {
                    if !creds.is_expired() && sent_with != Some(creds.authorization().as_str()) {
                        return Ok(creds);
                    }
                }
            }
            pending.park()
        };
        self.wait(ticket).await
    }

    async fn wait(&self, ticket: Ticket) -> Result<CredentialSet, ApiError> {
        if ticket.leads {
            self.start_refresh_cycle();
        }
        match ticket.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ApiError::session_expired()),
        }
    }

    fn start_refresh_cycle(&self) {
        let client = self.clone();
        // Detached so a cancelled caller cannot abandon the other waiters
        tokio::spawn(async move {
            client.run_refresh_cycle().await;
        });
    }

    async fn run_refresh_cycle(&self) {
        let guard = CycleGuard::new(&self.inner.pending, &self.inner.store);
        info!("Refreshing credentials");

        let outcome: RefreshOutcome = exchange_refresh(self, self.inner.store.read())
            .await
            .map_err(|e| {
                warn!(error = %e, "Credential refresh failed");
                // Unreachable is not rejected: keep the session for a later try
                if e.is_network() {
                    e
                } else {
                    e.into_terminal()
                }
            });

        match outcome {
            Ok(ref creds) => {
                info!(expires_at = %creds.expires_at, "Credentials refreshed");
                self.inner.store.write(creds.clone(), None);
            }
            Err(ref e) if e.is_terminal() => self.inner.store.clear(),
            Err(_) => {}
        }
        guard.complete(outcome);
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        self.inner.transport.send(request).await.map_err(|e| {
            warn!(error = %e, timed_out = e.timed_out, "Request failed without a response");
            ApiError::network(e.message)
        })
    }
}

fn build_request(method: Method, path: &str, body: Option<Value>, options: RequestOptions) -> HttpRequest {
    let mut request = HttpRequest::new(method, path);
    request.headers = options.headers;
    request.headers.remove(reqwest::header::AUTHORIZATION);
    request.body = body;
    request.timeout = options.timeout;
    request
}

fn is_refresh_call(request: &HttpRequest) -> bool {
    request.path.contains(REFRESH_PATH)
}

fn check_response(response: HttpResponse) -> Result<HttpResponse, ApiError> {
    if response.status.is_success() {
        Ok(response)
    } else {
        Err(ApiError::from_response(response.status, &response.body))
    }
}

/// Decode a successful body. Empty bodies decode as JSON `null`.
pub(super) fn decode<T: DeserializeOwned>(response: HttpResponse) -> Result<T, ApiError> {
    let body = if response.body.trim().is_empty() {
        "null"
    } else {
        response.body.as_str()
    };
    serde_json::from_str(body).map_err(|e| {
        ApiError::invalid_response(response.status, format!("Failed to parse JSON response: {}", e))
    })
}

fn to_body<B: Serialize>(body: &B) -> Result<Value, ApiError> {
    serde_json::to_value(body)
        .map_err(|e| ApiError::invalid_request(format!("Failed to serialize request body: {}", e)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ErrorKind;
    use crate::auth::Origin;
    use crate::test_support::{json_response, MockTransport};
    use chrono::Duration as ChronoDuration;
    use futures::future::join_all;
    use serde_json::json;

    fn client_with(transport: &Arc<MockTransport>, creds: Option<CredentialSet>) -> ApiClient {
        let store = SessionStore::open(&Origin::in_memory());
        if let Some(creds) = creds {
            store.write(creds, None);
        }
        ApiClient::new(transport.clone(), store)
    }

    fn expired() -> CredentialSet {
        CredentialSet::new(
            "old-access",
            "old-refresh",
            "Bearer",
            chrono::Utc::now() - ChronoDuration::seconds(1),
        )
    }

    fn fresh_pair() -> CredentialSet {
        CredentialSet::new(
            "new-access",
            "new-refresh",
            "Bearer",
            chrono::Utc::now() + ChronoDuration::hours(1),
        )
    }

    /// Accepts only `new-access`; the refresh endpoint hands it out.
    fn server_accepting_new_token() -> Arc<MockTransport> {
        let issued = fresh_pair();
        MockTransport::new(move |request| {
            if request.path == REFRESH_PATH {
                return json_response(StatusCode::OK, &issued);
            }
            match request.authorization() {
                Some("Bearer new-access") => json_response(StatusCode::OK, &json!({ "ok": true })),
                _ => json_response(StatusCode::UNAUTHORIZED, &json!({
                    "title": "Unauthorized", "status": 401, "detail": "Invalid or expired token"
                })),
            }
        })
        .with_latency(std::time::Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_valid_credentials_are_attached_without_refresh() {
        let transport = server_accepting_new_token();
        let client = client_with(&transport, Some(fresh_pair()));

        let body: Value = client.get("/expenses").await.unwrap();

        assert_eq!(body, json!({ "ok": true }));
        assert_eq!(transport.refresh_calls(), 0);
        assert_eq!(transport.requests()[0].authorization(), Some("Bearer new-access"));
    }

    #[tokio::test]
    async fn test_expired_credentials_refresh_before_send() {
        let transport = server_accepting_new_token();
        let client = client_with(&transport, Some(expired()));

        let _: Value = client.get("/expenses").await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].path, REFRESH_PATH);
        assert_eq!(requests[0].authorization(), Some("Bearer old-refresh"));
        assert_eq!(requests[1].authorization(), Some("Bearer new-access"));

        let held = client.session().read().unwrap();
        assert_eq!(held.access_token, "new-access");
        assert_eq!(held.refresh_token, "new-refresh");
    }

    #[tokio::test]
    async fn test_single_flight_on_expiry() {
        let transport = server_accepting_new_token();
        let client = client_with(&transport, Some(expired()));

        let calls = (0..5).map(|i| {
            let client = client.clone();
            async move { client.get::<Value>(&format!("/expenses/{}", i)).await }
        });
        let results = join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(transport.refresh_calls(), 1);
        // Every data call went out after the refresh with the new token
        let requests = transport.requests();
        assert_eq!(requests[0].path, REFRESH_PATH);
        assert!(requests[1..]
            .iter()
            .all(|r| r.authorization() == Some("Bearer new-access")));
        assert!(!client.is_refreshing());
    }

    #[tokio::test]
    async fn test_single_flight_failure_rejects_all_and_clears() {
        let transport = MockTransport::new(|request| {
            if request.path == REFRESH_PATH {
                return json_response(StatusCode::UNAUTHORIZED, &json!({
                    "title": "Unauthorized", "status": 401, "detail": "Invalid or expired token"
                }));
            }
            json_response(StatusCode::OK, &json!({}))
        })
        .with_latency(std::time::Duration::from_millis(20));
        let client = client_with(&transport, Some(expired()));

        let calls = (0..5).map(|_| {
            let client = client.clone();
            async move { client.get::<Value>("/expenses").await }
        });
        let results = join_all(calls).await;

        assert_eq!(transport.refresh_calls(), 1);
        assert_eq!(transport.requests().len(), 1);
        for result in results {
            let err = result.unwrap_err();
            assert_eq!(err.kind, ErrorKind::UnauthorizedTerminal);
            assert_eq!(err.status, 401);
        }
        assert_eq!(client.session().read(), None);
        assert!(!client.is_refreshing());
    }

    #[tokio::test]
    async fn test_reactive_refresh_retries_once() {
        let transport = server_accepting_new_token();
        // Not expired by the clock, but the server no longer accepts it
        let stale = CredentialSet::new(
            "revoked",
            "old-refresh",
            "Bearer",
            chrono::Utc::now() + ChronoDuration::hours(1),
        );
        let client = client_with(&transport, Some(stale));

        let _: Value = client.get("/expenses").await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].authorization(), Some("Bearer revoked"));
        assert_eq!(requests[1].path, REFRESH_PATH);
        assert_eq!(requests[2].authorization(), Some("Bearer new-access"));
    }

    #[tokio::test]
    async fn test_reactive_single_flight() {
        let transport = server_accepting_new_token();
        let stale = CredentialSet::new(
            "revoked",
            "old-refresh",
            "Bearer",
            chrono::Utc::now() + ChronoDuration::hours(1),
        );
        let client = client_with(&transport, Some(stale));

        let calls = (0..5).map(|_| {
            let client = client.clone();
            async move { client.get::<Value>("/expenses").await }
        });
        let results = join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(transport.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_rejected_call_joins_proactive_refresh_in_flight() {
        let issued = fresh_pair();
        let transport = MockTransport::new(move |request| {
            if request.path == REFRESH_PATH {
                return json_response(StatusCode::OK, &issued);
            }
            match request.authorization() {
                Some("Bearer new-access") => json_response(StatusCode::OK, &json!({ "ok": true })),
                _ => json_response(StatusCode::UNAUTHORIZED, &json!({
                    "title": "Unauthorized", "status": 401, "detail": "Invalid or expired token"
                })),
            }
        })
        .with_latency(std::time::Duration::from_millis(40));
        // Valid when the first call goes out, expired by the time the second starts
        let expiring = CredentialSet::new(
            "old-access",
            "old-refresh",
            "Bearer",
            chrono::Utc::now() + ChronoDuration::milliseconds(15),
        );
        let client = client_with(&transport, Some(expiring));

        let rejected = client.get::<Value>("/expenses");
        let proactive = async {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            client.get::<Value>("/expenses/categories").await
        };
        let (rejected, proactive) = tokio::join!(rejected, proactive);

        assert!(rejected.is_ok());
        assert!(proactive.is_ok());
        assert_eq!(transport.refresh_calls(), 1);
        let requests = transport.requests();
        assert_eq!(requests[0].authorization(), Some("Bearer old-access"));
        assert_eq!(requests[1].path, REFRESH_PATH);
        assert!(!client.is_refreshing());
    }

    #[tokio::test]
    async fn test_no_double_retry() {
        // Refresh succeeds but the server keeps rejecting every data call
        let issued = fresh_pair();
        let transport = MockTransport::new(move |request| {
            if request.path == REFRESH_PATH {
                return json_response(StatusCode::OK, &issued);
            }
            json_response(StatusCode::UNAUTHORIZED, &json!({
                "title": "Unauthorized", "status": 401, "detail": "Invalid or expired token"
            }))
        });
        let client = client_with(&transport, Some(fresh_pair()));

        let err = client.get::<Value>("/expenses").await.unwrap_err();

        assert!(err.is_terminal());
        assert_eq!(err.details, "Invalid or expired token");
        assert_eq!(transport.refresh_calls(), 1);
        assert_eq!(transport.requests().len(), 3);
        assert_eq!(client.session().read(), None);
    }

    #[tokio::test]
    async fn test_refresh_endpoint_is_never_retried() {
        let transport = MockTransport::new(|_| {
            json_response(StatusCode::UNAUTHORIZED, &json!({
                "title": "Unauthorized", "status": 401, "detail": "Invalid or expired token"
            }))
        });
        let client = client_with(&transport, Some(fresh_pair()));

        let err = client
            .post::<Value, _>(REFRESH_PATH, &json!({}))
            .await
            .unwrap_err();

        assert!(err.is_terminal());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_fast() {
        let transport = server_accepting_new_token();
        let client = client_with(&transport, None);

        let err = client.get::<Value>("/expenses").await.unwrap_err();

        assert!(err.is_terminal());
        assert_eq!(err.details, "No refresh token available. Please sign in again.");
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_network_error_is_normalized_and_does_not_wedge() {
        let transport = MockTransport::failing_refresh_then(|_| json_response(StatusCode::OK, &json!(1)));
        let expired_creds = expired();
        let client = client_with(&transport, Some(expired_creds.clone()));

        let err = client.get::<Value>("/expenses").await.unwrap_err();
        assert!(err.is_network());
        assert!(!client.is_refreshing());
        // An unreachable refresh endpoint is not a sign-out
        assert_eq!(client.session().read(), Some(expired_creds));

        // Plain calls after a network failure still go through
        client.session().write(fresh_pair(), None);
        let value: i64 = client.get("/expenses").await.unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn test_network_error_on_data_call() {
        let transport = MockTransport::unreachable();
        let client = client_with(&transport, Some(fresh_pair()));

        let err = client.get::<Value>("/expenses").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Network);
        assert_eq!(err.title, "Network Error");
        // A network failure is not an auth failure; the session survives
        assert!(client.session().read().is_some());
    }

    #[tokio::test]
    async fn test_validation_error_propagates_unchanged() {
        let transport = MockTransport::new(|_| {
            json_response(StatusCode::BAD_REQUEST, &json!({
                "title": "Validation",
                "status": 400,
                "detail": "One or more fields failed validation",
                "error": { "name": ["required"] }
            }))
        });
        let client = client_with(&transport, Some(fresh_pair()));

        let err = client
            .post::<Value, _>("/expenses/categories", &json!({ "name": "" }))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.error, Some(json!({ "name": ["required"] })));
        assert_eq!(transport.refresh_calls(), 0);
        assert!(client.session().read().is_some());
    }

    #[tokio::test]
    async fn test_empty_body_decodes_as_unit() {
        let transport = MockTransport::new(|_| HttpResponse::new(StatusCode::NO_CONTENT, ""));
        let client = client_with(&transport, Some(fresh_pair()));

        let () = client.get("/auth/me").await.unwrap();
    }

    #[tokio::test]
    async fn test_request_public_sends_no_credentials() {
        let transport = MockTransport::new(|_| json_response(StatusCode::OK, &json!(true)));
        let client = client_with(&transport, Some(expired()));

        let ok: bool = client
            .request_public(Method::GET, "/health", None, RequestOptions::default())
            .await
            .unwrap();

        assert!(ok);
        assert_eq!(transport.refresh_calls(), 0);
        assert_eq!(transport.requests()[0].authorization(), None);
    }

    #[tokio::test]
    async fn test_refresh_session_joins_proactive_refresh() {
        let transport = server_accepting_new_token();
        let client = client_with(&transport, Some(expired()));

        let (manual, call) = tokio::join!(client.refresh_session(), client.get::<Value>("/expenses"));

        assert_eq!(manual.unwrap().access_token, "new-access");
        assert!(call.is_ok());
        assert_eq!(transport.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_options_cannot_smuggle_authorization() {
        let transport = server_accepting_new_token();
        let client = client_with(&transport, Some(fresh_pair()));
        let mut options = RequestOptions::default();
        options
            .headers
            .insert(reqwest::header::AUTHORIZATION, "Bearer forged".parse().unwrap());
        options.headers.insert("x-trace", "abc".parse().unwrap());

        let _: Value = client.request(Method::GET, "/expenses", None, options).await.unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(sent.authorization(), Some("Bearer new-access"));
        assert_eq!(sent.headers.get("x-trace").unwrap(), "abc");
    }
}
