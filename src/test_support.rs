//! Shared test infrastructure: a scripted transport and credential fixtures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Serialize;

use crate::api::auth::REFRESH_PATH;
use crate::api::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::auth::CredentialSet;

type Handler = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

/// Transport that answers from a closure and records every request.
pub struct MockTransport {
    handler: Handler,
    requests: Mutex<Vec<HttpRequest>>,
    latency: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        Self::with_handler(move |request| Ok(respond(request)))
    }

    pub fn with_handler<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            latency: Mutex::new(None),
        })
    }

    /// Refresh calls time out; everything else goes to `respond`.
    pub fn failing_refresh_then<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        Self::with_handler(move |request| {
            if request.path == REFRESH_PATH {
                Err(TransportError::timeout())
            } else {
                Ok(respond(request))
            }
        })
    }

    /// Every call fails without a response.
    pub fn unreachable() -> Arc<Self> {
        Self::with_handler(|_| Err(TransportError::new("connection refused")))
    }

    /// Delay every response, so concurrent callers overlap.
    pub fn with_latency(self: Arc<Self>, latency: Duration) -> Arc<Self> {
        *self.latency.lock() = Some(latency);
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn refresh_calls(&self) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path == REFRESH_PATH)
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request.clone());
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        (self.handler)(&request)
    }
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> HttpResponse {
    HttpResponse::new(status, serde_json::to_string(body).unwrap())
}

pub fn credentials_expiring_in(duration: chrono::Duration) -> CredentialSet {
    CredentialSet::new("access-token", "refresh-token", "Bearer", Utc::now() + duration)
}

/// Subscriber that records every value it is called with.
pub fn recording_subscriber() -> (
    Arc<Mutex<Vec<Option<CredentialSet>>>>,
    impl Fn(Option<&CredentialSet>) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |creds: Option<&CredentialSet>| {
        sink.lock().push(creds.cloned())
    })
}
