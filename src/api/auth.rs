//! Credential exchanges with the auth endpoints.
//!
//! Sign-in, sign-up and refresh go out without credentials; their results
//! are written to the session store. `me` is an ordinary authenticated call.

use reqwest::Method;
use serde::Serialize;
use tracing::info;

use super::client::{decode, ApiClient, RequestOptions};
use super::error::ApiError;
use super::transport::HttpRequest;
use crate::auth::{CredentialSet, StorageTier};

pub const SIGN_IN_PATH: &str = "/auth/sign-in";
pub const SIGN_UP_PATH: &str = "/auth/sign-up";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const ME_PATH: &str = "/auth/me";

#[derive(Serialize)]
struct SignInPayload<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct SignUpPayload<'a> {
    email: &'a str,
    username: &'a str,
    password: &'a str,
}

/// Sign-in, sign-up, sign-out and refresh for one tab.
#[derive(Clone)]
pub struct AuthApi {
    client: ApiClient,
}

impl AuthApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Exchange a username and password for credentials and store them.
    /// `tier` overrides the current tier preference ("remember me").
    pub async fn sign_in(
        &self,
        username: &str,
        password: &str,
        tier: Option<StorageTier>,
    ) -> Result<CredentialSet, ApiError> {
        let payload = SignInPayload { username, password };
        let creds = self.exchange(SIGN_IN_PATH, &payload).await?;
        self.client.session().write(creds.clone(), tier);
        info!(username, "Signed in");
        Ok(creds)
    }

    /// Create an account and store the credentials it comes with.
    pub async fn sign_up(
        &self,
        email: &str,
        username: &str,
        password: &str,
        tier: Option<StorageTier>,
    ) -> Result<CredentialSet, ApiError> {
        let payload = SignUpPayload {
            email,
            username,
            password,
        };
        let creds = self.exchange(SIGN_UP_PATH, &payload).await?;
        self.client.session().write(creds.clone(), tier);
        info!(username, "Signed up");
        Ok(creds)
    }

    pub fn sign_out(&self) {
        self.client.session().clear();
        info!("Signed out");
    }

    /// Renew credentials now. Shares the in-flight refresh if there is one.
    pub async fn refresh(&self) -> Result<CredentialSet, ApiError> {
        self.client.refresh_session().await
    }

    /// Check that the current session is accepted by the server.
    pub async fn me(&self) -> Result<(), ApiError> {
        self.client.get(ME_PATH).await
    }

    async fn exchange<P: Serialize>(&self, path: &str, payload: &P) -> Result<CredentialSet, ApiError> {
        let body = serde_json::to_value(payload)
            .map_err(|e| ApiError::invalid_request(format!("Failed to serialize request body: {}", e)))?;
        self.client
            .request_public(Method::POST, path, Some(body), RequestOptions::default())
            .await
    }
}

/// The refresh exchange itself: POST with `<tokenType> <refreshToken>`.
/// Fails without a network call when there is no refresh token.
pub(crate) async fn exchange_refresh(
    client: &ApiClient,
    creds: Option<CredentialSet>,
) -> Result<CredentialSet, ApiError> {
    let authorization = creds
        .as_ref()
        .and_then(CredentialSet::refresh_authorization)
        .ok_or_else(ApiError::no_refresh_token)?;

    let mut request = HttpRequest::new(Method::POST, REFRESH_PATH);
    request.set_authorization(&authorization);
    let response = client.send_public(request).await?;
    decode(response)
}

// ============================================================================
// Tests
// ============================================================================
