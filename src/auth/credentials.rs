use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The token pair handed out by sign-in, sign-up and refresh.
///
/// Values are never patched in place: a new set always replaces the old one
/// in full. The serialized form is the persisted layout, e.g.
/// `{"accessToken":"…","refreshToken":"…","tokenType":"Bearer","expiresAt":"…"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct CredentialSet {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

impl CredentialSet {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        token_type: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            token_type: token_type.into(),
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Credentials are usable strictly before `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at - Utc::now()
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }

    /// Value for the `Authorization` header of ordinary calls.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    /// Value for the `Authorization` header of the refresh exchange.
    pub fn refresh_authorization(&self) -> Option<String> {
        if self.token_type.is_empty() || self.refresh_token.is_empty() {
            return None;
        }
        Some(format!("{} {}", self.token_type, self.refresh_token))
    }
}

/// Where the credential set is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum StorageTier {
    /// Survives restarts ("remember me").
    Durable,
    /// Lives only as long as the current tab.
    Ephemeral,
}

impl StorageTier {
    pub fn other(self) -> Self {
        match self {
            StorageTier::Durable => StorageTier::Ephemeral,
            StorageTier::Ephemeral => StorageTier::Durable,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
