//! Session credentials shared by concurrent calls and by every open tab.
//!
//! Two pieces:
//!
//! - [`auth::SessionStore`]: holds the current [`auth::CredentialSet`],
//!   persists it to a durable or ephemeral tier, and keeps all tabs of an
//!   [`auth::Origin`] in step.
//! - [`api::ApiClient`]: attaches credentials to outgoing calls and renews
//!   them when they expire or are rejected, with at most one refresh in
//!   flight per tab no matter how many calls notice.
//!
//! ```no_run
//! use sessionsync::{api::{ApiClient, AuthApi}, auth::{Origin, SessionStore}, Config};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::from_env()?;
//! let origin = Origin::from_config(&config);
//! let session = SessionStore::open_configured(&origin, &config);
//! let client = ApiClient::from_config(&config, session)?;
//!
//! AuthApi::new(client.clone()).sign_in("alice", "hunter22", None).await?;
//! let categories: serde_json::Value = client.get("/expenses/categories").await?;
//! # let _ = categories;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod logging;

#[cfg(test)]
mod test_support;

pub use config::Config;
