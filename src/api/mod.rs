//! REST API client module.
//!
//! This module provides the `ApiClient` for authenticated calls and the
//! `AuthApi` for the credential exchanges. Calls carry a
//! `<tokenType> <accessToken>` authorization header; expired or rejected
//! credentials are renewed through a single shared refresh.

pub mod auth;
pub mod client;
pub mod error;
pub(crate) mod refresh;
pub mod transport;

pub use auth::AuthApi;
pub use client::{ApiClient, RequestOptions};
pub use error::{ApiError, ErrorKind, NETWORK_ERROR_STATUS};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};
