//! Verification provider integration: token lifecycle, HTTP client and wire formats.

pub mod auth;
pub mod client;
pub(crate) mod wire;

pub use auth::{AuthToken, Authenticate, TokenManager};
pub use client::{ProviderClient, ProviderVerdict, Verify, VerifyError};
