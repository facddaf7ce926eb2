//! Access gate error types.

use thiserror::Error;

/// Reasons a request is refused by the access gate.
///
/// Every variant maps to an authentication failure response; none of
/// them is fatal to the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("token expired")]
    Expired,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("verification keys unavailable")]
    KeySetUnavailable,
}

impl AuthError {
    /// Stable machine-readable kind, used in response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::Unauthorized(_) => "unauthorized",
            AuthError::Expired => "expired",
            AuthError::Malformed(_) => "malformed",
            AuthError::KeySetUnavailable => "key_set_unavailable",
        }
    }
}

/// A key source could not produce a key set.
#[derive(Debug, Error)]
#[error("key fetch failed: {0}")]
pub struct KeyFetchError(pub String);

impl From<reqwest::Error> for KeyFetchError {
    fn from(e: reqwest::Error) -> Self {
        KeyFetchError(e.to_string())
    }
}
