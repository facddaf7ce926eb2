//! Where the bearer credential lives on a request.
//!
//! The credential belongs to the gate: it is read here and stripped
//! before the request is forwarded to the backend.

use http::header::{AUTHORIZATION, COOKIE, HeaderName, HeaderValue};
use http::HeaderMap;

use sandgate_core::AuthConfig;

/// Locates the credential in a header (and optionally a cookie).
#[derive(Debug, Clone)]
pub struct TokenLocator {
    header: HeaderName,
    cookie: Option<String>,
}

impl TokenLocator {
    pub fn new(header: HeaderName, cookie: Option<String>) -> Self {
        Self { header, cookie }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, http::header::InvalidHeaderName> {
        let header = HeaderName::from_bytes(config.token_header.trim().as_bytes())?;
        Ok(Self::new(header, config.token_cookie.clone()))
    }

    /// Extract the raw token, if any.
    ///
    /// For `Authorization` the `Bearer` scheme is required. The header
    /// wins over the cookie when both are present.
    pub fn extract(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(value) = headers.get(&self.header).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            let token = if self.header == AUTHORIZATION {
                strip_bearer(value)
            } else {
                Some(value)
            };
            if let Some(token) = token.filter(|t| !t.is_empty()) {
                return Some(token.to_string());
            }
        }

        let cookie_name = self.cookie.as_deref()?;
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == cookie_name)
            .map(|(_, value)| value.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    /// Remove the credential header and cookie, keeping other cookies.
    pub fn strip(&self, headers: &mut HeaderMap) {
        headers.remove(&self.header);

        let Some(cookie_name) = self.cookie.as_deref() else {
            return;
        };
        let kept: Vec<String> = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .filter(|pair| pair.split_once('=').is_none_or(|(name, _)| name != cookie_name))
            .map(str::to_string)
            .collect();

        headers.remove(COOKIE);
        if !kept.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&kept.join("; ")) {
                headers.insert(COOKIE, value);
            }
        }
    }
}

fn strip_bearer(value: &str) -> Option<&str> {
    let (scheme, rest) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| rest.trim())
}
