//! sandgate-auth — the access gate in front of the backend.
//!
//! Bearer tokens are JWTs verified against a JWK set fetched from a
//! remote endpoint. The key set is cached with a TTL; when a refresh
//! fails after expiry, a bounded grace window keeps trusting the stale
//! set before verification starts failing with `KeySetUnavailable`.
//!
//! # Components
//!
//! - **`keys`** — `KeySource` trait, HTTP/static sources, TTL cache
//! - **`gate`** — `AccessGate::verify()` and the development bypass
//! - **`token`** — locating (and stripping) the credential on a request

pub mod error;
pub mod gate;
pub mod keys;
pub mod token;

pub use error::{AuthError, KeyFetchError};
pub use gate::{AccessGate, Identity};
pub use keys::{CachePolicy, HttpKeySource, KeyCache, KeySource, StaticKeySource};
pub use token::TokenLocator;
