//! sandgate-core — configuration shared by every sandgate component.
//!
//! The gateway is configured from a single TOML file. Each component
//! crate reads its own section:
//!
//! | Section | Consumer |
//! |---|---|
//! | `[server]` | `sandgated` listener |
//! | `[auth]` | `sandgate-auth` access gate |
//! | `[backend]` | `sandgate-supervisor` lifecycle supervisor |
//! | `[storage]`, `[sync]` | `sandgate-sync` engine and scheduler |

pub mod config;
pub mod duration;

pub use config::{
    AuthConfig, BackendConfig, ConfigError, EntryConfig, GatewayConfig, ServerConfig,
    StorageConfig, StorageKind, SyncConfig,
};
pub use duration::parse_duration;
