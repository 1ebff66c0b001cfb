//! Shared configuration and data-model types for the tollgate proxy.
//!
//! Nothing in this crate touches HTTP, the filesystem watcher, or the
//! scheduler; it is the plain-data layer both `tollgate-core` and the
//! `tollgate` binary depend on.

mod config;
mod principal;

pub use config::{
    AllowlistConfig, AppConfig, ConfigError, HttpClientConfig, RateLimitConfig, RateLimitTier,
};
pub use principal::Principal;
