//! delve-core — shared building blocks for the Delve control plane.
//!
//! Holds the daemon configuration ([`DelveConfig`]), the pool-name
//! matcher that separates schedulable dungeons from infrastructure
//! servers, and the wall-clock helper every subsystem stamps records with.

pub mod config;
pub mod pool;

pub use config::{BackfillConfig, DelveConfig, ProbeConfig, RunMode};
pub use pool::PoolMatcher;

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
