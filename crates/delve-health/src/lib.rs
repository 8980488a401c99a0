//! delve-health — reachability checks for dungeon instances.
//!
//! Every known instance is probed independently each tick. A probe is a
//! plain TCP connect with a short timeout, retried a bounded number of
//! times.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor::check_all
//!   └── one spawned task per instance (bounded by a semaphore)
//!       ├── probe_with_retries(Prober) → ProbeResult
//!       ├── Reachable   → mark_healthy → HealthyCallback (lease checks)
//!       └── Unreachable → degrade
//!           ├── within grace  → Unreachable, first unhealthy_since kept
//!           └── past grace    → delete record → EvictionCallback
//! ```
//!
//! The tick driver does not wait for these tasks; a slow or dead instance
//! never delays its siblings or the next tick.

pub mod checker;
pub mod monitor;

pub use checker::{ProbeResult, Prober, StaticProber, TcpProber, probe_with_retries};
pub use monitor::{BoxFuture, DegradeOutcome, EvictionCallback, HealthMonitor, HealthyCallback};
