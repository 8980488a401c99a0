//! delve-state — embedded state store for Delve.
//!
//! Backed by [redb](https://docs.rs/redb). Holds players, dungeon
//! instances, claims, advisory locks, telemetry events, outbound command
//! tasks, scores and cards.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{name}/{address}`, `{type}:{target}`) enable prefix
//! scans for related records. Two index tables back the claim invariants:
//! `active_claims` (player → non-terminal claim id) and `run_index`
//! (run id → claim id). Both are maintained in the same write transaction
//! as the claim itself.
//!
//! Conditional writes (`update_instance`, `compare_and_swap_instance`)
//! read and write inside one redb write transaction. Write transactions
//! are serialized by redb, so a conditional write observing stale state
//! declines instead of overwriting.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

#[macro_use]
pub mod error;
pub mod claims;
pub mod events;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use events::RunPage;
pub use store::StateStore;
pub use types::*;
