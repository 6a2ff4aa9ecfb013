//! greengrid-state — embedded state store for GreenGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for workloads, compute nodes, GPU slices, routing
//! decisions, grid snapshots, and health reports.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{workload_id}:{seq:08}`, `{zone}:{recorded_at:012}`)
//! keep per-entity prefix scans in append order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Per-node atomicity for
//! capacity-claiming mutations comes from `update_node`, which performs the
//! read-modify-write inside a single serialized write transaction.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{GridView, StateStore};
pub use types::*;
