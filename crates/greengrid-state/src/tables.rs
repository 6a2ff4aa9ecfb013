//! redb table definitions for the GreenGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys use zero-padded numeric suffixes
//! (`{workload_id}:{seq:08}`, `{zone}:{recorded_at:012}`) so prefix scans
//! come back in order.

use redb::TableDefinition;

/// Workloads keyed by `{workload_id}`.
pub const WORKLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("workloads");

/// Compute nodes keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// GPU slices keyed by `{slice_id}`.
pub const SLICES: TableDefinition<&str, &[u8]> = TableDefinition::new("slices");

/// Routing decisions keyed by `{workload_id}:{seq:08}`. Append-only.
pub const DECISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("decisions");

/// Grid snapshots keyed by `{zone}:{recorded_at:012}`.
pub const GRID_SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("grid_snapshots");

/// Health reports keyed by `{node_id}:{recorded_at:012}`.
pub const HEALTH_REPORTS: TableDefinition<&str, &[u8]> = TableDefinition::new("health_reports");
