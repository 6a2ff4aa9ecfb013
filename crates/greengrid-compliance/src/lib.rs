//! GreenGrid compliance gate — decides which nodes may run a workload.
//!
//! Green gating rules, per node category:
//! - **Energy recyclers** (always-green) pass unconditionally, no grid check.
//! - **Datacenters** pass while the local grid shows a surplus price, heavy
//!   curtailment, or a renewable share above the green threshold.
//! - **Consumer GPUs** pass only on renewable share (no surplus escape
//!   hatch, stricter than datacenters).
//!
//! On top of the green gate sits a hard capability check: available VRAM,
//! carbon ceiling, and budget at the node's quoted rate. The gate is a pure
//! filter: no matching node means an empty candidate set, never an error.

pub mod gate;

pub use gate::{
    ComplianceConfig, can_handle, compliant, consumer_compliant, datacenter_compliant,
    eligible_nodes, sync_nodes_with_grid,
};
