//! GreenGrid checkpoint & migration — resumable state and node hand-off.
//!
//! A checkpoint is a logical state snapshot: an opaque resumable-state
//! handle plus a timestamp, not file contents. Live migration checkpoints
//! the workload, reassigns it to the target node (releasing any held
//! slice), conceptually restores on the target, moves the utilization
//! share between source and target, and appends a migration-flagged
//! routing decision.
//!
//! In production the checkpoint step would drive CRIU or a CUDA
//! checkpoint mechanism; here the handle is the interface.

pub mod checkpoint;

pub use checkpoint::{CheckpointManager, MigrateError, MigrateResult, MigrationRecord};
