//! Checkpoint persistence and the live-migration sequence.

use thiserror::Error;
use tracing::{debug, info};

use greengrid_state::{
    ASSIGNMENT_UTILIZATION_STEP, DecisionKind, NodeId, NodeStatus, RoutingDecision, SliceStatus,
    StateError, StateStore, Tier, Workload, WorkloadId, WorkloadStatus,
};

/// Result type alias for checkpoint/migration operations.
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Errors that can occur during checkpointing or migration.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

/// Summary of a completed live migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub workload_id: WorkloadId,
    pub from_node: Option<NodeId>,
    pub to_node: NodeId,
}

/// Performs checkpoints and live migrations against the state store.
pub struct CheckpointManager {
    state: StateStore,
}

impl CheckpointManager {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Save a checkpoint for a workload.
    ///
    /// No-op (returns `None`) when checkpointing is disabled or the
    /// workload is not in a checkpointable status.
    pub fn checkpoint(&self, workload_id: &str, now: u64) -> MigrateResult<Option<String>> {
        let mut workload = self.get_workload(workload_id)?;

        if !workload.checkpoint_enabled {
            return Ok(None);
        }
        if !matches!(
            workload.status,
            WorkloadStatus::Running | WorkloadStatus::Paused | WorkloadStatus::Migrating
        ) {
            return Ok(None);
        }

        let handle = format!("checkpoint://{workload_id}/{now}");
        workload.checkpoint_handle = Some(handle.clone());
        workload.last_checkpoint_at = Some(now);
        self.state.put_workload(&workload)?;

        info!(workload = %workload_id, %handle, "checkpoint saved");
        Ok(Some(handle))
    }

    /// Checkpoint every running, checkpoint-enabled workload that is due.
    /// Returns the number checkpointed.
    pub fn checkpoint_all_due(&self, now: u64) -> MigrateResult<usize> {
        let mut checkpointed = 0;
        for workload in self.state.list_workloads()? {
            if workload.needs_checkpoint(now) && self.checkpoint(&workload.id, now)?.is_some() {
                checkpointed += 1;
            }
        }
        if checkpointed > 0 {
            info!(count = checkpointed, "due checkpoints saved");
        }
        Ok(checkpointed)
    }

    /// Live-migrate a workload onto `target_node_id`.
    ///
    /// `tier` labels the audit record; the caller (broker) computed it when
    /// it scored the target. The workload ends up running on the target
    /// with any previously held slice released back to its pool.
    pub fn live_migrate(
        &self,
        workload_id: &str,
        target_node_id: &str,
        reason: &str,
        tier: Option<Tier>,
        now: u64,
    ) -> MigrateResult<MigrationRecord> {
        let mut workload = self.get_workload(workload_id)?;
        let target = self
            .state
            .get_node(target_node_id)?
            .ok_or_else(|| MigrateError::NodeNotFound(target_node_id.to_string()))?;

        // Where the workload currently holds capacity: its node, or the
        // node that owns its slice.
        let held_slice = match &workload.slice_id {
            Some(slice_id) => self.state.get_slice(slice_id)?,
            None => None,
        };
        let source_node_id = workload
            .node_id
            .clone()
            .or_else(|| held_slice.as_ref().map(|s| s.node_id.clone()));

        info!(
            workload = %workload_id,
            from = source_node_id.as_deref().unwrap_or("-"),
            to = %target_node_id,
            reason,
            "live migration starting"
        );

        // Step 1: checkpoint current state.
        workload.status = WorkloadStatus::Migrating;
        self.state.put_workload(&workload)?;
        self.checkpoint(workload_id, now)?;
        workload = self.get_workload(workload_id)?;

        // Step 2: release a held slice back to its pool.
        if let Some(mut slice) = held_slice {
            slice.status = SliceStatus::Available;
            slice.workload_id = None;
            slice.released_at = Some(now);
            self.state.put_slice(&slice)?;
            debug!(slice = %slice.id, "held slice released for migration");
        }

        // Step 3: reassign and conceptually restore on the target.
        workload.node_id = Some(target.id.clone());
        workload.slice_id = None;
        workload.migration_count += 1;
        workload.status = WorkloadStatus::Running;
        workload.started_at = workload.started_at.or(Some(now));
        self.state.put_workload(&workload)?;
        if let Some(handle) = &workload.checkpoint_handle {
            debug!(workload = %workload_id, %handle, "restoring from checkpoint on target");
        }

        // Step 4: move the utilization share from source to target.
        if let Some(source_id) = &source_node_id
            && source_id != target_node_id
        {
            let others_running = self.state.list_workloads()?.iter().any(|w| {
                w.id != workload.id
                    && w.status == WorkloadStatus::Running
                    && w.node_id.as_deref() == Some(source_id.as_str())
            });
            self.state.update_node(source_id, |n| {
                n.utilization -= ASSIGNMENT_UTILIZATION_STEP;
                n.status = if others_running { NodeStatus::Busy } else { NodeStatus::Idle };
            })?;
        }
        let target = self.state.update_node(target_node_id, |n| {
            n.utilization += ASSIGNMENT_UTILIZATION_STEP;
            n.status = NodeStatus::Busy;
        })?;

        // Step 5: migration-flagged audit record.
        self.state.append_decision(RoutingDecision {
            workload_id: workload_id.to_string(),
            seq: 0,
            node_id: Some(target.id.clone()),
            slice_id: None,
            kind: DecisionKind::Reroute,
            reason: format!("live_migration_{reason}"),
            tier,
            score: None,
            carbon_intensity: target.effective_carbon(),
            energy_price: target.energy_price,
            renewable_pct: target.renewable_pct,
            migration: true,
            decided_at: now,
        })?;

        info!(workload = %workload_id, to = %target_node_id, "live migration complete");
        Ok(MigrationRecord {
            workload_id: workload_id.to_string(),
            from_node: source_node_id,
            to_node: target_node_id.to_string(),
        })
    }

    fn get_workload(&self, workload_id: &str) -> MigrateResult<Workload> {
        self.state
            .get_workload(workload_id)?
            .ok_or_else(|| MigrateError::WorkloadNotFound(workload_id.to_string()))
    }
}
