//! Slice lifecycle: auto-manage, best-fit lookup, allocate and release.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use greengrid_pricing::{PricingConfig, PricingContext, quote};
use greengrid_state::{
    ComputeNode, GpuSlice, GridView, NodeId, SliceId, SliceProfile, SliceStatus, StateError,
    StateStore, Workload, WorkloadId,
};

/// Result type alias for slice operations.
pub type SliceResult<T> = Result<T, SliceError>;

/// Errors that can occur during slice operations.
#[derive(Debug, Error)]
pub enum SliceError {
    #[error("slice not found: {0}")]
    NotFound(String),

    #[error("slice not available: {0}")]
    NotAvailable(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

/// Utilization thresholds driving slice creation and reclamation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceConfig {
    /// Below this utilization, spare capacity is packed into slices.
    pub slice_threshold: f64,
    /// Above this utilization, unallocated slices are reclaimed.
    pub reclaim_threshold: f64,
    /// Above this utilization, allocated slices must migrate off.
    pub critical_threshold: f64,
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            slice_threshold: 0.70,
            reclaim_threshold: 0.85,
            critical_threshold: 0.95,
        }
    }
}

/// A workload that must be moved off an allocated slice before the slice
/// can be released. Executed by the monitor through the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSliceMigration {
    pub workload_id: WorkloadId,
    pub slice_id: SliceId,
    pub node_id: NodeId,
}

/// Outcome of one auto-manage pass over the fleet.
#[derive(Debug, Default)]
pub struct AutoManageReport {
    pub created: usize,
    pub reclaimed: usize,
    pub pending_migrations: Vec<PendingSliceMigration>,
    pub errors: Vec<(NodeId, String)>,
}

/// Manages slice lifecycle against the state store.
pub struct SliceManager {
    state: StateStore,
    config: SliceConfig,
}

impl SliceManager {
    pub fn new(state: StateStore, config: SliceConfig) -> Self {
        Self { state, config }
    }

    /// Scan all multi-instance-capable nodes and create or reclaim slices.
    ///
    /// Idempotent: a second pass with unchanged utilization creates and
    /// reclaims nothing, because stale available slices are cleared and
    /// repacked from the same spare fraction. Per-node failures are
    /// collected, not propagated.
    pub fn auto_manage(
        &self,
        grid: &GridView,
        pricing_ctx: &PricingContext,
        pricing_cfg: &PricingConfig,
        now: u64,
    ) -> SliceResult<AutoManageReport> {
        let mut report = AutoManageReport::default();

        for node in self.state.list_nodes()? {
            if !node.mig_capable {
                continue;
            }
            let result = if node.utilization < self.config.slice_threshold {
                self.create_slices(&node, grid, pricing_ctx, pricing_cfg, now)
                    .map(|created| {
                        report.created += created.len();
                    })
            } else if node.utilization > self.config.reclaim_threshold {
                self.reclaim_slices(&node, now).map(|(reclaimed, pending)| {
                    report.reclaimed += reclaimed;
                    report.pending_migrations.extend(pending);
                })
            } else {
                Ok(())
            };

            if let Err(e) = result {
                warn!(node = %node.id, error = %e, "slice auto-manage failed for node");
                report.errors.push((node.id.clone(), e.to_string()));
            }
        }

        info!(
            created = report.created,
            reclaimed = report.reclaimed,
            pending_migrations = report.pending_migrations.len(),
            "slice auto-manage complete"
        );
        Ok(report)
    }

    /// Pack a node's spare compute fraction with the largest fitting
    /// profiles. Stale available slices are cleared first, so recreation
    /// is idempotent rather than additive.
    pub fn create_slices(
        &self,
        node: &ComputeNode,
        grid: &GridView,
        pricing_ctx: &PricingContext,
        pricing_cfg: &PricingConfig,
        now: u64,
    ) -> SliceResult<Vec<GpuSlice>> {
        if !node.mig_capable || node.utilization >= self.config.slice_threshold {
            return Ok(Vec::new());
        }

        // Clear stale available slices before recomputing.
        for slice in self.state.list_slices_for_node(&node.id)? {
            if slice.is_available() {
                self.state.delete_slice(&slice.id)?;
            }
        }

        // Spare fraction excludes capacity already held by live slices, so
        // the per-node fraction sum can never exceed 1.0.
        let held = self.held_fraction(&node.id)?;
        let mut spare = (1.0 - node.utilization - held).max(0.0);
        let node_rate = quote(node, grid, pricing_ctx, pricing_cfg).final_rate;

        let mut created = Vec::new();
        for profile in SliceProfile::ALL {
            let fraction = profile.compute_fraction();
            while spare >= fraction && profile.vram_mb() as f64 <= node.vram_mb as f64 * spare {
                let slice = GpuSlice {
                    id: format!("{}-mig-{}-{}-{}", node.id, profile.label(), now, created.len()),
                    node_id: node.id.clone(),
                    profile,
                    status: SliceStatus::Available,
                    workload_id: None,
                    hourly_rate_eur: node_rate * fraction,
                    created_at: now,
                    allocated_at: None,
                    released_at: None,
                };
                self.state.put_slice(&slice)?;
                created.push(slice);
                spare -= fraction;
                if spare < SliceProfile::SMALLEST_FRACTION {
                    break;
                }
            }
            if spare < SliceProfile::SMALLEST_FRACTION {
                break;
            }
        }

        self.refresh_active_count(&node.id)?;

        if !created.is_empty() {
            info!(
                node = %node.id,
                slices = created.len(),
                utilization = node.utilization,
                "slices created on underutilized node"
            );
        }
        Ok(created)
    }

    /// Reclaim capacity on a loaded node: destroy unallocated slices, and
    /// at critical utilization report allocated slices for migration.
    pub fn reclaim_slices(
        &self,
        node: &ComputeNode,
        _now: u64,
    ) -> SliceResult<(usize, Vec<PendingSliceMigration>)> {
        let mut reclaimed = 0;
        for slice in self.state.list_slices_for_node(&node.id)? {
            if slice.is_available() {
                self.state.delete_slice(&slice.id)?;
                reclaimed += 1;
            }
        }
        self.refresh_active_count(&node.id)?;

        let mut pending = Vec::new();
        if node.utilization > self.config.critical_threshold {
            for slice in self.state.list_slices_for_node(&node.id)? {
                if slice.status == SliceStatus::Allocated
                    && let Some(workload_id) = &slice.workload_id
                {
                    warn!(
                        node = %node.id,
                        slice = %slice.id,
                        workload = %workload_id,
                        "critical utilization, allocated slice needs migration"
                    );
                    pending.push(PendingSliceMigration {
                        workload_id: workload_id.clone(),
                        slice_id: slice.id.clone(),
                        node_id: node.id.clone(),
                    });
                }
            }
        }

        if reclaimed > 0 {
            debug!(node = %node.id, reclaimed, "unallocated slices reclaimed");
        }
        Ok((reclaimed, pending))
    }

    /// Best-fit slice for a workload: the smallest available slice with
    /// enough VRAM on an available node. Ties resolve in enumeration order.
    pub fn find_slice_for(&self, workload: &Workload) -> SliceResult<Option<GpuSlice>> {
        let mut best: Option<GpuSlice> = None;
        for slice in self.state.list_slices()? {
            if !slice.is_available() || slice.vram_mb() < workload.required_vram_mb {
                continue;
            }
            let node_available = self
                .state
                .get_node(&slice.node_id)?
                .is_some_and(|n| n.is_available());
            if !node_available {
                continue;
            }
            match &best {
                Some(current) if current.vram_mb() <= slice.vram_mb() => {}
                _ => best = Some(slice),
            }
        }
        Ok(best)
    }

    /// Allocate a slice to a workload.
    pub fn allocate(&self, slice_id: &str, workload_id: &str, now: u64) -> SliceResult<GpuSlice> {
        let mut slice = self
            .state
            .get_slice(slice_id)?
            .ok_or_else(|| SliceError::NotFound(slice_id.to_string()))?;
        if !slice.is_available() {
            return Err(SliceError::NotAvailable(slice_id.to_string()));
        }

        slice.status = SliceStatus::Allocated;
        slice.workload_id = Some(workload_id.to_string());
        slice.allocated_at = Some(now);
        self.state.put_slice(&slice)?;

        info!(slice = %slice.id, workload = %workload_id, "slice allocated");
        Ok(slice)
    }

    /// Release a slice back to the available pool.
    pub fn release(&self, slice_id: &str, now: u64) -> SliceResult<GpuSlice> {
        let mut slice = self
            .state
            .get_slice(slice_id)?
            .ok_or_else(|| SliceError::NotFound(slice_id.to_string()))?;

        slice.status = SliceStatus::Available;
        slice.workload_id = None;
        slice.released_at = Some(now);
        self.state.put_slice(&slice)?;

        debug!(slice = %slice.id, "slice released");
        Ok(slice)
    }

    /// Sum of compute fractions held by live slices on a node.
    pub fn held_fraction(&self, node_id: &str) -> SliceResult<f64> {
        Ok(self
            .state
            .list_slices_for_node(node_id)?
            .iter()
            .filter(|s| s.holds_capacity())
            .map(|s| s.compute_fraction())
            .sum())
    }

    /// Total fraction (available + held) carved on a node, for invariants.
    pub fn carved_fraction(&self, node_id: &str) -> SliceResult<f64> {
        Ok(self
            .state
            .list_slices_for_node(node_id)?
            .iter()
            .filter(|s| s.status != SliceStatus::Maintenance)
            .map(|s| s.compute_fraction())
            .sum())
    }

    fn refresh_active_count(&self, node_id: &str) -> SliceResult<()> {
        let count = self.state.list_slices_for_node(node_id)?.len() as u32;
        self.state.update_node(node_id, |n| n.active_slices = count)?;
        Ok(())
    }
}
