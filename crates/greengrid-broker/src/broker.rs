//! The tiered broker: placement, rerouting, and health-driven migration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use greengrid_compliance::{ComplianceConfig, eligible_nodes};
use greengrid_migrate::CheckpointManager;
use greengrid_placement::{
    RerouteConfig, RerouteReason, ScoredCandidate, ScoringWeights, categorize,
    relative_improvement, reroute_trigger, score_node, select_candidate, tier_of,
};
use greengrid_pricing::{PricingConfig, PricingContext, estimate_cost, quote};
use greengrid_slices::{SliceConfig, SliceManager};
use greengrid_state::{
    ASSIGNMENT_UTILIZATION_STEP, ComputeNode, DecisionKind, GridView, NodeHealth, NodeId,
    NodeStatus, Priority, RoutingDecision, SliceId, StateStore, Tier, Workload, WorkloadStatus,
};

use crate::error::{BrokerError, BrokerResult};
use crate::events::{BrokerEvent, EventSink, LogSink, estimated_carbon_saved_grams};

/// How many pending async workloads one surplus event may route.
const SURPLUS_ROUTE_BATCH: usize = 5;

/// All tunables of the broker, one section per concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub compliance: ComplianceConfig,
    pub pricing: PricingConfig,
    pub scoring: ScoringWeights,
    pub reroute: RerouteConfig,
    pub slices: SliceConfig,
}

/// Result of an initial placement attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PlacementOutcome {
    /// Whole-node placement.
    Placed { node_id: NodeId, tier: Tier, score: f64 },
    /// Slice fallback placement.
    SlicePlaced {
        slice_id: SliceId,
        node_id: NodeId,
        tier: Tier,
        score: f64,
    },
    /// Nothing qualified. The workload stays pending and is retried on the
    /// next monitoring cycle.
    NoCandidates,
}

/// Result of a reroute attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RerouteOutcome {
    Rerouted {
        from_node: Option<NodeId>,
        to_node: NodeId,
        tier: Tier,
        improvement: f64,
        migrated: bool,
    },
    /// The circuit breaker: the reroute ceiling is reached, no side effects.
    CeilingExceeded,
    /// No candidate besides the current node; resumed in place.
    NoAlternative,
    /// Best alternative did not clear the hysteresis threshold; resumed in
    /// place.
    ImprovementInsufficient { improvement: f64 },
}

/// Counters from one sweep over the running workloads.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    pub health_reroutes: usize,
    pub triggered: usize,
    pub errors: usize,
}

/// The broker wires the compliance gate, pricing model, placement core,
/// slice manager, and migration manager into executable operations.
pub struct Broker {
    state: StateStore,
    slices: SliceManager,
    migrate: CheckpointManager,
    config: BrokerConfig,
    sink: Arc<dyn EventSink>,
}

impl Broker {
    pub fn new(state: StateStore, config: BrokerConfig) -> Self {
        let slices = SliceManager::new(state.clone(), config.slices.clone());
        let migrate = CheckpointManager::new(state.clone());
        Self {
            state,
            slices,
            migrate,
            config,
            sink: Arc::new(LogSink),
        }
    }

    /// Replace the event sink (billing adapter, test capture, ...).
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    // ── Initial placement ──────────────────────────────────────────

    /// Place a pending workload through the tier ladder.
    ///
    /// When no whole node qualifies, falls back to the smallest sufficient
    /// GPU slice (except for recycled-only workloads, whose mandate no
    /// slice can satisfy). When that fails too, the workload stays pending
    /// and the failure is recorded for audit.
    pub fn place(
        &self,
        workload_id: &str,
        grid: &GridView,
        now: u64,
    ) -> BrokerResult<PlacementOutcome> {
        let mut workload = self.get_workload(workload_id)?;
        if !matches!(
            workload.status,
            WorkloadStatus::Pending | WorkloadStatus::Rerouting | WorkloadStatus::Routing
        ) {
            return Err(BrokerError::NotRoutable(workload.id, workload.status));
        }

        workload.status = WorkloadStatus::Routing;
        self.state.put_workload(&workload)?;

        let nodes = self.state.list_nodes()?;
        let ctx = PricingContext::from_fleet(&nodes, now);
        let candidates = eligible_nodes(
            &workload,
            &nodes,
            grid,
            &self.config.compliance,
            &self.config.pricing,
            &ctx,
        );

        if candidates.is_empty() {
            if !workload.requires_recycled_energy()
                && let Some(slice) = self.slices.find_slice_for(&workload)?
            {
                return self.assign_to_slice(workload, &slice.id, grid, &ctx, now);
            }
            return self.leave_pending(workload, now);
        }

        let tiered = categorize(&candidates, grid);
        let (t1, t2, t3) = tiered.counts();
        debug!(workload = %workload_id, t1, t2, t3, "tier analysis");

        let Some(best) = select_candidate(&tiered, &workload, &self.config.scoring) else {
            return self.leave_pending(workload, now);
        };

        info!(
            workload = %workload_id,
            node = %best.node.id,
            tier = best.tier.label(),
            score = best.score,
            "placement selected"
        );
        self.assign_to_node(workload, &best, DecisionKind::Initial, "initial_route", grid, &ctx, now)?;

        Ok(PlacementOutcome::Placed {
            node_id: best.node.id,
            tier: best.tier,
            score: best.score,
        })
    }

    // ── Adaptive rerouting ─────────────────────────────────────────

    /// Re-evaluate a workload and move it if a sufficiently better node
    /// exists.
    ///
    /// Best-effort: a workload is never left stranded without the
    /// resources it already had. Bounded by the reroute ceiling.
    pub fn reroute(
        &self,
        workload_id: &str,
        reason: &str,
        grid: &GridView,
        now: u64,
    ) -> BrokerResult<RerouteOutcome> {
        let mut workload = self.get_workload(workload_id)?;

        if workload.reroute_count >= self.config.reroute.max_reroutes {
            warn!(
                workload = %workload_id,
                count = workload.reroute_count,
                "reroute ceiling reached, manual intervention required"
            );
            return Ok(RerouteOutcome::CeilingExceeded);
        }

        info!(workload = %workload_id, reason, "reroute starting");
        workload.reroute_count += 1;
        self.state.put_workload(&workload)?;

        let current_node_id = self.current_node_id(&workload)?;

        // Checkpoint before pausing, then pause.
        if workload.status == WorkloadStatus::Running {
            if workload.checkpoint_enabled {
                self.migrate.checkpoint(workload_id, now)?;
                workload = self.get_workload(workload_id)?;
            }
            workload = self.pause(workload, reason, now)?;
        }

        let nodes: Vec<ComputeNode> = self
            .state
            .list_nodes()?
            .into_iter()
            .filter(|n| Some(&n.id) != current_node_id.as_ref())
            .collect();
        let ctx = PricingContext::from_fleet(&nodes, now);
        let candidates = eligible_nodes(
            &workload,
            &nodes,
            grid,
            &self.config.compliance,
            &self.config.pricing,
            &ctx,
        );

        if candidates.is_empty() {
            debug!(workload = %workload_id, "no alternatives, resuming on current node");
            self.resume_in_place(workload, "no_alternatives", now)?;
            return Ok(RerouteOutcome::NoAlternative);
        }

        let tiered = categorize(&candidates, grid);
        let Some(best) = select_candidate(&tiered, &workload, &self.config.scoring) else {
            self.resume_in_place(workload, "no_suitable_alternative", now)?;
            return Ok(RerouteOutcome::NoAlternative);
        };

        let old_score = match &current_node_id {
            Some(id) => match self.state.get_node(id)? {
                Some(old) => score_node(&old, &workload, tier_of(&old, grid), &self.config.scoring),
                None => 1.0,
            },
            None => 1.0,
        };
        let improvement = relative_improvement(old_score, best.score);

        if improvement < self.config.reroute.improvement_threshold {
            debug!(
                workload = %workload_id,
                improvement,
                threshold = self.config.reroute.improvement_threshold,
                "improvement insufficient, resuming in place"
            );
            self.resume_in_place(workload, "improvement_insufficient", now)?;
            return Ok(RerouteOutcome::ImprovementInsufficient { improvement });
        }

        info!(
            workload = %workload_id,
            from = current_node_id.as_deref().unwrap_or("-"),
            to = %best.node.id,
            improvement,
            "reroute committed"
        );

        let migrated = workload.checkpoint_enabled;
        if migrated {
            self.migrate
                .live_migrate(workload_id, &best.node.id, reason, Some(best.tier), now)?;
        } else {
            self.assign_to_node(workload, &best, DecisionKind::Reroute, reason, grid, &ctx, now)?;
        }

        self.sink.emit(&BrokerEvent::WorkloadRerouted {
            workload_id: workload_id.to_string(),
            from_node: current_node_id.clone(),
            to_node: best.node.id.clone(),
            reason: reason.to_string(),
            improvement,
            migrated,
        });

        Ok(RerouteOutcome::Rerouted {
            from_node: current_node_id,
            to_node: best.node.id,
            tier: best.tier,
            improvement,
            migrated,
        })
    }

    // ── Continuous monitoring hooks ────────────────────────────────

    /// One sweep over all running workloads: health-based reroutes first,
    /// then environmental triggers. Each workload's evaluation is
    /// isolated; one failure never halts the sweep.
    pub fn check_running(&self, grid: &GridView, now: u64) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let workloads = match self.state.list_workloads() {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "running sweep could not list workloads");
                outcome.errors += 1;
                return outcome;
            }
        };

        for workload in workloads {
            if workload.status != WorkloadStatus::Running {
                continue;
            }
            if workload.reroute_count >= self.config.reroute.max_reroutes {
                continue;
            }
            if let Err(e) = self.check_one(&workload, grid, now, &mut outcome) {
                warn!(workload = %workload.id, error = %e, "running check failed");
                outcome.errors += 1;
            }
        }
        outcome
    }

    fn check_one(
        &self,
        workload: &Workload,
        grid: &GridView,
        now: u64,
        outcome: &mut SweepOutcome,
    ) -> BrokerResult<()> {
        let Some(node_id) = self.current_node_id(workload)? else {
            return Ok(());
        };
        let Some(node) = self.state.get_node(&node_id)? else {
            return Ok(());
        };

        if matches!(node.health, NodeHealth::Degraded | NodeHealth::Critical)
            && workload.checkpoint_enabled
        {
            let reason = match node.health {
                NodeHealth::Critical => RerouteReason::NodeCritical,
                _ => RerouteReason::NodeDegraded,
            };
            self.reroute(&workload.id, reason.as_str(), grid, now)?;
            outcome.health_reroutes += 1;
            return Ok(());
        }

        let Some(last) = self.state.last_decision_for(&workload.id)? else {
            return Ok(());
        };
        let nodes = self.state.list_nodes()?;
        let ctx = PricingContext::from_fleet(&nodes, now);
        let rate = quote(&node, grid, &ctx, &self.config.pricing).final_rate;

        if let Some(trigger) = reroute_trigger(workload, &node, &last, rate, &self.config.reroute) {
            self.reroute(&workload.id, trigger.as_str(), grid, now)?;
            outcome.triggered += 1;
        }
        Ok(())
    }

    /// Proactively migrate checkpoint-enabled workloads off degraded or
    /// critical nodes. Workloads with no viable destination stay put (a
    /// warning, not an error). Returns the number migrated.
    pub fn check_and_migrate(&self, grid: &GridView, now: u64) -> BrokerResult<usize> {
        let mut migrated = 0;
        let nodes = self.state.list_nodes()?;

        for node in nodes
            .iter()
            .filter(|n| matches!(n.health, NodeHealth::Degraded | NodeHealth::Critical))
        {
            let on_node: Vec<Workload> = self
                .state
                .list_workloads()?
                .into_iter()
                .filter(|w| {
                    w.status == WorkloadStatus::Running
                        && w.checkpoint_enabled
                        && w.node_id.as_deref() == Some(node.id.as_str())
                })
                .collect();

            for workload in on_node {
                let reason = match node.health {
                    NodeHealth::Critical => "node_critical",
                    _ => "node_degraded",
                };
                match self.find_migration_target(&workload, &node.id, grid, now)? {
                    Some(target) => {
                        self.migrate.live_migrate(
                            &workload.id,
                            &target.node.id,
                            reason,
                            Some(target.tier),
                            now,
                        )?;
                        migrated += 1;
                    }
                    None => warn!(
                        workload = %workload.id,
                        node = %node.id,
                        "no migration target available, leaving workload in place"
                    ),
                }
            }
        }
        Ok(migrated)
    }

    /// Move a specific workload off its slice (capacity reclaim). The
    /// caller releases the slice afterwards.
    pub fn migrate_off_slice(
        &self,
        workload_id: &str,
        source_node_id: &str,
        grid: &GridView,
        now: u64,
    ) -> BrokerResult<bool> {
        let workload = self.get_workload(workload_id)?;
        match self.find_migration_target(&workload, source_node_id, grid, now)? {
            Some(target) => {
                self.migrate.live_migrate(
                    workload_id,
                    &target.node.id,
                    RerouteReason::CapacityReclaim.as_str(),
                    Some(target.tier),
                    now,
                )?;
                Ok(true)
            }
            None => {
                warn!(
                    workload = %workload_id,
                    node = %source_node_id,
                    "no target for capacity-reclaim migration, slice stays allocated"
                );
                Ok(false)
            }
        }
    }

    /// Route every workload waiting for placement. Failures are isolated.
    /// Returns (placed, still pending).
    pub fn route_pending(&self, grid: &GridView, now: u64) -> (usize, usize) {
        let workloads = match self.state.list_workloads() {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "pending sweep could not list workloads");
                return (0, 0);
            }
        };

        let mut placed = 0;
        let mut pending = 0;
        for workload in workloads {
            if !workload.status.needs_routing() {
                continue;
            }
            match self.place(&workload.id, grid, now) {
                Ok(PlacementOutcome::NoCandidates) => pending += 1,
                Ok(_) => placed += 1,
                Err(e) => {
                    warn!(workload = %workload.id, error = %e, "placement failed");
                    pending += 1;
                }
            }
        }
        (placed, pending)
    }

    /// Opportunistically route pending async workloads while `zone` shows
    /// a surplus window. Capped per event to avoid stampedes.
    pub fn route_async_on_surplus(
        &self,
        zone: &str,
        grid: &GridView,
        now: u64,
    ) -> BrokerResult<usize> {
        let has_surplus_nodes = self
            .state
            .list_nodes()?
            .iter()
            .any(|n| n.grid_zone == zone && n.is_available());
        if !has_surplus_nodes {
            return Ok(0);
        }

        let mut routed = 0;
        for workload in self.state.list_workloads()? {
            if routed >= SURPLUS_ROUTE_BATCH {
                break;
            }
            if !workload.status.needs_routing() || workload.priority != Priority::Async {
                continue;
            }
            match self.place(&workload.id, grid, now) {
                Ok(PlacementOutcome::NoCandidates) => {}
                Ok(_) => {
                    info!(workload = %workload.id, zone, "async workload routed on surplus");
                    routed += 1;
                }
                Err(e) => warn!(workload = %workload.id, error = %e, "surplus routing failed"),
            }
        }
        Ok(routed)
    }

    // ── Completion ─────────────────────────────────────────────────

    /// Mark a workload completed, free its capacity, and emit the billing
    /// event with cost and carbon metrics.
    pub fn complete(&self, workload_id: &str, grid: &GridView, now: u64) -> BrokerResult<()> {
        let mut workload = self.get_workload(workload_id)?;
        if workload.status.is_terminal() {
            return Err(BrokerError::NotRoutable(workload.id, workload.status));
        }

        let node_id = self.current_node_id(&workload)?;
        let node = match &node_id {
            Some(id) => self.state.get_node(id)?,
            None => None,
        };

        if let Some(slice_id) = workload.slice_id.clone() {
            self.slices.release(&slice_id, now)?;
        } else if let Some(id) = &node_id {
            let others_running = self.state.list_workloads()?.iter().any(|w| {
                w.id != workload.id
                    && w.status == WorkloadStatus::Running
                    && w.node_id.as_deref() == Some(id.as_str())
            });
            self.state.update_node(id, |n| {
                n.utilization -= ASSIGNMENT_UTILIZATION_STEP;
                n.status = if others_running { NodeStatus::Busy } else { NodeStatus::Idle };
            })?;
        }

        workload.status = WorkloadStatus::Completed;
        workload.completed_at = Some(now);
        workload.node_id = None;
        workload.slice_id = None;
        self.state.put_workload(&workload)?;

        let (cost, carbon_saved) = match &node {
            Some(node) => {
                let nodes = self.state.list_nodes()?;
                let ctx = PricingContext::from_fleet(&nodes, now);
                let q = quote(node, grid, &ctx, &self.config.pricing);
                (
                    Some(estimate_cost(&workload, &q, &self.config.pricing)),
                    estimated_carbon_saved_grams(&workload, node, now),
                )
            }
            None => (None, 0.0),
        };

        self.sink.emit(&BrokerEvent::WorkloadCompleted {
            workload_id: workload.id.clone(),
            cost,
            carbon_saved_grams: carbon_saved,
        });
        Ok(())
    }

    // ── Internal helpers ───────────────────────────────────────────

    /// The node a workload currently holds capacity on: its own node, or
    /// the owner of its slice.
    fn current_node_id(&self, workload: &Workload) -> BrokerResult<Option<NodeId>> {
        if workload.node_id.is_some() {
            return Ok(workload.node_id.clone());
        }
        match &workload.slice_id {
            Some(slice_id) => Ok(self.state.get_slice(slice_id)?.map(|s| s.node_id)),
            None => Ok(None),
        }
    }

    fn get_workload(&self, workload_id: &str) -> BrokerResult<Workload> {
        self.state
            .get_workload(workload_id)?
            .ok_or_else(|| BrokerError::WorkloadNotFound(workload_id.to_string()))
    }

    fn leave_pending(&self, mut workload: Workload, now: u64) -> BrokerResult<PlacementOutcome> {
        warn!(workload = %workload.id, "no eligible compute nodes or GPU slices");
        workload.status = WorkloadStatus::Pending;
        self.state.put_workload(&workload)?;
        self.state.append_decision(RoutingDecision {
            workload_id: workload.id.clone(),
            seq: 0,
            node_id: None,
            slice_id: None,
            kind: DecisionKind::Initial,
            reason: "no_candidates".to_string(),
            tier: None,
            score: None,
            carbon_intensity: 0.0,
            energy_price: 0.0,
            renewable_pct: 0.0,
            migration: false,
            decided_at: now,
        })?;
        Ok(PlacementOutcome::NoCandidates)
    }

    fn pause(&self, mut workload: Workload, reason: &str, now: u64) -> BrokerResult<Workload> {
        workload.status = WorkloadStatus::Paused;
        workload.paused_at = Some(now);
        self.state.put_workload(&workload)?;

        let node = match self.current_node_id(&workload)? {
            Some(id) => self.state.get_node(&id)?,
            None => None,
        };
        self.state.append_decision(RoutingDecision {
            workload_id: workload.id.clone(),
            seq: 0,
            node_id: node.as_ref().map(|n| n.id.clone()),
            slice_id: workload.slice_id.clone(),
            kind: DecisionKind::Pause,
            reason: reason.to_string(),
            tier: None,
            score: None,
            carbon_intensity: node.as_ref().map(|n| n.effective_carbon()).unwrap_or(0.0),
            energy_price: node.as_ref().map(|n| n.energy_price).unwrap_or(0.0),
            renewable_pct: node.as_ref().map(|n| n.renewable_pct).unwrap_or(0.0),
            migration: false,
            decided_at: now,
        })?;
        Ok(workload)
    }

    /// Reroute is best-effort: when it cannot improve, the workload goes
    /// straight back to running on whatever it already had.
    fn resume_in_place(
        &self,
        mut workload: Workload,
        reason: &str,
        now: u64,
    ) -> BrokerResult<()> {
        workload.status = WorkloadStatus::Running;
        self.state.put_workload(&workload)?;

        let node = match self.current_node_id(&workload)? {
            Some(id) => self.state.get_node(&id)?,
            None => None,
        };
        self.state.append_decision(RoutingDecision {
            workload_id: workload.id.clone(),
            seq: 0,
            node_id: node.as_ref().map(|n| n.id.clone()),
            slice_id: workload.slice_id.clone(),
            kind: DecisionKind::Resume,
            reason: reason.to_string(),
            tier: None,
            score: None,
            carbon_intensity: node.as_ref().map(|n| n.effective_carbon()).unwrap_or(0.0),
            energy_price: node.as_ref().map(|n| n.energy_price).unwrap_or(0.0),
            renewable_pct: node.as_ref().map(|n| n.renewable_pct).unwrap_or(0.0),
            migration: false,
            decided_at: now,
        })?;
        Ok(())
    }

    fn assign_to_node(
        &self,
        mut workload: Workload,
        best: &ScoredCandidate,
        kind: DecisionKind,
        reason: &str,
        grid: &GridView,
        ctx: &PricingContext,
        now: u64,
    ) -> BrokerResult<()> {
        let old_node_id = workload.node_id.clone();
        if let Some(slice_id) = workload.slice_id.clone() {
            self.slices.release(&slice_id, now)?;
        }

        workload.node_id = Some(best.node.id.clone());
        workload.slice_id = None;
        workload.status = WorkloadStatus::Running;
        workload.started_at = workload.started_at.or(Some(now));
        self.state.put_workload(&workload)?;
        debug_assert!(workload.has_exclusive_assignment());

        self.state.update_node(&best.node.id, |n| {
            n.status = NodeStatus::Busy;
            n.utilization += ASSIGNMENT_UTILIZATION_STEP;
        })?;
        if let Some(old_id) = &old_node_id
            && old_id != &best.node.id
        {
            self.state.update_node(old_id, |n| {
                n.status = NodeStatus::Idle;
                n.utilization -= ASSIGNMENT_UTILIZATION_STEP;
            })?;
        }

        self.state.append_decision(RoutingDecision {
            workload_id: workload.id.clone(),
            seq: 0,
            node_id: Some(best.node.id.clone()),
            slice_id: None,
            kind,
            reason: reason.to_string(),
            tier: Some(best.tier),
            score: Some(best.score),
            carbon_intensity: best.node.effective_carbon(),
            energy_price: best.node.energy_price,
            renewable_pct: best.node.renewable_pct,
            migration: false,
            decided_at: now,
        })?;

        let q = quote(&best.node, grid, ctx, &self.config.pricing);
        self.sink.emit(&BrokerEvent::WorkloadRouted {
            workload_id: workload.id.clone(),
            node_id: Some(best.node.id.clone()),
            slice_id: None,
            tier: best.tier,
            score: best.score,
            cost: estimate_cost(&workload, &q, &self.config.pricing),
            carbon_intensity: best.node.effective_carbon(),
        });
        Ok(())
    }

    fn assign_to_slice(
        &self,
        mut workload: Workload,
        slice_id: &str,
        grid: &GridView,
        ctx: &PricingContext,
        now: u64,
    ) -> BrokerResult<PlacementOutcome> {
        let slice = self.slices.allocate(slice_id, &workload.id, now)?;
        let node = self
            .state
            .get_node(&slice.node_id)?
            .ok_or_else(|| BrokerError::NodeNotFound(slice.node_id.clone()))?;
        let tier = tier_of(&node, grid);
        let score = score_node(&node, &workload, tier, &self.config.scoring);

        // A rerouting workload may still hold its previous node; free it.
        if let Some(old_id) = workload.node_id.clone()
            && old_id != slice.node_id
        {
            self.state.update_node(&old_id, |n| {
                n.status = NodeStatus::Idle;
                n.utilization -= ASSIGNMENT_UTILIZATION_STEP;
            })?;
        }

        // Slice placement: the slice is the assignment, the owning node is
        // reachable through it. Capacity was already carved out of the
        // node's spare fraction, so node utilization is untouched.
        workload.node_id = None;
        workload.slice_id = Some(slice.id.clone());
        workload.status = WorkloadStatus::Running;
        workload.started_at = workload.started_at.or(Some(now));
        self.state.put_workload(&workload)?;
        debug_assert!(workload.has_exclusive_assignment());

        info!(
            workload = %workload.id,
            slice = %slice.id,
            node = %node.id,
            "workload routed to GPU slice"
        );

        self.state.append_decision(RoutingDecision {
            workload_id: workload.id.clone(),
            seq: 0,
            node_id: None,
            slice_id: Some(slice.id.clone()),
            kind: DecisionKind::Initial,
            reason: "slice_fallback".to_string(),
            tier: Some(tier),
            score: Some(score),
            carbon_intensity: node.effective_carbon(),
            energy_price: node.energy_price,
            renewable_pct: node.renewable_pct,
            migration: false,
            decided_at: now,
        })?;

        let q = quote(&node, grid, ctx, &self.config.pricing);
        self.sink.emit(&BrokerEvent::WorkloadRouted {
            workload_id: workload.id.clone(),
            node_id: None,
            slice_id: Some(slice.id.clone()),
            tier,
            score,
            cost: estimate_cost(&workload, &q, &self.config.pricing),
            carbon_intensity: node.effective_carbon(),
        });

        Ok(PlacementOutcome::SlicePlaced {
            slice_id: slice.id,
            node_id: node.id,
            tier,
            score,
        })
    }

    fn find_migration_target(
        &self,
        workload: &Workload,
        exclude_node_id: &str,
        grid: &GridView,
        now: u64,
    ) -> BrokerResult<Option<ScoredCandidate>> {
        let nodes: Vec<ComputeNode> = self
            .state
            .list_nodes()?
            .into_iter()
            .filter(|n| n.id != exclude_node_id && n.is_healthy())
            .collect();
        let ctx = PricingContext::from_fleet(&nodes, now);
        let candidates = eligible_nodes(
            workload,
            &nodes,
            grid,
            &self.config.compliance,
            &self.config.pricing,
            &ctx,
        );
        let tiered = categorize(&candidates, grid);
        Ok(select_candidate(&tiered, workload, &self.config.scoring))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use greengrid_state::*;

    struct CaptureSink(Mutex<Vec<BrokerEvent>>);

    impl CaptureSink {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }

        fn events(&self) -> Vec<BrokerEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    impl EventSink for CaptureSink {
        fn emit(&self, event: &BrokerEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn test_node(id: &str, category: NodeCategory, zone: &str) -> ComputeNode {
        ComputeNode {
            id: id.to_string(),
            name: format!("node-{id}"),
            category,
            gpu_model: "A100".to_string(),
            vram_mb: 81_920,
            utilization: 0.1,
            status: NodeStatus::Idle,
            health: NodeHealth::Healthy,
            grid_zone: zone.to_string(),
            carbon_intensity: 100.0,
            energy_price: 40.0,
            renewable_pct: 60.0,
            always_green: false,
            green_compliant: false,
            mig_capable: false,
            active_slices: 0,
            last_health_check_at: None,
            updated_at: 1000,
        }
    }

    fn test_workload(id: &str) -> Workload {
        Workload {
            id: id.to_string(),
            name: format!("job-{id}"),
            kind: WorkloadKind::Training,
            priority: Priority::Normal,
            required_vram_mb: 10_240,
            green: GreenRequirement::Standard,
            green_only: false,
            max_carbon_intensity: None,
            budget_max_eur: None,
            estimated_duration_hours: 4.0,
            status: WorkloadStatus::Pending,
            reroute_count: 0,
            migration_count: 0,
            checkpoint_enabled: false,
            checkpoint_interval_secs: 900,
            last_checkpoint_at: None,
            checkpoint_handle: None,
            node_id: None,
            slice_id: None,
            submitted_at: 100,
            started_at: None,
            paused_at: None,
            completed_at: None,
        }
    }

    fn green_snapshot(zone: &str) -> GridSnapshot {
        GridSnapshot {
            zone: zone.to_string(),
            carbon_intensity: 60.0,
            renewable_pct: 70.0,
            energy_price: 40.0,
            curtailment_mw: 0.0,
            surplus: false,
            recorded_at: 1000,
        }
    }

    fn setup() -> (Broker, StateStore) {
        let state = StateStore::open_in_memory().unwrap();
        (Broker::new(state.clone(), BrokerConfig::default()), state)
    }

    const NOON: u64 = 12 * 3600;

    #[test]
    fn recycled_workload_lands_on_recycler_despite_cheaper_alternative() {
        let (broker, state) = setup();

        let mut recycler = test_node("recycler", NodeCategory::EnergyRecycler, "FR");
        recycler.always_green = true;
        recycler.green_compliant = true;
        recycler.gpu_model = "H100".to_string();
        recycler.utilization = 0.2;
        state.put_node(&recycler).unwrap();

        let mut cheap = test_node("cheap-a100", NodeCategory::Datacenter, "FR");
        cheap.utilization = 0.1;
        cheap.energy_price = 5.0;
        state.put_node(&cheap).unwrap();

        let mut wl = test_workload("wl-1");
        wl.green = GreenRequirement::RecycledOnly;
        wl.required_vram_mb = 40_960;
        wl.budget_max_eur = Some(80.0);
        state.put_workload(&wl).unwrap();

        let grid = GridView::from_snapshots(vec![green_snapshot("FR")]);
        let outcome = broker.place("wl-1", &grid, NOON).unwrap();

        match outcome {
            PlacementOutcome::Placed { node_id, tier, .. } => {
                assert_eq!(node_id, "recycler");
                assert_eq!(tier, Tier::Recycler);
            }
            other => panic!("expected recycler placement, got {other:?}"),
        }

        let stored = state.get_workload("wl-1").unwrap().unwrap();
        assert_eq!(stored.status, WorkloadStatus::Running);
        assert_eq!(stored.node_id.as_deref(), Some("recycler"));
        assert!(stored.has_exclusive_assignment());

        let node = state.get_node("recycler").unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Busy);
        assert!((node.utilization - 0.5).abs() < 1e-9);

        let decision = state.last_decision_for("wl-1").unwrap().unwrap();
        assert_eq!(decision.kind, DecisionKind::Initial);
        assert_eq!(decision.tier, Some(Tier::Recycler));
        assert_eq!(decision.carbon_intensity, 0.0);
    }

    #[test]
    fn tier_one_beats_lower_tiers_for_standard_workloads() {
        let (broker, state) = setup();

        let mut recycler = test_node("rec", NodeCategory::EnergyRecycler, "FR");
        recycler.always_green = true;
        state.put_node(&recycler).unwrap();

        let mut surplus_dc = test_node("dc", NodeCategory::Datacenter, "ES");
        surplus_dc.green_compliant = true;
        surplus_dc.energy_price = 2.0;
        state.put_node(&surplus_dc).unwrap();

        state.put_workload(&test_workload("wl-1")).unwrap();

        let mut es = green_snapshot("ES");
        es.surplus = true;
        let grid = GridView::from_snapshots(vec![green_snapshot("FR"), es]);

        let outcome = broker.place("wl-1", &grid, NOON).unwrap();
        assert!(matches!(
            outcome,
            PlacementOutcome::Placed { ref node_id, tier: Tier::Recycler, .. } if node_id == "rec"
        ));
    }

    #[test]
    fn over_budget_placement_returns_no_candidates_and_records_it() {
        let (broker, state) = setup();
        state
            .put_node(&test_node("dc", NodeCategory::Datacenter, "FR"))
            .unwrap();

        let mut wl = test_workload("wl-1");
        wl.budget_max_eur = Some(1.0); // A100 for 4h costs well above 1 EUR
        state.put_workload(&wl).unwrap();

        let grid = GridView::from_snapshots(vec![green_snapshot("FR")]);
        let outcome = broker.place("wl-1", &grid, NOON).unwrap();
        assert_eq!(outcome, PlacementOutcome::NoCandidates);

        let stored = state.get_workload("wl-1").unwrap().unwrap();
        assert_eq!(stored.status, WorkloadStatus::Pending);
        assert!(stored.node_id.is_none());

        // The failure is auditable.
        let decision = state.last_decision_for("wl-1").unwrap().unwrap();
        assert_eq!(decision.reason, "no_candidates");
        assert!(decision.node_id.is_none());
    }

    #[test]
    fn slice_fallback_when_no_whole_node_fits() {
        let (broker, state) = setup();

        // Loaded node: not enough free VRAM for a whole-node placement,
        // but it carries an available slice.
        let mut node = test_node("n1", NodeCategory::Datacenter, "FR");
        node.status = NodeStatus::Partial;
        node.utilization = 0.9;
        node.mig_capable = true;
        state.put_node(&node).unwrap();

        state
            .put_slice(&GpuSlice {
                id: "n1-mig-1g.10gb-0".to_string(),
                node_id: "n1".to_string(),
                profile: SliceProfile::Mig1g10gb,
                status: SliceStatus::Available,
                workload_id: None,
                hourly_rate_eur: 0.4,
                created_at: 500,
                allocated_at: None,
                released_at: None,
            })
            .unwrap();

        state.put_workload(&test_workload("wl-1")).unwrap();

        let grid = GridView::from_snapshots(vec![green_snapshot("FR")]);
        let outcome = broker.place("wl-1", &grid, NOON).unwrap();

        match outcome {
            PlacementOutcome::SlicePlaced { slice_id, node_id, .. } => {
                assert_eq!(slice_id, "n1-mig-1g.10gb-0");
                assert_eq!(node_id, "n1");
            }
            other => panic!("expected slice placement, got {other:?}"),
        }

        let stored = state.get_workload("wl-1").unwrap().unwrap();
        assert_eq!(stored.status, WorkloadStatus::Running);
        assert!(stored.node_id.is_none());
        assert_eq!(stored.slice_id.as_deref(), Some("n1-mig-1g.10gb-0"));
        assert!(stored.has_exclusive_assignment());

        let slice = state.get_slice("n1-mig-1g.10gb-0").unwrap().unwrap();
        assert_eq!(slice.status, SliceStatus::Allocated);
        assert_eq!(slice.workload_id.as_deref(), Some("wl-1"));
    }

    #[test]
    fn recycled_only_workloads_never_take_the_slice_fallback() {
        let (broker, state) = setup();

        let mut node = test_node("n1", NodeCategory::Datacenter, "FR");
        node.status = NodeStatus::Partial;
        node.utilization = 0.9;
        state.put_node(&node).unwrap();
        state
            .put_slice(&GpuSlice {
                id: "s1".to_string(),
                node_id: "n1".to_string(),
                profile: SliceProfile::Mig2g20gb,
                status: SliceStatus::Available,
                workload_id: None,
                hourly_rate_eur: 0.4,
                created_at: 500,
                allocated_at: None,
                released_at: None,
            })
            .unwrap();

        let mut wl = test_workload("wl-1");
        wl.green = GreenRequirement::RecycledOnly;
        state.put_workload(&wl).unwrap();

        let grid = GridView::from_snapshots(vec![green_snapshot("FR")]);
        let outcome = broker.place("wl-1", &grid, NOON).unwrap();
        assert_eq!(outcome, PlacementOutcome::NoCandidates);
    }

    #[test]
    fn reroute_ceiling_is_a_side_effect_free_circuit_breaker() {
        let (broker, state) = setup();
        let mut wl = test_workload("wl-1");
        wl.status = WorkloadStatus::Running;
        wl.node_id = Some("n1".to_string());
        wl.reroute_count = 5;
        state.put_workload(&wl).unwrap();
        state
            .put_node(&test_node("n1", NodeCategory::Datacenter, "FR"))
            .unwrap();

        let grid = GridView::from_snapshots(vec![green_snapshot("FR")]);
        let outcome = broker.reroute("wl-1", "carbon_spike", &grid, NOON).unwrap();
        assert_eq!(outcome, RerouteOutcome::CeilingExceeded);

        // No side effects at all.
        let stored = state.get_workload("wl-1").unwrap().unwrap();
        assert_eq!(stored.reroute_count, 5);
        assert_eq!(stored.status, WorkloadStatus::Running);
        assert!(state.decisions_for_workload("wl-1").unwrap().is_empty());

        // And it stays that way on repeat calls.
        let again = broker.reroute("wl-1", "price_surge", &grid, NOON).unwrap();
        assert_eq!(again, RerouteOutcome::CeilingExceeded);
    }

    #[test]
    fn carbon_spike_checkpoints_then_migrates() {
        let (broker, state) = setup();

        // Current node: carbon rose from 80 (at decision time) to 130.
        let mut current = test_node("old", NodeCategory::Datacenter, "DE");
        current.status = NodeStatus::Busy;
        current.utilization = 0.4;
        current.carbon_intensity = 130.0;
        state.put_node(&current).unwrap();

        // Clearly better green alternative.
        let mut better = test_node("new", NodeCategory::Datacenter, "FR");
        better.green_compliant = true;
        better.carbon_intensity = 30.0;
        better.energy_price = 30.0;
        state.put_node(&better).unwrap();

        let mut wl = test_workload("wl-1");
        wl.status = WorkloadStatus::Running;
        wl.node_id = Some("old".to_string());
        wl.green = GreenRequirement::GreenPreferred;
        wl.green_only = true;
        wl.checkpoint_enabled = true;
        wl.started_at = Some(100);
        state.put_workload(&wl).unwrap();

        state
            .append_decision(RoutingDecision {
                workload_id: "wl-1".to_string(),
                seq: 0,
                node_id: Some("old".to_string()),
                slice_id: None,
                kind: DecisionKind::Initial,
                reason: "initial_route".to_string(),
                tier: Some(Tier::Surplus),
                score: Some(0.2),
                carbon_intensity: 80.0,
                energy_price: 40.0,
                renewable_pct: 60.0,
                migration: false,
                decided_at: 500,
            })
            .unwrap();

        let grid = GridView::from_snapshots(vec![green_snapshot("FR"), green_snapshot("DE")]);
        let sweep = broker.check_running(&grid, NOON);
        assert_eq!(sweep.triggered, 1);
        assert_eq!(sweep.errors, 0);

        let stored = state.get_workload("wl-1").unwrap().unwrap();
        assert_eq!(stored.status, WorkloadStatus::Running);
        assert_eq!(stored.node_id.as_deref(), Some("new"));
        assert_eq!(stored.reroute_count, 1);
        // Checkpoint happened on the way out.
        assert!(stored.last_checkpoint_at.is_some());
        assert!(stored.checkpoint_handle.is_some());

        // The decision trail ends with a migration-flagged reroute.
        let last = state.last_decision_for("wl-1").unwrap().unwrap();
        assert!(last.migration);
        assert_eq!(last.reason, "live_migration_carbon_spike");
        assert_eq!(last.node_id.as_deref(), Some("new"));
    }

    #[test]
    fn insufficient_improvement_resumes_in_place() {
        let (broker, state) = setup();

        let mut current = test_node("old", NodeCategory::Datacenter, "FR");
        current.status = NodeStatus::Busy;
        current.utilization = 0.4;
        current.green_compliant = true;
        state.put_node(&current).unwrap();

        // Nearly identical alternative: not 25% better.
        let mut twin = test_node("twin", NodeCategory::Datacenter, "FR");
        twin.green_compliant = true;
        twin.utilization = 0.35;
        state.put_node(&twin).unwrap();

        let mut wl = test_workload("wl-1");
        wl.status = WorkloadStatus::Running;
        wl.node_id = Some("old".to_string());
        state.put_workload(&wl).unwrap();

        let grid = GridView::from_snapshots(vec![green_snapshot("FR")]);
        let outcome = broker.reroute("wl-1", "price_surge", &grid, NOON).unwrap();
        assert!(matches!(outcome, RerouteOutcome::ImprovementInsufficient { .. }));

        let stored = state.get_workload("wl-1").unwrap().unwrap();
        assert_eq!(stored.status, WorkloadStatus::Running);
        assert_eq!(stored.node_id.as_deref(), Some("old"));

        let last = state.last_decision_for("wl-1").unwrap().unwrap();
        assert_eq!(last.kind, DecisionKind::Resume);
        assert_eq!(last.reason, "improvement_insufficient");
    }

    #[test]
    fn reroute_without_alternatives_resumes_on_current_node() {
        let (broker, state) = setup();

        let mut only = test_node("only", NodeCategory::Datacenter, "FR");
        only.status = NodeStatus::Busy;
        state.put_node(&only).unwrap();

        let mut wl = test_workload("wl-1");
        wl.status = WorkloadStatus::Running;
        wl.node_id = Some("only".to_string());
        state.put_workload(&wl).unwrap();

        let grid = GridView::from_snapshots(vec![green_snapshot("FR")]);
        let outcome = broker.reroute("wl-1", "carbon_spike", &grid, NOON).unwrap();
        assert_eq!(outcome, RerouteOutcome::NoAlternative);

        let stored = state.get_workload("wl-1").unwrap().unwrap();
        assert_eq!(stored.status, WorkloadStatus::Running);
        assert_eq!(stored.node_id.as_deref(), Some("only"));
    }

    #[test]
    fn health_migration_moves_checkpointed_workloads() {
        let (broker, state) = setup();

        let mut sick = test_node("sick", NodeCategory::Datacenter, "FR");
        sick.health = NodeHealth::Degraded;
        sick.status = NodeStatus::Busy;
        sick.utilization = 0.4;
        state.put_node(&sick).unwrap();

        let healthy = test_node("ok", NodeCategory::Datacenter, "FR");
        state.put_node(&healthy).unwrap();

        let mut wl = test_workload("wl-1");
        wl.status = WorkloadStatus::Running;
        wl.node_id = Some("sick".to_string());
        wl.checkpoint_enabled = true;
        state.put_workload(&wl).unwrap();

        let grid = GridView::from_snapshots(vec![green_snapshot("FR")]);
        let migrated = broker.check_and_migrate(&grid, NOON).unwrap();
        assert_eq!(migrated, 1);

        let stored = state.get_workload("wl-1").unwrap().unwrap();
        assert_eq!(stored.node_id.as_deref(), Some("ok"));
        assert_eq!(stored.migration_count, 1);
    }

    #[test]
    fn health_migration_without_target_leaves_workload_in_place() {
        let (broker, state) = setup();

        let mut sick = test_node("sick", NodeCategory::Datacenter, "FR");
        sick.health = NodeHealth::Critical;
        sick.status = NodeStatus::Busy;
        state.put_node(&sick).unwrap();

        let mut wl = test_workload("wl-1");
        wl.status = WorkloadStatus::Running;
        wl.node_id = Some("sick".to_string());
        wl.checkpoint_enabled = true;
        state.put_workload(&wl).unwrap();

        let grid = GridView::from_snapshots(vec![green_snapshot("FR")]);
        let migrated = broker.check_and_migrate(&grid, NOON).unwrap();
        assert_eq!(migrated, 0);

        // Recoverable-only-if-possible: not an error, workload stays.
        let stored = state.get_workload("wl-1").unwrap().unwrap();
        assert_eq!(stored.node_id.as_deref(), Some("sick"));
        assert_eq!(stored.status, WorkloadStatus::Running);
    }

    #[test]
    fn route_pending_sweeps_the_queue() {
        let (broker, state) = setup();
        state
            .put_node(&test_node("n1", NodeCategory::Datacenter, "FR"))
            .unwrap();
        state.put_workload(&test_workload("wl-1")).unwrap();

        let mut blocked = test_workload("wl-2");
        blocked.required_vram_mb = 500_000; // nothing fits
        state.put_workload(&blocked).unwrap();

        let mut done = test_workload("wl-3");
        done.status = WorkloadStatus::Completed;
        state.put_workload(&done).unwrap();

        let grid = GridView::from_snapshots(vec![green_snapshot("FR")]);
        let (placed, pending) = broker.route_pending(&grid, NOON);
        assert_eq!(placed, 1);
        assert_eq!(pending, 1);
    }

    #[test]
    fn surplus_routing_targets_pending_async_only() {
        let (broker, state) = setup();
        state
            .put_node(&test_node("es-node", NodeCategory::Datacenter, "ES"))
            .unwrap();

        let mut async_wl = test_workload("wl-async");
        async_wl.priority = Priority::Async;
        state.put_workload(&async_wl).unwrap();

        let normal = test_workload("wl-normal");
        state.put_workload(&normal).unwrap();

        let mut es = green_snapshot("ES");
        es.surplus = true;
        let grid = GridView::from_snapshots(vec![es]);

        let routed = broker.route_async_on_surplus("ES", &grid, NOON).unwrap();
        assert_eq!(routed, 1);

        assert_eq!(
            state.get_workload("wl-async").unwrap().unwrap().status,
            WorkloadStatus::Running
        );
        assert_eq!(
            state.get_workload("wl-normal").unwrap().unwrap().status,
            WorkloadStatus::Pending
        );
    }

    #[test]
    fn complete_frees_capacity_and_emits_metrics() {
        let (broker, state) = setup();
        let sink = CaptureSink::new();
        let broker = broker.with_sink(sink.clone());

        let mut node = test_node("n1", NodeCategory::Datacenter, "FR");
        node.status = NodeStatus::Busy;
        node.utilization = 0.4;
        state.put_node(&node).unwrap();

        let mut wl = test_workload("wl-1");
        wl.status = WorkloadStatus::Running;
        wl.node_id = Some("n1".to_string());
        wl.started_at = Some(NOON - 3600);
        state.put_workload(&wl).unwrap();

        let grid = GridView::from_snapshots(vec![green_snapshot("FR")]);
        broker.complete("wl-1", &grid, NOON).unwrap();

        let stored = state.get_workload("wl-1").unwrap().unwrap();
        assert_eq!(stored.status, WorkloadStatus::Completed);
        assert_eq!(stored.completed_at, Some(NOON));
        assert!(stored.node_id.is_none());

        let freed = state.get_node("n1").unwrap().unwrap();
        assert!((freed.utilization - 0.1).abs() < 1e-9);
        assert_eq!(freed.status, NodeStatus::Idle);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            BrokerEvent::WorkloadCompleted { workload_id, cost, carbon_saved_grams } => {
                assert_eq!(workload_id, "wl-1");
                assert!(cost.is_some());
                assert!(*carbon_saved_grams > 0.0);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Terminal states are final.
        assert!(matches!(
            broker.complete("wl-1", &grid, NOON + 1),
            Err(BrokerError::NotRoutable(_, WorkloadStatus::Completed))
        ));
    }

    #[test]
    fn place_rejects_non_routable_statuses() {
        let (broker, state) = setup();
        let mut wl = test_workload("wl-1");
        wl.status = WorkloadStatus::Running;
        wl.node_id = Some("n1".to_string());
        state.put_workload(&wl).unwrap();

        let grid = GridView::default();
        assert!(matches!(
            broker.place("wl-1", &grid, NOON),
            Err(BrokerError::NotRoutable(_, WorkloadStatus::Running))
        ));
        assert!(matches!(
            broker.place("ghost", &grid, NOON),
            Err(BrokerError::WorkloadNotFound(_))
        ));
    }
}
