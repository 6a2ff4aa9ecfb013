//! Domain types for the GreenGrid state store.
//!
//! These types represent the persisted state of workloads, compute nodes,
//! GPU slices, routing decisions, grid snapshots, and health reports. All
//! types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for a workload.
pub type WorkloadId = String;

/// Unique identifier for a compute node.
pub type NodeId = String;

/// Unique identifier for a GPU slice.
pub type SliceId = String;

/// Grid zone code (e.g. "FR", "DE", "US-CAL-CISO").
pub type Zone = String;

/// Coarse utilization share one whole-node workload claims on assignment.
pub const ASSIGNMENT_UTILIZATION_STEP: f64 = 0.3;

// ── Workload ──────────────────────────────────────────────────────

/// A unit of compute work submitted to the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workload {
    pub id: WorkloadId,
    pub name: String,
    pub kind: WorkloadKind,
    pub priority: Priority,
    /// VRAM the workload needs, in megabytes.
    pub required_vram_mb: u64,
    pub green: GreenRequirement,
    /// Hard green gate independent of the tier request.
    pub green_only: bool,
    /// Maximum tolerable carbon intensity in gCO2/kWh, if any.
    pub max_carbon_intensity: Option<f64>,
    /// Total budget in EUR, if any.
    pub budget_max_eur: Option<f64>,
    pub estimated_duration_hours: f64,
    pub status: WorkloadStatus,
    pub reroute_count: u32,
    pub migration_count: u32,
    pub checkpoint_enabled: bool,
    /// Seconds between checkpoints when enabled.
    pub checkpoint_interval_secs: u64,
    /// Unix timestamp of the last checkpoint.
    pub last_checkpoint_at: Option<u64>,
    /// Opaque resumable-state handle (`checkpoint://...`).
    pub checkpoint_handle: Option<String>,
    /// Whole-node assignment. Mutually exclusive with `slice_id`.
    pub node_id: Option<NodeId>,
    /// Slice assignment. Mutually exclusive with `node_id`.
    pub slice_id: Option<SliceId>,
    pub submitted_at: u64,
    pub started_at: Option<u64>,
    pub paused_at: Option<u64>,
    pub completed_at: Option<u64>,
}

/// What kind of compute work a workload is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    Inference,
    Training,
    Embedding,
    FineTune,
    Batch,
}

/// Scheduling priority for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    Normal,
    Async,
}

/// The green-energy tier a workload requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GreenRequirement {
    /// No green constraint.
    Standard,
    /// Prefer green-compliant nodes; non-compliant nodes are excluded.
    GreenPreferred,
    /// Only always-green recycler nodes qualify.
    RecycledOnly,
}

/// Lifecycle status of a workload. `Completed` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    Pending,
    Routing,
    Running,
    Paused,
    Rerouting,
    Migrating,
    Completed,
    Failed,
}

impl WorkloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkloadStatus::Completed | WorkloadStatus::Failed)
    }

    /// Active statuses take part in monitoring cycles.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            WorkloadStatus::Routing
                | WorkloadStatus::Running
                | WorkloadStatus::Paused
                | WorkloadStatus::Rerouting
                | WorkloadStatus::Migrating
        )
    }

    /// Statuses that the broker picks up for (re-)placement.
    pub fn needs_routing(self) -> bool {
        matches!(self, WorkloadStatus::Pending | WorkloadStatus::Rerouting)
    }
}

impl Workload {
    /// Only always-green recycler nodes may run this workload.
    pub fn requires_recycled_energy(&self) -> bool {
        self.green == GreenRequirement::RecycledOnly
    }

    /// Any green gating applies (preferred tier, recycled tier, or the flag).
    pub fn requires_green(&self) -> bool {
        self.green_only
            || matches!(
                self.green,
                GreenRequirement::GreenPreferred | GreenRequirement::RecycledOnly
            )
    }

    /// Whether a checkpoint is due at `now`.
    pub fn needs_checkpoint(&self, now: u64) -> bool {
        if !self.checkpoint_enabled || self.status != WorkloadStatus::Running {
            return false;
        }
        match self.last_checkpoint_at {
            Some(last) => now.saturating_sub(last) >= self.checkpoint_interval_secs,
            None => true,
        }
    }

    /// A running workload holds exactly one of node/slice, never both.
    pub fn has_exclusive_assignment(&self) -> bool {
        self.node_id.is_some() != self.slice_id.is_some()
    }
}

// ── Compute node ──────────────────────────────────────────────────

/// A physical or virtual GPU host in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputeNode {
    pub id: NodeId,
    pub name: String,
    pub category: NodeCategory,
    pub gpu_model: String,
    /// Total VRAM in megabytes.
    pub vram_mb: u64,
    /// GPU utilization fraction in [0, 1].
    pub utilization: f64,
    pub status: NodeStatus,
    pub health: NodeHealth,
    pub grid_zone: Zone,
    /// Current carbon intensity in gCO2/kWh (0 for always-green nodes).
    pub carbon_intensity: f64,
    /// Current energy price in EUR/MWh.
    pub energy_price: f64,
    /// Renewable share of the local grid, percent.
    pub renewable_pct: f64,
    /// Zero-carbon by construction, regardless of the grid.
    pub always_green: bool,
    /// Cached result of the last compliance refresh.
    pub green_compliant: bool,
    /// Supports multi-instance GPU partitioning.
    pub mig_capable: bool,
    pub active_slices: u32,
    pub last_health_check_at: Option<u64>,
    pub updated_at: u64,
}

/// Provider category of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    Datacenter,
    /// Consumer-grade GPU (gamer rigs).
    Consumer,
    EnergyRecycler,
}

/// Scheduling status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Idle,
    Partial,
    Busy,
    Offline,
}

impl NodeStatus {
    /// Idle and partially-loaded nodes accept new work.
    pub fn is_available(self) -> bool {
        matches!(self, NodeStatus::Idle | NodeStatus::Partial)
    }
}

/// Health level as determined by the latest health report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    Degraded,
    Critical,
    Offline,
}

impl ComputeNode {
    pub fn is_available(&self) -> bool {
        self.status.is_available()
    }

    /// Recycler nodes are zero-carbon by definition.
    pub fn is_recycler(&self) -> bool {
        self.category == NodeCategory::EnergyRecycler || self.always_green
    }

    /// Carbon intensity as seen by scoring: always-green nodes count as zero.
    pub fn effective_carbon(&self) -> f64 {
        if self.always_green { 0.0 } else { self.carbon_intensity }
    }

    /// VRAM not claimed by the current utilization.
    pub fn available_vram_mb(&self) -> u64 {
        (self.vram_mb as f64 * (1.0 - self.utilization.clamp(0.0, 1.0))).round() as u64
    }

    pub fn is_healthy(&self) -> bool {
        self.health == NodeHealth::Healthy
    }
}

// ── GPU slice ─────────────────────────────────────────────────────

/// A fractional partition of a multi-instance-capable GPU.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuSlice {
    pub id: SliceId,
    pub node_id: NodeId,
    pub profile: SliceProfile,
    pub status: SliceStatus,
    pub workload_id: Option<WorkloadId>,
    pub hourly_rate_eur: f64,
    pub created_at: u64,
    pub allocated_at: Option<u64>,
    pub released_at: Option<u64>,
}

/// Fixed MIG partition profiles (VRAM / compute-fraction pairs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SliceProfile {
    #[serde(rename = "1g.10gb")]
    Mig1g10gb,
    #[serde(rename = "2g.20gb")]
    Mig2g20gb,
    #[serde(rename = "3g.40gb")]
    Mig3g40gb,
    #[serde(rename = "4g.40gb")]
    Mig4g40gb,
    #[serde(rename = "7g.80gb")]
    Mig7g80gb,
}

impl SliceProfile {
    /// All profiles, largest compute fraction first (packing order).
    pub const ALL: [SliceProfile; 5] = [
        SliceProfile::Mig7g80gb,
        SliceProfile::Mig4g40gb,
        SliceProfile::Mig3g40gb,
        SliceProfile::Mig2g20gb,
        SliceProfile::Mig1g10gb,
    ];

    /// Compute fraction of the smallest profile.
    pub const SMALLEST_FRACTION: f64 = 1.0 / 7.0;

    pub fn vram_mb(self) -> u64 {
        match self {
            SliceProfile::Mig1g10gb => 10_240,
            SliceProfile::Mig2g20gb => 20_480,
            SliceProfile::Mig3g40gb => 40_960,
            SliceProfile::Mig4g40gb => 40_960,
            SliceProfile::Mig7g80gb => 81_920,
        }
    }

    pub fn compute_fraction(self) -> f64 {
        match self {
            SliceProfile::Mig1g10gb => 1.0 / 7.0,
            SliceProfile::Mig2g20gb => 2.0 / 7.0,
            SliceProfile::Mig3g40gb => 3.0 / 7.0,
            SliceProfile::Mig4g40gb => 4.0 / 7.0,
            SliceProfile::Mig7g80gb => 1.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SliceProfile::Mig1g10gb => "1g.10gb",
            SliceProfile::Mig2g20gb => "2g.20gb",
            SliceProfile::Mig3g40gb => "3g.40gb",
            SliceProfile::Mig4g40gb => "4g.40gb",
            SliceProfile::Mig7g80gb => "7g.80gb",
        }
    }
}

/// Lifecycle status of a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceStatus {
    Available,
    Allocated,
    Reserved,
    Maintenance,
}

impl GpuSlice {
    pub fn is_available(&self) -> bool {
        self.status == SliceStatus::Available
    }

    /// Allocated and reserved slices hold compute capacity on the node.
    pub fn holds_capacity(&self) -> bool {
        matches!(self.status, SliceStatus::Allocated | SliceStatus::Reserved)
    }

    pub fn vram_mb(&self) -> u64 {
        self.profile.vram_mb()
    }

    pub fn compute_fraction(&self) -> f64 {
        self.profile.compute_fraction()
    }
}

// ── Routing decision ──────────────────────────────────────────────

/// Categorical priority class of a node. Partitions candidates before
/// scoring; tiers are tried strictly in this order and never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Recycler,
    Surplus,
    ConsumerGreen,
}

impl Tier {
    /// Score multiplier expressing categorical preference (lower is better).
    pub fn multiplier(self) -> f64 {
        match self {
            Tier::Recycler => 0.5,
            Tier::Surplus => 0.7,
            Tier::ConsumerGreen => 0.85,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Tier::Recycler => "tier_1_recycler",
            Tier::Surplus => "tier_2_surplus",
            Tier::ConsumerGreen => "tier_3_consumer_green",
        }
    }
}

/// What kind of routing event a decision records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Initial,
    Reroute,
    Pause,
    Resume,
}

/// Immutable audit record of one placement or reroute event. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingDecision {
    pub workload_id: WorkloadId,
    /// Store-assigned, monotonic per workload.
    pub seq: u64,
    pub node_id: Option<NodeId>,
    pub slice_id: Option<SliceId>,
    pub kind: DecisionKind,
    /// Machine-readable reason code ("carbon_spike", "no_candidates", ...).
    pub reason: String,
    pub tier: Option<Tier>,
    pub score: Option<f64>,
    /// Grid values at decision time.
    pub carbon_intensity: f64,
    pub energy_price: f64,
    pub renewable_pct: f64,
    /// Set when the decision was executed as a live migration.
    pub migration: bool,
    pub decided_at: u64,
}

// ── Grid snapshot ─────────────────────────────────────────────────

/// Per-zone grid conditions at a point in time. Written by an external
/// ingester; the core only reads these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GridSnapshot {
    pub zone: Zone,
    /// gCO2/kWh.
    pub carbon_intensity: f64,
    /// Percent of generation from renewables.
    pub renewable_pct: f64,
    /// EUR/MWh.
    pub energy_price: f64,
    /// Curtailed (wasted) renewable generation in MW.
    pub curtailment_mw: f64,
    pub surplus: bool,
    pub recorded_at: u64,
}

impl GridSnapshot {
    /// A surplus window: flagged by the feed, or meaningful curtailment.
    pub fn has_surplus(&self) -> bool {
        self.surplus || self.curtailment_mw > 50.0
    }

    pub fn is_green(&self) -> bool {
        self.renewable_pct >= 50.0
    }
}

// ── Health report ─────────────────────────────────────────────────

/// One observation of a node's health, supplied by an external checker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub node_id: NodeId,
    pub health: NodeHealth,
    pub gpu_temp_c: f64,
    pub network_latency_ms: f64,
    pub gpu_errors: bool,
    pub recorded_at: u64,
}

impl HealthReport {
    /// Classify raw metrics into a health level.
    pub fn classify(gpu_temp_c: f64, network_latency_ms: f64, gpu_errors: bool) -> NodeHealth {
        if gpu_errors || gpu_temp_c > 95.0 {
            NodeHealth::Critical
        } else if gpu_temp_c > 85.0 || network_latency_ms > 30.0 {
            NodeHealth::Degraded
        } else {
            NodeHealth::Healthy
        }
    }
}

// ── Table keys ────────────────────────────────────────────────────

impl RoutingDecision {
    /// Composite key for the decisions table. Zero-padding keeps the
    /// per-workload prefix scan in seq order.
    pub fn table_key(&self) -> String {
        format!("{}:{:08}", self.workload_id, self.seq)
    }
}

impl GridSnapshot {
    /// Composite key for the grid table, ordered by time within a zone.
    pub fn table_key(&self) -> String {
        format!("{}:{:012}", self.zone, self.recorded_at)
    }
}

impl HealthReport {
    /// Composite key for the health table, ordered by time within a node.
    pub fn table_key(&self) -> String {
        format!("{}:{:012}", self.node_id, self.recorded_at)
    }
}
