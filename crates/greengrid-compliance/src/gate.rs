//! Eligibility gating: green compliance rules and the capability filter.

use serde::{Deserialize, Serialize};
use tracing::debug;

use greengrid_pricing::{PricingConfig, PricingContext, quote};
use greengrid_state::{
    ComputeNode, GridSnapshot, GridView, NodeCategory, StateResult, StateStore, Workload,
};

/// Tunable compliance thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Minimum renewable share (percent) for a grid to count as green.
    pub renewable_threshold: f64,
    /// Energy price (EUR/MWh) below which a datacenter zone is in surplus.
    pub surplus_price_threshold: f64,
    /// Curtailed megawatts above which a datacenter zone is in surplus.
    pub curtailment_threshold_mw: f64,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            renewable_threshold: 50.0,
            surplus_price_threshold: 30.0,
            curtailment_threshold_mw: 100.0,
        }
    }
}

/// Whether a node passes the green compliance gate right now.
pub fn compliant(node: &ComputeNode, grid: &GridView, cfg: &ComplianceConfig) -> bool {
    // Energy recyclers always pass.
    if node.always_green {
        return true;
    }

    let Some(snapshot) = grid.latest(&node.grid_zone) else {
        return false;
    };

    match node.category {
        NodeCategory::EnergyRecycler => true,
        NodeCategory::Datacenter => datacenter_compliant(snapshot, cfg),
        NodeCategory::Consumer => consumer_compliant(snapshot, cfg),
    }
}

/// Datacenter rule: surplus price, heavy curtailment, or a green grid.
pub fn datacenter_compliant(snapshot: &GridSnapshot, cfg: &ComplianceConfig) -> bool {
    snapshot.energy_price < cfg.surplus_price_threshold
        || snapshot.curtailment_mw > cfg.curtailment_threshold_mw
        || snapshot.renewable_pct >= cfg.renewable_threshold
}

/// Consumer rule: renewable share only.
pub fn consumer_compliant(snapshot: &GridSnapshot, cfg: &ComplianceConfig) -> bool {
    snapshot.renewable_pct >= cfg.renewable_threshold
}

/// Hard capability check, independent of green gating.
///
/// `hourly_rate` is the node's current quoted rate, used for the budget
/// check against the workload's estimated duration.
pub fn can_handle(node: &ComputeNode, workload: &Workload, hourly_rate: f64) -> bool {
    if !node.is_available() {
        return false;
    }
    if node.available_vram_mb() < workload.required_vram_mb {
        return false;
    }
    if workload.green_only && !node.green_compliant && !node.always_green {
        return false;
    }
    if let Some(ceiling) = workload.max_carbon_intensity
        && !node.always_green
        && node.carbon_intensity > ceiling
    {
        return false;
    }
    if let Some(budget) = workload.budget_max_eur {
        let estimated_total = hourly_rate * workload.estimated_duration_hours;
        if estimated_total > budget {
            return false;
        }
    }
    true
}

/// Candidate nodes for a workload's green requirement and capabilities.
///
/// Returns an empty vec when nothing qualifies; the caller handles the
/// empty case (slice fallback, retry next cycle).
pub fn eligible_nodes(
    workload: &Workload,
    nodes: &[ComputeNode],
    grid: &GridView,
    cfg: &ComplianceConfig,
    pricing_cfg: &PricingConfig,
    pricing_ctx: &PricingContext,
) -> Vec<ComputeNode> {
    let gated: Vec<&ComputeNode> = if workload.requires_recycled_energy() {
        // 100% recycled: only always-green recyclers, no grid check.
        nodes.iter().filter(|n| n.is_recycler()).collect()
    } else if workload.requires_green() {
        nodes.iter().filter(|n| compliant(n, grid, cfg)).collect()
    } else {
        nodes.iter().filter(|n| n.is_available()).collect()
    };

    let candidates: Vec<ComputeNode> = gated
        .into_iter()
        .filter(|n| {
            let rate = quote(n, grid, pricing_ctx, pricing_cfg).final_rate;
            can_handle(n, workload, rate)
        })
        .cloned()
        .collect();

    debug!(
        workload = %workload.id,
        green = ?workload.green,
        candidates = candidates.len(),
        "eligibility gate evaluated"
    );
    candidates
}

/// Refresh every node's grid-derived fields and compliance flag.
///
/// Always-green nodes read as zero-carbon and fully renewable regardless of
/// the grid snapshot. Nodes in zones with no snapshot keep their last
/// values but lose compliance. Returns the number of nodes touched.
pub fn sync_nodes_with_grid(
    store: &StateStore,
    grid: &GridView,
    cfg: &ComplianceConfig,
    now: u64,
) -> StateResult<usize> {
    let nodes = store.list_nodes()?;
    let mut updated = 0;

    for node in &nodes {
        let snapshot = grid.latest(&node.grid_zone).cloned();
        let is_compliant = compliant(node, grid, cfg);
        store.update_node(&node.id, |n| {
            if let Some(snap) = &snapshot {
                n.energy_price = snap.energy_price;
                if n.always_green {
                    n.carbon_intensity = 0.0;
                    n.renewable_pct = 100.0;
                } else {
                    n.carbon_intensity = snap.carbon_intensity;
                    n.renewable_pct = snap.renewable_pct;
                }
            }
            n.green_compliant = is_compliant;
            n.updated_at = now;
        })?;
        updated += 1;
    }

    Ok(updated)
}
