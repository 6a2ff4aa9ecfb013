//! Reroute trigger detection — side-effect-free checks run once per
//! monitoring cycle for every running workload.

use serde::{Deserialize, Serialize};

use greengrid_state::{ComputeNode, RoutingDecision, Workload};

/// Bounds and hysteresis parameters for rerouting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerouteConfig {
    /// Hard ceiling on automatic reroutes per workload.
    pub max_reroutes: u32,
    /// Minimum relative score improvement to commit a reroute.
    pub improvement_threshold: f64,
    /// Carbon intensity growth factor vs. the last decision that triggers
    /// a reroute (1.5 = +50%).
    pub carbon_spike_factor: f64,
    /// Energy price growth factor vs. the last decision (2.0 = +100%).
    pub price_surge_factor: f64,
}

impl Default for RerouteConfig {
    fn default() -> Self {
        Self {
            max_reroutes: 5,
            improvement_threshold: 0.25,
            carbon_spike_factor: 1.5,
            price_surge_factor: 2.0,
        }
    }
}

/// Why a workload should (or did) move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerouteReason {
    CarbonSpike,
    GreenComplianceLost,
    PriceSurge,
    BudgetExceeded,
    NodeDegraded,
    NodeCritical,
    CapacityReclaim,
}

impl RerouteReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RerouteReason::CarbonSpike => "carbon_spike",
            RerouteReason::GreenComplianceLost => "green_compliance_lost",
            RerouteReason::PriceSurge => "price_surge",
            RerouteReason::BudgetExceeded => "budget_exceeded",
            RerouteReason::NodeDegraded => "node_health_degraded",
            RerouteReason::NodeCritical => "node_health_critical",
            RerouteReason::CapacityReclaim => "capacity_reclaim",
        }
    }
}

/// Check whether a running workload's conditions have degraded enough to
/// warrant a reroute attempt.
///
/// Pure: compares the node's current state against the grid values recorded
/// at the last routing decision. `current_hourly_rate` is the node's quoted
/// rate now, used for the budget check. Returns the first matching trigger.
pub fn reroute_trigger(
    workload: &Workload,
    node: &ComputeNode,
    last_decision: &RoutingDecision,
    current_hourly_rate: f64,
    cfg: &RerouteConfig,
) -> Option<RerouteReason> {
    let original_carbon = last_decision.carbon_intensity;
    if original_carbon > 0.0
        && node.effective_carbon() > original_carbon * cfg.carbon_spike_factor
    {
        return Some(RerouteReason::CarbonSpike);
    }

    if workload.requires_green() && !node.green_compliant && !node.always_green {
        return Some(RerouteReason::GreenComplianceLost);
    }

    let original_price = last_decision.energy_price;
    if original_price > 0.0 && node.energy_price > original_price * cfg.price_surge_factor {
        return Some(RerouteReason::PriceSurge);
    }

    if let Some(budget) = workload.budget_max_eur
        && current_hourly_rate * workload.estimated_duration_hours > budget
    {
        return Some(RerouteReason::BudgetExceeded);
    }

    None
}
