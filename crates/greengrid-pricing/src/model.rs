//! The pricing model: base rates, tier derivation, and multipliers.

use serde::{Deserialize, Serialize};

use greengrid_state::{ComputeNode, GridView, Workload};

/// Base hourly rate per GPU model, EUR/hour.
pub fn base_rate(gpu_model: &str) -> f64 {
    match gpu_model {
        "H100" => 3.50,
        "A100" => 2.20,
        "RTX 4090" => 1.10,
        "RTX 4080" => 0.85,
        "RTX 3080" => 0.55,
        "RTX 3070" => 0.35,
        _ => 1.0,
    }
}

/// Pricing tier of a node, derived from its flags and current grid state.
///
/// Distinct from the routing [`Tier`](greengrid_state::Tier): routing tiers
/// partition placement candidates, rate tiers set discounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateTier {
    Recycler,
    Surplus,
    Green,
    Standard,
}

impl RateTier {
    /// Fixed tier discount, percent. Recycler is cheapest.
    pub fn discount_pct(self) -> f64 {
        match self {
            RateTier::Recycler => 40.0,
            RateTier::Surplus => 30.0,
            RateTier::Green => 10.0,
            RateTier::Standard => 0.0,
        }
    }
}

/// Tunable pricing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Markup applied to green-compliant nodes.
    pub green_premium: f64,
    /// Extra discount while the node's zone shows a surplus window.
    pub surplus_discount: f64,
    /// Platform fee share of the compute cost.
    pub platform_fee_pct: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            green_premium: 0.10,
            surplus_discount: 0.30,
            platform_fee_pct: 0.15,
        }
    }
}

/// Fleet-wide inputs to a pricing pass, computed once per cycle.
#[derive(Debug, Clone, Copy)]
pub struct PricingContext {
    /// Busy nodes / total nodes, in [0, 1].
    pub demand_ratio: f64,
    /// UTC hour of day, 0..24.
    pub hour: u8,
}

impl PricingContext {
    /// Derive the context from the current fleet and wall clock.
    pub fn from_fleet(nodes: &[ComputeNode], now: u64) -> Self {
        let total = nodes.len().max(1);
        let busy = nodes
            .iter()
            .filter(|n| n.status == greengrid_state::NodeStatus::Busy)
            .count();
        Self {
            demand_ratio: busy as f64 / total as f64,
            hour: hour_of_day(now),
        }
    }
}

/// UTC hour of day from epoch seconds.
pub fn hour_of_day(epoch_secs: u64) -> u8 {
    ((epoch_secs / 3600) % 24) as u8
}

/// A priced hourly rate with its component breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub base_rate: f64,
    pub tier: RateTier,
    pub surplus_discount_pct: f64,
    pub green_premium_pct: f64,
    pub demand_multiplier: f64,
    pub time_multiplier: f64,
    /// EUR per hour after all adjustments.
    pub final_rate: f64,
}

/// Cost projection for a workload at a quoted rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEstimate {
    pub hourly_rate: f64,
    pub estimated_hours: f64,
    pub compute_cost: f64,
    pub platform_fee: f64,
    pub total_cost: f64,
    pub provider_payout: f64,
}

/// Price a node under the given grid view and fleet context.
pub fn quote(
    node: &ComputeNode,
    grid: &GridView,
    ctx: &PricingContext,
    cfg: &PricingConfig,
) -> Quote {
    let surplus = grid.surplus_in(&node.grid_zone);
    let tier = rate_tier(node, surplus);
    let base = base_rate(&node.gpu_model);

    let surplus_discount = if surplus { cfg.surplus_discount } else { 0.0 };
    let green_premium = if node.green_compliant { cfg.green_premium } else { 0.0 };
    let demand_mult = demand_multiplier(ctx.demand_ratio);
    let time_mult = time_of_day_multiplier(ctx.hour);

    let final_rate = base
        * (1.0 + green_premium)
        * (1.0 - surplus_discount)
        * (1.0 - tier.discount_pct() / 100.0)
        * demand_mult
        * time_mult;

    Quote {
        base_rate: base,
        tier,
        surplus_discount_pct: surplus_discount * 100.0,
        green_premium_pct: green_premium * 100.0,
        demand_multiplier: demand_mult,
        time_multiplier: time_mult,
        final_rate,
    }
}

/// Project the total cost of a workload at the quoted rate.
pub fn estimate_cost(workload: &Workload, quote: &Quote, cfg: &PricingConfig) -> CostEstimate {
    let hours = if workload.estimated_duration_hours > 0.0 {
        workload.estimated_duration_hours
    } else {
        1.0
    };
    let compute_cost = quote.final_rate * hours;
    let platform_fee = compute_cost * cfg.platform_fee_pct;

    CostEstimate {
        hourly_rate: quote.final_rate,
        estimated_hours: hours,
        compute_cost,
        platform_fee,
        total_cost: compute_cost + platform_fee,
        provider_payout: compute_cost - platform_fee,
    }
}

fn rate_tier(node: &ComputeNode, surplus: bool) -> RateTier {
    if node.always_green {
        RateTier::Recycler
    } else if surplus {
        RateTier::Surplus
    } else if node.green_compliant {
        RateTier::Green
    } else {
        RateTier::Standard
    }
}

/// Supply/demand multiplier: 0.8x with an idle fleet, 1.3x fully busy.
fn demand_multiplier(demand_ratio: f64) -> f64 {
    0.8 + demand_ratio.clamp(0.0, 1.0) * 0.5
}

/// Diurnal demand curve over UTC hours.
fn time_of_day_multiplier(hour: u8) -> f64 {
    match hour {
        0..=5 => 0.7,    // night
        6..=8 => 0.85,   // morning ramp
        9..=17 => 1.0,   // business hours
        18..=21 => 1.15, // evening peak
        22..=23 => 0.8,  // late off-peak
        _ => 1.0,
    }
}
