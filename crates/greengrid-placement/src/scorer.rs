//! Composite scoring within a tier. Lower scores win.
//!
//! The composite weighs normalized carbon intensity, energy price, and
//! utilization, then applies the tier multiplier, an async/high-renewable
//! bonus, and a health adjustment. Degraded nodes are penalized but not
//! excluded here (exclusion happens through the health-triggered reroute
//! path, not placement).

use serde::{Deserialize, Serialize};

use greengrid_state::{ComputeNode, NodeHealth, Priority, Tier, Workload};

use crate::tier::TieredCandidates;

/// Weights and normalization constants for the composite score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub carbon: f64,
    pub price: f64,
    pub utilization: f64,
    /// Carbon intensity normalization divisor (gCO2/kWh).
    pub carbon_norm: f64,
    /// Energy price normalization divisor (EUR/MWh).
    pub price_norm: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            carbon: 0.6,
            price: 0.3,
            utilization: 0.1,
            carbon_norm: 500.0,
            price_norm: 200.0,
        }
    }
}

/// A candidate with its computed score.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub node: ComputeNode,
    pub tier: Tier,
    pub score: f64,
}

/// Composite score for one node. Lower is better.
pub fn score_node(
    node: &ComputeNode,
    workload: &Workload,
    tier: Tier,
    weights: &ScoringWeights,
) -> f64 {
    let carbon_score = node.effective_carbon() / weights.carbon_norm;
    let price_score = node.energy_price / weights.price_norm;
    let util_score = node.utilization;

    let mut composite = carbon_score * weights.carbon
        + price_score * weights.price
        + util_score * weights.utilization;

    composite *= tier.multiplier();

    // Async workloads prefer high-renewable nodes.
    if workload.priority == Priority::Async && node.renewable_pct >= 80.0 {
        composite *= 0.8;
    }

    match node.health {
        NodeHealth::Healthy => composite *= 0.95,
        NodeHealth::Degraded => composite *= 1.2,
        _ => {}
    }

    composite
}

/// Score and rank candidates within one tier, best first.
///
/// The sort is stable, so equal scores resolve in enumeration order. This
/// keeps tie-breaking deterministic and testable.
pub fn rank_candidates(
    candidates: &[ComputeNode],
    workload: &Workload,
    tier: Tier,
    weights: &ScoringWeights,
) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = candidates
        .iter()
        .map(|node| ScoredCandidate {
            node: node.clone(),
            tier,
            score: score_node(node, workload, tier, weights),
        })
        .collect();
    scored.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

/// Pick the winning candidate across tiers.
///
/// Workloads that mandate recycled energy only ever consider Tier 1, even
/// when it is empty. Everything else walks the tiers strictly in order:
/// the first tier with any candidate supplies the winner.
pub fn select_candidate(
    tiered: &TieredCandidates,
    workload: &Workload,
    weights: &ScoringWeights,
) -> Option<ScoredCandidate> {
    if workload.requires_recycled_energy() {
        return rank_candidates(&tiered.recycler, workload, Tier::Recycler, weights)
            .into_iter()
            .next();
    }

    for (nodes, tier) in [
        (&tiered.recycler, Tier::Recycler),
        (&tiered.surplus, Tier::Surplus),
        (&tiered.consumer, Tier::ConsumerGreen),
    ] {
        if let Some(best) = rank_candidates(nodes, workload, tier, weights).into_iter().next() {
            return Some(best);
        }
    }
    None
}

/// Relative improvement of a new score over an old one.
///
/// Guarded against a zero old score; positive values mean the new
/// candidate is better (scores are lower-is-better).
pub fn relative_improvement(old_score: f64, new_score: f64) -> f64 {
    (old_score - new_score) / old_score.max(0.001)
}
