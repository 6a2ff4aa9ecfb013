//! Tier categorization — candidates are partitioned before scoring.
//!
//! Tier priority is categorical, not score-based: tiers are tried strictly
//! in order (recycler, then surplus, then consumer-green) and never merged
//! or compared against each other.

use greengrid_state::{ComputeNode, GridView, NodeCategory, Tier};

/// Candidates partitioned by tier.
#[derive(Debug, Clone, Default)]
pub struct TieredCandidates {
    /// Tier 1: always-green energy recyclers.
    pub recycler: Vec<ComputeNode>,
    /// Tier 2: datacenters in a surplus window, or green datacenters.
    pub surplus: Vec<ComputeNode>,
    /// Tier 3: green consumer GPUs, plus anything not classified above.
    pub consumer: Vec<ComputeNode>,
}

impl TieredCandidates {
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.recycler.len(), self.surplus.len(), self.consumer.len())
    }

    pub fn is_empty(&self) -> bool {
        self.recycler.is_empty() && self.surplus.is_empty() && self.consumer.is_empty()
    }
}

/// The tier a single node belongs to under the given grid view.
pub fn tier_of(node: &ComputeNode, grid: &GridView) -> Tier {
    if node.is_recycler() {
        Tier::Recycler
    } else if node.category == NodeCategory::Datacenter
        && (grid.surplus_in(&node.grid_zone) || node.green_compliant)
    {
        Tier::Surplus
    } else {
        Tier::ConsumerGreen
    }
}

/// Partition candidates into the three priority tiers.
///
/// Enumeration order within each tier is preserved so downstream stable
/// sorts stay deterministic.
pub fn categorize(candidates: &[ComputeNode], grid: &GridView) -> TieredCandidates {
    let mut tiered = TieredCandidates::default();
    for node in candidates {
        match tier_of(node, grid) {
            Tier::Recycler => tiered.recycler.push(node.clone()),
            Tier::Surplus => tiered.surplus.push(node.clone()),
            Tier::ConsumerGreen => tiered.consumer.push(node.clone()),
        }
    }
    tiered
}
