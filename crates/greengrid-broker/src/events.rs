//! Billing/notification events emitted by the broker.
//!
//! The broker reports what happened with cost and carbon metrics attached;
//! settlement and payouts happen in an external billing adapter behind the
//! [`EventSink`] trait. The default sink writes tracing lines.

use serde::{Deserialize, Serialize};
use tracing::info;

use greengrid_pricing::CostEstimate;
use greengrid_state::{ComputeNode, NodeId, SliceId, Tier, Workload, WorkloadId};

/// Lifecycle events the broker publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    WorkloadRouted {
        workload_id: WorkloadId,
        node_id: Option<NodeId>,
        slice_id: Option<SliceId>,
        tier: Tier,
        score: f64,
        cost: CostEstimate,
        carbon_intensity: f64,
    },
    WorkloadRerouted {
        workload_id: WorkloadId,
        from_node: Option<NodeId>,
        to_node: NodeId,
        reason: String,
        improvement: f64,
        migrated: bool,
    },
    WorkloadCompleted {
        workload_id: WorkloadId,
        cost: Option<CostEstimate>,
        carbon_saved_grams: f64,
    },
}

/// Receives broker events. Implementations must be cheap; the broker calls
/// this synchronously on its decision path.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &BrokerEvent);
}

/// Default sink: structured log lines.
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &BrokerEvent) {
        match event {
            BrokerEvent::WorkloadRouted {
                workload_id,
                node_id,
                slice_id,
                tier,
                score,
                ..
            } => info!(
                workload = %workload_id,
                node = node_id.as_deref().unwrap_or("-"),
                slice = slice_id.as_deref().unwrap_or("-"),
                tier = tier.label(),
                score,
                "workload routed"
            ),
            BrokerEvent::WorkloadRerouted {
                workload_id,
                from_node,
                to_node,
                reason,
                improvement,
                migrated,
            } => info!(
                workload = %workload_id,
                from = from_node.as_deref().unwrap_or("-"),
                to = %to_node,
                reason,
                improvement,
                migrated,
                "workload rerouted"
            ),
            BrokerEvent::WorkloadCompleted {
                workload_id,
                carbon_saved_grams,
                ..
            } => info!(
                workload = %workload_id,
                carbon_saved_grams,
                "workload completed"
            ),
        }
    }
}

/// Sink that drops everything (for tests).
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &BrokerEvent) {}
}

/// Estimated carbon saved by running a workload on `node` instead of a
/// dirty-grid baseline, in grams of CO2.
///
/// Baseline 400 gCO2/kWh (EU grid average); power draw scaled by GPU
/// model; PUE accounts for cooling overhead; minimum billing window 15
/// minutes.
pub fn estimated_carbon_saved_grams(workload: &Workload, node: &ComputeNode, now: u64) -> f64 {
    const BASELINE_INTENSITY: f64 = 400.0;
    const PUE: f64 = 1.2;

    let actual = node.effective_carbon();
    let gpu_kw = match node.gpu_model.as_str() {
        "H100" => 0.70,
        "A100" => 0.40,
        "RTX 4090" => 0.35,
        "RTX 4080" => 0.32,
        _ => 0.30,
    };
    let hours = match workload.started_at {
        Some(started) => (now.saturating_sub(started) as f64 / 3600.0).max(0.25),
        None => workload.estimated_duration_hours.max(0.25),
    };

    (BASELINE_INTENSITY - actual) * gpu_kw * hours * PUE
}
