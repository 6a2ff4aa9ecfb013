//! The adaptive agent: an explicit state machine over anomaly handling.
//!
//! `monitoring → anomaly_detected → evaluating → adapting → resolved`,
//! then back to monitoring on the next cycle. The transition function and
//! the anomaly-to-action mapping are pure, so the sequence is testable
//! without invoking real placement or migration logic. `resolved` is
//! always reached once the action has run; the action's own success or
//! failure is logged, not encoded in the state machine.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use greengrid_broker::Broker;
use greengrid_state::{GridView, Priority, Workload};

use crate::anomaly::{Anomaly, AnomalyKind};

/// States of the adaptive agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Monitoring,
    AnomalyDetected,
    Evaluating,
    Adapting,
    Resolved,
}

impl AgentState {
    /// The fixed transition order; `Resolved` wraps back to `Monitoring`.
    pub fn next(self) -> AgentState {
        match self {
            AgentState::Monitoring => AgentState::AnomalyDetected,
            AgentState::AnomalyDetected => AgentState::Evaluating,
            AgentState::Evaluating => AgentState::Adapting,
            AgentState::Adapting => AgentState::Resolved,
            AgentState::Resolved => AgentState::Monitoring,
        }
    }
}

/// What the agent decides to do about an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    Reroute,
    PauseAndReroute,
    Alert,
    OpportunisticRoute,
    Monitor,
}

/// Map an anomaly type and the affected workload's attributes to an
/// action. Pure.
pub fn plan_response(kind: AnomalyKind, workload: &Workload) -> ResponseAction {
    match kind {
        AnomalyKind::CarbonSpike => {
            if workload.requires_green() {
                ResponseAction::Reroute
            } else {
                ResponseAction::Monitor
            }
        }
        AnomalyKind::PriceSurge => {
            if workload.priority == Priority::Async {
                ResponseAction::Reroute
            } else {
                ResponseAction::Alert
            }
        }
        AnomalyKind::RenewableDrop => {
            if workload.requires_green() {
                ResponseAction::PauseAndReroute
            } else {
                ResponseAction::Monitor
            }
        }
        AnomalyKind::CurtailmentOpportunity => ResponseAction::OpportunisticRoute,
    }
}

/// Drives one workload through the state machine for one anomaly.
pub struct AdaptiveAgent {
    state: AgentState,
    /// Visited states, for inspection.
    trail: Vec<AgentState>,
}

impl AdaptiveAgent {
    pub fn new() -> Self {
        Self {
            state: AgentState::Monitoring,
            trail: vec![AgentState::Monitoring],
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn trail(&self) -> &[AgentState] {
        &self.trail
    }

    /// Walk the full detect/evaluate/adapt sequence for one anomaly.
    ///
    /// Returns the planned action. Always ends in `Resolved` even when
    /// the underlying broker action fails.
    pub fn handle_anomaly(
        &mut self,
        broker: &Broker,
        workload: &Workload,
        anomaly: &Anomaly,
        grid: &GridView,
        now: u64,
    ) -> ResponseAction {
        self.advance(); // anomaly_detected
        info!(
            workload = %workload.id,
            zone = %anomaly.zone,
            kind = anomaly.kind.as_str(),
            current = anomaly.current,
            previous = anomaly.previous,
            "anomaly detected"
        );

        self.advance(); // evaluating
        let action = plan_response(anomaly.kind, workload);

        self.advance(); // adapting
        self.execute(broker, workload, anomaly, action, grid, now);

        self.advance(); // resolved
        debug!(workload = %workload.id, ?action, "anomaly handled");
        action
    }

    fn execute(
        &self,
        broker: &Broker,
        workload: &Workload,
        anomaly: &Anomaly,
        action: ResponseAction,
        grid: &GridView,
        now: u64,
    ) {
        let reason = anomaly.kind.as_str();
        let result = match action {
            // The broker's reroute path checkpoints and pauses before
            // re-evaluating, so both variants execute the same way.
            ResponseAction::Reroute | ResponseAction::PauseAndReroute => broker
                .reroute(&workload.id, reason, grid, now)
                .map(|outcome| debug!(workload = %workload.id, ?outcome, "reroute evaluated")),
            ResponseAction::OpportunisticRoute => broker
                .route_async_on_surplus(&anomaly.zone, grid, now)
                .map(|routed| debug!(zone = %anomaly.zone, routed, "opportunistic routing")),
            ResponseAction::Alert => {
                warn!(
                    workload = %workload.id,
                    zone = %anomaly.zone,
                    kind = reason,
                    "grid anomaly alert"
                );
                Ok(())
            }
            ResponseAction::Monitor => {
                debug!(workload = %workload.id, "continuing to monitor");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(workload = %workload.id, error = %e, "anomaly action failed");
        }
    }

    fn advance(&mut self) {
        self.state = self.state.next();
        self.trail.push(self.state);
    }
}

impl Default for AdaptiveAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greengrid_broker::BrokerConfig;
    use greengrid_state::*;

    fn workload(priority: Priority, green: GreenRequirement) -> Workload {
        Workload {
            id: "wl-1".to_string(),
            name: "job".to_string(),
            kind: WorkloadKind::Training,
            priority,
            required_vram_mb: 10_240,
            green,
            green_only: false,
            max_carbon_intensity: None,
            budget_max_eur: None,
            estimated_duration_hours: 1.0,
            status: WorkloadStatus::Running,
            reroute_count: 0,
            migration_count: 0,
            checkpoint_enabled: false,
            checkpoint_interval_secs: 900,
            last_checkpoint_at: None,
            checkpoint_handle: None,
            node_id: Some("n1".to_string()),
            slice_id: None,
            submitted_at: 0,
            started_at: Some(100),
            paused_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn transition_order_is_fixed() {
        assert_eq!(AgentState::Monitoring.next(), AgentState::AnomalyDetected);
        assert_eq!(AgentState::AnomalyDetected.next(), AgentState::Evaluating);
        assert_eq!(AgentState::Evaluating.next(), AgentState::Adapting);
        assert_eq!(AgentState::Adapting.next(), AgentState::Resolved);
        assert_eq!(AgentState::Resolved.next(), AgentState::Monitoring);
    }

    #[test]
    fn action_planning_matrix() {
        let green = workload(Priority::Normal, GreenRequirement::GreenPreferred);
        let standard = workload(Priority::Normal, GreenRequirement::Standard);
        let async_wl = workload(Priority::Async, GreenRequirement::Standard);

        assert_eq!(plan_response(AnomalyKind::CarbonSpike, &green), ResponseAction::Reroute);
        assert_eq!(plan_response(AnomalyKind::CarbonSpike, &standard), ResponseAction::Monitor);

        assert_eq!(plan_response(AnomalyKind::PriceSurge, &async_wl), ResponseAction::Reroute);
        assert_eq!(plan_response(AnomalyKind::PriceSurge, &standard), ResponseAction::Alert);

        assert_eq!(
            plan_response(AnomalyKind::RenewableDrop, &green),
            ResponseAction::PauseAndReroute
        );
        assert_eq!(
            plan_response(AnomalyKind::RenewableDrop, &standard),
            ResponseAction::Monitor
        );

        assert_eq!(
            plan_response(AnomalyKind::CurtailmentOpportunity, &standard),
            ResponseAction::OpportunisticRoute
        );
    }

    #[test]
    fn handle_anomaly_always_reaches_resolved() {
        let state = StateStore::open_in_memory().unwrap();
        let broker = Broker::new(state.clone(), BrokerConfig::default());

        // The workload isn't even in the store: the reroute will fail,
        // but the state machine still completes.
        let wl = workload(Priority::Normal, GreenRequirement::GreenPreferred);
        let anomaly = Anomaly {
            kind: AnomalyKind::CarbonSpike,
            zone: "DE".to_string(),
            current: 300.0,
            previous: 100.0,
        };

        let mut agent = AdaptiveAgent::new();
        let action =
            agent.handle_anomaly(&broker, &wl, &anomaly, &GridView::default(), 1000);

        assert_eq!(action, ResponseAction::Reroute);
        assert_eq!(agent.state(), AgentState::Resolved);
        assert_eq!(
            agent.trail(),
            &[
                AgentState::Monitoring,
                AgentState::AnomalyDetected,
                AgentState::Evaluating,
                AgentState::Adapting,
                AgentState::Resolved,
            ]
        );
    }
}
