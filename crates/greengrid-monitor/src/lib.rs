//! GreenGrid anomaly monitor — the recurring control loop.
//!
//! Once per cycle the monitor materializes a consistent grid view, compares
//! each zone against a 30-minute-old baseline, and walks detected anomalies
//! through an explicit state machine
//! (`monitoring → anomaly_detected → evaluating → adapting → resolved`)
//! whose transition and action-planning functions are pure and testable
//! without touching real placement or migration logic.
//!
//! A full cycle also applies fresh health reports, refreshes compliance
//! flags, runs health-triggered migrations, sweeps running workloads for
//! reroute triggers, auto-manages GPU slices, checkpoints due workloads,
//! and routes the pending queue. Per-workload failures are isolated so one
//! bad record never halts the cycle.

pub mod agent;
pub mod anomaly;
pub mod cycle;

pub use agent::{AdaptiveAgent, AgentState, ResponseAction, plan_response};
pub use anomaly::{Anomaly, AnomalyKind, AnomalyThresholds, detect_anomalies};
pub use cycle::{CycleReport, Monitor, MonitorConfig};
