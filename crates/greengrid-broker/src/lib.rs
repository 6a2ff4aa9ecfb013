//! GreenGrid broker — the executor over the pure placement core.
//!
//! The `Broker` wires the compliance gate, pricing model, tier/scoring
//! logic, slice manager, and checkpoint/migration manager into the
//! operations the monitoring cycle calls:
//!
//! - `place` — tiered initial placement with slice fallback
//! - `reroute` — bounded, hysteresis-guarded re-placement
//! - `check_running` — per-cycle trigger detection over running workloads
//! - `check_and_migrate` — proactive migration off unhealthy nodes
//! - `route_pending` / `route_async_on_surplus` — pending-queue sweeps
//! - `complete` — teardown with cost and carbon metrics
//!
//! Non-fatal outcomes (no candidates, ceiling, insufficient improvement)
//! are ordinary enum variants; every decision, including failures, lands
//! in the append-only decision log.

pub mod broker;
pub mod error;
pub mod events;

pub use broker::{Broker, BrokerConfig, PlacementOutcome, RerouteOutcome, SweepOutcome};
pub use error::{BrokerError, BrokerResult};
pub use events::{BrokerEvent, EventSink, LogSink, NullSink, estimated_carbon_saved_grams};
