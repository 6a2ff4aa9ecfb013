//! GreenGrid placement core — pure decision logic for the broker.
//!
//! This crate decides, it does not execute. Given borrowed fleet state and
//! a grid view it categorizes candidates into priority tiers, scores them,
//! picks winners, and detects reroute triggers. All functions are free of
//! store access and side effects; `greengrid-broker` applies the results.
//!
//! # Components
//!
//! - **`tier`** — Categorical tiers (recycler > surplus > consumer-green)
//! - **`scorer`** — Weighted composite scoring and deterministic ranking
//! - **`detect`** — Reroute trigger detection and hysteresis parameters

pub mod detect;
pub mod scorer;
pub mod tier;

pub use detect::{RerouteConfig, RerouteReason, reroute_trigger};
pub use scorer::{
    ScoredCandidate, ScoringWeights, rank_candidates, relative_improvement, score_node,
    select_candidate,
};
pub use tier::{TieredCandidates, categorize, tier_of};
