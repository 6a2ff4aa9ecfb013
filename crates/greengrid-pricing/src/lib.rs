//! GreenGrid pricing — hourly rates for compute nodes.
//!
//! Rates start from a flat per-GPU-model base table and are adjusted by:
//! - **Rate tier** (recycler / surplus / green / standard, fixed discounts)
//! - **Surplus windows** (extra discount while the local grid is dumping energy)
//! - **Green premium** (small markup for verified green compute)
//! - **Demand multiplier** (fleet-wide busy ratio, 0.8x–1.3x)
//! - **Time-of-day multiplier** (diurnal demand curve, 0.7x–1.15x)
//!
//! Everything here is pure: grid conditions, demand ratio, and the hour of
//! day are passed in, so the model can be called on every scoring pass
//! without side effects.

pub mod model;

pub use model::{
    CostEstimate, PricingConfig, PricingContext, Quote, RateTier, base_rate, estimate_cost,
    hour_of_day, quote,
};
