//! Grid anomaly detection: current conditions vs. a lookback baseline.

use serde::{Deserialize, Serialize};

use greengrid_state::{StateResult, StateStore, Zone};

/// Relative-change thresholds that qualify as a regime change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyThresholds {
    /// Carbon intensity increase (percent) that counts as a spike.
    pub carbon_spike_pct: f64,
    /// Energy price increase (percent) that counts as a surge.
    pub price_surge_pct: f64,
    /// Renewable share drop (percent, relative) that counts as a loss.
    pub renewable_drop_pct: f64,
    /// Curtailment level (MW) that counts as a large opportunity.
    pub curtailment_opportunity_mw: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            carbon_spike_pct: 50.0,
            price_surge_pct: 100.0,
            renewable_drop_pct: 30.0,
            curtailment_opportunity_mw: 200.0,
        }
    }
}

/// What changed in a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    CarbonSpike,
    PriceSurge,
    RenewableDrop,
    CurtailmentOpportunity,
}

impl AnomalyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyKind::CarbonSpike => "carbon_spike",
            AnomalyKind::PriceSurge => "price_surge",
            AnomalyKind::RenewableDrop => "renewable_drop",
            AnomalyKind::CurtailmentOpportunity => "curtailment_opportunity",
        }
    }
}

/// One detected regime change.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub zone: Zone,
    pub current: f64,
    pub previous: f64,
}

/// Compare each zone's latest snapshot against a baseline at least
/// `lookback_secs` old. Zones without both points are skipped.
///
/// Detection is side-effect-free; acting on the result is the agent's job.
pub fn detect_anomalies(
    store: &StateStore,
    thresholds: &AnomalyThresholds,
    lookback_secs: u64,
    now: u64,
) -> StateResult<Vec<Anomaly>> {
    let view = store.grid_view()?;
    let cutoff = now.saturating_sub(lookback_secs);
    let mut anomalies = Vec::new();

    let mut zones: Vec<&str> = view.zones().collect();
    zones.sort();

    for zone in zones {
        let Some(current) = view.latest(zone) else { continue };
        let Some(previous) = store.snapshot_at_or_before(zone, cutoff)? else {
            continue;
        };

        if previous.carbon_intensity > 0.0
            && current.carbon_intensity
                > previous.carbon_intensity * (1.0 + thresholds.carbon_spike_pct / 100.0)
        {
            anomalies.push(Anomaly {
                kind: AnomalyKind::CarbonSpike,
                zone: zone.to_string(),
                current: current.carbon_intensity,
                previous: previous.carbon_intensity,
            });
        }

        if previous.energy_price > 0.0
            && current.energy_price
                > previous.energy_price * (1.0 + thresholds.price_surge_pct / 100.0)
        {
            anomalies.push(Anomaly {
                kind: AnomalyKind::PriceSurge,
                zone: zone.to_string(),
                current: current.energy_price,
                previous: previous.energy_price,
            });
        }

        if previous.renewable_pct > 0.0
            && current.renewable_pct
                < previous.renewable_pct * (1.0 - thresholds.renewable_drop_pct / 100.0)
        {
            anomalies.push(Anomaly {
                kind: AnomalyKind::RenewableDrop,
                zone: zone.to_string(),
                current: current.renewable_pct,
                previous: previous.renewable_pct,
            });
        }

        if current.curtailment_mw > thresholds.curtailment_opportunity_mw {
            anomalies.push(Anomaly {
                kind: AnomalyKind::CurtailmentOpportunity,
                zone: zone.to_string(),
                current: current.curtailment_mw,
                previous: previous.curtailment_mw,
            });
        }
    }

    Ok(anomalies)
}
