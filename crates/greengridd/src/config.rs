//! greengrid.toml configuration parser.
//!
//! Every section mirrors a subsystem config struct and every field is
//! defaulted, so an empty (or absent) file yields the stock setup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use greengrid_broker::BrokerConfig;
use greengrid_monitor::MonitorConfig;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GreengridConfig {
    pub broker: BrokerConfig,
    pub monitor: MonitorConfig,
}

impl GreengridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GreengridConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: GreengridConfig = toml::from_str("").unwrap();
        assert_eq!(config.monitor.cycle_interval_secs, 300);
        assert_eq!(config.broker.reroute.max_reroutes, 5);
        assert_eq!(config.broker.slices.slice_threshold, 0.70);
    }

    #[test]
    fn partial_config_overrides_selected_fields() {
        let config: GreengridConfig = toml::from_str(
            r#"
            [monitor]
            cycle_interval_secs = 60

            [broker.reroute]
            improvement_threshold = 0.4

            [broker.compliance]
            renewable_threshold = 60.0
            "#,
        )
        .unwrap();

        assert_eq!(config.monitor.cycle_interval_secs, 60);
        assert_eq!(config.broker.reroute.improvement_threshold, 0.4);
        assert_eq!(config.broker.compliance.renewable_threshold, 60.0);
        // Untouched fields keep their defaults.
        assert_eq!(config.broker.reroute.max_reroutes, 5);
        assert_eq!(config.monitor.anomaly.carbon_spike_pct, 50.0);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = GreengridConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: GreengridConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.monitor.cycle_interval_secs, config.monitor.cycle_interval_secs);
    }
}
