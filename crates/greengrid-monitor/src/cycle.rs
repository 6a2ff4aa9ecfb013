//! The full monitoring cycle and its interval run loop.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use greengrid_broker::{Broker, SweepOutcome};
use greengrid_compliance::sync_nodes_with_grid;
use greengrid_migrate::CheckpointManager;
use greengrid_pricing::PricingContext;
use greengrid_slices::SliceManager;
use greengrid_state::{StateStore, Workload, Zone};

use crate::agent::AdaptiveAgent;
use crate::anomaly::{AnomalyThresholds, detect_anomalies};

/// Monitor loop tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between full monitoring cycles.
    pub cycle_interval_secs: u64,
    /// How far back the anomaly baseline looks.
    pub lookback_secs: u64,
    /// How fresh a surplus snapshot must be to route into its zone.
    pub surplus_window_secs: u64,
    pub anomaly: AnomalyThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 300,
            lookback_secs: 1800,
            surplus_window_secs: 3600,
            anomaly: AnomalyThresholds::default(),
        }
    }
}

/// Counters from one full monitoring cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub anomalies: usize,
    pub agent_actions: usize,
    pub surplus_routed: usize,
    pub health_updates: usize,
    pub compliance_updates: usize,
    pub health_migrations: usize,
    pub sweep: SweepOutcome,
    pub slices_created: usize,
    pub slices_reclaimed: usize,
    pub slice_migrations: usize,
    pub checkpointed: usize,
    pub routed: usize,
    pub still_pending: usize,
    pub errors: usize,
}

/// Runs the recurring control loop over the whole fleet.
pub struct Monitor {
    state: StateStore,
    broker: Broker,
    slices: SliceManager,
    migrate: CheckpointManager,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(state: StateStore, broker: Broker, config: MonitorConfig) -> Self {
        let slices = SliceManager::new(state.clone(), broker.config().slices.clone());
        let migrate = CheckpointManager::new(state.clone());
        Self {
            state,
            broker,
            slices,
            migrate,
            config,
        }
    }

    /// One full monitoring cycle.
    ///
    /// The grid view is materialized once up front; every decision in the
    /// cycle sees the same snapshot set. Each step and each workload is
    /// isolated: failures are counted and logged, never propagated.
    pub fn run_cycle(&self, now: u64) -> CycleReport {
        let mut report = CycleReport::default();

        let grid = match self.state.grid_view() {
            Ok(grid) => grid,
            Err(e) => {
                warn!(error = %e, "cycle aborted, could not materialize grid view");
                report.errors += 1;
                return report;
            }
        };

        // 1. Apply the latest external health reports to node records.
        match self.apply_health_reports(now) {
            Ok(count) => report.health_updates = count,
            Err(e) => {
                warn!(error = %e, "health report application failed");
                report.errors += 1;
            }
        }

        // 2. Refresh grid-derived node fields and compliance flags.
        match sync_nodes_with_grid(&self.state, &grid, &self.broker.config().compliance, now) {
            Ok(count) => report.compliance_updates = count,
            Err(e) => {
                warn!(error = %e, "grid sync failed");
                report.errors += 1;
            }
        }

        // 3. Detect regime changes and run the adaptive agent for every
        //    affected active workload.
        match detect_anomalies(&self.state, &self.config.anomaly, self.config.lookback_secs, now)
        {
            Ok(anomalies) => {
                report.anomalies = anomalies.len();
                for anomaly in &anomalies {
                    let affected = self.active_workloads_in_zone(&anomaly.zone);
                    for workload in affected {
                        let mut agent = AdaptiveAgent::new();
                        agent.handle_anomaly(&self.broker, &workload, anomaly, &grid, now);
                        report.agent_actions += 1;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "anomaly detection failed");
                report.errors += 1;
            }
        }

        // 4. Route pending async work into fresh surplus windows.
        match self.state.zones_with_surplus(now, self.config.surplus_window_secs) {
            Ok(zones) => {
                for zone in zones {
                    match self.broker.route_async_on_surplus(&zone, &grid, now) {
                        Ok(routed) => report.surplus_routed += routed,
                        Err(e) => {
                            warn!(%zone, error = %e, "surplus routing failed");
                            report.errors += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "surplus zone query failed");
                report.errors += 1;
            }
        }

        // 5. Proactively migrate off degraded/critical nodes.
        match self.broker.check_and_migrate(&grid, now) {
            Ok(migrated) => report.health_migrations = migrated,
            Err(e) => {
                warn!(error = %e, "health-triggered migration pass failed");
                report.errors += 1;
            }
        }

        // 6. Sweep running workloads for reroute triggers.
        report.sweep = self.broker.check_running(&grid, now);

        // 7. Auto-manage GPU slices; move workloads off slices that a
        //    critical node is reclaiming. A successful migration releases
        //    the slice; the freed slice is swept up on the next pass.
        let nodes = self.state.list_nodes().unwrap_or_default();
        let pricing_ctx = PricingContext::from_fleet(&nodes, now);
        match self
            .slices
            .auto_manage(&grid, &pricing_ctx, &self.broker.config().pricing, now)
        {
            Ok(slice_report) => {
                report.slices_created = slice_report.created;
                report.slices_reclaimed = slice_report.reclaimed;
                report.errors += slice_report.errors.len();
                for pending in slice_report.pending_migrations {
                    match self.broker.migrate_off_slice(
                        &pending.workload_id,
                        &pending.node_id,
                        &grid,
                        now,
                    ) {
                        Ok(true) => report.slice_migrations += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(
                                workload = %pending.workload_id,
                                error = %e,
                                "slice-reclaim migration failed"
                            );
                            report.errors += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "slice auto-manage failed");
                report.errors += 1;
            }
        }

        // 8. Checkpoint everything that is due.
        match self.migrate.checkpoint_all_due(now) {
            Ok(count) => report.checkpointed = count,
            Err(e) => {
                warn!(error = %e, "checkpoint sweep failed");
                report.errors += 1;
            }
        }

        // 9. Route the pending queue through the tiered broker.
        let (routed, still_pending) = self.broker.route_pending(&grid, now);
        report.routed = routed;
        report.still_pending = still_pending;

        info!(
            anomalies = report.anomalies,
            routed = report.routed,
            reroutes = report.sweep.triggered,
            health_migrations = report.health_migrations,
            slices_created = report.slices_created,
            checkpointed = report.checkpointed,
            errors = report.errors,
            "monitoring cycle complete"
        );
        report
    }

    /// Run the monitor loop until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.cycle_interval_secs);
        info!(interval_secs = interval.as_secs(), "monitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.run_cycle(epoch_secs());
                }
                _ = shutdown.changed() => {
                    info!("monitor shutting down");
                    break;
                }
            }
        }
    }

    // ── Internal helpers ───────────────────────────────────────────

    /// Copy the newest health report per node onto the node record.
    fn apply_health_reports(&self, now: u64) -> greengrid_state::StateResult<usize> {
        let mut updated = 0;
        for node in self.state.list_nodes()? {
            let Some(report) = self.state.latest_health_report(&node.id)? else {
                continue;
            };
            if node.health != report.health || node.last_health_check_at != Some(report.recorded_at)
            {
                self.state.update_node(&node.id, |n| {
                    n.health = report.health;
                    n.last_health_check_at = Some(report.recorded_at);
                    n.updated_at = now;
                })?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Active workloads whose current node sits in `zone`.
    fn active_workloads_in_zone(&self, zone: &Zone) -> Vec<Workload> {
        let workloads = match self.state.list_workloads() {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "could not list workloads for zone filter");
                return Vec::new();
            }
        };
        workloads
            .into_iter()
            .filter(|w| w.status.is_active())
            .filter(|w| self.workload_zone(w).as_ref() == Some(zone))
            .collect()
    }

    fn workload_zone(&self, workload: &Workload) -> Option<Zone> {
        let node_id = match (&workload.node_id, &workload.slice_id) {
            (Some(node_id), _) => Some(node_id.clone()),
            (None, Some(slice_id)) => self
                .state
                .get_slice(slice_id)
                .ok()
                .flatten()
                .map(|s| s.node_id),
            (None, None) => None,
        }?;
        self.state.get_node(&node_id).ok().flatten().map(|n| n.grid_zone)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use greengrid_broker::BrokerConfig;
    use greengrid_state::*;

    const NOW: u64 = 12 * 3600;

    fn test_node(id: &str, zone: &str) -> ComputeNode {
        ComputeNode {
            id: id.to_string(),
            name: format!("node-{id}"),
            category: NodeCategory::Datacenter,
            gpu_model: "A100".to_string(),
            vram_mb: 81_920,
            utilization: 0.1,
            status: NodeStatus::Idle,
            health: NodeHealth::Healthy,
            grid_zone: zone.to_string(),
            carbon_intensity: 100.0,
            energy_price: 40.0,
            renewable_pct: 60.0,
            always_green: false,
            green_compliant: true,
            mig_capable: false,
            active_slices: 0,
            last_health_check_at: None,
            updated_at: 1000,
        }
    }

    fn test_workload(id: &str) -> Workload {
        Workload {
            id: id.to_string(),
            name: format!("job-{id}"),
            kind: WorkloadKind::Training,
            priority: Priority::Normal,
            required_vram_mb: 10_240,
            green: GreenRequirement::Standard,
            green_only: false,
            max_carbon_intensity: None,
            budget_max_eur: None,
            estimated_duration_hours: 2.0,
            status: WorkloadStatus::Pending,
            reroute_count: 0,
            migration_count: 0,
            checkpoint_enabled: false,
            checkpoint_interval_secs: 900,
            last_checkpoint_at: None,
            checkpoint_handle: None,
            node_id: None,
            slice_id: None,
            submitted_at: 100,
            started_at: None,
            paused_at: None,
            completed_at: None,
        }
    }

    fn snapshot(zone: &str, recorded_at: u64) -> GridSnapshot {
        GridSnapshot {
            zone: zone.to_string(),
            carbon_intensity: 100.0,
            renewable_pct: 60.0,
            energy_price: 40.0,
            curtailment_mw: 0.0,
            surplus: false,
            recorded_at,
        }
    }

    fn monitor_over(state: &StateStore) -> Monitor {
        let broker = Broker::new(state.clone(), BrokerConfig::default());
        Monitor::new(state.clone(), broker, MonitorConfig::default())
    }

    #[test]
    fn empty_store_cycle_is_a_noop() {
        let state = StateStore::open_in_memory().unwrap();
        let monitor = monitor_over(&state);

        let report = monitor.run_cycle(NOW);
        assert_eq!(report, CycleReport::default());
    }

    #[test]
    fn cycle_applies_health_reports_to_nodes() {
        let state = StateStore::open_in_memory().unwrap();
        state.put_node(&test_node("n1", "FR")).unwrap();
        state
            .put_health_report(&HealthReport {
                node_id: "n1".to_string(),
                health: NodeHealth::Degraded,
                gpu_temp_c: 90.0,
                network_latency_ms: 5.0,
                gpu_errors: false,
                recorded_at: NOW - 60,
            })
            .unwrap();

        let monitor = monitor_over(&state);
        let report = monitor.run_cycle(NOW);
        assert_eq!(report.health_updates, 1);

        let node = state.get_node("n1").unwrap().unwrap();
        assert_eq!(node.health, NodeHealth::Degraded);
        assert_eq!(node.last_health_check_at, Some(NOW - 60));
    }

    #[test]
    fn cycle_routes_the_pending_queue() {
        let state = StateStore::open_in_memory().unwrap();
        state.put_node(&test_node("n1", "FR")).unwrap();
        state.put_grid_snapshot(&snapshot("FR", NOW - 100)).unwrap();
        state.put_workload(&test_workload("wl-1")).unwrap();

        let monitor = monitor_over(&state);
        let report = monitor.run_cycle(NOW);

        assert_eq!(report.routed, 1);
        assert_eq!(report.still_pending, 0);
        assert_eq!(
            state.get_workload("wl-1").unwrap().unwrap().status,
            WorkloadStatus::Running
        );
    }

    #[test]
    fn carbon_spike_drives_an_agent_reroute() {
        let state = StateStore::open_in_memory().unwrap();

        // DE carbon jumped from 100 to 160 over the lookback window.
        state.put_grid_snapshot(&snapshot("DE", NOW - 3600)).unwrap();
        let mut spiked = snapshot("DE", NOW - 100);
        spiked.carbon_intensity = 160.0;
        state.put_grid_snapshot(&spiked).unwrap();

        // Clean FR alternative.
        let mut fr = snapshot("FR", NOW - 100);
        fr.carbon_intensity = 30.0;
        fr.energy_price = 30.0;
        fr.renewable_pct = 80.0;
        state.put_grid_snapshot(&fr).unwrap();
        state.put_grid_snapshot(&snapshot("FR", NOW - 3600)).unwrap();

        let mut old = test_node("old", "DE");
        old.status = NodeStatus::Busy;
        old.utilization = 0.4;
        state.put_node(&old).unwrap();
        state.put_node(&test_node("alt", "FR")).unwrap();

        let mut wl = test_workload("wl-1");
        wl.status = WorkloadStatus::Running;
        wl.node_id = Some("old".to_string());
        wl.green = GreenRequirement::GreenPreferred;
        wl.started_at = Some(1000);
        state.put_workload(&wl).unwrap();

        let monitor = monitor_over(&state);
        let report = monitor.run_cycle(NOW);

        assert!(report.anomalies >= 1);
        assert_eq!(report.agent_actions, 1);

        let stored = state.get_workload("wl-1").unwrap().unwrap();
        assert_eq!(stored.node_id.as_deref(), Some("alt"));
        assert_eq!(stored.reroute_count, 1);
        assert_eq!(stored.status, WorkloadStatus::Running);
    }

    #[test]
    fn fresh_surplus_zone_routes_pending_async_work() {
        let state = StateStore::open_in_memory().unwrap();
        let mut es = snapshot("ES", NOW - 100);
        es.surplus = true;
        state.put_grid_snapshot(&es).unwrap();
        state.put_node(&test_node("es-1", "ES")).unwrap();

        let mut wl = test_workload("wl-async");
        wl.priority = Priority::Async;
        state.put_workload(&wl).unwrap();

        let monitor = monitor_over(&state);
        let report = monitor.run_cycle(NOW);

        assert_eq!(report.surplus_routed, 1);
        assert_eq!(
            state.get_workload("wl-async").unwrap().unwrap().status,
            WorkloadStatus::Running
        );
    }

    #[test]
    fn critical_node_slice_reclaim_migrates_the_tenant() {
        let state = StateStore::open_in_memory().unwrap();
        state.put_grid_snapshot(&snapshot("FR", NOW - 100)).unwrap();

        let mut crowded = test_node("crowded", "FR");
        crowded.mig_capable = true;
        crowded.utilization = 0.96;
        crowded.status = NodeStatus::Busy;
        state.put_node(&crowded).unwrap();

        state.put_node(&test_node("spare", "FR")).unwrap();

        state
            .put_slice(&GpuSlice {
                id: "crowded-mig-1g.10gb-0".to_string(),
                node_id: "crowded".to_string(),
                profile: SliceProfile::Mig1g10gb,
                status: SliceStatus::Allocated,
                workload_id: Some("wl-1".to_string()),
                hourly_rate_eur: 0.4,
                created_at: 500,
                allocated_at: Some(600),
                released_at: None,
            })
            .unwrap();

        let mut wl = test_workload("wl-1");
        wl.status = WorkloadStatus::Running;
        wl.slice_id = Some("crowded-mig-1g.10gb-0".to_string());
        wl.started_at = Some(1000);
        state.put_workload(&wl).unwrap();

        let monitor = monitor_over(&state);
        let report = monitor.run_cycle(NOW);
        assert_eq!(report.slice_migrations, 1);

        let stored = state.get_workload("wl-1").unwrap().unwrap();
        assert_eq!(stored.node_id.as_deref(), Some("spare"));
        assert!(stored.slice_id.is_none());
        assert!(stored.has_exclusive_assignment());

        let slice = state.get_slice("crowded-mig-1g.10gb-0").unwrap().unwrap();
        assert_eq!(slice.status, SliceStatus::Available);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let state = StateStore::open_in_memory().unwrap();
        let monitor = monitor_over(&state);

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move { monitor.run(shutdown_rx).await });

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
