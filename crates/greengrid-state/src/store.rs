//! StateStore — redb-backed state persistence for GreenGrid.
//!
//! Provides typed CRUD operations over workloads, compute nodes, GPU
//! slices, routing decisions, grid snapshots, and health reports. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).
//!
//! Node mutation goes through [`StateStore::update_node`], a
//! read-modify-write inside a single write transaction. redb serializes
//! write transactions, so two concurrent placements can never both observe
//! and claim the same free capacity.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

/// Latest grid snapshot per zone, materialized once per monitoring cycle.
///
/// Every placement and reroute decision within a cycle reads the same view,
/// so decisions cannot race against snapshot updates mid-cycle.
#[derive(Debug, Clone, Default)]
pub struct GridView {
    snapshots: HashMap<Zone, GridSnapshot>,
}

impl GridView {
    /// Build a view from raw snapshots, keeping the latest per zone.
    pub fn from_snapshots(snapshots: impl IntoIterator<Item = GridSnapshot>) -> Self {
        let mut latest: HashMap<Zone, GridSnapshot> = HashMap::new();
        for snap in snapshots {
            match latest.get(&snap.zone) {
                Some(existing) if existing.recorded_at >= snap.recorded_at => {}
                _ => {
                    latest.insert(snap.zone.clone(), snap);
                }
            }
        }
        Self { snapshots: latest }
    }

    pub fn latest(&self, zone: &str) -> Option<&GridSnapshot> {
        self.snapshots.get(zone)
    }

    pub fn surplus_in(&self, zone: &str) -> bool {
        self.latest(zone).is_some_and(|s| s.has_surplus())
    }

    pub fn zones(&self) -> impl Iterator<Item = &str> {
        self.snapshots.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(SLICES).map_err(map_err!(Table))?;
        txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        txn.open_table(GRID_SNAPSHOTS).map_err(map_err!(Table))?;
        txn.open_table(HEALTH_REPORTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Insert or update a workload.
    pub fn put_workload(&self, workload: &Workload) -> StateResult<()> {
        let value = serde_json::to_vec(workload).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            table
                .insert(workload.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a workload by ID.
    pub fn get_workload(&self, workload_id: &str) -> StateResult<Option<Workload>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        match table.get(workload_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let workload: Workload =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(workload))
            }
            None => Ok(None),
        }
    }

    /// List all workloads.
    pub fn list_workloads(&self) -> StateResult<Vec<Workload>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let workload: Workload =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(workload);
        }
        Ok(results)
    }

    /// Delete a workload by ID. Returns true if it existed.
    pub fn delete_workload(&self, workload_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            existed = table.remove(workload_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node record.
    pub fn put_node(&self, node: &ComputeNode) -> StateResult<()> {
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(node.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a node by ID.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<ComputeNode>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(node_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: ComputeNode =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List all nodes.
    pub fn list_nodes(&self) -> StateResult<Vec<ComputeNode>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: ComputeNode =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(node);
        }
        Ok(results)
    }

    /// Atomically read-modify-write a node inside one write transaction.
    ///
    /// Utilization is clamped to [0, 1] after the mutation. Returns the
    /// updated record.
    pub fn update_node<F>(&self, node_id: &str, f: F) -> StateResult<ComputeNode>
    where
        F: FnOnce(&mut ComputeNode),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut node: ComputeNode = {
                match table.get(node_id).map_err(map_err!(Read))? {
                    Some(guard) => {
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                    }
                    None => return Err(StateError::NotFound(format!("node {node_id}"))),
                }
            };
            f(&mut node);
            node.utilization = node.utilization.clamp(0.0, 1.0);
            let value = serde_json::to_vec(&node).map_err(map_err!(Serialize))?;
            table
                .insert(node_id, value.as_slice())
                .map_err(map_err!(Write))?;
            updated = node;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Delete a node by ID. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table.remove(node_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Slices ─────────────────────────────────────────────────────

    /// Insert or update a GPU slice.
    pub fn put_slice(&self, slice: &GpuSlice) -> StateResult<()> {
        let value = serde_json::to_vec(slice).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SLICES).map_err(map_err!(Table))?;
            table
                .insert(slice.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a slice by ID.
    pub fn get_slice(&self, slice_id: &str) -> StateResult<Option<GpuSlice>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SLICES).map_err(map_err!(Table))?;
        match table.get(slice_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let slice: GpuSlice =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(slice))
            }
            None => Ok(None),
        }
    }

    /// List all slices.
    pub fn list_slices(&self) -> StateResult<Vec<GpuSlice>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SLICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let slice: GpuSlice =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(slice);
        }
        Ok(results)
    }

    /// List all slices carved from a given node.
    pub fn list_slices_for_node(&self, node_id: &str) -> StateResult<Vec<GpuSlice>> {
        Ok(self
            .list_slices()?
            .into_iter()
            .filter(|s| s.node_id == node_id)
            .collect())
    }

    /// Delete a slice by ID. Returns true if it existed.
    pub fn delete_slice(&self, slice_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SLICES).map_err(map_err!(Table))?;
            existed = table.remove(slice_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Routing decisions ──────────────────────────────────────────

    /// Append a routing decision, assigning the next seq for its workload.
    ///
    /// The seq is computed and the record inserted within one write
    /// transaction, so concurrent appends for the same workload cannot
    /// collide. Returns the stored record.
    pub fn append_decision(&self, decision: RoutingDecision) -> StateResult<RoutingDecision> {
        let prefix = format!("{}:", decision.workload_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored;
        {
            let mut table = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
            let mut next_seq: u64 = 0;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                if key.value().starts_with(&prefix) {
                    next_seq += 1;
                }
            }
            let mut record = decision;
            record.seq = next_seq;
            let key = record.table_key();
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            stored = record;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    /// All decisions for a workload, in seq order.
    pub fn decisions_for_workload(&self, workload_id: &str) -> StateResult<Vec<RoutingDecision>> {
        let prefix = format!("{workload_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let decision: RoutingDecision =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(decision);
            }
        }
        Ok(results)
    }

    /// The most recent decision for a workload, if any.
    pub fn last_decision_for(&self, workload_id: &str) -> StateResult<Option<RoutingDecision>> {
        Ok(self.decisions_for_workload(workload_id)?.into_iter().last())
    }

    // ── Grid snapshots ─────────────────────────────────────────────

    /// Record a grid snapshot (written by the external feed ingester).
    pub fn put_grid_snapshot(&self, snapshot: &GridSnapshot) -> StateResult<()> {
        let key = snapshot.table_key();
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GRID_SNAPSHOTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The latest snapshot for a zone.
    pub fn latest_snapshot(&self, zone: &str) -> StateResult<Option<GridSnapshot>> {
        Ok(self.snapshots_for_zone(zone)?.into_iter().last())
    }

    /// All snapshots for a zone with `recorded_at >= since`, in time order.
    pub fn snapshot_history(&self, zone: &str, since: u64) -> StateResult<Vec<GridSnapshot>> {
        Ok(self
            .snapshots_for_zone(zone)?
            .into_iter()
            .filter(|s| s.recorded_at >= since)
            .collect())
    }

    /// The most recent snapshot for a zone at or before `cutoff`.
    ///
    /// Used by anomaly detection to compare current conditions against a
    /// baseline from a fixed lookback window.
    pub fn snapshot_at_or_before(
        &self,
        zone: &str,
        cutoff: u64,
    ) -> StateResult<Option<GridSnapshot>> {
        Ok(self
            .snapshots_for_zone(zone)?
            .into_iter()
            .filter(|s| s.recorded_at <= cutoff)
            .last())
    }

    /// Zones whose latest snapshot within `within_secs` of `now` shows a
    /// surplus window.
    pub fn zones_with_surplus(&self, now: u64, within_secs: u64) -> StateResult<Vec<Zone>> {
        let view = self.grid_view()?;
        let mut zones: Vec<Zone> = view
            .zones()
            .filter(|z| {
                view.latest(z).is_some_and(|s| {
                    s.has_surplus() && now.saturating_sub(s.recorded_at) <= within_secs
                })
            })
            .map(str::to_string)
            .collect();
        zones.sort();
        Ok(zones)
    }

    /// Materialize the latest snapshot per zone.
    pub fn grid_view(&self) -> StateResult<GridView> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GRID_SNAPSHOTS).map_err(map_err!(Table))?;
        let mut snapshots = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let snapshot: GridSnapshot =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            snapshots.push(snapshot);
        }
        Ok(GridView::from_snapshots(snapshots))
    }

    fn snapshots_for_zone(&self, zone: &str) -> StateResult<Vec<GridSnapshot>> {
        let prefix = format!("{zone}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GRID_SNAPSHOTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let snapshot: GridSnapshot =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(snapshot);
            }
        }
        Ok(results)
    }

    // ── Health reports ─────────────────────────────────────────────

    /// Record a health report for a node.
    pub fn put_health_report(&self, report: &HealthReport) -> StateResult<()> {
        let key = report.table_key();
        let value = serde_json::to_vec(report).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(HEALTH_REPORTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The most recent health report for a node, if any.
    pub fn latest_health_report(&self, node_id: &str) -> StateResult<Option<HealthReport>> {
        let prefix = format!("{node_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HEALTH_REPORTS).map_err(map_err!(Table))?;
        let mut latest = None;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let report: HealthReport =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                latest = Some(report);
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_workload(id: &str) -> Workload {
        Workload {
            id: id.to_string(),
            name: format!("job-{id}"),
            kind: WorkloadKind::Training,
            priority: Priority::Normal,
            required_vram_mb: 20_480,
            green: GreenRequirement::Standard,
            green_only: false,
            max_carbon_intensity: None,
            budget_max_eur: None,
            estimated_duration_hours: 2.0,
            status: WorkloadStatus::Pending,
            reroute_count: 0,
            migration_count: 0,
            checkpoint_enabled: true,
            checkpoint_interval_secs: 900,
            last_checkpoint_at: None,
            checkpoint_handle: None,
            node_id: None,
            slice_id: None,
            submitted_at: 1000,
            started_at: None,
            paused_at: None,
            completed_at: None,
        }
    }

    fn test_node(id: &str) -> ComputeNode {
        ComputeNode {
            id: id.to_string(),
            name: format!("node-{id}"),
            category: NodeCategory::Datacenter,
            gpu_model: "A100".to_string(),
            vram_mb: 40_960,
            utilization: 0.1,
            status: NodeStatus::Idle,
            health: NodeHealth::Healthy,
            grid_zone: "FR".to_string(),
            carbon_intensity: 60.0,
            energy_price: 45.0,
            renewable_pct: 75.0,
            always_green: false,
            green_compliant: true,
            mig_capable: true,
            active_slices: 0,
            last_health_check_at: None,
            updated_at: 1000,
        }
    }

    fn test_slice(id: &str, node_id: &str, profile: SliceProfile) -> GpuSlice {
        GpuSlice {
            id: id.to_string(),
            node_id: node_id.to_string(),
            profile,
            status: SliceStatus::Available,
            workload_id: None,
            hourly_rate_eur: 0.5,
            created_at: 1000,
            allocated_at: None,
            released_at: None,
        }
    }

    fn test_snapshot(zone: &str, recorded_at: u64) -> GridSnapshot {
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

    fn test_decision(workload_id: &str) -> RoutingDecision {
        RoutingDecision {
            workload_id: workload_id.to_string(),
            seq: 0,
            node_id: Some("n1".to_string()),
            slice_id: None,
            kind: DecisionKind::Initial,
            reason: "initial_route".to_string(),
            tier: Some(Tier::Surplus),
            score: Some(0.21),
            carbon_intensity: 100.0,
            energy_price: 40.0,
            renewable_pct: 60.0,
            migration: false,
            decided_at: 1000,
        }
    }

    // ── Workload CRUD ──────────────────────────────────────────────

    #[test]
    fn workload_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let wl = test_workload("wl-1");

        store.put_workload(&wl).unwrap();
        assert_eq!(store.get_workload("wl-1").unwrap(), Some(wl));
        assert!(store.get_workload("nope").unwrap().is_none());
    }

    #[test]
    fn workload_list_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_workload(&test_workload("wl-1")).unwrap();
        store.put_workload(&test_workload("wl-2")).unwrap();

        assert_eq!(store.list_workloads().unwrap().len(), 2);
        assert!(store.delete_workload("wl-1").unwrap());
        assert!(!store.delete_workload("wl-1").unwrap());
        assert_eq!(store.list_workloads().unwrap().len(), 1);
    }

    // ── Node CRUD ──────────────────────────────────────────────────

    #[test]
    fn node_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let node = test_node("n1");

        store.put_node(&node).unwrap();
        assert_eq!(store.get_node("n1").unwrap(), Some(node));
    }

    #[test]
    fn node_update_is_read_modify_write() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("n1")).unwrap();

        let updated = store
            .update_node("n1", |n| {
                n.utilization += 0.3;
                n.status = NodeStatus::Busy;
            })
            .unwrap();

        assert_eq!(updated.status, NodeStatus::Busy);
        assert!((updated.utilization - 0.4).abs() < 1e-9);

        let stored = store.get_node("n1").unwrap().unwrap();
        assert_eq!(stored, updated);
    }

    #[test]
    fn node_update_clamps_utilization() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("n1")).unwrap();

        let up = store.update_node("n1", |n| n.utilization = 1.7).unwrap();
        assert_eq!(up.utilization, 1.0);

        let down = store.update_node("n1", |n| n.utilization = -0.4).unwrap();
        assert_eq!(down.utilization, 0.0);
    }

    #[test]
    fn node_update_missing_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let result = store.update_node("ghost", |n| n.utilization = 0.5);
        assert!(matches!(result, Err(StateError::NotFound(_))));
    }

    // ── Slice CRUD ─────────────────────────────────────────────────

    #[test]
    fn slice_list_for_node() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_slice(&test_slice("s1", "n1", SliceProfile::Mig1g10gb))
            .unwrap();
        store
            .put_slice(&test_slice("s2", "n1", SliceProfile::Mig2g20gb))
            .unwrap();
        store
            .put_slice(&test_slice("s3", "n2", SliceProfile::Mig1g10gb))
            .unwrap();

        assert_eq!(store.list_slices_for_node("n1").unwrap().len(), 2);
        assert_eq!(store.list_slices_for_node("n2").unwrap().len(), 1);
        assert!(store.delete_slice("s1").unwrap());
        assert_eq!(store.list_slices_for_node("n1").unwrap().len(), 1);
    }

    // ── Decision log ───────────────────────────────────────────────

    #[test]
    fn decisions_get_monotonic_seq() {
        let store = StateStore::open_in_memory().unwrap();

        let d0 = store.append_decision(test_decision("wl-1")).unwrap();
        let d1 = store.append_decision(test_decision("wl-1")).unwrap();
        let other = store.append_decision(test_decision("wl-2")).unwrap();

        assert_eq!(d0.seq, 0);
        assert_eq!(d1.seq, 1);
        assert_eq!(other.seq, 0); // independent counter per workload

        let all = store.decisions_for_workload("wl-1").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].seq, 0);
        assert_eq!(all[1].seq, 1);

        let last = store.last_decision_for("wl-1").unwrap().unwrap();
        assert_eq!(last.seq, 1);
    }

    // ── Grid snapshots ─────────────────────────────────────────────

    #[test]
    fn latest_snapshot_per_zone() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_grid_snapshot(&test_snapshot("FR", 1000)).unwrap();
        store.put_grid_snapshot(&test_snapshot("FR", 2000)).unwrap();
        store.put_grid_snapshot(&test_snapshot("DE", 1500)).unwrap();

        let latest = store.latest_snapshot("FR").unwrap().unwrap();
        assert_eq!(latest.recorded_at, 2000);

        let view = store.grid_view().unwrap();
        assert_eq!(view.latest("FR").unwrap().recorded_at, 2000);
        assert_eq!(view.latest("DE").unwrap().recorded_at, 1500);
        assert!(view.latest("ES").is_none());
    }

    #[test]
    fn snapshot_history_and_lookback() {
        let store = StateStore::open_in_memory().unwrap();
        for t in [1000u64, 2000, 3000] {
            store.put_grid_snapshot(&test_snapshot("FR", t)).unwrap();
        }

        let history = store.snapshot_history("FR", 2000).unwrap();
        assert_eq!(history.len(), 2);

        let baseline = store.snapshot_at_or_before("FR", 2500).unwrap().unwrap();
        assert_eq!(baseline.recorded_at, 2000);
        assert!(store.snapshot_at_or_before("FR", 500).unwrap().is_none());
    }

    #[test]
    fn surplus_zones_are_recent_only() {
        let store = StateStore::open_in_memory().unwrap();

        let mut old_surplus = test_snapshot("ES", 1000);
        old_surplus.surplus = true;
        store.put_grid_snapshot(&old_surplus).unwrap();

        let mut fresh_surplus = test_snapshot("PT", 9800);
        fresh_surplus.curtailment_mw = 120.0;
        store.put_grid_snapshot(&fresh_surplus).unwrap();

        store.put_grid_snapshot(&test_snapshot("FR", 9900)).unwrap();

        let zones = store.zones_with_surplus(10_000, 3600).unwrap();
        assert_eq!(zones, vec!["PT".to_string()]);
    }

    #[test]
    fn grid_view_keeps_latest_per_zone() {
        let view = GridView::from_snapshots(vec![
            test_snapshot("FR", 2000),
            test_snapshot("FR", 1000),
            test_snapshot("DE", 500),
        ]);
        assert_eq!(view.latest("FR").unwrap().recorded_at, 2000);
        assert_eq!(view.zones().count(), 2);
    }

    // ── Health reports ─────────────────────────────────────────────

    #[test]
    fn latest_health_report_wins() {
        let store = StateStore::open_in_memory().unwrap();
        let mut report = HealthReport {
            node_id: "n1".to_string(),
            health: NodeHealth::Healthy,
            gpu_temp_c: 60.0,
            network_latency_ms: 4.0,
            gpu_errors: false,
            recorded_at: 1000,
        };
        store.put_health_report(&report).unwrap();

        report.recorded_at = 2000;
        report.health = NodeHealth::Degraded;
        store.put_health_report(&report).unwrap();

        let latest = store.latest_health_report("n1").unwrap().unwrap();
        assert_eq!(latest.health, NodeHealth::Degraded);
        assert!(store.latest_health_report("n2").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_workload(&test_workload("wl-1")).unwrap();
            store.put_node(&test_node("n1")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_workload("wl-1").unwrap().is_some());
        assert!(store.get_node("n1").unwrap().is_some());
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_workloads().unwrap().is_empty());
        assert!(store.list_nodes().unwrap().is_empty());
        assert!(store.list_slices().unwrap().is_empty());
        assert!(store.decisions_for_workload("any").unwrap().is_empty());
        assert!(store.latest_snapshot("FR").unwrap().is_none());
        assert!(store.grid_view().unwrap().is_empty());
        assert!(!store.delete_workload("nope").unwrap());
        assert!(!store.delete_node("nope").unwrap());
        assert!(!store.delete_slice("nope").unwrap());
    }
}
