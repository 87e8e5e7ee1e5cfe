/**
 * POLL AGGREGATOR - Cached, single-flight polling of transit status providers
 *
 * ROLE :
 * Fetches elevator and vehicle status, keeps the last good snapshot per
 * (provider, resource), and turns snapshot transitions into alerts.
 *
 * OPERATION :
 * - refresh : fresh cache hit returns without I/O; otherwise one fetch per key
 *   at a time (concurrent callers wait on the per-key gate, then re-read the cache)
 * - failure : snapshot untouched, FetchError returned, next cycle retries
 * - success : snapshot stored (a late older fetch never overwrites a newer one),
 *   diffed against the previous one, alert board updated, the alerts that
 *   changed the board pushed
 * - scheduler : fixed interval over the configured resource set, one failing
 *   resource never aborts the cycle
 */

use crate::alerts::{AlertEngine, AlertInput, ElevatorDiff, VehicleDiff, VehicleState, vehicle_list};
use crate::board::AlertBoard;
use crate::broadcast::{Accessibility, ArrivalUpdate, Broadcaster, PushEvent, TransitUpdate};
use crate::cache::{SnapshotCache, StoreOutcome};
use crate::config::FocusStation;
use crate::error::FetchError;
use crate::models::{AlertKind, ProviderKey, ProviderSnapshot};
use crate::providers::{ProviderKind, StatusProvider};
use crate::state::SharedClock;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type GateMap = Mutex<HashMap<ProviderKey, Arc<tokio::sync::Mutex<()>>>>;

/// Hold on a per-key fetch gate. The map entry goes away with the last holder,
/// so resource ids that are asked for once do not pile up.
struct GateLease<'a> {
    gates: &'a GateMap,
    key: ProviderKey,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for GateLease<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.lock();
        // map entry + this lease
        if Arc::strong_count(&self.gate) == 2
            && gates.get(&self.key).is_some_and(|g| Arc::ptr_eq(g, &self.gate))
        {
            gates.remove(&self.key);
        }
    }
}

struct RegisteredProvider {
    kind: ProviderKind,
    provider: Arc<dyn StatusProvider>,
}

pub struct PollAggregator {
    providers: HashMap<String, RegisteredProvider>,
    cache: Arc<SnapshotCache>,
    engine: AlertEngine,
    board: Arc<AlertBoard>,
    broadcaster: Arc<Broadcaster>,
    clock: SharedClock,
    ttl: Duration,
    fetch_timeout: Duration,
    focus: Option<FocusStation>,
    gates: GateMap,
}

impl PollAggregator {
    pub fn new(
        cache: Arc<SnapshotCache>,
        engine: AlertEngine,
        board: Arc<AlertBoard>,
        broadcaster: Arc<Broadcaster>,
        clock: SharedClock,
        ttl: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            providers: HashMap::new(),
            cache,
            engine,
            board,
            broadcaster,
            clock,
            ttl,
            fetch_timeout,
            focus: None,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_provider(mut self, kind: ProviderKind, provider: Arc<dyn StatusProvider>) -> Self {
        let id = provider.id().to_string();
        self.providers.insert(id, RegisteredProvider { kind, provider });
        self
    }

    pub fn with_focus(mut self, focus: Option<FocusStation>) -> Self {
        self.focus = focus;
        self
    }

    pub fn has_provider(&self, provider_id: &str) -> bool {
        self.providers.contains_key(provider_id)
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    fn lease_gate(&self, key: &ProviderKey) -> GateLease<'_> {
        let gate = self.gates.lock().entry(key.clone()).or_default().clone();
        GateLease {
            gates: &self.gates,
            key: key.clone(),
            gate,
        }
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates.lock().len()
    }

    pub async fn refresh(&self, provider_id: &str, resource_id: &str) -> Result<Arc<ProviderSnapshot>, FetchError> {
        let registered = self
            .providers
            .get(provider_id)
            .ok_or_else(|| FetchError::UnknownProvider(provider_id.to_string()))?;
        let key = ProviderKey::new(provider_id, resource_id);

        if let Some(hit) = self.cache.get_fresh(&key, self.ttl, self.clock.now()) {
            return Ok(hit);
        }

        // locals drop in reverse order: the guard goes before the lease
        let lease = self.lease_gate(&key);
        let _inflight = lease.gate.clone().lock_owned().await;

        // whoever held the gate before us may have refreshed the entry
        if let Some(hit) = self.cache.get_fresh(&key, self.ttl, self.clock.now()) {
            return Ok(hit);
        }

        let started_at = self.clock.now();
        let payload = match tokio::time::timeout(self.fetch_timeout, registered.provider.fetch(resource_id)).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                warn!("[poll] {key} fetch failed: {e}, keeping last snapshot");
                return Err(e);
            }
            Err(_) => {
                warn!("[poll] {key} fetch timed out after {:?}, keeping last snapshot", self.fetch_timeout);
                return Err(FetchError::Timeout);
            }
        };

        let snapshot = Arc::new(ProviderSnapshot {
            key: key.clone(),
            payload,
            fetched_at: started_at,
        });

        match self.cache.store(snapshot.clone()) {
            StoreOutcome::Stored { previous } => {
                debug!("[poll] {key} snapshot stored");
                self.dispatch_transitions(registered.kind, previous.as_deref(), &snapshot);
                Ok(snapshot)
            }
            StoreOutcome::Superseded { current } => {
                debug!("[poll] {key} fetch superseded by a newer snapshot");
                Ok(current)
            }
        }
    }

    fn dispatch_transitions(&self, kind: ProviderKind, previous: Option<&ProviderSnapshot>, current: &ProviderSnapshot) {
        let now = self.clock.now();
        let resource_id = current.key.resource_id.as_str();

        let alerts = match kind {
            ProviderKind::Elevators => {
                let diff = ElevatorDiff::between(resource_id, previous.map(|p| &p.payload), &current.payload);
                self.engine.evaluate(AlertInput::Elevators(&diff), now)
            }
            ProviderKind::Vehicles => {
                let diff = VehicleDiff {
                    route_id: resource_id.to_string(),
                    previous: previous.map(|p| VehicleState::from_payload(&p.payload)),
                    current: VehicleState::from_payload(&current.payload),
                    notice_active: self.board.is_active(AlertKind::DelayNotice, resource_id),
                };
                self.engine.evaluate(AlertInput::Vehicles(&diff), now)
            }
        };

        for alert in &alerts {
            info!("[alert] {:?} {:?} {}: {}", alert.kind, alert.status, alert.subject_id, alert.message);
        }
        let effective = self.board.apply(resource_id, &alerts);
        let changed = !effective.is_empty();
        for alert in effective {
            self.broadcaster.emit(PushEvent::Alert(alert), None);
        }
        if changed {
            self.broadcaster.emit(
                PushEvent::TransitUpdate(TransitUpdate {
                    announcements: self.board.active(),
                    timestamp: now,
                }),
                None,
            );
        }

        if kind == ProviderKind::Elevators {
            if let Some(update) = self.arrival_update(resource_id) {
                self.broadcaster.emit(PushEvent::ArrivalUpdate(update), None);
            }
        }
    }

    /// Focus-station card: accessibility from the board, ETA from the first
    /// vehicle of any cached route that carries one.
    fn arrival_update(&self, line_id: &str) -> Option<ArrivalUpdate> {
        let focus = self.focus.as_ref().filter(|f| f.line_id == line_id)?;
        let accessibility = if self.board.station_has_outage(&focus.station) {
            Accessibility::Warning
        } else {
            Accessibility::Clear
        };
        let (eta_minutes, distance) = self
            .cache
            .snapshots_for(crate::models::VEHICLES_PROVIDER)
            .iter()
            .flat_map(|s| vehicle_list(&s.payload).to_vec())
            .find_map(|v| {
                let eta = number_field(&v, &["eta_minutes", "btime2"])?;
                Some((Some(eta), number_field(&v, &["distance", "distance_km"])))
            })
            .unwrap_or((None, None));

        Some(ArrivalUpdate {
            station: focus.station.clone(),
            line: focus.line.clone(),
            direction: focus.direction.clone(),
            eta_minutes,
            distance,
            accessibility,
        })
    }

    /// One pass over `resources`; failures are logged inside `refresh`.
    pub async fn run_cycle(&self, resources: &[ProviderKey]) -> usize {
        let mut refreshed = 0;
        for key in resources {
            match self.refresh(&key.provider_id, &key.resource_id).await {
                Ok(_) => refreshed += 1,
                Err(e) => debug!("[poll] cycle continues past {key}: {e}"),
            }
        }
        refreshed
    }

    /// Polls until `shutdown` fires. A cycle already running is allowed to
    /// finish; the caller bounds that with its grace period.
    pub fn spawn_scheduler(
        self: Arc<Self>,
        resources: Vec<ProviderKey>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        info!("[poll] scheduler started: {} resources every {:?}", resources.len(), interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let refreshed = self.run_cycle(&resources).await;
                debug!("[poll] cycle done: {refreshed}/{} refreshed", resources.len());
            }
            info!("[poll] scheduler stopped");
        })
    }
}

fn number_field(v: &Value, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|n| match v.get(*n)? {
        Value::Number(num) => num.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertStatus, ELEVATORS_PROVIDER, VEHICLES_PROVIDER};
    use crate::state::Clock;
    use crate::test_support::{ManualClock, ScriptedProvider};
    use serde_json::json;

    struct Fixture {
        aggregator: Arc<PollAggregator>,
        elevators: Arc<ScriptedProvider>,
        vehicles: Arc<ScriptedProvider>,
        clock: Arc<ManualClock>,
        board: Arc<AlertBoard>,
        broadcaster: Arc<Broadcaster>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let elevators = Arc::new(ScriptedProvider::new(ELEVATORS_PROVIDER));
        let vehicles = Arc::new(ScriptedProvider::new(VEHICLES_PROVIDER));
        let board = Arc::new(AlertBoard::new());
        let broadcaster = Arc::new(Broadcaster::new(64));
        let aggregator = PollAggregator::new(
            Arc::new(SnapshotCache::new()),
            AlertEngine::new(120),
            board.clone(),
            broadcaster.clone(),
            clock.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .with_provider(ProviderKind::Elevators, elevators.clone())
        .with_provider(ProviderKind::Vehicles, vehicles.clone())
        .with_focus(Some(FocusStation {
            line_id: "2".into(),
            station: "Syntagma".into(),
            line: "Line 2 (Red)".into(),
            direction: "Elliniko".into(),
        }));
        Fixture {
            aggregator: Arc::new(aggregator),
            elevators,
            vehicles,
            clock,
            board,
            broadcaster,
        }
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<PushEvent>) -> Vec<PushEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn outages(events: &[PushEvent]) -> Vec<&crate::models::AlertEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                PushEvent::Alert(a) if a.kind == AlertKind::EquipmentOutage => Some(a),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_elevator_outage_scenario() {
        let f = fixture();
        let (_, mut rx) = f.broadcaster.open_channel(None);
        f.elevators.push_ok("L2-station-A", json!({"isWorking": 1}));
        f.elevators.push_ok("L2-station-A", json!({"isWorking": 0}));

        f.aggregator.refresh(ELEVATORS_PROVIDER, "L2-station-A").await.unwrap();
        assert!(outages(&drain(&mut rx)).is_empty());

        f.clock.advance(Duration::from_secs(61));
        let second = f.aggregator.refresh(ELEVATORS_PROVIDER, "L2-station-A").await.unwrap();
        assert_eq!(second.payload, json!({"isWorking": 0}));
        let events = drain(&mut rx);
        let alerts = outages(&events);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].subject_id, "L2-station-A");
        assert!(events.iter().any(|e| e.name() == "transit_update"));

        // within TTL of the second fetch: cached, no provider call
        f.clock.advance(Duration::from_secs(30));
        let third = f.aggregator.refresh(ELEVATORS_PROVIDER, "L2-station-A").await.unwrap();
        assert_eq!(third.payload, json!({"isWorking": 0}));
        assert_eq!(f.elevators.calls("L2-station-A"), 2);
        assert!(outages(&drain(&mut rx)).is_empty());
    }

    #[tokio::test]
    async fn test_cached_within_ttl() {
        let f = fixture();
        f.elevators.push_ok("2", json!([]));
        for _ in 0..5 {
            f.aggregator.refresh(ELEVATORS_PROVIDER, "2").await.unwrap();
            f.clock.advance(Duration::from_secs(10));
        }
        assert_eq!(f.elevators.calls("2"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_single_flight() {
        let f = fixture();
        f.vehicles.set_delay(Duration::from_millis(50));
        f.vehicles.push_ok("2045", json!([{"VEH_NO": "1"}]));
        f.vehicles.push_ok("2045", json!([{"VEH_NO": "2"}]));

        let (a, b) = tokio::join!(
            f.aggregator.refresh(VEHICLES_PROVIDER, "2045"),
            f.aggregator.refresh(VEHICLES_PROVIDER, "2045"),
        );
        assert_eq!(a.unwrap().payload, b.unwrap().payload);
        assert_eq!(f.vehicles.calls("2045"), 1);
    }

    #[tokio::test]
    async fn test_gates_released_after_refresh() {
        let f = fixture();
        for route in 0..50 {
            f.vehicles.push_ok(&route.to_string(), json!([]));
            f.aggregator.refresh(VEHICLES_PROVIDER, &route.to_string()).await.unwrap();
        }
        f.vehicles.push_err("x", FetchError::BadStatus(404));
        f.aggregator.refresh(VEHICLES_PROVIDER, "x").await.unwrap_err();
        assert_eq!(f.aggregator.gate_count(), 0);

        f.vehicles.set_delay(Duration::from_millis(20));
        f.vehicles.push_ok("2045", json!([]));
        let (a, b, c) = tokio::join!(
            f.aggregator.refresh(VEHICLES_PROVIDER, "2045"),
            f.aggregator.refresh(VEHICLES_PROVIDER, "2045"),
            f.aggregator.refresh(VEHICLES_PROVIDER, "2045"),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(f.vehicles.calls("2045"), 1);
        assert_eq!(f.aggregator.gate_count(), 0);
    }

    #[tokio::test]
    async fn test_interchange_outage_raised_once_and_held_by_both_lines() {
        let f = fixture();
        let (_, mut rx) = f.broadcaster.open_channel(None);
        let broken = json!([{"station_name": "Syntagma", "elevators": [{"name": "E1", "isWorking": 0}]}]);
        let working = json!([{"station_name": "Syntagma", "elevators": [{"name": "E1", "isWorking": 1}]}]);
        f.elevators.push_ok("2", broken.clone());
        f.elevators.push_ok("2", working.clone());
        f.elevators.push_ok("3", broken);
        f.elevators.push_ok("3", working);

        f.aggregator.refresh(ELEVATORS_PROVIDER, "2").await.unwrap();
        f.aggregator.refresh(ELEVATORS_PROVIDER, "3").await.unwrap();
        let events = drain(&mut rx);
        let raised = outages(&events);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].subject_id, "Syntagma/E1");

        // line 3 sees it fixed, line 2 still reports it broken
        f.clock.advance(Duration::from_secs(61));
        f.aggregator.refresh(ELEVATORS_PROVIDER, "3").await.unwrap();
        assert!(outages(&drain(&mut rx)).is_empty());
        assert!(f.board.is_active(AlertKind::EquipmentOutage, "Syntagma/E1"));
        assert!(f.board.station_has_outage("Syntagma"));

        f.aggregator.refresh(ELEVATORS_PROVIDER, "2").await.unwrap();
        let events = drain(&mut rx);
        let resolved = outages(&events);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].status, AlertStatus::Resolved);
        assert!(f.board.is_empty());
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_snapshot() {
        let f = fixture();
        f.elevators.push_ok("1", json!([{"station_name": "A", "elevators": [{"name": "E1", "isWorking": 1}]}]));
        f.elevators.push_err("1", FetchError::BadStatus(503));
        f.aggregator.refresh(ELEVATORS_PROVIDER, "1").await.unwrap();

        f.clock.advance(Duration::from_secs(120));
        let err = f.aggregator.refresh(ELEVATORS_PROVIDER, "1").await.unwrap_err();
        assert_eq!(err, FetchError::BadStatus(503));
        let kept = f.aggregator.cache().get(&ProviderKey::new(ELEVATORS_PROVIDER, "1")).unwrap();
        assert_eq!(kept.payload[0]["station_name"], "A");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let f = fixture();
        f.vehicles.set_delay(Duration::from_secs(30));
        f.vehicles.push_ok("2045", json!([]));
        let err = f.aggregator.refresh(VEHICLES_PROVIDER, "2045").await.unwrap_err();
        assert_eq!(err, FetchError::Timeout);
        assert!(f.aggregator.cache().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let f = fixture();
        let err = f.aggregator.refresh("weather", "athens").await.unwrap_err();
        assert_eq!(err, FetchError::UnknownProvider("weather".into()));
    }

    #[tokio::test]
    async fn test_cycle_continues_past_failures() {
        let f = fixture();
        f.elevators.push_err("1", FetchError::Unreachable("dns".into()));
        f.elevators.push_ok("2", json!([]));
        f.elevators.push_ok("3", json!([]));
        let resources: Vec<_> = ["1", "2", "3"].iter().map(|r| ProviderKey::new(ELEVATORS_PROVIDER, *r)).collect();
        assert_eq!(f.aggregator.run_cycle(&resources).await, 2);
        assert_eq!(f.aggregator.cache().len(), 2);
    }

    #[tokio::test]
    async fn test_outage_resolution_restores_all_clear() {
        let f = fixture();
        f.elevators.push_ok("L2-station-A", json!({"isWorking": 0}));
        f.elevators.push_ok("L2-station-A", json!({"isWorking": 1}));

        f.aggregator.refresh(ELEVATORS_PROVIDER, "L2-station-A").await.unwrap();
        assert!(f.board.is_active(AlertKind::EquipmentOutage, "L2-station-A"));

        f.clock.advance(Duration::from_secs(61));
        f.aggregator.refresh(ELEVATORS_PROVIDER, "L2-station-A").await.unwrap();
        let list = f.board.announcements(f.clock.now());
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].content, crate::board::ALL_CLEAR_MESSAGE);
    }

    #[tokio::test]
    async fn test_delay_notice_from_vehicle_feed() {
        let f = fixture();
        let (_, mut rx) = f.broadcaster.open_channel(None);
        f.vehicles.push_ok("2045", json!([{"VEH_NO": "1"}, {"VEH_NO": "2"}]));
        f.vehicles.push_ok("2045", json!(null));
        f.vehicles.push_ok("2045", json!([]));
        f.vehicles.push_ok("2045", json!([{"VEH_NO": "3"}]));

        let mut statuses = Vec::new();
        for _ in 0..4 {
            f.aggregator.refresh(VEHICLES_PROVIDER, "2045").await.unwrap();
            f.clock.advance(Duration::from_secs(61));
            for e in drain(&mut rx) {
                if let PushEvent::Alert(a) = e {
                    assert_eq!(a.kind, AlertKind::DelayNotice);
                    statuses.push(a.status);
                }
            }
        }
        assert_eq!(statuses, vec![AlertStatus::Active, AlertStatus::Resolved]);
    }

    #[tokio::test]
    async fn test_arrival_update_for_focus_line() {
        let f = fixture();
        let (_, mut rx) = f.broadcaster.open_channel(None);
        f.elevators.push_ok(
            "2",
            json!([{"station_name": "Syntagma", "elevators": [{"name": "E1", "isWorking": 0}]}]),
        );
        f.elevators.push_ok("3", json!([]));
        f.aggregator.refresh(ELEVATORS_PROVIDER, "2").await.unwrap();
        f.aggregator.refresh(ELEVATORS_PROVIDER, "3").await.unwrap();

        let arrivals: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                PushEvent::ArrivalUpdate(u) => Some(u),
                _ => None,
            })
            .collect();
        assert_eq!(arrivals.len(), 1);
        assert_eq!(arrivals[0].station, "Syntagma");
        assert_eq!(arrivals[0].accessibility, Accessibility::Warning);
        assert_eq!(arrivals[0].eta_minutes, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_stops_on_shutdown() {
        let f = fixture();
        f.elevators.push_ok("2", json!([]));
        let token = CancellationToken::new();
        let handle = f.aggregator.clone().spawn_scheduler(
            vec![ProviderKey::new(ELEVATORS_PROVIDER, "2")],
            Duration::from_secs(60),
            token.clone(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.elevators.calls("2"), 1);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
