//! Test doubles shared by the unit tests of several modules.

use crate::alerts::AlertEngine;
use crate::board::AlertBoard;
use crate::broadcast::Broadcaster;
use crate::cache::SnapshotCache;
use crate::error::{FetchError, PersistError};
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::ingress::IngressAdapter;
use crate::persistence::PersistenceSink;
use crate::pipeline::TelemetryPipeline;
use crate::poller::PollAggregator;
use crate::providers::StatusProvider;
use crate::state::Clock;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use time::OffsetDateTime;
use time::macros::datetime;

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(datetime!(2026-03-01 10:00:00 UTC)),
        }
    }
}

impl ManualClock {
    pub fn set(&self, at: OffsetDateTime) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

/// Sink that remembers every write, or fails every write.
#[derive(Default)]
pub struct RecordingSink {
    fail: bool,
    attempts: AtomicUsize,
    writes: Mutex<Vec<(String, String, Value, OffsetDateTime)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<(String, String, Value, OffsetDateTime)> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl PersistenceSink for RecordingSink {
    async fn save(
        &self,
        device_id: &str,
        field: &str,
        value: &Value,
        recorded_at: OffsetDateTime,
    ) -> Result<(), PersistError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PersistError::WriteFailed("disk full".into()));
        }
        self.writes
            .lock()
            .push((device_id.to_string(), field.to_string(), value.clone(), recorded_at));
        Ok(())
    }
}

/// Provider answering from a per-resource script. The last queued answer
/// repeats once the queue is down to one.
pub struct ScriptedProvider {
    id: String,
    script: Mutex<HashMap<String, VecDeque<Result<Value, FetchError>>>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
        }
    }

    pub fn push_ok(&self, resource_id: &str, payload: Value) {
        self.push(resource_id, Ok(payload));
    }

    pub fn push_err(&self, resource_id: &str, err: FetchError) {
        self.push(resource_id, Err(err));
    }

    fn push(&self, resource_id: &str, answer: Result<Value, FetchError>) {
        self.script
            .lock()
            .entry(resource_id.to_string())
            .or_default()
            .push_back(answer);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self, resource_id: &str) -> usize {
        self.calls.lock().get(resource_id).copied().unwrap_or(0)
    }

    fn next_answer(&self, resource_id: &str) -> Result<Value, FetchError> {
        let mut script = self.script.lock();
        let Some(queue) = script.get_mut(resource_id) else {
            return Err(FetchError::Unreachable(format!("no script for {resource_id}")));
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(Err(FetchError::Timeout))
        } else {
            queue.front().cloned().unwrap_or(Err(FetchError::Timeout))
        }
    }
}

#[async_trait]
impl StatusProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, resource_id: &str) -> Result<Value, FetchError> {
        *self.calls.lock().entry(resource_id.to_string()).or_default() += 1;
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.next_answer(resource_id)
    }
}

/// Application state with no providers registered.
pub fn app_state(clock: Arc<ManualClock>) -> AppState {
    let broadcaster = Arc::new(Broadcaster::new(16));
    let board = Arc::new(AlertBoard::new());
    let engine = AlertEngine::new(120);
    let aggregator = PollAggregator::new(
        Arc::new(SnapshotCache::new()),
        engine,
        board.clone(),
        broadcaster.clone(),
        clock.clone(),
        Duration::from_secs(60),
        Duration::from_secs(5),
    );
    let adapter = IngressAdapter::new("deafnav/telemetry", None, clock.clone());
    let pipeline = TelemetryPipeline::new(adapter, engine, Arc::new(RecordingSink::new()), broadcaster.clone(), clock.clone());
    AppState {
        pipeline: Arc::new(pipeline),
        aggregator: Arc::new(aggregator),
        board,
        broadcaster,
        health_tracker: HealthTracker::new(),
        clock,
        shutdown: CancellationToken::new(),
    }
}
