#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, TimeZone, Utc};
use outflow_core::app::{ClaimDispatcher, Completion, Projector, RetryScheduler, TickOutcome};
use outflow_core::impls::{
    InMemoryProjectionStore, InMemoryStore, SqliteProjectionStore, SqliteStore,
};
use outflow_core::ports::{CustomerStore, FixedClock, OutboxStore, ProjectionStore};
use outflow_core::{
    EventApplier, EventId, EventStatus, OutboxEvent, OutflowError, ProjectionApplier,
    RelayConfig, Result,
};

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    Sqlite,
}

pub struct Harness {
    pub clock: Arc<FixedClock>,
    pub customers: Arc<dyn CustomerStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub projection: Arc<dyn ProjectionStore>,
    pub config: RelayConfig,
    _dir: Option<tempfile::TempDir>,
}

impl Harness {
    pub fn new(backend: Backend) -> Self {
        Self::with_config(backend, RelayConfig::default())
    }

    pub fn with_config(backend: Backend, config: RelayConfig) -> Self {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        match backend {
            Backend::Memory => {
                let store = Arc::new(InMemoryStore::new(clock.clone()));
                Self {
                    clock,
                    customers: store.clone(),
                    outbox: store,
                    projection: Arc::new(InMemoryProjectionStore::new()),
                    config,
                    _dir: None,
                }
            }
            Backend::Sqlite => {
                let dir = tempfile::tempdir().unwrap();
                let store =
                    Arc::new(SqliteStore::open(dir.path().join("outflow.db"), clock.clone()).unwrap());
                let projection =
                    SqliteProjectionStore::open(dir.path().join("projection.db")).unwrap();
                Self {
                    clock,
                    customers: store.clone(),
                    outbox: store,
                    projection: Arc::new(projection),
                    config,
                    _dir: Some(dir),
                }
            }
        }
    }

    pub fn dispatcher(&self) -> ClaimDispatcher {
        ClaimDispatcher::new(self.outbox.clone(), self.clock.clone(), self.config.clone())
    }

    pub fn scheduler(&self) -> RetryScheduler {
        RetryScheduler::new(self.outbox.clone(), self.clock.clone(), self.config.clone())
    }

    pub fn projection_applier(&self) -> Arc<ProjectionApplier> {
        Arc::new(ProjectionApplier::new(self.projection.clone()))
    }

    pub fn projector(&self, applier: Arc<dyn EventApplier>) -> Projector {
        Projector::new(self.outbox.clone(), applier, self.clock.clone())
    }

    /// One dispatcher tick followed by processing of whatever it claimed.
    pub async fn step(&self, projector: &Projector) -> Result<Option<Completion>> {
        match self.dispatcher().run_once().await? {
            TickOutcome::Claimed(event) => projector.process(&event).await.map(Some),
            _ => Ok(None),
        }
    }

    /// Drive dispatcher, projector and retry scheduler on the fixed clock
    /// until nothing is left to do or `max_steps` is hit.
    pub async fn drain(&self, projector: &Projector, max_steps: usize) {
        let scheduler = self.scheduler();
        for _ in 0..max_steps {
            if self.step(projector).await.unwrap().is_some() {
                continue;
            }
            let counts = self.outbox.counts(self.config.max_retries).await.unwrap();
            if counts.is_drained() {
                return;
            }
            self.clock.advance(
                TimeDelta::from_std(self.config.retry_cooldown).unwrap() + TimeDelta::seconds(1),
            );
            scheduler.run_once().await.unwrap();
        }
    }

    pub async fn event_statuses(&self) -> Vec<EventStatus> {
        self.outbox
            .list_events()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.status)
            .collect()
    }
}

/// Wraps an applier, records successful applications in order and fails
/// chosen events a fixed number of times.
pub struct ScriptedApplier {
    inner: Arc<dyn EventApplier>,
    failures: Mutex<Vec<(EventId, u32)>>,
    always_fail: bool,
    pub applied: Mutex<Vec<EventId>>,
    pub attempts: Mutex<Vec<EventId>>,
}

impl ScriptedApplier {
    pub fn new(inner: Arc<dyn EventApplier>) -> Self {
        Self {
            inner,
            failures: Mutex::new(Vec::new()),
            always_fail: false,
            applied: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing(inner: Arc<dyn EventApplier>) -> Self {
        Self {
            always_fail: true,
            ..Self::new(inner)
        }
    }

    pub fn fail_times(self, id: EventId, times: u32) -> Self {
        self.failures.lock().unwrap().push((id, times));
        self
    }

    pub fn applied(&self) -> Vec<EventId> {
        self.applied.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, id: EventId) -> usize {
        self.attempts.lock().unwrap().iter().filter(|a| **a == id).count()
    }

    pub fn distinct_applied(&self) -> HashSet<EventId> {
        self.applied().into_iter().collect()
    }
}

#[async_trait]
impl EventApplier for ScriptedApplier {
    async fn apply(&self, event: &OutboxEvent) -> Result<()> {
        self.attempts.lock().unwrap().push(event.id);
        if self.always_fail {
            return Err(OutflowError::Handler("downstream unavailable".into()));
        }
        let scripted = {
            let mut failures = self.failures.lock().unwrap();
            match failures.iter_mut().find(|(id, left)| *id == event.id && *left > 0) {
                Some((_, left)) => {
                    *left -= 1;
                    true
                }
                None => false,
            }
        };
        if scripted {
            return Err(OutflowError::Handler("scripted failure".into()));
        }
        self.inner.apply(event).await?;
        self.applied.lock().unwrap().push(event.id);
        Ok(())
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
