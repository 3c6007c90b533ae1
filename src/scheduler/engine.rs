use crate::catalog::QueryCatalog;
use crate::error::SentryError;
use crate::executor::Executor;
use crate::scheduler::cadence::SchedulePlan;
use crate::scheduler::history::{self, HistoryEntry, RunStatus};
use crate::scheduler::{control, QueryState};
use crate::storage::{ResultStore, StoreError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cooperative scheduler: one coordinating loop, workers bounded by the
/// executor's slots. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: Arc<QueryCatalog>,
    plan: SchedulePlan,
    executor: Executor,
    store: ResultStore,
    tick: Duration,
    states: Mutex<HashMap<String, QueryState>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        catalog: Arc<QueryCatalog>,
        plan: SchedulePlan,
        executor: Executor,
        store: ResultStore,
        tick: Duration,
    ) -> Self {
        let states = plan
            .entries()
            .iter()
            .map(|p| (p.id.clone(), QueryState::Idle))
            .collect();
        Self {
            inner: Arc::new(Inner {
                catalog,
                plan,
                executor,
                store,
                tick: tick.max(Duration::from_millis(1)),
                states: Mutex::new(states),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Current state of a scheduled query.
    pub fn state(&self, query_id: &str) -> Option<QueryState> {
        self.inner.states().get(query_id).copied()
    }

    /// Number of queries currently holding an execution slot.
    pub fn running_count(&self) -> usize {
        self.inner
            .states()
            .values()
            .filter(|s| **s == QueryState::Running)
            .count()
    }

    /// Stop triggering. In-flight runs finish or hit their deadline.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn history(&self, query_id: &str, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        history::recent(self.inner.store.pool(), query_id, limit)
    }

    /// Main scheduler execution loop. Returns after `stop()` once in-flight
    /// runs have drained, or with the storage error that stopped it.
    pub async fn run(&self) -> Result<(), SentryError> {
        let inner = &self.inner;
        info!(
            queries = inner.plan.len(),
            max_in_flight = inner.executor.max_in_flight(),
            "Scheduler engine started"
        );

        if let Err(e) = control::clear_stop(inner.store.pool()) {
            warn!("Failed to clear stale stop request: {}", e);
        }

        let start = Instant::now();
        let mut next_due: Vec<Instant> = inner
            .plan
            .entries()
            .iter()
            .map(|p| p.cadence.first_due(start))
            .collect();

        let mut ticker = tokio::time::interval(inner.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut workers: JoinSet<Result<(), StoreError>> = JoinSet::new();
        let mut fatal: Option<StoreError> = None;

        loop {
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => break,
                Some(joined) = workers.join_next() => {
                    if let Some(e) = reap(joined) {
                        error!("Result archive unavailable, stopping scheduler: {}", e);
                        fatal.get_or_insert(e);
                        self.stop();
                    }
                }
                _ = ticker.tick() => {
                    if self.stop_requested() {
                        info!("Stop requested");
                        self.stop();
                        continue;
                    }
                    self.dispatch_due(&mut next_due, &mut workers, Instant::now());
                }
            }
        }

        info!(in_flight = workers.len(), "Scheduler stopping");
        while let Some(joined) = workers.join_next().await {
            if let Some(e) = reap(joined) {
                fatal.get_or_insert(e);
            }
        }
        info!("Scheduler stopped");

        match fatal {
            Some(e) => Err(SentryError::Storage(e)),
            None => Ok(()),
        }
    }

    fn stop_requested(&self) -> bool {
        match control::stop_requested(self.inner.store.pool()) {
            Ok(true) => {
                if let Err(e) = control::clear_stop(self.inner.store.pool()) {
                    warn!("Failed to clear stop request: {}", e);
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("Failed to read stop request: {}", e);
                false
            }
        }
    }

    fn dispatch_due(
        &self,
        next_due: &mut [Instant],
        workers: &mut JoinSet<Result<(), StoreError>>,
        now: Instant,
    ) {
        for (idx, planned) in self.inner.plan.entries().iter().enumerate() {
            if next_due[idx] > now {
                continue;
            }
            next_due[idx] = planned.cadence.next_after(next_due[idx], now);

            {
                let mut states = self.inner.states();
                let state = states.entry(planned.id.clone()).or_insert(QueryState::Idle);
                if *state != QueryState::Idle {
                    let previous = *state;
                    drop(states);
                    warn!(query=%planned.id, state=%previous, "Previous run still active, skipping trigger");
                    // Detached; the loop does not wait on history writes.
                    drop(self.inner.record(&planned.id, RunStatus::Skipped, Some(format!("previous run {}", previous)), Utc::now()));
                    continue;
                }
                *state = QueryState::Waiting;
            }

            info!(query=%planned.id, "Task due");
            let inner = self.inner.clone();
            workers.spawn(async move { inner.run_one(idx).await });
        }
    }
}

/// Logs worker panics; returns the fatal storage error if the worker hit one.
fn reap(joined: Result<Result<(), StoreError>, JoinError>) -> Option<StoreError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => {
            error!("Scheduler worker crashed: {}", e);
            None
        }
    }
}

/// Returns the query to `Idle` when dropped, whatever the exit path.
struct IdleOnDrop<'a> {
    inner: &'a Inner,
    query_id: &'a str,
}

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.inner.set_state(self.query_id, QueryState::Idle);
    }
}

impl Inner {
    fn states(&self) -> MutexGuard<'_, HashMap<String, QueryState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, query_id: &str, state: QueryState) {
        self.states().insert(query_id.to_string(), state);
    }

    /// One scheduled execution. Only a storage failure that survives the
    /// retry is returned; everything else is recorded in history.
    async fn run_one(&self, idx: usize) -> Result<(), StoreError> {
        let planned = &self.plan.entries()[idx];
        let query_id = planned.id.as_str();

        let query = match self.catalog.get(query_id) {
            Ok(q) => q,
            Err(e) => {
                self.set_state(query_id, QueryState::Idle);
                settle(self.record(query_id, RunStatus::Failed, Some(e.to_string()), Utc::now())).await;
                return Ok(());
            }
        };

        let slot = match self.executor.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                self.set_state(query_id, QueryState::Idle);
                settle(self.record(query_id, RunStatus::Failed, Some(e.to_string()), Utc::now())).await;
                return Ok(());
            }
        };
        // Declared after the slot so the state is Idle before the slot frees.
        let _idle = IdleOnDrop {
            inner: self,
            query_id,
        };
        self.set_state(query_id, QueryState::Running);

        let started_at = Utc::now();
        let result = match slot.run(query, planned.timeout).await {
            Ok(result) => result,
            Err(e) => {
                settle(self.record(query_id, RunStatus::Failed, Some(e.to_string()), started_at)).await;
                return Ok(());
            }
        };

        let summary = format!("{} rows in {} ms", result.rows().len(), result.duration().as_millis());
        let store = self.store.clone();
        let archived = tokio::task::spawn_blocking(move || store.append_with_retry(&result))
            .await
            .unwrap_or_else(|e| Err(StoreError::Corrupt(format!("archive task failed: {}", e))));

        match archived {
            Ok(()) => {
                settle(self.record(query_id, RunStatus::Succeeded, Some(summary), started_at)).await;
                Ok(())
            }
            // Another writer got there first (an ad hoc run, or a clock step).
            // Only this run is lost.
            Err(e) if e.is_out_of_order() => {
                warn!(query=%query_id, "Run not archived: {}", e);
                settle(self.record(query_id, RunStatus::Failed, Some(format!("not archived: {}", e)), started_at)).await;
                Ok(())
            }
            Err(e) => {
                settle(self.record(query_id, RunStatus::Failed, Some(format!("not archived: {}", e)), started_at)).await;
                Err(e)
            }
        }
    }

    /// Write a history entry on the blocking pool.
    fn record(
        &self,
        query_id: &str,
        status: RunStatus,
        detail: Option<String>,
        started_at: chrono::DateTime<Utc>,
    ) -> JoinHandle<()> {
        debug!(query=%query_id, %status, "Recording history");
        let entry = HistoryEntry {
            query_id: query_id.to_string(),
            status,
            detail,
            started_at,
            finished_at: Some(Utc::now()),
        };
        let pool = self.store.pool().clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = history::record(&pool, &entry) {
                error!(query=%entry.query_id, status=%entry.status, "Failed to record history: {}", e);
            }
        })
    }
}

async fn settle(write: JoinHandle<()>) {
    if let Err(e) = write.await {
        error!("History writer crashed: {}", e);
    }
}
