//! Run lifecycle manager: owns the per-run event buffer that backs SSE
//! streaming and reconnect, independent of the executor that produced the
//! events (§4.8).
//!
//! Every event appended to a run gets a dense, monotonically increasing
//! sequence number starting at 0. A subscriber gives a `start_seq` and
//! receives every buffered event from that point on, then blocks for new
//! ones — this is what makes `Last-Event-ID` reconnect work: the client
//! hands back the last `seq` it saw and picks up exactly where it left off,
//! no gaps, no duplicates. Completed runs are kept around for a TTL so a
//! slow reconnect still finds them, then swept by a background task.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::Instant;

use crate::handle::ExecutionHandle;
use crate::workflow_service::{RunResult, WorkflowEvent};
use crate::{CoreError, Result};

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const GC_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, serde::Serialize)]
pub struct EventRecord {
    pub seq: u64,
    pub event: WorkflowEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

struct RunEntry {
    events: Vec<EventRecord>,
    status: RunStatus,
    result: Option<std::result::Result<RunResult, String>>,
    /// Fires every time a new event is appended or the run finishes, so a
    /// subscriber parked past the buffer's end wakes up instead of polling.
    wake: watch::Sender<u64>,
    finished_at: Option<Instant>,
    /// The run's suspend/resume rendezvous, so `/resume` calls can reach it
    /// regardless of which trigger (manual, webhook, cron) started the run.
    /// Cleared on completion/failure per §4.5 ("the handle is unregistered").
    handle: Option<Arc<ExecutionHandle>>,
}

impl RunEntry {
    fn new() -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            events: Vec::new(),
            status: RunStatus::Running,
            result: None,
            wake,
            finished_at: None,
            handle: None,
        }
    }
}

/// Registry of live and recently finished runs, keyed by run id.
#[derive(Clone)]
pub struct RunManager {
    runs: Arc<DashMap<String, Arc<AsyncMutex<RunEntry>>>>,
    ttl: Duration,
}

impl Default for RunManager {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl RunManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            runs: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn register(&self, run_id: impl Into<String>) {
        self.runs.insert(run_id.into(), Arc::new(AsyncMutex::new(RunEntry::new())));
    }

    pub async fn append(&self, run_id: &str, event: WorkflowEvent) -> Result<u64> {
        let entry = self.entry(run_id)?;
        let mut guard = entry.lock().await;
        let seq = guard.events.len() as u64;
        guard.events.push(EventRecord { seq, event });
        let _ = guard.wake.send(seq);
        Ok(seq)
    }

    pub async fn complete(&self, run_id: &str, result: RunResult) -> Result<()> {
        let entry = self.entry(run_id)?;
        let mut guard = entry.lock().await;
        guard.status = RunStatus::Completed;
        guard.result = Some(Ok(result));
        guard.finished_at = Some(Instant::now());
        guard.handle = None;
        let seq = guard.events.len() as u64;
        let _ = guard.wake.send(seq);
        Ok(())
    }

    pub async fn fail(&self, run_id: &str, message: String) -> Result<()> {
        let entry = self.entry(run_id)?;
        let mut guard = entry.lock().await;
        guard.status = RunStatus::Failed;
        guard.result = Some(Err(message));
        guard.finished_at = Some(Instant::now());
        guard.handle = None;
        let seq = guard.events.len() as u64;
        let _ = guard.wake.send(seq);
        Ok(())
    }

    pub async fn status(&self, run_id: &str) -> Result<RunStatus> {
        let entry = self.entry(run_id)?;
        Ok(entry.lock().await.status)
    }

    /// Records the run's execution handle so a `/resume` call addressed to
    /// this run id can find it without the caller needing to know which
    /// trigger started the run.
    pub async fn attach_handle(&self, run_id: &str, handle: Arc<ExecutionHandle>) -> Result<()> {
        let entry = self.entry(run_id)?;
        entry.lock().await.handle = Some(handle);
        Ok(())
    }

    pub async fn handle(&self, run_id: &str) -> Result<Option<Arc<ExecutionHandle>>> {
        let entry = self.entry(run_id)?;
        Ok(entry.lock().await.handle.clone())
    }

    /// Streams every buffered event from `start_seq` onward, then waits for
    /// new ones until the run finishes. Returns once the run is terminal and
    /// every event up to that point has been yielded.
    pub fn subscribe(&self, run_id: &str, start_seq: u64) -> Result<EventSubscription> {
        let entry = self.entry(run_id)?;
        Ok(EventSubscription { entry, next: start_seq })
    }

    fn entry(&self, run_id: &str) -> Result<Arc<AsyncMutex<RunEntry>>> {
        self.runs
            .get(run_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CoreError::NotFound(format!("run not found: {run_id}")))
    }

    /// Removes completed/failed runs whose `finished_at` is older than the
    /// configured TTL. Intended to run on a periodic background task.
    pub async fn gc_once(&self) {
        let mut stale = Vec::new();
        for item in self.runs.iter() {
            let guard = item.value().lock().await;
            if let Some(finished_at) = guard.finished_at {
                if finished_at.elapsed() >= self.ttl {
                    stale.push(item.key().clone());
                }
            }
        }
        for run_id in stale {
            self.runs.remove(&run_id);
        }
    }

    /// Spawns the periodic GC sweep; the returned handle keeps it alive for
    /// as long as the caller holds it.
    pub fn spawn_gc(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                manager.gc_once().await;
            }
        })
    }
}

pub struct EventSubscription {
    entry: Arc<AsyncMutex<RunEntry>>,
    next: u64,
}

impl EventSubscription {
    /// Returns the next batch of events at or after `next`, blocking until
    /// at least one is available or the run has finished with nothing left
    /// to deliver (in which case this returns an empty vec and the caller
    /// should stop).
    pub async fn next_batch(&mut self) -> Vec<EventRecord> {
        loop {
            let mut rx = {
                let guard = self.entry.lock().await;
                let batch: Vec<EventRecord> = guard
                    .events
                    .iter()
                    .skip(self.next as usize)
                    .cloned()
                    .collect();
                if !batch.is_empty() {
                    self.next += batch.len() as u64;
                    return batch;
                }
                if guard.status != RunStatus::Running {
                    return Vec::new();
                }
                guard.wake.subscribe()
            };
            if rx.changed().await.is_err() {
                return Vec::new();
            }
        }
    }

    pub async fn final_result(&self) -> Option<std::result::Result<RunResult, String>> {
        self.entry.lock().await.result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn append_assigns_dense_sequence_numbers() {
        let manager = RunManager::default();
        manager.register("run1");
        let seq0 = manager
            .append("run1", WorkflowEvent::NodeStarted { node_id: "a".into() })
            .await
            .unwrap();
        let seq1 = manager
            .append("run1", WorkflowEvent::NodeCompleted { node_id: "a".into() })
            .await
            .unwrap();
        assert_eq!((seq0, seq1), (0, 1));
    }

    #[tokio::test]
    async fn subscriber_replays_from_start_seq() {
        let manager = RunManager::default();
        manager.register("run1");
        manager
            .append("run1", WorkflowEvent::NodeStarted { node_id: "a".into() })
            .await
            .unwrap();
        manager
            .append("run1", WorkflowEvent::NodeCompleted { node_id: "a".into() })
            .await
            .unwrap();
        manager
            .complete(
                "run1",
                RunResult { state: serde_json::Map::new(), output: serde_json::Map::new() },
            )
            .await
            .unwrap();

        let mut sub = manager.subscribe("run1", 1).unwrap();
        let batch = sub.next_batch().await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].seq, 1);

        let next = sub.next_batch().await;
        assert!(next.is_empty());
        assert!(sub.final_result().await.is_some());
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let manager = RunManager::default();
        assert!(manager.status("missing").await.is_err());
        let _ = json!(null);
    }
}
