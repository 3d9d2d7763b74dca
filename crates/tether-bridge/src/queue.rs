use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tether_core::ToolError;
use tokio::sync::oneshot;

pub const DEFAULT_RESULTS_CAPACITY: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One enqueued unit of host work.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub args: Value,
    pub created_at: DateTime<Utc>,
    done: oneshot::Sender<JobOutcome>,
}

/// Handed to the enqueuer; redeemed with [`JobQueue::wait`].
#[derive(Debug)]
pub struct Ticket {
    pub job_id: String,
    done: oneshot::Receiver<JobOutcome>,
}

/// The recorded result of a job that has run.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: String,
    pub command: String,
    pub result: Result<Value, ToolError>,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn to_json(&self) -> Value {
        let mut value = json!({
            "job_id": self.job_id,
            "command": self.command,
            "ok": self.result.is_ok(),
            "finished_at": self.finished_at,
        });
        match &self.result {
            Ok(result) => value["result"] = result.clone(),
            Err(err) => value["error"] = json!(err.to_payload()),
        }
        value
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    /// Queued or currently executing.
    Pending,
    Completed(JobOutcome),
    /// Never seen, handed to its waiter, or evicted.
    Unknown,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    in_flight: HashSet<String>,
}

/// Outcomes whose waiter had already left, oldest evicted first past capacity.
struct ResultStore {
    capacity: usize,
    entries: HashMap<String, JobOutcome>,
    order: VecDeque<String>,
}

impl ResultStore {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, outcome: JobOutcome) {
        self.order.push_back(outcome.job_id.clone());
        self.entries.insert(outcome.job_id.clone(), outcome);

        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&oldest) {
                tracing::warn!(
                    job_id = %evicted.job_id,
                    command = %evicted.command,
                    capacity = self.capacity,
                    "Evicted uncollected job result"
                );
            }
        }
    }

    fn get(&self, job_id: &str) -> Option<JobOutcome> {
        self.entries.get(job_id).cloned()
    }
}

struct Shared {
    state: Mutex<QueueState>,
    results: Mutex<ResultStore>,
}

/// Thread-safe FIFO between request handlers and the host drain loop.
///
/// Any thread may [`enqueue`](Self::enqueue); only the host's drain loop pops
/// and completes jobs. An outcome goes straight to its waiter when one is
/// still attached. Only outcomes nobody is waiting for land in the bounded
/// result store, where [`status`](Self::status) can find them later.
#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(DEFAULT_RESULTS_CAPACITY)
    }
}

impl JobQueue {
    pub fn new(results_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                results: Mutex::new(ResultStore::new(results_capacity)),
            }),
        }
    }

    pub fn enqueue(&self, command: impl Into<String>, args: Value) -> Ticket {
        let (tx, rx) = oneshot::channel();
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            command: command.into(),
            args,
            created_at: Utc::now(),
            done: tx,
        };
        let ticket = Ticket {
            job_id: job.id.clone(),
            done: rx,
        };

        let depth = {
            let mut state = lock(&self.shared.state);
            state.pending.push_back(job);
            state.pending.len()
        };
        tracing::debug!(job_id = %ticket.job_id, depth, "Job enqueued");
        ticket
    }

    /// Pop up to `max` jobs in enqueue order, marking them in flight.
    pub fn pop_batch(&self, max: usize) -> Vec<Job> {
        let mut state = lock(&self.shared.state);
        let take = max.min(state.pending.len());
        let batch: Vec<Job> = state.pending.drain(..take).collect();
        for job in &batch {
            state.in_flight.insert(job.id.clone());
        }
        batch
    }

    /// Hand a job's result to its waiter, or retain it if the waiter left.
    pub fn complete(&self, job: Job, result: Result<Value, ToolError>) {
        let Job {
            id, command, done, ..
        } = job;

        let outcome = JobOutcome {
            job_id: id.clone(),
            command,
            result,
            finished_at: Utc::now(),
        };
        // Stored before in-flight is cleared, so `status` never sees neither.
        if let Err(outcome) = done.send(outcome) {
            tracing::debug!(job_id = %id, "Job completed after its waiter left");
            lock(&self.shared.results).insert(outcome);
        }
        lock(&self.shared.state).in_flight.remove(&id);
    }

    /// Wait up to `timeout` for the job behind `ticket`.
    ///
    /// On timeout the job keeps its place (or keeps running) and its outcome
    /// stays retrievable through [`status`](Self::status).
    pub async fn wait(&self, ticket: Ticket, timeout: Duration) -> Result<Value, ToolError> {
        let Ticket { job_id, mut done } = ticket;

        match tokio::time::timeout(timeout, &mut done).await {
            Ok(Ok(outcome)) => outcome.result,
            Ok(Err(_)) => Err(ToolError::BridgeUnavailable(format!(
                "job {job_id} was dropped before it ran"
            ))),
            Err(_) => {
                // Closing makes any later send fail over to the result store;
                // an outcome that slipped in before the close is still ours.
                done.close();
                if let Ok(outcome) = done.try_recv() {
                    return outcome.result;
                }
                tracing::warn!(
                    job_id = %job_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Stopped waiting for job"
                );
                Err(ToolError::TimedOut { job_id })
            }
        }
    }

    pub fn status(&self, job_id: &str) -> JobStatus {
        // Queue state first: `complete` stores the outcome before clearing
        // in-flight, so a job is never seen as neither.
        {
            let state = lock(&self.shared.state);
            if state.in_flight.contains(job_id) || state.pending.iter().any(|j| j.id == job_id) {
                return JobStatus::Pending;
            }
        }
        match lock(&self.shared.results).get(job_id) {
            Some(outcome) => JobStatus::Completed(outcome),
            None => JobStatus::Unknown,
        }
    }

    /// Jobs waiting to be popped.
    pub fn pending_len(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }

    /// Retained outcomes of jobs whose waiter left.
    pub fn results_len(&self) -> usize {
        lock(&self.shared.results).entries.len()
    }
}
