//! State shared by both bridge server variants.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tether_core::ToolError;

use crate::host::HostHealth;
use crate::queue::{JobQueue, JobStatus};
use crate::wire::{BRIDGE_VERSION, PING_COMMAND, RESULT_COMMAND};

/// How long a server waits on a job before answering `TimedOut`.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    pub query: Duration,
    pub mutation: Duration,
    queries: HashSet<String>,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(60))
    }
}

impl TimeoutPolicy {
    pub fn new(query: Duration, mutation: Duration) -> Self {
        Self {
            query,
            mutation,
            queries: HashSet::new(),
        }
    }

    /// Mark `commands` as read-only; everything else uses the mutation wait.
    pub fn with_queries<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queries.extend(commands.into_iter().map(Into::into));
        self
    }

    pub fn timeout_for(&self, command: &str) -> Duration {
        if self.queries.contains(command) {
            self.query
        } else {
            self.mutation
        }
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

#[derive(Clone)]
pub struct BridgeState {
    queue: JobQueue,
    health: HostHealth,
    policy: Arc<TimeoutPolicy>,
    token: Option<[u8; 32]>,
}

impl BridgeState {
    pub fn new(queue: JobQueue, health: HostHealth, policy: TimeoutPolicy) -> Self {
        Self {
            queue,
            health,
            policy: Arc::new(policy),
            token: None,
        }
    }

    /// Require clients to present `token`. `None` accepts everyone.
    pub fn with_token(mut self, token: Option<&str>) -> Self {
        self.token = token.map(digest);
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn requires_token(&self) -> bool {
        self.token.is_some()
    }

    /// Short fingerprint of the expected token, safe to log.
    pub fn token_fingerprint(&self) -> Option<String> {
        self.token.map(|d| hex::encode(&d[..4]))
    }

    /// Compares digests, so the check does not short-circuit on a shared
    /// prefix of the raw token.
    pub fn authorize(&self, presented: Option<&str>) -> bool {
        match (&self.token, presented) {
            (None, _) => true,
            (Some(expected), Some(presented)) => digest(presented) == *expected,
            (Some(_), None) => false,
        }
    }

    /// Answer one call. `ping` and `job.result` are served here; any other
    /// command becomes a job for the host.
    pub async fn handle_call(&self, command: &str, args: Value) -> Result<Value, ToolError> {
        match command {
            PING_COMMAND => Ok(self.ping()),
            RESULT_COMMAND => {
                let job_id = args
                    .get("job_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ToolError::Protocol("job.result requires a string 'job_id'".into()))?;
                Ok(self.job_result(job_id))
            }
            _ => {
                let timeout = self.policy.timeout_for(command);
                let ticket = self.queue.enqueue(command, args);
                tracing::debug!(
                    job_id = %ticket.job_id,
                    command = %command,
                    timeout_ms = timeout.as_millis() as u64,
                    "Waiting on host"
                );
                self.queue.wait(ticket, timeout).await
            }
        }
    }

    /// Liveness of the bridge itself plus a view of the host. Never queued.
    pub fn ping(&self) -> Value {
        let mut host = json!(self.health.snapshot());
        host["pending"] = json!(self.queue.pending_len());
        json!({
            "pong": true,
            "version": BRIDGE_VERSION,
            "host": host,
        })
    }

    pub fn job_result(&self, job_id: &str) -> Value {
        match self.queue.status(job_id) {
            JobStatus::Completed(outcome) => json!({
                "job_id": job_id,
                "status": "completed",
                "outcome": outcome.to_json(),
            }),
            JobStatus::Pending => json!({ "job_id": job_id, "status": "pending" }),
            JobStatus::Unknown => json!({ "job_id": job_id, "status": "unknown" }),
        }
    }
}
