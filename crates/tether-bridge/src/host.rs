//! The host side of the queue: the collaborator interface, the drain loop
//! that runs jobs on the host's single thread, and host health tracking.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tether_core::ToolError;
use tether_core::registry::panic_message;

use crate::queue::{Job, JobQueue};

/// Failure reported by the host for a single command.
#[derive(Debug, Clone, PartialEq)]
pub struct HostFailure {
    pub message: String,
    pub detail: Option<Value>,
}

impl HostFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl From<HostFailure> for ToolError {
    fn from(failure: HostFailure) -> Self {
        ToolError::ToolExecution {
            message: failure.message,
            detail: failure.detail,
        }
    }
}

/// The application that actually performs commands.
///
/// `execute` is only ever called from the drain loop's thread, one call at a
/// time, and must return in bounded time.
pub trait Host: Send + 'static {
    fn execute(&mut self, command: &str, args: &Value) -> Result<Value, HostFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Idle,
    Busy,
    /// The current job has run past the execution timeout.
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentJob {
    pub job_id: String,
    pub command: String,
    pub running_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub state: HostState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_job: Option<CurrentJob>,
}

struct Running {
    job_id: String,
    command: String,
    started: Instant,
    reported: bool,
}

/// What the host thread is doing right now, readable from any thread.
#[derive(Clone)]
pub struct HostHealth {
    running: Arc<Mutex<Option<Running>>>,
    exec_timeout: Duration,
}

impl HostHealth {
    pub fn new(exec_timeout: Duration) -> Self {
        Self {
            running: Arc::new(Mutex::new(None)),
            exec_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn exec_timeout(&self) -> Duration {
        self.exec_timeout
    }

    pub fn begin(&self, job_id: &str, command: &str) {
        *self.lock() = Some(Running {
            job_id: job_id.to_string(),
            command: command.to_string(),
            started: Instant::now(),
            reported: false,
        });
    }

    /// Clear the running job and return how long it ran.
    pub fn finish(&self) -> Duration {
        let Some(running) = self.lock().take() else {
            return Duration::ZERO;
        };
        let elapsed = running.started.elapsed();
        if running.reported {
            tracing::warn!(
                job_id = %running.job_id,
                command = %running.command,
                elapsed_ms = elapsed.as_millis() as u64,
                "Stalled host job finished"
            );
        }
        elapsed
    }

    /// Current state. The first observation of a stall is logged.
    pub fn snapshot(&self) -> HealthSnapshot {
        let mut guard = self.lock();
        let Some(running) = guard.as_mut() else {
            return HealthSnapshot {
                state: HostState::Idle,
                current_job: None,
            };
        };

        let elapsed = running.started.elapsed();
        let state = if elapsed > self.exec_timeout {
            if !running.reported {
                running.reported = true;
                tracing::error!(
                    job_id = %running.job_id,
                    command = %running.command,
                    elapsed_ms = elapsed.as_millis() as u64,
                    exec_timeout_ms = self.exec_timeout.as_millis() as u64,
                    "Host job exceeded execution timeout; host is not responding"
                );
            }
            HostState::Stalled
        } else {
            HostState::Busy
        };

        HealthSnapshot {
            state,
            current_job: Some(CurrentJob {
                job_id: running.job_id.clone(),
                command: running.command.clone(),
                running_ms: elapsed.as_millis() as u64,
            }),
        }
    }
}

/// Check host health every `period` so a stall is reported even when nobody
/// pings.
pub fn spawn_watchdog(health: HostHealth, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            health.snapshot();
        }
    })
}

/// Owns the host and executes queued jobs on whichever thread calls
/// [`drain`](Self::drain).
pub struct HostRunner<H: Host> {
    host: H,
    queue: JobQueue,
    health: HostHealth,
}

impl<H: Host> HostRunner<H> {
    pub fn new(host: H, queue: JobQueue, health: HostHealth) -> Self {
        Self {
            host,
            queue,
            health,
        }
    }

    /// One tick: run up to `max_per_tick` pending jobs in FIFO order.
    /// Returns how many ran.
    ///
    /// Never panics because of a job; a panicking host command is recorded
    /// as that job's failure.
    pub fn drain(&mut self, max_per_tick: usize) -> usize {
        let batch = self.queue.pop_batch(max_per_tick);
        let count = batch.len();
        for job in batch {
            self.run(job);
        }
        count
    }

    fn run(&mut self, job: Job) {
        self.health.begin(&job.id, &job.command);

        let host = &mut self.host;
        let result = match panic::catch_unwind(AssertUnwindSafe(|| {
            host.execute(&job.command, &job.args)
        })) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(ToolError::from(failure)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(job_id = %job.id, command = %job.command, error = %message, "Host command panicked");
                Err(ToolError::execution(format!("host command panicked: {message}")))
            }
        };

        let elapsed = self.health.finish();
        tracing::debug!(
            job_id = %job.id,
            command = %job.command,
            ok = result.is_ok(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Job executed"
        );
        self.queue.complete(job, result);
    }

    pub fn host(&self) -> &H {
        &self.host
    }
}

/// A dedicated thread standing in for the host's own scheduler: it calls
/// [`HostRunner::drain`] every `tick` until shut down.
pub struct HostThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HostThread {
    pub fn spawn<H: Host>(
        mut runner: HostRunner<H>,
        tick: Duration,
        max_per_tick: usize,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("tether-host".into())
            .spawn(move || {
                tracing::info!(
                    tick_ms = tick.as_millis() as u64,
                    max_per_tick,
                    "Host drain loop started"
                );
                while !flag.load(Ordering::Acquire) {
                    runner.drain(max_per_tick);
                    std::thread::sleep(tick);
                }
                tracing::info!("Host drain loop stopped");
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop after the current tick and wait for the thread to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("Host drain thread panicked");
        }
    }
}

impl Drop for HostThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
