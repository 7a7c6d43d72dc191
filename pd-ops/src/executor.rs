//! Bounded job execution.
//!
//! Every job runs behind one shared, FIFO-fair [`Semaphore`]. Once a slot is
//! held the job downloads its inputs, invokes the operation and resolves to
//! exactly one [`JobOutcome`]. The slot is returned before the report is
//! delivered, whatever the outcome.

use crate::error::PipelineError;
use crate::registry::{OperationDescriptor, OperationId, OperationRegistry};
use crate::resource::{ResourceGuard, ResourceHandle};
use futures_util::FutureExt;
use pd_channels::{ByteSource, SizeLimitExceeded};
use serde::Serialize;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(Ulid);

impl JobId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One pending input. The handle is allocated when the file event is
/// accepted; the bytes are fetched from `source` once the job holds a slot.
#[derive(Debug)]
pub struct JobInput {
    pub handle: ResourceHandle,
    /// `None` when the handle already holds the content.
    pub source: Option<Arc<dyn ByteSource>>,
}

pub struct JobRequest {
    pub job_id: JobId,
    pub session_id: String,
    pub descriptor: Arc<OperationDescriptor>,
    pub inputs: Vec<JobInput>,
    pub parameter: Option<String>,
}

impl fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secret = self.descriptor.input.parameter().is_some_and(|spec| spec.secret);
        let parameter: &dyn fmt::Debug = match &self.parameter {
            Some(_) if secret => &"<redacted>",
            other => other,
        };
        f.debug_struct("JobRequest")
            .field("job_id", &self.job_id)
            .field("session_id", &self.session_id)
            .field("operation", &self.descriptor.id)
            .field("inputs", &self.inputs)
            .field("parameter", parameter)
            .finish()
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Success(Vec<ResourceHandle>),
    Failure(PipelineError),
    Timeout(Duration),
    Cancelled,
}

impl JobOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failure(_) => "failure",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct JobReport {
    pub job_id: JobId,
    pub session_id: String,
    pub operation: OperationId,
    pub outcome: JobOutcome,
    pub queued_for: Duration,
    pub ran_for: Duration,
}

/// Awaitable result of [`JobExecutor::submit`].
pub struct JobTicket {
    job_id: JobId,
    session_id: String,
    operation: OperationId,
    rx: oneshot::Receiver<JobReport>,
}

impl JobTicket {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn wait(self) -> JobReport {
        match self.rx.await {
            Ok(report) => report,
            // Job task was torn down with the runtime.
            Err(_) => JobReport {
                job_id: self.job_id,
                session_id: self.session_id,
                operation: self.operation,
                outcome: JobOutcome::Cancelled,
                queued_for: Duration::ZERO,
                ran_for: Duration::ZERO,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub max_concurrent_jobs: usize,
    pub max_input_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExecutorStats {
    pub limit: usize,
    pub running: usize,
    pub queued: usize,
    pub peak_running: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct Counters {
    running: AtomicUsize,
    queued: AtomicUsize,
    peak_running: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &JobOutcome) {
        let counter = match outcome {
            JobOutcome::Success(_) => &self.completed,
            JobOutcome::Failure(_) => &self.failed,
            JobOutcome::Timeout(_) => &self.timed_out,
            JobOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct ExecutorInner {
    config: ExecutorConfig,
    slots: Arc<Semaphore>,
    registry: Arc<OperationRegistry>,
    guard: ResourceGuard,
    counters: Counters,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct JobExecutor {
    inner: Arc<ExecutorInner>,
}

impl JobExecutor {
    pub fn new(
        config: ExecutorConfig,
        registry: Arc<OperationRegistry>,
        guard: ResourceGuard,
    ) -> Result<Self, PipelineError> {
        if config.max_concurrent_jobs == 0 {
            return Err(PipelineError::Validation(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                config,
                slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
                registry,
                guard,
                counters: Counters::default(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.inner.registry
    }

    pub fn guard(&self) -> &ResourceGuard {
        &self.inner.guard
    }

    /// Queues the job and returns immediately.
    pub fn submit(&self, request: JobRequest) -> JobTicket {
        let (tx, rx) = oneshot::channel();
        let ticket = JobTicket {
            job_id: request.job_id,
            session_id: request.session_id.clone(),
            operation: request.descriptor.id.clone(),
            rx,
        };
        let span = tracing::info_span!(
            "job",
            job_id = %request.job_id,
            session = %request.session_id,
            operation = %request.descriptor.id,
        );
        let inner = self.inner.clone();
        inner.counters.queued.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(
            async move {
                let report = inner.execute(request).await;
                tracing::info!(
                    outcome = report.outcome.label(),
                    queued_ms = report.queued_for.as_millis() as u64,
                    ran_ms = report.ran_for.as_millis() as u64,
                    "job finished"
                );
                if tx.send(report).is_err() {
                    tracing::debug!("job report dropped; nobody is waiting");
                }
            }
            .instrument(span),
        );
        ticket
    }

    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    pub fn stats(&self) -> ExecutorStats {
        let c = &self.inner.counters;
        ExecutorStats {
            limit: self.inner.config.max_concurrent_jobs,
            running: c.running.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            peak_running: c.peak_running.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Cancels jobs still waiting for a slot. Running jobs finish normally.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl ExecutorInner {
    async fn execute(&self, request: JobRequest) -> JobReport {
        let submitted = Instant::now();
        let JobRequest {
            job_id,
            session_id,
            descriptor,
            inputs,
            parameter,
        } = request;

        let permit = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            permit = self.slots.clone().acquire_owned() => permit.ok(),
        };
        self.counters.queued.fetch_sub(1, Ordering::Relaxed);
        let queued_for = submitted.elapsed();

        let Some(permit) = permit else {
            drop(inputs);
            let outcome = JobOutcome::Cancelled;
            self.counters.record(&outcome);
            return JobReport {
                job_id,
                session_id,
                operation: descriptor.id.clone(),
                outcome,
                queued_for,
                ran_for: Duration::ZERO,
            };
        };

        let running = self.counters.running.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters
            .peak_running
            .fetch_max(running, Ordering::Relaxed);
        let started = Instant::now();
        tracing::debug!(running, "job started");

        let limit = descriptor.timeout;
        let work = AssertUnwindSafe(self.run(
            &session_id,
            &descriptor,
            &inputs,
            parameter.as_deref(),
        ))
        .catch_unwind();
        let outcome = match tokio::time::timeout(limit, work).await {
            Ok(Ok(Ok(outputs))) => JobOutcome::Success(outputs),
            Ok(Ok(Err(err))) => {
                tracing::warn!(error = %err, kind = err.kind(), "job failed");
                JobOutcome::Failure(err)
            }
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(reason = %reason, "backend panicked");
                JobOutcome::Failure(PipelineError::BackendFailure(format!(
                    "backend crashed: {reason}"
                )))
            }
            Err(_) => {
                tracing::warn!(timeout_s = limit.as_secs(), "job timed out");
                JobOutcome::Timeout(limit)
            }
        };
        let ran_for = started.elapsed();

        // Inputs go first, then the slot; only then is the outcome reported.
        drop(inputs);
        self.counters.running.fetch_sub(1, Ordering::Relaxed);
        drop(permit);
        self.counters.record(&outcome);

        JobReport {
            job_id,
            session_id,
            operation: descriptor.id.clone(),
            outcome,
            queued_for,
            ran_for,
        }
    }

    async fn run(
        &self,
        session_id: &str,
        descriptor: &OperationDescriptor,
        inputs: &[JobInput],
        parameter: Option<&str>,
    ) -> Result<Vec<ResourceHandle>, PipelineError> {
        for input in inputs {
            if let Some(source) = &input.source {
                fetch_input(source.as_ref(), input, self.config.max_input_bytes).await?;
            }
        }
        let scope = self.guard.scope(session_id);
        let handles: Vec<&ResourceHandle> = inputs.iter().map(|input| &input.handle).collect();
        let outputs = self
            .registry
            .invoke(descriptor, &handles, parameter, &scope)
            .await?;
        scope.detach(&outputs);
        Ok(outputs)
    }
}

async fn fetch_input(
    source: &dyn ByteSource,
    input: &JobInput,
    max_bytes: u64,
) -> Result<(), PipelineError> {
    match source.fetch_to(input.handle.path(), max_bytes).await {
        Ok(written) => {
            tracing::debug!(bytes = written, "input downloaded");
            Ok(())
        }
        Err(err) => match err.downcast_ref::<SizeLimitExceeded>() {
            Some(exceeded) => Err(PipelineError::ResourceExhausted {
                size: exceeded.received,
                limit: exceeded.limit,
            }),
            None => Err(PipelineError::BackendFailure(format!(
                "input download failed: {err:#}"
            ))),
        },
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
