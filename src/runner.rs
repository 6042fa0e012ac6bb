use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use tracing::{info, warn};

use crate::concurrency::Concurrency;
use crate::config::{JobBehavior, JobFile, JobSpec};
use crate::error::TaskError;
use crate::limiter::{Limiter, LimiterStats, WeakLimiter};
use crate::trace::Trace;

/// Error a simulated job settles with when its spec says `fail`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct JobFailure(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ok,
    Failed,
    Panicked,
    Cancelled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Ok => "ok",
            JobStatus::Failed => "failed",
            JobStatus::Panicked => "panicked",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Settled result of one job, in submission order.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub concurrency: String,
    pub outcomes: Vec<JobOutcome>,
    /// Highest number of jobs observed running at once.
    pub peak_active: usize,
    pub elapsed_ms: u64,
    #[serde(skip)]
    pub stats: Option<LimiterStats>,
    #[serde(skip)]
    pub trace: Option<Trace>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == JobStatus::Ok)
            .count()
    }

    pub fn all_ok(&self) -> bool {
        self.succeeded() == self.outcomes.len()
    }
}

/// Knobs for [`execute_jobs`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Drop every still-queued job as soon as one job fails or panics.
    pub fail_fast: bool,
}

/// Shared bookkeeping between the runner and its in-flight jobs.
struct Observer {
    trace: Mutex<Trace>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    /// Set when running fail-fast. Weak, since queued jobs own the observer.
    abort_queue: Option<WeakLimiter>,
}

impl Observer {
    fn trace(&self) -> MutexGuard<'_, Trace> {
        self.trace.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks one job as running; finishing (or unwinding) records the end.
struct InFlight {
    observer: Arc<Observer>,
    job_id: String,
    success: bool,
}

impl InFlight {
    fn start(observer: &Arc<Observer>, job_id: &str) -> Self {
        let now = observer.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        observer.peak.fetch_max(now, Ordering::SeqCst);
        observer.trace().job_started(job_id, now);
        InFlight {
            observer: Arc::clone(observer),
            job_id: job_id.to_string(),
            success: false,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.observer.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.observer.trace().job_finished(&self.job_id, self.success);

        if self.success {
            return;
        }
        let limiter = self.observer.abort_queue.as_ref().and_then(WeakLimiter::upgrade);
        if let Some(limiter) = limiter {
            let dropped = limiter.clear_queue();
            if dropped > 0 {
                warn!(job = %self.job_id, dropped, "job failed; dropping queued jobs");
                self.observer.trace().queue_cleared(dropped);
            }
        }
    }
}

/// Run every job of `file` through a limiter of `concurrency` slots.
///
/// Job failures and panics are reported in the outcome list, not returned
/// as errors.
pub async fn execute_jobs(
    run_id: &str,
    file: &JobFile,
    concurrency: Concurrency,
    opts: RunOptions,
) -> Result<RunReport> {
    let started = Instant::now();
    let limiter = Limiter::with_concurrency(concurrency);
    let observer = Arc::new(Observer {
        trace: Mutex::new(Trace::new(run_id, concurrency.to_string())),
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        abort_queue: opts.fail_fast.then(|| limiter.downgrade()),
    });

    info!(
        run_id,
        jobs = file.jobs.len(),
        %concurrency,
        fail_fast = opts.fail_fast,
        "starting run"
    );

    let mut handles = Vec::with_capacity(file.jobs.len());
    for spec in &file.jobs {
        let (active, pending) = (limiter.active_count(), limiter.pending_count());
        observer.trace().job_submitted(&spec.id, active, pending);
        handles.push(limiter.submit(job_task(spec.clone(), Arc::clone(&observer))));
    }

    let settled = join_all(handles).await;

    let outcomes: Vec<JobOutcome> = file
        .jobs
        .iter()
        .zip(settled)
        .map(|(spec, res)| to_outcome(spec, res))
        .collect();

    let all_ok = outcomes.iter().all(|o| o.status == JobStatus::Ok);
    let trace = {
        let mut tr = observer.trace();
        tr.run_finished(all_ok);
        tr.clone()
    };

    let report = RunReport {
        run_id: run_id.to_string(),
        concurrency: concurrency.to_string(),
        outcomes,
        peak_active: observer.peak.load(Ordering::SeqCst),
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        stats: Some(limiter.stats()),
        trace: Some(trace),
    };

    info!(
        run_id,
        succeeded = report.succeeded(),
        total = report.outcomes.len(),
        peak_active = report.peak_active,
        "run finished"
    );
    Ok(report)
}

/// Build the deferred task for one job spec.
fn job_task(
    spec: JobSpec,
    observer: Arc<Observer>,
) -> impl FnOnce() -> BoxFuture<'static, Result<String, JobFailure>> + Send + 'static {
    move || -> BoxFuture<'static, Result<String, JobFailure>> {
        let running = InFlight::start(&observer, &spec.id);
        if spec.behavior() == JobBehavior::Panic {
            panic!("job '{}' panicked on start", spec.id);
        }

        Box::pin(async move {
            // Bind the whole guard so it lives until the job settles.
            let mut running = running;
            if spec.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(spec.delay_ms)).await;
            }
            let result = match &spec.fail {
                Some(msg) => Err(JobFailure(msg.clone())),
                None => Ok(spec.success_value()),
            };
            running.success = result.is_ok();
            result
        })
    }
}

fn to_outcome(spec: &JobSpec, res: Result<String, TaskError<JobFailure>>) -> JobOutcome {
    let (status, value, error) = match res {
        Ok(v) => (JobStatus::Ok, Some(v), None),
        Err(TaskError::Failed(e)) => (JobStatus::Failed, None, Some(e.to_string())),
        Err(TaskError::Panicked(msg)) => (JobStatus::Panicked, None, Some(msg)),
        Err(TaskError::Cancelled) => (JobStatus::Cancelled, None, None),
    };
    JobOutcome {
        id: spec.id.clone(),
        status,
        value,
        error,
    }
}
