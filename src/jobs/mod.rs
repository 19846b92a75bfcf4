//! C4: single-worker FIFO job queue.
//!
//! Mirrors the teacher's preference for explicit, narrowly-scoped locks: the
//! queue hands work to one spawned task over an mpsc channel, and every
//! [`Progress`] is mutated only by that task, behind its own mutex.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

pub type JobId = i64;

#[derive(Debug, Error)]
pub enum JobsError {
    #[error("job {0} does not exist")]
    NotFound(JobId),
    #[error("job {0} is still active")]
    JobActive(JobId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Successful,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Successful | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One step within a job's overall unit count, mirroring the original
/// daemon's step-counted progress reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CurrentStep {
    pub num: u32,
    pub num_total: u32,
    pub unit: String,
    pub desc: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub id: JobId,
    pub description: String,
    pub status: JobStatus,
    pub current_step: CurrentStep,
    pub result_code: Option<i32>,
    pub result_message: Option<String>,
}

impl Progress {
    fn new(id: JobId, description: String) -> Self {
        Self {
            id,
            description,
            status: JobStatus::Queued,
            current_step: CurrentStep::default(),
            result_code: None,
            result_message: None,
        }
    }
}

struct JobHandle {
    progress: Arc<Mutex<Progress>>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    done: Arc<Notify>,
}

/// A unit of work submitted to the queue. `run` receives a [`JobContext`]
/// through which it reports progress; it is never preempted once started.
#[async_trait::async_trait]
pub trait Job: Send + 'static {
    async fn run(self: Box<Self>, ctx: JobContext);
}

#[derive(Clone)]
pub struct JobContext {
    progress: Arc<Mutex<Progress>>,
}

impl JobContext {
    pub fn next_step(&self, num_total: u32, unit: impl Into<String>, desc: impl Into<String>) {
        let mut p = self.progress.lock().expect("lock poisoned");
        p.current_step.num += 1;
        p.current_step.num_total = num_total;
        p.current_step.unit = unit.into();
        p.current_step.desc = desc.into();
    }

    pub fn skip_to_step(&self, num: u32, desc: impl Into<String>) {
        let mut p = self.progress.lock().expect("lock poisoned");
        p.current_step.num = num;
        p.current_step.desc = desc.into();
    }

    pub fn result(&self, code: i32, message: Option<String>) {
        let mut p = self.progress.lock().expect("lock poisoned");
        p.result_code = Some(code);
        p.result_message = message;
    }
}

struct ClosureJob<F> {
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> Job for ClosureJob<F>
where
    F: FnOnce(JobContext) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    async fn run(self: Box<Self>, ctx: JobContext) {
        (self.f)(ctx).await
    }
}

/// Wraps a plain async closure as a [`Job`], so HTTP handlers don't need a
/// dedicated struct for every enqueued operation.
pub fn from_async<F, Fut>(f: F) -> Box<dyn Job>
where
    F: FnOnce(JobContext) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Box::new(ClosureJob { f })
}

enum QueueMessage {
    Run {
        id: JobId,
        job: Box<dyn Job>,
        handle: Arc<JobHandle>,
    },
}

/// The job queue. Cheap to clone; the worker task owns the receiving end.
pub struct Jobs {
    next_id: AtomicI64,
    handles: Mutex<BTreeMap<JobId, Arc<JobHandle>>>,
    sender: mpsc::UnboundedSender<QueueMessage>,
}

impl Jobs {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let jobs = Arc::new(Self {
            next_id: AtomicI64::new(1),
            handles: Mutex::new(BTreeMap::new()),
            sender,
        });
        tokio::spawn(Self::worker_loop(receiver));
        jobs
    }

    async fn worker_loop(mut receiver: mpsc::UnboundedReceiver<QueueMessage>) {
        while let Some(QueueMessage::Run { id, job, handle }) = receiver.recv().await {
            if handle.cancelled.load(Ordering::SeqCst) {
                handle.progress.lock().expect("lock poisoned").status = JobStatus::Cancelled;
                handle.done.notify_waiters();
                continue;
            }

            handle.progress.lock().expect("lock poisoned").status = JobStatus::Running;
            debug!(job_id = id, "job started");

            let ctx = JobContext {
                progress: handle.progress.clone(),
            };
            job.run(ctx).await;

            let mut progress = handle.progress.lock().expect("lock poisoned");
            if progress.status != JobStatus::Cancelled {
                progress.status = if progress.result_code == Some(0) || progress.result_code.is_none()
                {
                    JobStatus::Successful
                } else {
                    JobStatus::Failed
                };
            }
            drop(progress);
            handle.done.notify_waiters();
        }
    }

    /// Enqueues `job`, returning its strictly monotonic id.
    pub fn append(&self, job: Box<dyn Job>, description: impl Into<String>) -> JobId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let progress = Arc::new(Mutex::new(Progress::new(id, description.into())));
        let handle = Arc::new(JobHandle {
            progress,
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            done: Arc::new(Notify::new()),
        });

        self.handles
            .lock()
            .expect("lock poisoned")
            .insert(id, handle.clone());

        if self.sender.send(QueueMessage::Run { id, job, handle }).is_err() {
            warn!(job_id = id, "job queue worker is gone");
        }
        id
    }

    pub fn list_jobs(&self) -> Vec<Progress> {
        self.handles
            .lock()
            .expect("lock poisoned")
            .values()
            .map(|h| h.progress.lock().expect("lock poisoned").clone())
            .collect()
    }

    pub fn get(&self, id: JobId) -> Option<Progress> {
        self.handles
            .lock()
            .expect("lock poisoned")
            .get(&id)
            .map(|h| h.progress.lock().expect("lock poisoned").clone())
    }

    /// Only legal when the job is terminal; cancels a still-queued job.
    pub fn delete_job(&self, id: JobId) -> Result<(), JobsError> {
        let mut handles = self.handles.lock().expect("lock poisoned");
        let handle = handles.get(&id).ok_or(JobsError::NotFound(id))?;

        let status = handle.progress.lock().expect("lock poisoned").status;
        match status {
            JobStatus::Queued => {
                handle.cancelled.store(true, Ordering::SeqCst);
            }
            s if s.is_terminal() => {}
            _ => return Err(JobsError::JobActive(id)),
        }

        handles.remove(&id);
        Ok(())
    }

    /// Blocks until the job is terminal. Returns `(-1, "no such job")` if
    /// `id` never existed.
    pub async fn wait_for_job(&self, id: JobId) -> (i32, String) {
        let handle = self.handles.lock().expect("lock poisoned").get(&id).cloned();
        let Some(handle) = handle else {
            return (-1, "no such job".to_owned());
        };

        loop {
            {
                let progress = handle.progress.lock().expect("lock poisoned");
                if progress.status.is_terminal() {
                    return (
                        progress.result_code.unwrap_or(0),
                        progress
                            .result_message
                            .clone()
                            .unwrap_or_else(|| progress.status.to_string()),
                    );
                }
            }
            handle.done.notified().await;
        }
    }
}

impl Default for Jobs {
    fn default() -> Self {
        unreachable!("Jobs::new returns an Arc; use Jobs::new() instead of Default::default()")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Noop;
    #[async_trait::async_trait]
    impl Job for Noop {
        async fn run(self: Box<Self>, ctx: JobContext) {
            ctx.next_step(1, "steps", "doing the thing");
            ctx.result(0, None);
        }
    }

    struct Failing;
    #[async_trait::async_trait]
    impl Job for Failing {
        async fn run(self: Box<Self>, ctx: JobContext) {
            ctx.result(1, Some("boom".to_owned()));
        }
    }

    #[tokio::test]
    async fn jobs_run_in_fifo_order_and_report_success() {
        let jobs = Jobs::new();
        let id = jobs.append(Box::new(Noop), "noop");
        let (code, _) = jobs.wait_for_job(id).await;
        assert_eq!(code, 0);
        assert_eq!(jobs.get(id).unwrap().status, JobStatus::Successful);
    }

    #[tokio::test]
    async fn failing_job_reports_failed_status() {
        let jobs = Jobs::new();
        let id = jobs.append(Box::new(Failing), "failing");
        let (code, message) = jobs.wait_for_job(id).await;
        assert_eq!(code, 1);
        assert_eq!(message, "boom");
        assert_eq!(jobs.get(id).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn wait_for_unknown_job_returns_sentinel() {
        let jobs = Jobs::new();
        let (code, message) = jobs.wait_for_job(999).await;
        assert_eq!(code, -1);
        assert_eq!(message, "no such job");
    }

    #[tokio::test]
    async fn delete_job_rejects_running_and_accepts_terminal() {
        let jobs = Jobs::new();
        let id = jobs.append(Box::new(Noop), "noop");
        jobs.wait_for_job(id).await;
        assert!(jobs.delete_job(id).is_ok());
        assert!(jobs.get(id).is_none());
    }

    #[tokio::test]
    async fn delete_job_of_unknown_id_fails() {
        let jobs = Jobs::new();
        assert!(matches!(jobs.delete_job(42), Err(JobsError::NotFound(42))));
        let _ = Duration::from_secs(0);
    }
}
