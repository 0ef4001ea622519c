//! Job-queue invocation.
//!
//! [`QueueInvoker`] turns every dispatch into a job on a named queue instead
//! of calling the destination in place. A [`QueueWorker`] owns the receiving
//! end of one queue and runs its jobs against a shared [`Router`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::message::Message;

use super::{Invoker, Router, RouterError};

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(500);

/// Where and how a node's jobs run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub queue: String,
    /// Per-job limit; `None` waits forever.
    pub timeout: Option<Duration>,
    /// How long a finished job's record is kept.
    pub result_ttl: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            timeout: None,
            result_ttl: DEFAULT_RESULT_TTL,
        }
    }
}

impl QueueOptions {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
    /// The worker stopped waiting. The node body keeps running in the
    /// background; whatever it dispatches is still enqueued, its own result
    /// is discarded.
    TimedOut,
}

impl JobStatus {
    pub fn is_done(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub queue: String,
    pub origin: String,
    pub destination: String,
    pub status: JobStatus,
    pub produced: Vec<Message>,
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub result_ttl: Duration,
}

impl JobRecord {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        let Some(ended) = self.ended_at else {
            return false;
        };
        chrono::Duration::from_std(self.result_ttl)
            .ok()
            .and_then(|ttl| ended.checked_add_signed(ttl))
            .is_some_and(|expiry| expiry <= now)
    }
}

#[derive(Debug)]
struct Job {
    id: Uuid,
    destination: String,
    message: Message,
    timeout: Option<Duration>,
}

type JobTable = Arc<DashMap<Uuid, JobRecord>>;

/// Enqueues each dispatch as a job on the destination's queue.
#[derive(Debug, Default)]
pub struct QueueInvoker {
    defaults: QueueOptions,
    options: DashMap<String, QueueOptions>,
    queues: DashMap<String, UnboundedSender<Job>>,
    jobs: JobTable,
}

impl QueueInvoker {
    pub fn new(defaults: QueueOptions) -> Self {
        Self {
            defaults,
            ..Default::default()
        }
    }

    /// Override the queue options for jobs addressed to `node`.
    pub fn set_options(&self, node: &str, options: QueueOptions) {
        self.options.insert(node.to_string(), options);
    }

    pub fn options_for(&self, node: &str) -> QueueOptions {
        self.options
            .get(node)
            .map(|o| o.clone())
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Open `queue` and return the worker that drains it.
    ///
    /// Opening a queue twice replaces the earlier worker's sender, so the
    /// earlier worker stops once its backlog is empty.
    pub fn worker(&self, queue: &str) -> QueueWorker {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.queues.insert(queue.to_string(), tx).is_some() {
            warn!("queue \"{}\" reopened, the previous worker will stop", queue);
        }
        QueueWorker {
            queue: queue.to_string(),
            receiver: rx,
            jobs: self.jobs.clone(),
        }
    }

    /// Stop accepting jobs for `queue`. Its worker finishes the backlog and exits.
    pub fn close(&self, queue: &str) {
        self.queues.remove(queue);
    }

    pub fn job(&self, id: &Uuid) -> Option<JobRecord> {
        self.jobs.get(id).map(|j| j.clone())
    }

    /// Every retained job, oldest first.
    pub fn jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by_key(|j| j.enqueued_at);
        jobs
    }

    pub fn pending(&self) -> usize {
        self.jobs.iter().filter(|j| !j.status.is_done()).count()
    }

    /// Wait until no job is queued or running, or `limit` passes.
    /// Returns whether the queues went idle.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let poll = async {
            while self.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(limit, poll).await.is_ok()
    }

    pub fn purge_expired(&self) -> usize {
        purge_expired(&self.jobs)
    }
}

impl Invoker for QueueInvoker {
    fn invoke(
        &self,
        _router: &Router,
        origin: &str,
        destination: &str,
        message: Message,
    ) -> Result<(), RouterError> {
        let options = self.options_for(destination);
        let sender = self
            .queues
            .get(&options.queue)
            .map(|s| s.clone())
            .ok_or_else(|| {
                RouterError::Enqueue(format!("no worker is listening on \"{}\"", options.queue))
            })?;

        let id = Uuid::new_v4();
        self.jobs.insert(
            id,
            JobRecord {
                id,
                queue: options.queue.clone(),
                origin: origin.to_string(),
                destination: destination.to_string(),
                status: JobStatus::Queued,
                produced: Vec::new(),
                error: None,
                enqueued_at: Utc::now(),
                ended_at: None,
                result_ttl: options.result_ttl,
            },
        );

        let job = Job {
            id,
            destination: destination.to_string(),
            message,
            timeout: options.timeout,
        };
        if sender.send(job).is_err() {
            self.jobs.remove(&id);
            return Err(RouterError::Enqueue(format!(
                "queue \"{}\" is closed",
                options.queue
            )));
        }

        debug!("enqueued {} on \"{}\" for \"{}\"", id, options.queue, destination);
        Ok(())
    }
}

fn purge_expired(jobs: &DashMap<Uuid, JobRecord>) -> usize {
    let now = Utc::now();
    let before = jobs.len();
    jobs.retain(|_, job| !job.expired(now));
    before - jobs.len()
}

fn finish(
    jobs: &DashMap<Uuid, JobRecord>,
    id: &Uuid,
    status: JobStatus,
    outcome: Result<Vec<Message>, String>,
) {
    if let Some(mut job) = jobs.get_mut(id) {
        job.status = status;
        job.ended_at = Some(Utc::now());
        match outcome {
            Ok(produced) => job.produced = produced,
            Err(err) => job.error = Some(err),
        }
    }
}

/// Drains one queue. Jobs start one at a time; a timed-out job is left
/// running on the blocking pool while the next one starts.
#[derive(Debug)]
pub struct QueueWorker {
    queue: String,
    receiver: UnboundedReceiver<Job>,
    jobs: JobTable,
}

impl QueueWorker {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Run jobs until the queue is closed and its backlog is empty.
    ///
    /// Each job runs on the blocking pool. When a job outlives its timeout it
    /// is recorded as timed out and the worker moves on. The node body is not
    /// interrupted: it may still dispatch downstream jobs after its record
    /// says `TimedOut`, and its return value is dropped.
    pub async fn run(mut self, router: Arc<Router>) {
        info!("worker listening on \"{}\"", self.queue);

        while let Some(job) = self.receiver.recv().await {
            if let Some(mut record) = self.jobs.get_mut(&job.id) {
                record.status = JobStatus::Running;
            }

            let router = router.clone();
            let destination = job.destination.clone();
            let task = tokio::task::spawn_blocking(move || router.invoke(&destination, job.message));

            let joined = match job.timeout {
                Some(limit) => match tokio::time::timeout(limit, task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            "job {} for \"{}\" timed out after {:?}",
                            job.id, job.destination, limit
                        );
                        finish(
                            &self.jobs,
                            &job.id,
                            JobStatus::TimedOut,
                            Err(format!("timed out after {limit:?}")),
                        );
                        continue;
                    }
                },
                None => task.await,
            };

            match joined {
                Ok(Ok(produced)) => {
                    debug!("job {} for \"{}\" finished", job.id, job.destination);
                    finish(&self.jobs, &job.id, JobStatus::Finished, Ok(produced));
                }
                Ok(Err(err)) => {
                    error!("job {} for \"{}\" failed: {}", job.id, job.destination, err);
                    finish(&self.jobs, &job.id, JobStatus::Failed, Err(err.to_string()));
                }
                Err(join_err) => {
                    error!("job {} for \"{}\" panicked: {}", job.id, job.destination, join_err);
                    finish(&self.jobs, &job.id, JobStatus::Failed, Err(join_err.to_string()));
                }
            }

            purge_expired(&self.jobs);
        }

        info!("worker on \"{}\" stopped", self.queue);
    }
}
