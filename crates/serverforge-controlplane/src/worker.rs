//! In-process worker pool
//!
//! Jobs for different servers run in parallel on `concurrency` workers.
//! Failed attempts are re-queued after the job's backoff until its attempt
//! budget is spent; a job that overruns its timeout is abandoned and not
//! retried.

use crate::error::{LifecycleError, Result};
use crate::jobs::{Job, JobHandler, JobQueue};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

struct Envelope {
    job: Job,
    attempt: u32,
}

/// Counts queued, delayed and running jobs
#[derive(Default)]
struct Tracker {
    outstanding: AtomicUsize,
    exhausted: AtomicUsize,
    idle: Notify,
}

impl Tracker {
    fn start(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Producer side of a [`WorkerPool`]
#[derive(Clone)]
pub struct WorkerQueue {
    sender: mpsc::UnboundedSender<Envelope>,
    tracker: Arc<Tracker>,
}

impl WorkerQueue {
    fn submit(&self, envelope: Envelope, delay: Duration) -> Result<()> {
        self.tracker.start();

        if delay.is_zero() {
            return self.sender.send(envelope).map_err(|_| {
                self.tracker.finish();
                LifecycleError::QueueClosed
            });
        }

        let sender = self.sender.clone();
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(envelope).is_err() {
                warn!("Worker pool shut down before a delayed job was due");
                tracker.finish();
            }
        });
        Ok(())
    }

    /// Jobs queued, waiting on a delay, or running
    pub fn outstanding(&self) -> usize {
        self.tracker.outstanding.load(Ordering::SeqCst)
    }

    /// Jobs given up on since the pool was created
    pub fn exhausted(&self) -> usize {
        self.tracker.exhausted.load(Ordering::SeqCst)
    }

    /// Wait until no job is queued, delayed or running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.tracker.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl JobQueue for WorkerQueue {
    async fn enqueue(&self, job: Job, delay: Duration) -> Result<()> {
        self.submit(Envelope { job, attempt: 1 }, delay)
    }
}

pub struct WorkerPool {
    concurrency: usize,
    queue: WorkerQueue,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            concurrency: concurrency.max(1),
            queue: WorkerQueue {
                sender,
                tracker: Arc::new(Tracker::default()),
            },
            receiver: Arc::new(Mutex::new(receiver)),
            workers: Vec::new(),
        }
    }

    /// Handle for enqueuing; hand this to the orchestrator
    pub fn queue(&self) -> WorkerQueue {
        self.queue.clone()
    }

    /// Spawn the workers. Jobs enqueued earlier start running now.
    pub fn start(&mut self, handler: Arc<dyn JobHandler>) {
        if !self.workers.is_empty() {
            return;
        }
        for index in 0..self.concurrency {
            let receiver = self.receiver.clone();
            let queue = self.queue.clone();
            let handler = handler.clone();
            self.workers.push(tokio::spawn(async move {
                loop {
                    let next = { receiver.lock().await.recv().await };
                    let Some(envelope) = next else {
                        break;
                    };
                    run(handler.as_ref(), &queue, envelope, index).await;
                    queue.tracker.finish();
                }
            }));
        }
        info!(workers = self.concurrency, "Worker pool started");
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await
    }

    pub fn exhausted(&self) -> usize {
        self.queue.exhausted()
    }

    /// Stop all workers; running jobs are aborted
    pub fn shutdown(self) {
        for worker in &self.workers {
            worker.abort();
        }
        info!("Worker pool stopped");
    }
}

async fn run(handler: &dyn JobHandler, queue: &WorkerQueue, envelope: Envelope, worker: usize) {
    let Envelope { job, attempt } = envelope;
    let policy = handler.policy(&job);
    info!(job = job.name(), server_id = ?job.server_id(), attempt, worker, "Job started");

    let error = match tokio::time::timeout(policy.timeout, handler.handle(&job)).await {
        Ok(Ok(next)) => {
            info!(job = job.name(), server_id = ?job.server_id(), "Job finished");
            if let Some(next) = next
                && let Err(e) = queue.submit(Envelope { job: next, attempt: 1 }, Duration::ZERO)
            {
                error!(job = job.name(), error = %e, "Failed to enqueue successor job");
            }
            return;
        }
        Ok(Err(e)) if e.is_superseded() => {
            info!(job = job.name(), server_id = ?job.server_id(), "Job superseded, stopping chain");
            return;
        }
        Ok(Err(e)) => e,
        Err(_) => {
            let e = LifecycleError::Timeout(format!(
                "job {} exceeded {:?}",
                job.name(),
                policy.timeout
            ));
            error!(job = job.name(), server_id = ?job.server_id(), error = %e, "Job timed out");
            give_up(handler, queue, &job, &e).await;
            return;
        }
    };

    if attempt < policy.max_attempts {
        warn!(
            job = job.name(),
            server_id = ?job.server_id(),
            attempt,
            max_attempts = policy.max_attempts,
            error = %error,
            "Job failed, retrying in {:?}",
            policy.backoff
        );
        let retry = Envelope {
            job: job.clone(),
            attempt: attempt + 1,
        };
        if let Err(e) = queue.submit(retry, policy.backoff) {
            error!(job = job.name(), error = %e, "Failed to re-enqueue job");
            give_up(handler, queue, &job, &error).await;
        }
    } else {
        error!(
            job = job.name(),
            server_id = ?job.server_id(),
            attempts = attempt,
            error = %error,
            "Job failed permanently"
        );
        give_up(handler, queue, &job, &error).await;
    }
}

async fn give_up(handler: &dyn JobHandler, queue: &WorkerQueue, job: &Job, error: &LifecycleError) {
    queue.tracker.exhausted.fetch_add(1, Ordering::SeqCst);
    handler.on_exhausted(job, error).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobPolicy;
    use std::sync::Mutex as StdMutex;
    use tokio::time::Instant;
    use uuid::Uuid;

    /// Fails the first `failures` attempts of every job
    struct ScriptedHandler {
        failures: u32,
        policy: JobPolicy,
        hang: bool,
        chain: Option<Job>,
        calls: StdMutex<Vec<(Job, Instant)>>,
        exhausted: StdMutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn new(failures: u32, policy: JobPolicy) -> Self {
            Self {
                failures,
                policy,
                hang: false,
                chain: None,
                calls: StdMutex::new(Vec::new()),
                exhausted: StdMutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(Job, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, job: &Job) -> Result<Option<Job>> {
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((job.clone(), Instant::now()));
                calls.iter().filter(|(j, _)| j == job).count() as u32
            };
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if attempt <= self.failures {
                return Err(LifecycleError::InvalidRequest(format!("attempt {}", attempt)));
            }
            if matches!(job, Job::CreateAtProvider { .. }) {
                return Ok(self.chain.clone());
            }
            Ok(None)
        }

        async fn on_exhausted(&self, _job: &Job, error: &LifecycleError) {
            self.exhausted.lock().unwrap().push(error.to_string());
        }

        fn policy(&self, _job: &Job) -> JobPolicy {
            self.policy
        }
    }

    fn job() -> Job {
        Job::DeleteServer {
            server_id: Uuid::new_v4(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_then_succeeds() {
        let handler = Arc::new(ScriptedHandler::new(
            2,
            JobPolicy::retrying(Duration::from_secs(60), 3, Duration::from_secs(10)),
        ));
        let mut pool = WorkerPool::new(2);
        pool.start(handler.clone());

        pool.queue().enqueue(job(), Duration::ZERO).await.unwrap();
        pool.wait_idle().await;

        let calls = handler.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].1 - calls[0].1, Duration::from_secs(10));
        assert_eq!(calls[2].1 - calls[1].1, Duration::from_secs(10));
        assert!(handler.exhausted.lock().unwrap().is_empty());
        assert_eq!(pool.exhausted(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_max_attempts() {
        let handler = Arc::new(ScriptedHandler::new(
            u32::MAX,
            JobPolicy::retrying(Duration::from_secs(60), 3, Duration::from_secs(10)),
        ));
        let mut pool = WorkerPool::new(1);
        pool.start(handler.clone());

        pool.queue().enqueue(job(), Duration::ZERO).await.unwrap();
        pool.wait_idle().await;

        assert_eq!(handler.calls().len(), 3);
        let exhausted = handler.exhausted.lock().unwrap().clone();
        assert_eq!(exhausted, vec!["Invalid request: attempt 3".to_string()]);
        assert_eq!(pool.exhausted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_retried() {
        let mut handler = ScriptedHandler::new(
            0,
            JobPolicy::retrying(Duration::from_secs(5), 3, Duration::from_secs(1)),
        );
        handler.hang = true;
        let handler = Arc::new(handler);
        let mut pool = WorkerPool::new(1);
        pool.start(handler.clone());

        pool.queue().enqueue(job(), Duration::ZERO).await.unwrap();
        pool.wait_idle().await;

        assert_eq!(handler.calls().len(), 1);
        let exhausted = handler.exhausted.lock().unwrap().clone();
        assert_eq!(exhausted.len(), 1);
        assert!(exhausted[0].contains("Timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successor_runs_after_predecessor() {
        let server_id = Uuid::new_v4();
        let mut handler = ScriptedHandler::new(0, JobPolicy::once(Duration::from_secs(60)));
        handler.chain = Some(Job::InstallStack { server_id });
        let handler = Arc::new(handler);
        let mut pool = WorkerPool::new(4);
        pool.start(handler.clone());

        pool.queue()
            .enqueue(Job::CreateAtProvider { server_id }, Duration::ZERO)
            .await
            .unwrap();
        pool.wait_idle().await;

        let jobs: Vec<Job> = handler.calls().into_iter().map(|(j, _)| j).collect();
        assert_eq!(
            jobs,
            vec![
                Job::CreateAtProvider { server_id },
                Job::InstallStack { server_id }
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_enqueue() {
        let handler = Arc::new(ScriptedHandler::new(0, JobPolicy::once(Duration::from_secs(60))));
        let mut pool = WorkerPool::new(1);
        pool.start(handler.clone());

        let start = Instant::now();
        pool.queue().enqueue(job(), Duration::from_secs(30)).await.unwrap();
        assert_eq!(pool.queue().outstanding(), 1);
        pool.wait_idle().await;

        assert_eq!(handler.calls()[0].1 - start, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_idle_pool_returns_immediately() {
        let pool = WorkerPool::new(1);
        pool.wait_idle().await;
        assert_eq!(pool.queue().outstanding(), 0);
    }
}
