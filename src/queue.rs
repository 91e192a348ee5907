//! Bounded generation queue.
//!
//! Submissions land in a FIFO channel of capacity `queue_maxsize`; a full
//! channel rejects the submission with a capacity error rather than
//! buffering without bound. `queue_workers` worker tasks share one
//! receiver behind a mutex, so each job is claimed by exactly one worker.
//!
//! Submission is asynchronous: callers get a job id immediately and poll
//! `status` for the result. Terminal jobs are retained in memory; once the
//! status map grows past four times the queue capacity, the oldest
//! terminal entries are evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{ApiError, Result};
use crate::model::dit::{GeneratedAudio, GenerationTask, TaskKind};
use crate::model::manager::AudioGenerator;

/// Job lifecycle state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: GeneratedAudio },
    Failed { error: String },
}

impl JobState {
    fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed { .. } | JobState::Failed { .. })
    }
}

/// Point-in-time view of a job, as returned to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub kind: TaskKind,
    #[serde(flatten)]
    pub state: JobState,
}

struct JobEntry {
    seq: u64,
    kind: TaskKind,
    state: JobState,
}

struct QueuedJob {
    id: String,
    task: GenerationTask,
}

/// Handle for submitting and polling generation jobs.
#[derive(Clone)]
pub struct GenerationQueue {
    tx: mpsc::Sender<QueuedJob>,
    jobs: Arc<RwLock<HashMap<String, JobEntry>>>,
    pending: Arc<AtomicUsize>,
    next_seq: Arc<AtomicU64>,
    capacity: usize,
}

impl GenerationQueue {
    /// Start `workers` worker tasks over a queue of `capacity` slots.
    pub fn start(capacity: usize, workers: usize, generator: Arc<dyn AudioGenerator>) -> Self {
        let (tx, rx) = mpsc::channel::<QueuedJob>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let jobs: Arc<RwLock<HashMap<String, JobEntry>>> = Arc::new(RwLock::new(HashMap::new()));
        let pending = Arc::new(AtomicUsize::new(0));

        for worker_id in 0..workers {
            let rx = rx.clone();
            let jobs = jobs.clone();
            let pending = pending.clone();
            let generator = generator.clone();

            tokio::spawn(async move {
                loop {
                    // Claim exactly one job; holding the receiver lock only
                    // for the recv keeps other workers free to claim next.
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        debug!(worker_id, "queue closed, worker exiting");
                        break;
                    };

                    pending.fetch_sub(1, Ordering::SeqCst);
                    set_state(&jobs, &job.id, JobState::Running).await;
                    info!(worker_id, job_id = %job.id, kind = ?job.task.kind, "job started");

                    let state = match generator.run_generation(&job.id, &job.task).await {
                        Ok(result) => JobState::Completed { result },
                        Err(e) => {
                            error!(worker_id, job_id = %job.id, error = %e, "job failed");
                            JobState::Failed {
                                error: e.to_string(),
                            }
                        }
                    };
                    set_state(&jobs, &job.id, state).await;
                }
            });
        }

        Self {
            tx,
            jobs,
            pending,
            next_seq: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    /// Submit a task. Returns the job id and the queue position at
    /// submission time, or a capacity error when the queue is full.
    pub async fn submit(&self, task: GenerationTask) -> Result<(String, usize)> {
        let id = Uuid::new_v4().to_string();
        let kind = task.kind;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        {
            let mut jobs = self.jobs.write().await;
            jobs.insert(
                id.clone(),
                JobEntry {
                    seq,
                    kind,
                    state: JobState::Queued,
                },
            );
        }

        // Count the job as pending before it becomes visible to workers,
        // otherwise a fast worker could decrement first and underflow.
        let position = self.pending.fetch_add(1, Ordering::SeqCst);

        match self.tx.try_send(QueuedJob {
            id: id.clone(),
            task,
        }) {
            Ok(()) => {
                debug!(job_id = %id, position, "job enqueued");
                self.sweep().await;
                Ok((id, position))
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                self.jobs.write().await.remove(&id);
                Err(ApiError::Capacity {
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                self.jobs.write().await.remove(&id);
                Err(ApiError::internal("generation queue has shut down"))
            }
        }
    }

    /// Look up a job by id.
    pub async fn status(&self, job_id: &str) -> Option<JobSnapshot> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).map(|entry| JobSnapshot {
            job_id: job_id.to_string(),
            kind: entry.kind,
            state: entry.state.clone(),
        })
    }

    /// Number of submitted jobs not yet claimed by a worker.
    pub fn depth(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Maximum pending submissions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Evict the oldest terminal entries once the map outgrows 4x capacity.
    async fn sweep(&self) {
        let limit = self.capacity * 4;
        let mut jobs = self.jobs.write().await;
        if jobs.len() <= limit {
            return;
        }
        let mut terminal: Vec<(String, u64)> = jobs
            .iter()
            .filter(|(_, e)| e.state.is_terminal())
            .map(|(id, e)| (id.clone(), e.seq))
            .collect();
        terminal.sort_by_key(|(_, seq)| *seq);

        let excess = jobs.len() - limit;
        for (id, _) in terminal.into_iter().take(excess) {
            jobs.remove(&id);
        }
    }
}

async fn set_state(
    jobs: &Arc<RwLock<HashMap<String, JobEntry>>>,
    job_id: &str,
    state: JobState,
) {
    let mut jobs = jobs.write().await;
    if let Some(entry) = jobs.get_mut(job_id) {
        entry.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::time::Duration;

    /// Generator stub that parks until released, for queue-state tests.
    struct SlowGenerator {
        release: tokio::sync::Semaphore,
        runs: AtomicUsize,
    }

    impl SlowGenerator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                release: tokio::sync::Semaphore::new(0),
                runs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AudioGenerator for SlowGenerator {
        async fn run_generation(
            &self,
            _job_id: &str,
            task: &GenerationTask,
        ) -> crate::error::Result<GeneratedAudio> {
            let _permit = self.release.acquire().await.unwrap();
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(GeneratedAudio {
                audio_path: PathBuf::from("/tmp/out.wav"),
                duration: task.duration,
                sample_rate: 44_100,
                seed: task.seed,
            })
        }
    }

    fn task() -> GenerationTask {
        GenerationTask {
            kind: TaskKind::Text2Music,
            caption: "test".into(),
            lyrics: "[inst]".into(),
            duration: 10,
            bpm: None,
            seed: 1,
            source_audio: None,
            repaint_window: None,
        }
    }

    #[tokio::test]
    async fn test_full_queue_rejects_submission() {
        let generator = SlowGenerator::new();
        let queue = GenerationQueue::start(2, 1, generator.clone());

        // One job is claimed by the (blocked) worker; two fill the channel.
        let mut accepted = 0;
        let mut rejected = 0;
        for _ in 0..5 {
            match queue.submit(task()).await {
                Ok(_) => accepted += 1,
                Err(ApiError::Capacity { capacity }) => {
                    assert_eq!(capacity, 2);
                    rejected += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
            // Give the worker a chance to claim the first job.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(accepted >= 2, "expected at least capacity submissions");
        assert!(rejected >= 1, "expected overflow rejection");

        // Unblock workers and drain.
        generator.release.add_permits(16);
    }

    #[tokio::test]
    async fn test_jobs_run_to_completion_in_order() {
        let generator = SlowGenerator::new();
        let queue = GenerationQueue::start(8, 1, generator.clone());

        let (id1, pos1) = queue.submit(task()).await.unwrap();
        let (id2, _) = queue.submit(task()).await.unwrap();
        assert_eq!(pos1, 0);

        generator.release.add_permits(2);
        // Poll until both are terminal.
        for _ in 0..100 {
            let s1 = queue.status(&id1).await.unwrap();
            let s2 = queue.status(&id2).await.unwrap();
            if matches!(s1.state, JobState::Completed { .. })
                && matches!(s2.state, JobState::Completed { .. })
            {
                assert_eq!(generator.runs.load(Ordering::SeqCst), 2);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("jobs did not complete in time");
    }

    #[tokio::test]
    async fn test_each_job_claimed_once_with_many_workers() {
        let generator = SlowGenerator::new();
        let queue = GenerationQueue::start(32, 4, generator.clone());

        let mut ids = Vec::new();
        for _ in 0..16 {
            let (id, _) = queue.submit(task()).await.unwrap();
            ids.push(id);
        }
        generator.release.add_permits(16);

        for _ in 0..200 {
            let mut done = 0;
            for id in &ids {
                if matches!(
                    queue.status(id).await.unwrap().state,
                    JobState::Completed { .. }
                ) {
                    done += 1;
                }
            }
            if done == 16 {
                // Exactly one run per job: no double-claims.
                assert_eq!(generator.runs.load(Ordering::SeqCst), 16);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("jobs did not complete in time");
    }

    #[tokio::test]
    async fn test_unknown_job_id() {
        let queue = GenerationQueue::start(2, 1, SlowGenerator::new());
        assert!(queue.status("no-such-job").await.is_none());
    }
}
