//! Detection task orchestration.
//!
//! Submitting link text creates a task row, extracts video ids and queues a
//! job on a bounded channel consumed by a fixed pool of workers. Each job
//! runs its stages in order under a per-task timeout and the shared
//! shutdown token:
//!
//! 1. mark `processing`
//! 2. write `<work_dir>/<task_id>/input.csv`
//! 3. run the detector
//! 4. persist the detected videos with the task id
//! 5. record a verdict for every submitted id
//! 6. expansion rounds `1..=rounds`, each written to a round file and ingested
//! 7. mark `completed`
//!
//! The first failing stage marks the task `failed`; nothing is retried.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::detect::{
    CommandDetector, CommandExplorer, DetectRequest, Detector, ExploreRequest, Explorer,
};
use crate::ingest;
use crate::links::{self, HttpResolver, LinkResolver};
use crate::rounds;
use crate::tasks::{TaskRecord, TaskStatus, TaskStore};

/// The external services a task depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn LinkResolver>,
    pub detector: Arc<dyn Detector>,
    pub explorer: Arc<dyn Explorer>,
}

impl Collaborators {
    /// HTTP short-link resolution plus the configured external commands.
    pub fn from_context(ctx: &AppContext) -> Self {
        let config = &ctx.config;
        Self {
            resolver: Arc::new(HttpResolver::new(
                ctx.http.clone(),
                Duration::from_secs(config.tasks.resolve_timeout_secs),
            )),
            detector: Arc::new(CommandDetector::new(config.detector.clone())),
            explorer: Arc::new(CommandExplorer::new(config.explorer.clone())),
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("no valid video id found in the submitted text (task {task_id} failed)")]
    NoVideoIds { task_id: String },
    #[error("task queue is full, try again later (task {task_id} failed)")]
    QueueFull { task_id: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug)]
struct Job {
    task_id: String,
    video_ids: Vec<String>,
}

#[derive(Clone)]
pub struct TaskQueue {
    store: TaskStore,
    collaborators: Collaborators,
    sender: mpsc::Sender<Job>,
}

impl TaskQueue {
    /// Spawns `tasks.workers` workers. They exit when `cancel` fires.
    pub fn start(
        ctx: AppContext,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let store = TaskStore::new(ctx.pool.clone(), ctx.write_lock.clone());
        let (sender, receiver) = mpsc::channel(ctx.config.tasks.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..ctx.config.tasks.workers)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    ctx: ctx.clone(),
                    store: store.clone(),
                    collaborators: collaborators.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run(receiver.clone()))
            })
            .collect();

        (
            Self {
                store,
                collaborators,
                sender,
            },
            workers,
        )
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Creates a task for `text` and queues it.
    ///
    /// Text without any extractable id yields a task that is already
    /// `failed`; no job is queued for it.
    pub async fn submit(&self, text: &str) -> Result<TaskRecord, SubmitError> {
        let task = self.store.create().await?;
        let video_ids = links::extract_video_ids(text, self.collaborators.resolver.as_ref()).await;

        if video_ids.is_empty() {
            self.store
                .finish(&task.task_id, TaskStatus::Failed, Some("no valid video id"))
                .await?;
            return Err(SubmitError::NoVideoIds {
                task_id: task.task_id,
            });
        }

        let job = Job {
            task_id: task.task_id.clone(),
            video_ids,
        };
        match self.sender.try_send(job) {
            Ok(()) => {
                info!(task_id = %task.task_id, "task queued");
                Ok(task)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.store
                    .finish(&task.task_id, TaskStatus::Failed, Some("task queue is full"))
                    .await?;
                Err(SubmitError::QueueFull {
                    task_id: task.task_id,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.store
                    .finish(&task.task_id, TaskStatus::Failed, Some("task workers stopped"))
                    .await?;
                Err(SubmitError::Internal(anyhow!("task workers have stopped")))
            }
        }
    }
}

struct Worker {
    id: usize,
    ctx: AppContext,
    store: TaskStore,
    collaborators: Collaborators,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
        loop {
            let job = {
                let mut rx = receiver.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    job = rx.recv() => job,
                }
            };
            let Some(job) = job else {
                break;
            };
            self.process(job).await;
        }
        info!(worker = self.id, "task worker stopped");
    }

    async fn process(&self, job: Job) {
        let task_id = job.task_id.clone();
        let limit = Duration::from_secs(self.ctx.config.tasks.timeout_secs);

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(anyhow!("cancelled by shutdown")),
            result = tokio::time::timeout(limit, self.run_stages(&job)) => match result {
                Ok(inner) => inner,
                Err(_) => Err(anyhow!("timed out after {}s", limit.as_secs())),
            },
        };

        let finished = match &outcome {
            Ok(()) => {
                info!(task_id = %task_id, worker = self.id, "task completed");
                self.store.finish(&task_id, TaskStatus::Completed, None).await
            }
            Err(e) => {
                error!(task_id = %task_id, worker = self.id, error = %format!("{:#}", e), "task failed");
                self.store
                    .finish(&task_id, TaskStatus::Failed, Some(&format!("{:#}", e)))
                    .await
            }
        };
        if let Err(e) = finished {
            warn!(task_id = %task_id, error = %e, "could not record task outcome");
        }
    }

    async fn run_stages(&self, job: &Job) -> Result<()> {
        let task_id = job.task_id.as_str();
        self.store.set_processing(task_id).await?;

        let work_dir = self.ctx.config.paths.work_dir.join(task_id);
        let input_csv = write_input_csv(&work_dir, &job.video_ids)?;

        let response = self
            .collaborators
            .detector
            .detect(&DetectRequest {
                task_id: task_id.to_string(),
                video_ids: job.video_ids.clone(),
                input_csv,
            })
            .await
            .context("detection failed")?;
        let evil_ids: HashSet<String> = response.evil_video_ids.iter().cloned().collect();
        info!(task_id, submitted = job.video_ids.len(), evil = evil_ids.len(), "detection finished");

        if !response.videos.is_empty() {
            let videos = mark_verdicts(response.videos, &evil_ids);
            let detected = work_dir.join("detected.json");
            std::fs::write(&detected, serde_json::to_vec_pretty(&json!({ "videos": videos }))?)
                .with_context(|| format!("failed to write {}", detected.display()))?;
            ingest::ingest_file(&self.ctx, &detected, Some(task_id))
                .await
                .context("failed to persist detected videos")?;
        }

        self.store
            .record_verdicts(task_id, &job.video_ids, &evil_ids)
            .await?;

        let mut seeds: Vec<String> = job
            .video_ids
            .iter()
            .filter(|id| evil_ids.contains(*id))
            .cloned()
            .collect();
        for round in 1..=self.ctx.config.tasks.rounds {
            if seeds.is_empty() {
                break;
            }
            let data = self
                .collaborators
                .explorer
                .explore(&ExploreRequest {
                    task_id: task_id.to_string(),
                    round,
                    seed_ids: seeds.clone(),
                })
                .await
                .with_context(|| format!("expansion round {} failed", round))?;

            let path = rounds::write_round(&self.ctx.config.paths.rounds_dir, task_id, round, &data)?;
            let outcome = ingest::ingest_file(&self.ctx, &path, None)
                .await
                .with_context(|| format!("failed to persist round {}", round))?;
            info!(task_id, round, videos = outcome.persisted.videos_upserted, "round stored");

            seeds = video_ids_of(&data);
        }

        Ok(())
    }
}

fn write_input_csv(work_dir: &std::path::Path, video_ids: &[String]) -> Result<PathBuf> {
    std::fs::create_dir_all(work_dir)
        .with_context(|| format!("failed to create {}", work_dir.display()))?;
    let path = work_dir.join("input.csv");
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(["vd_id", "label"])?;
    for id in video_ids {
        writer.write_record([id.as_str(), ""])?;
    }
    writer.flush()?;
    Ok(path)
}

fn video_id_of(video: &Value) -> Option<String> {
    ["vd_id", "video_id"]
        .iter()
        .find_map(|k| video.get(*k))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Fills in `evil` from the detector's verdict where the record lacks it.
fn mark_verdicts(videos: Vec<Value>, evil_ids: &HashSet<String>) -> Vec<Value> {
    videos
        .into_iter()
        .map(|mut video| {
            let evil = video_id_of(&video).is_some_and(|id| evil_ids.contains(&id));
            if let Value::Object(map) = &mut video {
                map.entry("evil").or_insert(Value::Bool(evil));
            }
            video
        })
        .collect()
}

fn video_ids_of(round: &Value) -> Vec<String> {
    let videos = match round {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("videos") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    let mut ids: Vec<String> = Vec::new();
    for id in videos.iter().filter_map(video_id_of) {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{test_context, test_context_with};
    use crate::detect::DetectResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoResolve;

    #[async_trait]
    impl LinkResolver for NoResolve {
        async fn resolve(&self, _url: &str) -> Option<String> {
            None
        }
    }

    struct FakeDetector;

    #[async_trait]
    impl Detector for FakeDetector {
        async fn detect(&self, request: &DetectRequest) -> Result<DetectResponse> {
            assert!(request.input_csv.exists());
            Ok(DetectResponse {
                evil_video_ids: vec![request.video_ids[0].clone()],
                videos: vec![json!({
                    "vd_id": request.video_ids[0],
                    "title": "seed #bad",
                    "author": "seed_author",
                    "likes": 100
                })],
            })
        }
    }

    struct FailingDetector;

    #[async_trait]
    impl Detector for FailingDetector {
        async fn detect(&self, _request: &DetectRequest) -> Result<DetectResponse> {
            Err(anyhow!("model crashed"))
        }
    }

    /// Never answers; the task only ends through timeout or shutdown.
    struct StuckDetector;

    #[async_trait]
    impl Detector for StuckDetector {
        async fn detect(&self, _request: &DetectRequest) -> Result<DetectResponse> {
            std::future::pending().await
        }
    }

    struct FakeExplorer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Explorer for FakeExplorer {
        async fn explore(&self, request: &ExploreRequest) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({
                "user_info": { "user_id": format!("u{}", request.round) },
                "videos": [{ "vd_id": format!("r{}", request.round), "author": "related" }]
            }))
        }
    }

    fn collaborators(detector: Arc<dyn Detector>, explorer: Arc<FakeExplorer>) -> Collaborators {
        Collaborators {
            resolver: Arc::new(NoResolve),
            detector,
            explorer,
        }
    }

    async fn wait_terminal(store: &TaskStore, task_id: &str) -> TaskRecord {
        for _ in 0..200 {
            let task = store.get(task_id).await.unwrap().unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {} did not finish", task_id);
    }

    #[tokio::test]
    async fn test_zero_ids_fails_without_queueing() {
        let (_tmp, ctx) = test_context().await;
        let explorer = Arc::new(FakeExplorer {
            calls: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let (queue, _workers) = TaskQueue::start(
            ctx.clone(),
            collaborators(Arc::new(FakeDetector), explorer),
            cancel.clone(),
        );

        let task_id = match queue.submit("nothing to see here").await {
            Err(SubmitError::NoVideoIds { task_id }) => task_id,
            other => panic!("unexpected result: {:?}", other.map(|t| t.task_id)),
        };
        let task = queue.store().get(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.completed_at.is_some());
        assert!(!ctx.config.paths.work_dir.join(&task_id).exists());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_single_id_runs_to_completion() {
        let (_tmp, ctx) = test_context().await;
        let explorer = Arc::new(FakeExplorer {
            calls: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let (queue, _workers) = TaskQueue::start(
            ctx.clone(),
            collaborators(Arc::new(FakeDetector), explorer.clone()),
            cancel.clone(),
        );

        let task = queue
            .submit("look https://www.douyin.com/video/7460657806849445120 now")
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let done = wait_terminal(queue.store(), &task.task_id).await;
        assert_eq!(done.status, TaskStatus::Completed, "error: {:?}", done.error);

        let report = queue.store().report(&task.task_id).await.unwrap().unwrap();
        assert_eq!(report.summary.total_videos, 1);
        assert_eq!(report.evil_video_ids, vec!["7460657806849445120".to_string()]);

        // Two rounds by default, each seeded by the previous one
        assert_eq!(explorer.calls.load(Ordering::SeqCst), 2);
        let rounds = rounds::read_all_rounds(&ctx.config.paths.rounds_dir, &task.task_id).unwrap();
        assert_eq!(rounds.len(), 2);

        let videos: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM videos")
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
        assert_eq!(videos, 3);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stage_failure_marks_task_failed() {
        let (_tmp, ctx) = test_context().await;
        let explorer = Arc::new(FakeExplorer {
            calls: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let (queue, _workers) = TaskQueue::start(
            ctx.clone(),
            collaborators(Arc::new(FailingDetector), explorer.clone()),
            cancel.clone(),
        );

        let task = queue
            .submit("https://www.douyin.com/video/1")
            .await
            .unwrap();
        let done = wait_terminal(queue.store(), &task.task_id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error.unwrap().contains("model crashed"));
        assert_eq!(explorer.calls.load(Ordering::SeqCst), 0);
        cancel.cancel();
    }

    async fn wait_status(store: &TaskStore, task_id: &str, status: TaskStatus) {
        for _ in 0..200 {
            if store.get(task_id).await.unwrap().unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {} never reached {}", task_id, status);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_and_fails_task() {
        let (_tmp, ctx) = test_context_with("[tasks]\nworkers = 1\nqueue_capacity = 1\n").await;
        let explorer = Arc::new(FakeExplorer {
            calls: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let (queue, _workers) = TaskQueue::start(
            ctx.clone(),
            collaborators(Arc::new(StuckDetector), explorer),
            cancel.clone(),
        );

        // First job occupies the only worker, second fills the channel
        let running = queue.submit("https://www.douyin.com/video/1").await.unwrap();
        wait_status(queue.store(), &running.task_id, TaskStatus::Processing).await;
        let waiting = queue.submit("https://www.douyin.com/video/2").await.unwrap();

        let rejected = match queue.submit("https://www.douyin.com/video/3").await {
            Err(SubmitError::QueueFull { task_id }) => task_id,
            other => panic!("unexpected result: {:?}", other.map(|t| t.task_id)),
        };
        let task = queue.store().get(&rejected).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("task queue is full"));

        let queued = queue.store().get(&waiting.task_id).await.unwrap().unwrap();
        assert_eq!(queued.status, TaskStatus::Pending);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_timeout_marks_task_failed() {
        let (_tmp, ctx) = test_context_with("[tasks]\ntimeout_secs = 1\n").await;
        let explorer = Arc::new(FakeExplorer {
            calls: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let (queue, _workers) = TaskQueue::start(
            ctx.clone(),
            collaborators(Arc::new(StuckDetector), explorer.clone()),
            cancel.clone(),
        );

        let task = queue
            .submit("https://www.douyin.com/video/1")
            .await
            .unwrap();
        let done = wait_terminal(queue.store(), &task.task_id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error.unwrap().contains("timed out"));
        assert_eq!(explorer.calls.load(Ordering::SeqCst), 0);
        cancel.cancel();
    }

    #[test]
    fn test_mark_verdicts_keeps_explicit_flags() {
        let evil: HashSet<String> = ["1".to_string()].into_iter().collect();
        let videos = mark_verdicts(
            vec![
                json!({ "vd_id": "1" }),
                json!({ "vd_id": 2 }),
                json!({ "vd_id": "3", "evil": true }),
            ],
            &evil,
        );
        assert_eq!(videos[0]["evil"], true);
        assert_eq!(videos[1]["evil"], false);
        assert_eq!(videos[2]["evil"], true);
    }

    #[test]
    fn test_round_ids_are_deduplicated() {
        let data = json!({ "videos": [{ "vd_id": "a" }, { "video_id": "a" }, { "vd_id": "b" }] });
        assert_eq!(video_ids_of(&data), vec!["a".to_string(), "b".to_string()]);
    }
}
