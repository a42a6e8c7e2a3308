//! One-shot enhanced searches as pollable background jobs.
//!
//! Submissions land in a task table and a queue served by a fixed worker pool, which
//! bounds how many AI-stage runs happen at once. Finished tasks are retained for a
//! while, then leave a tombstone so late pollers see `Expired` instead of `NotFound`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::{Aggregator, CancelToken, PipelineStage};
use crate::error::{SearchError, TaskError};
use crate::model::{AggregatedResult, SearchQuery};
use crate::quota::{Metric, Principal, QuotaEnforcer, Tier, Window};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "async_tasks_total",
            "Async search task transitions by resulting state."
        );
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Canceled
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Queued,
    Searching,
    AiAnalysis,
    Finalizing,
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct AsyncTask {
    pub task_id: Uuid,
    pub user_id: String,
    pub query: SearchQuery,
    pub state: TaskState,
    pub stage: TaskStage,
    /// 0.0–1.0, never decreases.
    pub progress: f32,
    pub result: Option<Arc<AggregatedResult>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_duration_secs: u32,
}

#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    pub workers: usize,
    /// How long a finished task stays pollable.
    pub retention: Duration,
    pub job_timeout: Duration,
    pub gc_interval: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retention: Duration::from_secs(3600),
            job_timeout: Duration::from_secs(300),
            gc_interval: Duration::from_secs(60),
        }
    }
}

/// Rough wall-clock estimate shown to clients while they poll.
pub fn estimate_duration_secs(query: &SearchQuery, principal: &Principal, today: NaiveDate) -> u32 {
    let mut secs: i64 = 45;
    secs += if principal.tier == Tier::Guest { -10 } else { 20 };
    if (query.depart_date() - today).num_days() > 30 {
        secs += 10;
    }
    if query.return_date().is_some() {
        secs += 15;
    }
    if query.passenger_count() > 2 {
        secs += 5;
    }
    secs.clamp(30, 180) as u32
}

struct Entry {
    task: AsyncTask,
    cancel: CancelToken,
    finished: Option<Instant>,
}

struct Job {
    id: Uuid,
    query: SearchQuery,
}

struct Inner {
    aggregator: Arc<Aggregator>,
    quota: Arc<QuotaEnforcer>,
    cfg: TaskManagerConfig,
    table: Mutex<HashMap<Uuid, Entry>>,
    tombstones: Mutex<HashMap<Uuid, Instant>>,
}

/// Handle to the task table. Dropping every clone closes the queue and stops workers.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
    tx: mpsc::UnboundedSender<Job>,
}

impl TaskManager {
    /// Spawns the worker pool on the current Tokio runtime.
    pub fn start(
        aggregator: Arc<Aggregator>,
        quota: Arc<QuotaEnforcer>,
        cfg: TaskManagerConfig,
    ) -> Self {
        ensure_metrics_described();
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = cfg.workers.max(1);
        let inner = Arc::new(Inner {
            aggregator,
            quota,
            cfg,
            table: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashMap::new()),
        });
        for n in 0..workers {
            let inner = inner.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    inner.run(job).await;
                }
                debug!(target: "tasks", worker = n, "queue closed, worker exiting");
            });
        }
        Self { inner, tx }
    }

    /// Charges one `search` unit and queues the job. On `QuotaExceeded` nothing is created.
    pub async fn submit(
        &self,
        principal: &Principal,
        query: SearchQuery,
    ) -> Result<Uuid, TaskError> {
        query.validate().map_err(TaskError::InvalidQuery)?;
        if !self
            .inner
            .quota
            .check_and_increment(principal, Metric::Search, Window::Daily)
            .await?
        {
            return Err(TaskError::QuotaExceeded {
                metric: Metric::Search.as_str().to_string(),
            });
        }

        let id = Uuid::new_v4();
        let task = AsyncTask {
            task_id: id,
            user_id: principal.user_id.clone(),
            query: query.clone(),
            state: TaskState::Pending,
            stage: TaskStage::Queued,
            progress: 0.0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_duration_secs: estimate_duration_secs(&query, principal, Utc::now().date_naive()),
        };
        self.inner.table.lock().insert(
            id,
            Entry {
                task,
                cancel: CancelToken::new(),
                finished: None,
            },
        );
        if self.tx.send(Job { id, query }).is_err() {
            self.inner.table.lock().remove(&id);
            return Err(TaskError::QueueClosed);
        }
        counter!("async_tasks_total", "state" => TaskState::Pending.as_str()).increment(1);
        info!(target: "tasks", task_id = %id, user = %principal.user_id, "search submitted");
        Ok(id)
    }

    pub fn poll(&self, id: Uuid) -> Result<AsyncTask, TaskError> {
        let now = Instant::now();
        {
            let mut g = self.inner.table.lock();
            if let Some(e) = g.get(&id) {
                let stale = e
                    .finished
                    .is_some_and(|t| now.duration_since(t) > self.inner.cfg.retention);
                if !stale {
                    return Ok(e.task.clone());
                }
                g.remove(&id);
                self.inner.tombstones.lock().insert(id, now);
                return Err(TaskError::Expired(id.to_string()));
            }
        }
        if self.inner.tombstones.lock().contains_key(&id) {
            return Err(TaskError::Expired(id.to_string()));
        }
        Err(TaskError::NotFound(id.to_string()))
    }

    /// Marks a live task `Canceled`; terminal tasks are left as they are.
    /// Returns the state after the call.
    pub fn cancel(&self, id: Uuid) -> Result<TaskState, TaskError> {
        let mut g = self.inner.table.lock();
        let Some(e) = g.get_mut(&id) else {
            if self.inner.tombstones.lock().contains_key(&id) {
                return Err(TaskError::Expired(id.to_string()));
            }
            return Err(TaskError::NotFound(id.to_string()));
        };
        if e.task.state.is_terminal() {
            return Ok(e.task.state);
        }
        e.cancel.cancel();
        e.task.state = TaskState::Canceled;
        e.task.stage = TaskStage::Done;
        e.task.error = Some("canceled by user".into());
        e.task.completed_at = Some(Utc::now());
        e.finished = Some(Instant::now());
        counter!("async_tasks_total", "state" => TaskState::Canceled.as_str()).increment(1);
        info!(target: "tasks", task_id = %id, "task canceled");
        Ok(TaskState::Canceled)
    }

    /// Moves finished tasks past retention to tombstones and forgets old tombstones.
    pub fn gc(&self) -> usize {
        self.inner.gc()
    }

    /// Periodic `gc`; stops once the workers (and so the manager) are gone.
    pub fn spawn_gc(&self) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let every = self.inner.cfg.gc_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let n = inner.gc();
                if n > 0 {
                    debug!(target: "tasks", expired = n, "task gc");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn gc(&self) -> usize {
        let now = Instant::now();
        let retention = self.cfg.retention;
        let mut expired = Vec::new();
        {
            let mut g = self.table.lock();
            g.retain(|id, e| match e.finished {
                Some(t) if now.duration_since(t) > retention => {
                    expired.push(*id);
                    false
                }
                _ => true,
            });
        }
        let mut tomb = self.tombstones.lock();
        tomb.retain(|_, t| now.duration_since(*t) <= retention);
        for id in &expired {
            tomb.insert(*id, now);
        }
        expired.len()
    }

    async fn run(&self, job: Job) {
        let cancel = {
            let mut g = self.table.lock();
            let Some(e) = g.get_mut(&job.id) else { return };
            if e.task.state != TaskState::Pending {
                return;
            }
            e.task.state = TaskState::Running;
            e.task.stage = TaskStage::Searching;
            e.task.progress = 0.1;
            e.task.started_at = Some(Utc::now());
            e.cancel.clone()
        };
        counter!("async_tasks_total", "state" => TaskState::Running.as_str()).increment(1);

        let on_stage = |stage: PipelineStage| self.advance(job.id, stage);
        let outcome = tokio::time::timeout(
            self.cfg.job_timeout,
            self.aggregator
                .search_with_progress(&job.query, &cancel, &on_stage),
        )
        .await;

        let (state, result, error) = match outcome {
            Ok(Ok(r)) => (TaskState::Succeeded, Some(r), None),
            Ok(Err(SearchError::Canceled)) => {
                (TaskState::Canceled, None, Some("canceled".to_string()))
            }
            Ok(Err(e)) => (TaskState::Failed, None, Some(e.to_string())),
            Err(_) => (
                TaskState::Failed,
                None,
                Some(format!(
                    "search exceeded {}s",
                    self.cfg.job_timeout.as_secs()
                )),
            ),
        };

        let mut g = self.table.lock();
        let Some(e) = g.get_mut(&job.id) else { return };
        if e.task.state.is_terminal() {
            debug!(target: "tasks", task_id = %job.id, "result discarded, task already {}", e.task.state.as_str());
            return;
        }
        if state == TaskState::Failed {
            warn!(target: "tasks", task_id = %job.id, error = ?error, "search task failed");
        }
        e.task.state = state;
        e.task.stage = TaskStage::Done;
        e.task.progress = 1.0;
        e.task.result = result;
        e.task.error = error;
        e.task.completed_at = Some(Utc::now());
        e.finished = Some(Instant::now());
        counter!("async_tasks_total", "state" => state.as_str()).increment(1);
    }

    fn advance(&self, id: Uuid, stage: PipelineStage) {
        let (stage, progress) = match stage {
            PipelineStage::Sources => (TaskStage::Searching, 0.2),
            PipelineStage::Reasoning => (TaskStage::AiAnalysis, 0.6),
            PipelineStage::Finalizing => (TaskStage::Finalizing, 0.9),
        };
        let mut g = self.table.lock();
        if let Some(e) = g.get_mut(&id) {
            if e.task.state == TaskState::Running && progress > e.task.progress {
                e.task.stage = stage;
                e.task.progress = progress;
            }
        }
    }
}
