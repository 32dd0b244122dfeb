//! Detection task repository over the `tasks` and `detection_results` tables.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => bail!("unknown task status: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    #[serde(flatten)]
    pub task: TaskRecord,
    pub all_video_count: i64,
    pub evil_video_count: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReportCounts {
    pub total_videos: usize,
    pub evil_videos: usize,
    pub normal_videos: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_info: TaskRecord,
    /// Distinct video ids attached to the task.
    pub detection_results: Vec<String>,
    pub evil_video_ids: Vec<String>,
    pub summary: ReportCounts,
}

/// Injected wherever task state is read or written.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl TaskStore {
    pub fn new(pool: SqlitePool, write_lock: Arc<Mutex<()>>) -> Self {
        Self { pool, write_lock }
    }

    /// Inserts a new `pending` task.
    pub async fn create(&self) -> Result<TaskRecord> {
        let task = TaskRecord {
            task_id: Uuid::new_v4().to_string(),
            status: TaskStatus::Pending,
            created_at: db::now_ts(),
            completed_at: None,
            error: None,
        };
        let _guard = self.write_lock.lock().await;
        sqlx::query("INSERT INTO tasks (task_id, status, created_at) VALUES (?, ?, ?)")
            .bind(&task.task_id)
            .bind(task.status.as_str())
            .bind(&task.created_at)
            .execute(&self.pool)
            .await?;
        Ok(task)
    }

    pub async fn set_processing(&self, task_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE tasks SET status = ? WHERE task_id = ? AND status = ?")
            .bind(TaskStatus::Processing.as_str())
            .bind(task_id)
            .bind(TaskStatus::Pending.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Moves a task into a terminal state. Terminal tasks are never changed.
    pub async fn finish(&self, task_id: &str, status: TaskStatus, error: Option<&str>) -> Result<()> {
        if !status.is_terminal() {
            bail!("{} is not a terminal status", status);
        }
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            UPDATE tasks SET status = ?, completed_at = ?, error = ?
            WHERE task_id = ? AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(status.as_str())
        .bind(db::now_ts())
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query(
            "SELECT task_id, status, created_at, completed_at, error FROM tasks WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<TaskRecord> {
            let status: String = row.get("status");
            Ok(TaskRecord {
                task_id: row.get("task_id"),
                status: status.parse()?,
                created_at: row.get("created_at"),
                completed_at: row.get("completed_at"),
                error: row.get("error"),
            })
        })
        .transpose()
    }

    /// All tasks, newest first, with their detection counts.
    pub async fn list(&self) -> Result<Vec<TaskSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT t.task_id, t.status, t.created_at, t.completed_at, t.error,
                   COUNT(d.vd_id) AS all_video_count,
                   COALESCE(SUM(d.is_evil), 0) AS evil_video_count
            FROM tasks t
            LEFT JOIN detection_results d ON d.task_id = t.task_id
            GROUP BY t.task_id
            ORDER BY t.created_at DESC, t.task_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(TaskSummary {
                    task: TaskRecord {
                        task_id: row.get("task_id"),
                        status: status.parse()?,
                        created_at: row.get("created_at"),
                        completed_at: row.get("completed_at"),
                        error: row.get("error"),
                    },
                    all_video_count: row.get("all_video_count"),
                    evil_video_count: row.get("evil_video_count"),
                })
            })
            .collect()
    }

    /// Stores the detector's verdict for every submitted id.
    pub async fn record_verdicts(
        &self,
        task_id: &str,
        video_ids: &[String],
        evil_ids: &HashSet<String>,
    ) -> Result<()> {
        let now = db::now_ts();
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        for vd_id in video_ids {
            sqlx::query(
                r#"
                INSERT INTO detection_results (task_id, vd_id, is_evil, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(task_id, vd_id) DO UPDATE SET is_evil = excluded.is_evil
                "#,
            )
            .bind(task_id)
            .bind(vd_id)
            .bind(evil_ids.contains(vd_id))
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Video ids attached to a task, optionally only the evil ones.
    pub async fn video_ids(&self, task_id: &str, evil_only: bool) -> Result<Vec<String>> {
        let sql = if evil_only {
            "SELECT DISTINCT vd_id FROM detection_results WHERE task_id = ? AND is_evil = 1 ORDER BY vd_id"
        } else {
            "SELECT DISTINCT vd_id FROM detection_results WHERE task_id = ? ORDER BY vd_id"
        };
        let ids = sqlx::query_scalar(sql)
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Summary report; `None` when the task does not exist.
    pub async fn report(&self, task_id: &str) -> Result<Option<TaskReport>> {
        let Some(task) = self.get(task_id).await? else {
            return Ok(None);
        };
        let video_ids = self.video_ids(task_id, false).await?;
        let evil_video_ids = self.video_ids(task_id, true).await?;
        let summary = ReportCounts {
            total_videos: video_ids.len(),
            evil_videos: evil_video_ids.len(),
            normal_videos: video_ids.len() - evil_video_ids.len(),
        };
        Ok(Some(TaskReport {
            task_info: task,
            detection_results: video_ids,
            evil_video_ids,
            summary,
        }))
    }
}
