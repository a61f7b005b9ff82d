//! SQLite-backed store.
//!
//! Status changes are a single `UPDATE .. WHERE status = ?` checked through
//! `rows_affected()`, so concurrent driver processes sharing the database file
//! can never both win the same transition.

use super::{ActivityStore, CasOutcome, TaskFilter, TaskStore};
use crate::error::{Result, TaskerError};
use crate::models::{
    ActivityId, ActivityStatus, BackgroundActivity, NewTask, Task, TaskId, TaskLogEntry,
};
use crate::state_machine::TaskStatus;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    QueryBuilder, Row, Sqlite, SqlitePool,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

/// Fixed-width timestamps so text comparison in SQL orders correctly
fn ts(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TaskerError::DatabaseError(format!("Invalid timestamp '{value}': {e}")))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn parse_status(value: &str) -> Result<TaskStatus> {
    TaskStatus::from_str(value).map_err(TaskerError::DatabaseError)
}

impl SqliteStore {
    /// Open (or create) a database from a `sqlite://` URL
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Open an in-memory store (handy for tests)
    pub async fn open_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn bootstrap(&self) -> Result<()> {
        // Improve concurrency for file DBs.
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
              task_id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id INTEGER NOT NULL,
              group_id INTEGER NOT NULL,
              endpoint_id INTEGER NOT NULL,
              tool_class TEXT NOT NULL,
              tool_config_id INTEGER,
              description TEXT,
              params TEXT NOT NULL,
              status TEXT NOT NULL,
              run_number INTEGER NOT NULL,
              cluster_jobid TEXT,
              cluster_workdir TEXT,
              cluster_workdir_size INTEGER,
              batch_id INTEGER,
              level INTEGER NOT NULL DEFAULT 0,
              prerequisites TEXT NOT NULL,
              share_workdir_with INTEGER,
              workdir_archived INTEGER NOT NULL DEFAULT 0,
              workdir_archive_file_id INTEGER,
              flags TEXT NOT NULL,
              restart_return_status TEXT,
              data_ready_at TEXT,
              handler_lock TEXT,
              locked_at TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_endpoint_status ON tasks(endpoint_id, status);",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_logs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              task_id INTEGER NOT NULL,
              at TEXT NOT NULL,
              message TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id);")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS background_activities (
              activity_id INTEGER PRIMARY KEY AUTOINCREMENT,
              activity_type TEXT NOT NULL,
              user_id INTEGER NOT NULL,
              endpoint_id INTEGER NOT NULL,
              status TEXT NOT NULL,
              handler_lock TEXT,
              items TEXT NOT NULL,
              current_item INTEGER NOT NULL DEFAULT 0,
              num_successes INTEGER NOT NULL DEFAULT 0,
              num_failures INTEGER NOT NULL DEFAULT 0,
              messages TEXT NOT NULL,
              failed_indices TEXT NOT NULL,
              options TEXT NOT NULL,
              retry_count INTEGER NOT NULL DEFAULT 0,
              retry_delay_secs INTEGER NOT NULL DEFAULT 60,
              start_at TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("SQLite store bootstrapped");
        Ok(())
    }

    /// Move a task's last update into the past (staleness tests and tooling)
    pub async fn backdate_task(&self, task_id: TaskId, updated_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE tasks SET updated_at = ? WHERE task_id = ?")
            .bind(ts(updated_at))
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_log(&self, task_id: TaskId) -> Result<Vec<TaskLogEntry>> {
        let rows = sqlx::query("SELECT at, message FROM task_logs WHERE task_id = ? ORDER BY id")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(TaskLogEntry {
                    at: parse_ts(&row.try_get::<String, _>("at")?)?,
                    message: row.try_get("message")?,
                })
            })
            .collect()
    }

    async fn hydrate(&self, row: &SqliteRow) -> Result<Task> {
        let mut task = task_from_row(row)?;
        task.log = self.load_log(task.task_id).await?;
        Ok(task)
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let status: String = row.try_get("status")?;
    let restart_return_status: Option<String> = row.try_get("restart_return_status")?;
    Ok(Task {
        task_id: row.try_get("task_id")?,
        user_id: row.try_get("user_id")?,
        group_id: row.try_get("group_id")?,
        endpoint_id: row.try_get("endpoint_id")?,
        tool_class: row.try_get("tool_class")?,
        tool_config_id: row.try_get("tool_config_id")?,
        description: row.try_get("description")?,
        params: serde_json::from_str(&row.try_get::<String, _>("params")?)?,
        status: parse_status(&status)?,
        run_number: row.try_get("run_number")?,
        cluster_jobid: row.try_get("cluster_jobid")?,
        cluster_workdir: row.try_get("cluster_workdir")?,
        cluster_workdir_size: row.try_get("cluster_workdir_size")?,
        batch_id: row.try_get("batch_id")?,
        level: row.try_get("level")?,
        prerequisites: serde_json::from_str(&row.try_get::<String, _>("prerequisites")?)?,
        share_workdir_with: row.try_get("share_workdir_with")?,
        log: Vec::new(),
        workdir_archived: row.try_get::<i64, _>("workdir_archived")? != 0,
        workdir_archive_file_id: row.try_get("workdir_archive_file_id")?,
        flags: serde_json::from_str(&row.try_get::<String, _>("flags")?)?,
        restart_return_status: restart_return_status
            .as_deref()
            .map(parse_status)
            .transpose()?,
        data_ready_at: parse_opt_ts(row.try_get("data_ready_at")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn activity_from_row(row: &SqliteRow) -> Result<BackgroundActivity> {
    let status: String = row.try_get("status")?;
    Ok(BackgroundActivity {
        activity_id: row.try_get("activity_id")?,
        activity_type: row.try_get("activity_type")?,
        user_id: row.try_get("user_id")?,
        endpoint_id: row.try_get("endpoint_id")?,
        status: ActivityStatus::from_str(&status).map_err(TaskerError::DatabaseError)?,
        handler_lock: row.try_get("handler_lock")?,
        items: serde_json::from_str(&row.try_get::<String, _>("items")?)?,
        current_item: row.try_get::<i64, _>("current_item")? as usize,
        num_successes: row.try_get::<i64, _>("num_successes")? as usize,
        num_failures: row.try_get::<i64, _>("num_failures")? as usize,
        messages: serde_json::from_str(&row.try_get::<String, _>("messages")?)?,
        failed_indices: serde_json::from_str(&row.try_get::<String, _>("failed_indices")?)?,
        options: serde_json::from_str(&row.try_get::<String, _>("options")?)?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        retry_delay_secs: row.try_get("retry_delay_secs")?,
        start_at: parse_opt_ts(row.try_get("start_at")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create_task(&self, new_task: NewTask) -> Result<Task> {
        let now = Utc::now();
        let rec = sqlx::query(
            r#"
            INSERT INTO tasks (
              user_id, group_id, endpoint_id, tool_class, tool_config_id, description,
              params, status, run_number, batch_id, level, prerequisites,
              share_workdir_with, flags, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?)
            RETURNING task_id
            "#,
        )
        .bind(new_task.user_id)
        .bind(new_task.group_id)
        .bind(new_task.endpoint_id)
        .bind(&new_task.tool_class)
        .bind(new_task.tool_config_id)
        .bind(&new_task.description)
        .bind(serde_json::to_string(&new_task.params)?)
        .bind(new_task.status.as_str())
        .bind(new_task.batch_id)
        .bind(new_task.level)
        .bind(serde_json::to_string(&new_task.prerequisites)?)
        .bind(new_task.share_workdir_with)
        .bind(serde_json::to_string(&new_task.flags)?)
        .bind(ts(now))
        .bind(ts(now))
        .fetch_one(&self.pool)
        .await?;
        let task_id: TaskId = rec.try_get("task_id")?;
        self.get_task(task_id).await
    }

    async fn find_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    async fn compare_and_set_status(
        &self,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<CasOutcome> {
        let now = ts(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE tasks
               SET status = ?1,
                   updated_at = ?2,
                   data_ready_at = CASE WHEN ?1 = 'Data Ready' THEN ?2 ELSE data_ready_at END
             WHERE task_id = ?3 AND status = ?4
            "#,
        )
        .bind(to.as_str())
        .bind(&now)
        .bind(task_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(CasOutcome::Applied);
        }

        let found = sqlx::query("SELECT status FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        match found {
            Some(row) => Ok(CasOutcome::Conflict(parse_status(
                &row.try_get::<String, _>("status")?,
            )?)),
            None => Err(TaskerError::TaskNotFound(task_id)),
        }
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
              user_id = ?, group_id = ?, endpoint_id = ?, tool_class = ?, tool_config_id = ?,
              description = ?, params = ?,
              run_number = MAX(run_number, ?),
              cluster_jobid = ?, cluster_workdir = ?, cluster_workdir_size = ?,
              batch_id = COALESCE(batch_id, ?),
              level = ?, prerequisites = ?, share_workdir_with = ?,
              workdir_archived = ?, workdir_archive_file_id = ?, flags = ?,
              restart_return_status = ?,
              data_ready_at = COALESCE(data_ready_at, ?),
              updated_at = ?
            WHERE task_id = ?
            "#,
        )
        .bind(task.user_id)
        .bind(task.group_id)
        .bind(task.endpoint_id)
        .bind(&task.tool_class)
        .bind(task.tool_config_id)
        .bind(&task.description)
        .bind(serde_json::to_string(&task.params)?)
        .bind(task.run_number)
        .bind(&task.cluster_jobid)
        .bind(&task.cluster_workdir)
        .bind(task.cluster_workdir_size)
        .bind(task.batch_id)
        .bind(task.level)
        .bind(serde_json::to_string(&task.prerequisites)?)
        .bind(task.share_workdir_with)
        .bind(i64::from(task.workdir_archived))
        .bind(task.workdir_archive_file_id)
        .bind(serde_json::to_string(&task.flags)?)
        .bind(task.restart_return_status.map(|s| s.as_str()))
        .bind(task.data_ready_at.map(ts))
        .bind(ts(Utc::now()))
        .bind(task.task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TaskerError::TaskNotFound(task.task_id));
        }
        Ok(())
    }

    async fn append_log(&self, task_id: TaskId, entry: &TaskLogEntry) -> Result<()> {
        sqlx::query("INSERT INTO task_logs (task_id, at, message) VALUES (?, ?, ?)")
            .bind(task_id)
            .bind(ts(entry.at))
            .bind(&entry.message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM task_logs WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM tasks WHERE 1 = 1");
        if let Some(endpoint_id) = filter.endpoint_id {
            qb.push(" AND endpoint_id = ").push_bind(endpoint_id);
        }
        if let Some(user_id) = filter.user_id {
            qb.push(" AND user_id = ").push_bind(user_id);
        }
        if !filter.statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut separated = qb.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
        if let Some(before) = filter.updated_before {
            qb.push(" AND updated_at < ").push_bind(ts(before));
        }
        if filter.exclude_archived {
            qb.push(" AND workdir_archived = 0");
        }
        qb.push(" ORDER BY task_id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(self.hydrate(row).await?);
        }
        Ok(tasks)
    }

    async fn find_dependents(&self, task_id: TaskId) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
             WHERE EXISTS (SELECT 1 FROM json_each(tasks.prerequisites, '$.for_setup') WHERE key = ?1)
                OR EXISTS (SELECT 1 FROM json_each(tasks.prerequisites, '$.for_post_processing') WHERE key = ?1)
             ORDER BY task_id
            "#,
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(self.hydrate(row).await?);
        }
        Ok(tasks)
    }

    async fn statuses_of(&self, task_ids: &[TaskId]) -> Result<HashMap<TaskId, TaskStatus>> {
        if task_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT task_id, status FROM tasks WHERE task_id IN (");
        let mut separated = qb.separated(", ");
        for id in task_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok((row.try_get::<TaskId, _>("task_id")?, parse_status(&status)?))
            })
            .collect()
    }

    async fn acquire_lock(
        &self,
        task_id: TaskId,
        holder: &str,
        stale_after: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let cutoff = now
            - ChronoDuration::from_std(stale_after).unwrap_or_else(|_| ChronoDuration::zero());
        let result = sqlx::query(
            r#"
            UPDATE tasks SET handler_lock = ?1, locked_at = ?2
             WHERE task_id = ?3
               AND (handler_lock IS NULL OR handler_lock = ?1 OR locked_at < ?4)
            "#,
        )
        .bind(holder)
        .bind(ts(now))
        .bind(task_id)
        .bind(ts(cutoff))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.find_task(task_id).await? {
            Some(_) => Ok(false),
            None => Err(TaskerError::TaskNotFound(task_id)),
        }
    }

    async fn release_lock(&self, task_id: TaskId, holder: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET handler_lock = NULL, locked_at = NULL WHERE task_id = ? AND handler_lock = ?",
        )
        .bind(task_id)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl ActivityStore for SqliteStore {
    async fn create_activity(&self, activity: BackgroundActivity) -> Result<BackgroundActivity> {
        let rec = sqlx::query(
            r#"
            INSERT INTO background_activities (
              activity_type, user_id, endpoint_id, status, items, current_item,
              num_successes, num_failures, messages, failed_indices, options,
              retry_count, retry_delay_secs, start_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING activity_id
            "#,
        )
        .bind(&activity.activity_type)
        .bind(activity.user_id)
        .bind(activity.endpoint_id)
        .bind(activity.status.as_str())
        .bind(serde_json::to_string(&activity.items)?)
        .bind(activity.current_item as i64)
        .bind(activity.num_successes as i64)
        .bind(activity.num_failures as i64)
        .bind(serde_json::to_string(&activity.messages)?)
        .bind(serde_json::to_string(&activity.failed_indices)?)
        .bind(serde_json::to_string(&activity.options)?)
        .bind(i64::from(activity.retry_count))
        .bind(activity.retry_delay_secs)
        .bind(activity.start_at.map(ts))
        .bind(ts(activity.created_at))
        .bind(ts(activity.updated_at))
        .fetch_one(&self.pool)
        .await?;
        let activity_id: ActivityId = rec.try_get("activity_id")?;
        self.get_activity(activity_id).await
    }

    async fn find_activity(&self, activity_id: ActivityId) -> Result<Option<BackgroundActivity>> {
        let row = sqlx::query("SELECT * FROM background_activities WHERE activity_id = ?")
            .bind(activity_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(activity_from_row).transpose()
    }

    async fn save_activity(&self, activity: &BackgroundActivity) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE background_activities SET
              items = ?, current_item = ?, num_successes = ?, num_failures = ?,
              messages = ?, failed_indices = ?, options = ?, retry_count = ?,
              retry_delay_secs = ?, start_at = ?, updated_at = ?
            WHERE activity_id = ?
            "#,
        )
        .bind(serde_json::to_string(&activity.items)?)
        .bind(activity.current_item as i64)
        .bind(activity.num_successes as i64)
        .bind(activity.num_failures as i64)
        .bind(serde_json::to_string(&activity.messages)?)
        .bind(serde_json::to_string(&activity.failed_indices)?)
        .bind(serde_json::to_string(&activity.options)?)
        .bind(i64::from(activity.retry_count))
        .bind(activity.retry_delay_secs)
        .bind(activity.start_at.map(ts))
        .bind(ts(Utc::now()))
        .bind(activity.activity_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn compare_and_set_activity_status(
        &self,
        activity_id: ActivityId,
        from: ActivityStatus,
        to: ActivityStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE background_activities SET status = ?, updated_at = ? WHERE activity_id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(ts(Utc::now()))
        .bind(activity_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_activities(
        &self,
        endpoint_id: i64,
        statuses: &[ActivityStatus],
    ) -> Result<Vec<BackgroundActivity>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM background_activities WHERE endpoint_id = ");
        qb.push_bind(endpoint_id);
        qb.push(" AND status IN (");
        let mut separated = qb.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
        qb.push(" ORDER BY activity_id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(activity_from_row).collect()
    }

    async fn acquire_activity_lock(&self, activity_id: ActivityId, holder: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE background_activities SET handler_lock = ?1, updated_at = ?2
             WHERE activity_id = ?3 AND (handler_lock IS NULL OR handler_lock = ?1)
            "#,
        )
        .bind(holder)
        .bind(ts(Utc::now()))
        .bind(activity_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_activity_lock(&self, activity_id: ActivityId, holder: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE background_activities SET handler_lock = NULL WHERE activity_id = ? AND handler_lock = ?",
        )
        .bind(activity_id)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn clear_activity_lock(&self, activity_id: ActivityId) -> Result<()> {
        sqlx::query("UPDATE background_activities SET handler_lock = NULL WHERE activity_id = ?")
            .bind(activity_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
