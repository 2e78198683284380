//! SQLite implementation of [`TaskStore`].
//!
//! Migrations under `./migrations` are embedded at compile time and run on
//! [`SqliteTaskStore::connect`]. Queries use the runtime-checked
//! `sqlx::query` form so no `DATABASE_URL` is needed to build.
//!
//! JSON columns (`param`, `modelConfig`, `jobResult`, `result`) hold encoded
//! text; an empty or unparsable value reads back as JSON `null` for `result`
//! and `{}` for the others.

use aigcpanel_core::task::{now_millis, INTERRUPTED_MSG};
use aigcpanel_core::{CoreError, NewTask, Task, TaskStatus, TaskStore, TaskUpdate};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

type Result<T> = std::result::Result<T, CoreError>;

const COLUMNS: &str = "id, createdAt, updatedAt, biz, type, title, status, statusMsg, startTime, endTime, \
                       serverName, serverTitle, serverVersion, param, jobResult, modelConfig, result";

/// SQLite-backed task store.
#[derive(Clone, Debug)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (or create) the database at `url` and run pending migrations.
    pub async fn connect(url: &str) -> std::result::Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(url).await?;
        Self::with_pool(pool).await
    }

    /// Single-connection in-memory database; every connection to
    /// `sqlite::memory:` would otherwise see its own empty database.
    pub async fn in_memory() -> std::result::Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> std::result::Result<Self, sqlx::Error> {
        // Path is resolved relative to CARGO_MANIFEST_DIR at compile time.
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

impl SqliteTaskStore {
    /// Run one partial `UPDATE`, guarded by `expected` status when given.
    /// Returns the number of rows written.
    async fn write_update(&self, id: i64, update: TaskUpdate, expected: Option<TaskStatus>) -> Result<u64> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE data_task SET updatedAt = ");
        query.push_bind(now_millis());
        if let Some(status) = update.status {
            query.push(", status = ").push_bind(status.as_ref().to_owned());
        }
        if let Some(msg) = update.status_msg {
            query.push(", statusMsg = ").push_bind(msg);
        }
        if let Some(at) = update.start_time {
            query.push(", startTime = ").push_bind(at);
        }
        if let Some(at) = update.end_time {
            query.push(", endTime = ").push_bind(at);
        }
        if let Some(name) = update.server_name {
            query.push(", serverName = ").push_bind(name);
        }
        if let Some(title) = update.server_title {
            query.push(", serverTitle = ").push_bind(title);
        }
        if let Some(version) = update.server_version {
            query.push(", serverVersion = ").push_bind(version);
        }
        if let Some(job) = update.job_result {
            query.push(", jobResult = ").push_bind(encode(&job));
        }
        if let Some(result) = update.result {
            query.push(", result = ").push_bind(encode(&result));
        }
        query.push(" WHERE id = ").push_bind(id);
        if let Some(expected) = expected {
            query.push(" AND status = ").push_bind(expected.as_ref().to_owned());
        }

        let done = query.build().execute(&self.pool).await.map_err(store_err)?;
        Ok(done.rows_affected())
    }
}

fn store_err(e: sqlx::Error) -> CoreError {
    CoreError::Store(e.to_string())
}

fn encode(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn decode(raw: &str, empty: Value) -> Value {
    if raw.trim().is_empty() {
        return empty;
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "unparsable JSON column, keeping it as a string");
        Value::String(raw.to_owned())
    })
}

fn task_from_row(row: &SqliteRow) -> std::result::Result<Task, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let empty_object = || Value::Object(Default::default());
    Ok(Task {
        id: row.try_get("id")?,
        created_at: row.try_get("createdAt")?,
        updated_at: row.try_get("updatedAt")?,
        biz: row.try_get("biz")?,
        kind: row.try_get("type")?,
        title: row.try_get("title")?,
        status: status.parse().unwrap_or_else(|_| {
            tracing::warn!(raw = %status, "unknown task status; treating as fail");
            TaskStatus::Fail
        }),
        status_msg: row.try_get("statusMsg")?,
        start_time: row.try_get("startTime")?,
        end_time: row.try_get("endTime")?,
        server_name: row.try_get("serverName")?,
        server_title: row.try_get("serverTitle")?,
        server_version: row.try_get("serverVersion")?,
        param: decode(row.try_get("param")?, empty_object()),
        job_result: decode(row.try_get("jobResult")?, empty_object()),
        model_config: decode(row.try_get("modelConfig")?, empty_object()),
        result: decode(row.try_get("result")?, Value::Null),
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn list_queued(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM data_task WHERE status = ?1 ORDER BY id DESC"))
            .bind(TaskStatus::Queue.as_ref())
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(task_from_row).collect::<std::result::Result<_, _>>().map_err(store_err)
    }

    async fn get_task(&self, id: i64) -> Result<Task> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM data_task WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or(CoreError::TaskNotFound { id })?;
        task_from_row(&row).map_err(store_err)
    }

    async fn update_task(&self, id: i64, update: TaskUpdate) -> Result<Task> {
        if self.write_update(id, update, None).await? == 0 {
            return Err(CoreError::TaskNotFound { id });
        }
        self.get_task(id).await
    }

    async fn transition(&self, id: i64, expected: TaskStatus, update: TaskUpdate) -> Result<Option<Task>> {
        if self.write_update(id, update, Some(expected)).await? == 0 {
            // Distinguish a missing row from one that moved on.
            self.get_task(id).await?;
            return Ok(None);
        }
        self.get_task(id).await.map(Some)
    }

    async fn create_task(&self, new: NewTask) -> Result<Task> {
        let task = new.into_task(0, now_millis());
        let done = sqlx::query(
            "INSERT INTO data_task (createdAt, updatedAt, biz, type, title, status, statusMsg, startTime, endTime, \
             serverName, serverTitle, serverVersion, param, jobResult, modelConfig, result) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(&task.biz)
        .bind(task.kind)
        .bind(&task.title)
        .bind(task.status.as_ref())
        .bind(&task.status_msg)
        .bind(task.start_time)
        .bind(task.end_time)
        .bind(&task.server_name)
        .bind(&task.server_title)
        .bind(&task.server_version)
        .bind(encode(&task.param))
        .bind(encode(&task.job_result))
        .bind(encode(&task.model_config))
        .bind(encode(&task.result))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        self.get_task(done.last_insert_rowid()).await
    }

    async fn requeue_interrupted(&self) -> Result<u64> {
        let done = sqlx::query("UPDATE data_task SET status = ?1, statusMsg = ?2, updatedAt = ?3 WHERE status = ?4")
            .bind(TaskStatus::Queue.as_ref())
            .bind(INTERRUPTED_MSG)
            .bind(now_millis())
            .bind(TaskStatus::Running.as_ref())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(done.rows_affected())
    }
}
