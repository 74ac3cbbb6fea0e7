use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{Task, TaskStatus, TaskTransition},
    repositories::{CreateOutcome, TaskQuery, TaskStore},
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};

use super::{from_millis, from_optional_millis, parse_column, to_millis};

const TASK_COLUMNS: &str = "id, filter_id, meta_id, status, node_name, version, created_ms, \
     status_ms, assigned_ms, records_read, records_written, error_markers";

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Task> {
        let status: String = row.try_get("status")?;
        let error_markers: String = row.try_get("error_markers")?;
        let records_read: i64 = row.try_get("records_read")?;
        let records_written: i64 = row.try_get("records_written")?;
        Ok(Task {
            id: row.try_get("id")?,
            filter_id: row.try_get("filter_id")?,
            meta_id: row.try_get("meta_id")?,
            status: parse_column::<TaskStatus>(&status, "status")?,
            node_name: row.try_get("node_name")?,
            version: row.try_get("version")?,
            created_at: from_millis(row.try_get("created_ms")?)?,
            status_at: from_millis(row.try_get("status_ms")?)?,
            assigned_at: from_optional_millis(row.try_get("assigned_ms")?)?,
            records_read: records_read.max(0) as u64,
            records_written: records_written.max(0) as u64,
            error_markers: serde_json::from_str(&error_markers)?,
        })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self, now))]
    async fn create(
        &self,
        filter_id: i64,
        meta_id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<CreateOutcome> {
        let sql = format!(
            r#"
            INSERT INTO processor_tasks (filter_id, meta_id, status, version, created_ms, status_ms)
            VALUES (?, ?, 'UNASSIGNED', 0, ?, ?)
            ON CONFLICT (filter_id, meta_id) DO NOTHING
            RETURNING {TASK_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(filter_id)
            .bind(meta_id)
            .bind(to_millis(now))
            .bind(to_millis(now))
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => {
                let task = Self::row_to_task(&row)?;
                debug!("创建任务成功: {}", task.entity_description());
                Ok(CreateOutcome::Created(task))
            }
            None => Ok(CreateOutcome::Duplicate),
        }
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM processor_tasks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn find(&self, query: &TaskQuery) -> SchedulerResult<Vec<Task>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {TASK_COLUMNS} FROM processor_tasks WHERE 1 = 1"
        ));

        if let Some(filter_id) = query.filter_id {
            builder.push(" AND filter_id = ").push_bind(filter_id);
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(node_name) = &query.node_name {
            builder.push(" AND node_name = ").push_bind(node_name.clone());
        }
        if let Some(cutoff) = query.assigned_before {
            builder
                .push(" AND assigned_ms IS NOT NULL AND assigned_ms < ")
                .push_bind(to_millis(cutoff));
        }
        builder.push(" ORDER BY id ASC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn count(&self, filter_id: i64, status: TaskStatus) -> SchedulerResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM processor_tasks WHERE filter_id = ? AND status = ?",
        )
        .bind(filter_id)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        let count: i64 = row.try_get("cnt")?;
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self, observed, transition), fields(task_id = observed.id, version = observed.version))]
    async fn compare_and_swap(
        &self,
        observed: &Task,
        transition: &TaskTransition,
    ) -> SchedulerResult<Option<Task>> {
        let next = transition
            .apply(observed)
            .ok_or_else(|| SchedulerError::TaskStateConflict {
                id: observed.id,
                message: format!(
                    "不能从 {} 迁移到 {}",
                    observed.status,
                    transition.to_status()
                ),
            })?;

        let sql = format!(
            r#"
            UPDATE processor_tasks
            SET status = ?, node_name = ?, version = ?, status_ms = ?, assigned_ms = ?,
                records_read = ?, records_written = ?, error_markers = ?
            WHERE id = ? AND version = ? AND status = ?
            RETURNING {TASK_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(next.status.as_str())
            .bind(&next.node_name)
            .bind(next.version)
            .bind(to_millis(next.status_at))
            .bind(next.assigned_at.map(to_millis))
            .bind(next.records_read as i64)
            .bind(next.records_written as i64)
            .bind(serde_json::to_string(&next.error_markers)?)
            .bind(observed.id)
            .bind(observed.version)
            .bind(observed.status.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_task(&row)?)),
            None => {
                if self.get_by_id(observed.id).await?.is_none() {
                    return Err(SchedulerError::TaskNotFound { id: observed.id });
                }
                debug!("任务 {} 的版本已变化，比较交换失败", observed.id);
                Ok(None)
            }
        }
    }
}
