use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{Filter, FilterTracker, NewFilter, TrackerStatus},
    repositories::FilterRepository,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{from_millis, from_optional_millis, parse_column, to_millis};

const FILTER_COLUMNS: &str = "id, uuid, name, expression, priority, auto_priority, enabled, \
     processor_kind, min_meta_create_ms, max_meta_create_ms, max_processing_tasks, run_as, \
     created_ms, updated_ms";

pub struct SqliteFilterRepository {
    pool: SqlitePool,
}

impl SqliteFilterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_filter(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Filter> {
        let expression: String = row.try_get("expression")?;
        let max_processing_tasks: Option<i64> = row.try_get("max_processing_tasks")?;
        Ok(Filter {
            id: row.try_get("id")?,
            uuid: row.try_get("uuid")?,
            name: row.try_get("name")?,
            expression: serde_json::from_str(&expression)?,
            priority: row.try_get("priority")?,
            auto_priority: row.try_get("auto_priority")?,
            enabled: row.try_get("enabled")?,
            processor_kind: row.try_get("processor_kind")?,
            min_meta_create_time: from_optional_millis(row.try_get("min_meta_create_ms")?)?,
            max_meta_create_time: from_optional_millis(row.try_get("max_meta_create_ms")?)?,
            max_processing_tasks: max_processing_tasks.map(|v| v.max(0) as u32),
            run_as: row.try_get("run_as")?,
            created_at: from_millis(row.try_get("created_ms")?)?,
            updated_at: from_millis(row.try_get("updated_ms")?)?,
        })
    }

    fn row_to_tracker(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<FilterTracker> {
        let status: String = row.try_get("status")?;
        let last_poll_task_count: i64 = row.try_get("last_poll_task_count")?;
        let meta_count: i64 = row.try_get("meta_count")?;
        Ok(FilterTracker {
            filter_id: row.try_get("filter_id")?,
            min_meta_id: row.try_get("min_meta_id")?,
            last_poll_at: from_optional_millis(row.try_get("last_poll_ms")?)?,
            last_poll_task_count: last_poll_task_count.max(0) as u64,
            meta_count: meta_count.max(0) as u64,
            status: parse_column::<TrackerStatus>(&status, "status")?,
            message: row.try_get("message")?,
        })
    }
}

#[async_trait]
impl FilterRepository for SqliteFilterRepository {
    #[instrument(skip(self, filter), fields(name = %filter.name))]
    async fn create(&self, filter: &NewFilter, priority: i32, run_as: &str) -> SchedulerResult<Filter> {
        let now = to_millis(Utc::now());
        let sql = format!(
            r#"
            INSERT INTO processor_filters (uuid, name, expression, priority, auto_priority, enabled,
                processor_kind, min_meta_create_ms, max_meta_create_ms, max_processing_tasks,
                run_as, created_ms, updated_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {FILTER_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(&filter.name)
            .bind(serde_json::to_string(&filter.expression)?)
            .bind(priority)
            .bind(filter.auto_priority)
            .bind(filter.enabled)
            .bind(&filter.processor_kind)
            .bind(filter.min_meta_create_time.map(to_millis))
            .bind(filter.max_meta_create_time.map(to_millis))
            .bind(filter.max_processing_tasks.map(i64::from))
            .bind(run_as)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        let created = Self::row_to_filter(&row)?;
        debug!("创建过滤器成功: {}", created.entity_description());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Filter>> {
        let sql = format!("SELECT {FILTER_COLUMNS} FROM processor_filters WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_filter(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> SchedulerResult<Vec<Filter>> {
        let sql = format!("SELECT {FILTER_COLUMNS} FROM processor_filters ORDER BY id ASC");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_filter).collect()
    }

    async fn update(&self, filter: &Filter) -> SchedulerResult<Filter> {
        let sql = format!(
            r#"
            UPDATE processor_filters
            SET name = ?, expression = ?, priority = ?, auto_priority = ?, enabled = ?,
                processor_kind = ?, min_meta_create_ms = ?, max_meta_create_ms = ?,
                max_processing_tasks = ?, updated_ms = ?
            WHERE id = ?
            RETURNING {FILTER_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&filter.name)
            .bind(serde_json::to_string(&filter.expression)?)
            .bind(filter.priority)
            .bind(filter.auto_priority)
            .bind(filter.enabled)
            .bind(&filter.processor_kind)
            .bind(filter.min_meta_create_time.map(to_millis))
            .bind(filter.max_meta_create_time.map(to_millis))
            .bind(filter.max_processing_tasks.map(i64::from))
            .bind(to_millis(Utc::now()))
            .bind(filter.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => {
                let updated = Self::row_to_filter(&row)?;
                debug!("更新过滤器成功: {}", updated.entity_description());
                Ok(updated)
            }
            None => Err(SchedulerError::FilterNotFound { id: filter.id }),
        }
    }

    async fn delete(&self, id: i64) -> SchedulerResult<bool> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;
        sqlx::query("DELETE FROM processor_filter_trackers WHERE filter_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(SchedulerError::Database)?;
        let result = sqlx::query("DELETE FROM processor_filters WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(SchedulerError::Database)?;
        tx.commit().await.map_err(SchedulerError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_tracker(&self, filter_id: i64) -> SchedulerResult<FilterTracker> {
        let row = sqlx::query(
            r#"
            SELECT filter_id, min_meta_id, last_poll_ms, last_poll_task_count, meta_count, status, message
            FROM processor_filter_trackers WHERE filter_id = ?
            "#,
        )
        .bind(filter_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Self::row_to_tracker(&row),
            None => Ok(FilterTracker::new(filter_id)),
        }
    }

    async fn save_tracker(&self, tracker: &FilterTracker) -> SchedulerResult<()> {
        if self.get_by_id(tracker.filter_id).await?.is_none() {
            return Err(SchedulerError::FilterNotFound {
                id: tracker.filter_id,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO processor_filter_trackers
                (filter_id, min_meta_id, last_poll_ms, last_poll_task_count, meta_count, status, message)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (filter_id) DO UPDATE SET
                min_meta_id = excluded.min_meta_id,
                last_poll_ms = excluded.last_poll_ms,
                last_poll_task_count = excluded.last_poll_task_count,
                meta_count = excluded.meta_count,
                status = excluded.status,
                message = excluded.message
            "#,
        )
        .bind(tracker.filter_id)
        .bind(tracker.min_meta_id)
        .bind(tracker.last_poll_at.map(to_millis))
        .bind(tracker.last_poll_task_count as i64)
        .bind(tracker.meta_count as i64)
        .bind(tracker.status.as_str())
        .bind(&tracker.message)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Ok(())
    }
}
