use async_trait::async_trait;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{MetaRecord, MetaStatus, NewMetaRecord},
    expression::ExpressionOperator,
    repositories::{MetaCriteria, MetaScan, MetaStore},
};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

use super::{from_millis, parse_column, to_millis};

/// 每次从数据库读取的候选记录数
const SCAN_BATCH_SIZE: i64 = 500;

pub struct SqliteMetaStore {
    pool: SqlitePool,
}

impl SqliteMetaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_meta(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<MetaRecord> {
        let status: String = row.try_get("status")?;
        let attributes: String = row.try_get("attributes")?;
        let attributes: BTreeMap<String, String> = serde_json::from_str(&attributes)?;
        Ok(MetaRecord {
            id: row.try_get("id")?,
            feed_name: row.try_get("feed_name")?,
            type_name: row.try_get("type_name")?,
            status: parse_column::<MetaStatus>(&status, "status")?,
            create_time: from_millis(row.try_get("create_ms")?)?,
            attributes,
        })
    }

    /// 写入一条元数据记录，供数据接入方使用
    pub async fn append(&self, record: NewMetaRecord) -> SchedulerResult<MetaRecord> {
        let attributes = serde_json::to_string(&record.attributes)?;
        let row = sqlx::query(
            r#"
            INSERT INTO meta_records (feed_name, type_name, status, create_ms, attributes)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id, feed_name, type_name, status, create_ms, attributes
            "#,
        )
        .bind(&record.feed_name)
        .bind(&record.type_name)
        .bind(record.status.as_str())
        .bind(to_millis(record.create_time))
        .bind(&attributes)
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        Self::row_to_meta(&row)
    }

    pub async fn set_status(&self, id: i64, status: MetaStatus) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE meta_records SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::InvalidParams(format!("元数据记录 {id} 不存在")));
        }
        Ok(())
    }
}

#[async_trait]
impl MetaStore for SqliteMetaStore {
    #[instrument(skip(self, expression), fields(min_id = criteria.min_id, max_matches = criteria.max_matches))]
    async fn scan(
        &self,
        expression: &ExpressionOperator,
        criteria: &MetaCriteria,
    ) -> SchedulerResult<MetaScan> {
        let min_create = criteria.min_create_time.map(to_millis).unwrap_or(i64::MIN);
        let max_create = criteria.max_create_time.map(to_millis).unwrap_or(i64::MAX);

        let mut scan = MetaScan::new();
        let mut next_id = criteria.min_id;

        loop {
            let rows = sqlx::query(
                r#"
                SELECT id, feed_name, type_name, status, create_ms, attributes
                FROM meta_records
                WHERE id >= ? AND status IN ('UNLOCKED', 'LOCKED')
                  AND create_ms >= ? AND create_ms < ?
                ORDER BY id ASC
                LIMIT ?
                "#,
            )
            .bind(next_id)
            .bind(min_create)
            .bind(max_create)
            .bind(SCAN_BATCH_SIZE)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

            let batch_len = rows.len() as i64;
            let mut full = false;
            for row in &rows {
                let id: i64 = row.try_get("id").map_err(SchedulerError::Database)?;
                next_id = id + 1;
                let reached = match Self::row_to_meta(row) {
                    Ok(record) => scan.offer(record, expression, criteria),
                    Err(e) => {
                        warn!("元数据记录 {} 无法读取，跳过: {}", id, e);
                        scan.skip_unreadable(id, format!("记录无法读取: {e}"), criteria)
                    }
                };
                if reached {
                    full = true;
                    break;
                }
            }

            if full || batch_len < SCAN_BATCH_SIZE {
                break;
            }
        }

        debug!(
            "元数据扫描完成: 检查 {} 条, 命中 {} 条",
            scan.examined,
            scan.matches.len()
        );
        Ok(scan.finish(criteria))
    }

    async fn max_id(&self) -> SchedulerResult<Option<i64>> {
        let row = sqlx::query("SELECT MAX(id) AS max_id FROM meta_records")
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(row.try_get("max_id")?)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<MetaRecord>> {
        let row = sqlx::query(
            "SELECT id, feed_name, type_name, status, create_ms, attributes FROM meta_records WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_meta(&row)?)),
            None => Ok(None),
        }
    }
}
