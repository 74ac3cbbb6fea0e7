pub mod sqlite_filter_repository;
pub mod sqlite_meta_store;
pub mod sqlite_task_store;

pub use sqlite_filter_repository::SqliteFilterRepository;
pub use sqlite_meta_store::SqliteMetaStore;
pub use sqlite_task_store::SqliteTaskStore;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use scheduler_core::config::DatabaseConfig;
use scheduler_core::{SchedulerError, SchedulerResult};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("解析数据库连接串失败: {}", config.url))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(1800)) // 30分钟默认生命周期
            .connect_with(options)
            .await
            .context("连接数据库失败")?;

        Ok(Self { pool })
    }

    /// 单连接的内存数据库，测试使用
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("创建内存数据库失败")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("执行数据库迁移失败")?;
        info!("数据库迁移完成");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// 时间统一按毫秒整数存储，便于范围比较
pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> SchedulerResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SchedulerError::DatabaseOperation(format!("无效的时间戳: {ms}")))
}

pub(crate) fn from_optional_millis(ms: Option<i64>) -> SchedulerResult<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

pub(crate) fn parse_column<T>(value: &str, column: &str) -> SchedulerResult<T>
where
    T: FromStr<Err = String>,
{
    value
        .parse::<T>()
        .map_err(|e| SchedulerError::DatabaseOperation(format!("列 {column} 的值无效: {e}")))
}
