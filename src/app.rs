use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use scheduler_api::create_app;
use scheduler_core::config::{AppConfig, StorageKind, TuningHandle};
use scheduler_core::CallerContext;
use scheduler_dispatcher::{
    DispatcherComponents, ReclaimService, TaskCreationController, TaskReclaimService,
};
use scheduler_domain::repositories::{FilterRepository, MetaStore, TaskStore};
use scheduler_infrastructure::{
    init_metrics, DatabaseManager, InMemoryFilterRepository, InMemoryMetaStore,
    InMemoryTaskStore, MetricsCollector, SqliteFilterRepository, SqliteMetaStore,
    SqliteTaskStore, StructuredLogger,
};
use scheduler_worker::{DispatcherClient, LocalTaskSource, TaskSource, WorkerService};
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行任务创建和超时回收
    Dispatcher,
    /// 仅运行处理节点
    Worker,
    /// 仅运行API服务器
    Api,
    /// 运行所有组件
    All,
}

impl AppMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "dispatcher" => Ok(AppMode::Dispatcher),
            "worker" => Ok(AppMode::Worker),
            "api" => Ok(AppMode::Api),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {mode}")),
        }
    }

    /// 该模式下是否需要本地存储
    fn needs_storage(self, config: &AppConfig) -> bool {
        !(self == AppMode::Worker && config.worker.dispatcher_url.is_some())
    }
}

/// 主应用程序
#[derive(Clone)]
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    dispatcher: Option<DispatcherComponents>,
    database: Option<Arc<DatabaseManager>>,
    metrics_handle: Option<PrometheusHandle>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);
        check_mode_enabled(mode, &config)?;

        // 指标记录器必须在创建指标句柄之前安装
        let metrics_handle = if config.observability.metrics_enabled {
            Some(init_metrics().context("初始化指标导出失败")?)
        } else {
            None
        };

        let (dispatcher, database) = if mode.needs_storage(&config) {
            let metrics = Arc::new(MetricsCollector::new().context("创建指标收集器失败")?);
            let (filters, metas, tasks, database) = create_storage(&config).await?;
            let components = DispatcherComponents::build(
                filters,
                metas,
                tasks,
                TuningHandle::new(config.tuning.clone()),
                metrics,
                &config.dispatcher,
            );
            (Some(components), database)
        } else {
            info!("Worker使用远程调度器，不打开本地存储");
            (None, None)
        };

        Ok(Self {
            config,
            mode,
            dispatcher,
            database,
            metrics_handle,
        })
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    pub fn dispatcher(&self) -> Result<&DispatcherComponents> {
        self.dispatcher
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("当前模式未初始化调度组件"))
    }

    /// 运行到关闭令牌被取消
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        let result = match self.mode {
            AppMode::Dispatcher => self.run_dispatcher(shutdown).await,
            AppMode::Worker => self.run_worker(shutdown).await,
            AppMode::Api => self.run_api(shutdown).await,
            AppMode::All => self.run_all_components(shutdown).await,
        };

        if let Some(database) = &self.database {
            database.close().await;
            info!("数据库连接已关闭");
        }
        result
    }

    async fn run_dispatcher(&self, shutdown: CancellationToken) -> Result<()> {
        info!("启动Dispatcher服务");
        let dispatcher = self.dispatcher()?;
        let config = &self.config.dispatcher;

        let creation_handle = {
            let controller = Arc::clone(&dispatcher.controller);
            let interval = Duration::from_secs(config.create_interval_seconds);
            let on_startup = config.create_on_startup;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_creation_loop(controller, interval, on_startup, shutdown).await;
            })
        };

        let reclaim_handle = {
            let reclaimer = Arc::clone(&dispatcher.reclaimer);
            let interval = Duration::from_secs(config.reclaim_interval_seconds);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_reclaim_loop(reclaimer, interval, shutdown).await;
            })
        };

        let (creation, reclaim) = tokio::join!(creation_handle, reclaim_handle);
        creation.context("任务创建循环异常退出")?;
        reclaim.context("超时回收循环异常退出")?;

        info!("Dispatcher服务已停止");
        Ok(())
    }

    async fn run_worker(&self, shutdown: CancellationToken) -> Result<()> {
        let source: Arc<dyn TaskSource> = match &self.config.worker.dispatcher_url {
            Some(url) => {
                info!("Worker连接远程调度器: {}", url);
                Arc::new(DispatcherClient::new(url.clone()))
            }
            None => Arc::new(LocalTaskSource::new(self.dispatcher()?.clone())),
        };

        let worker = WorkerService::from_config(&self.config.worker, source)
            .context("创建Worker服务失败")?;
        info!("启动Worker服务: {}", worker.node_name());

        worker.run(shutdown).await?;

        info!("Worker服务已停止");
        Ok(())
    }

    async fn run_api(&self, shutdown: CancellationToken) -> Result<()> {
        let bind_address = &self.config.api.bind_address;
        info!("启动API服务器: {}", bind_address);

        let app = create_app(
            self.dispatcher()?.clone(),
            self.metrics_handle.clone(),
            shutdown.clone(),
            &self.config.api,
        );

        let listener = TcpListener::bind(bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {bind_address}"))?;
        info!("API服务器启动在 http://{}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("API服务器收到关闭信号");
            })
            .await
            .context("API服务器运行失败")?;

        info!("API服务器已停止");
        Ok(())
    }

    async fn run_all_components(&self, shutdown: CancellationToken) -> Result<()> {
        info!("启动所有组件");

        let mut handles = Vec::new();
        let components = [
            (AppMode::Dispatcher, self.config.dispatcher.enabled),
            (AppMode::Worker, self.config.worker.enabled),
            (AppMode::Api, self.config.api.enabled),
        ];

        for (mode, enabled) in components {
            if !enabled {
                info!("{:?} 已在配置中禁用", mode);
                continue;
            }
            let app = self.clone_for_mode(mode);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let result = match mode {
                    AppMode::Dispatcher => app.run_dispatcher(shutdown.clone()).await,
                    AppMode::Worker => app.run_worker(shutdown.clone()).await,
                    _ => app.run_api(shutdown.clone()).await,
                };
                if let Err(e) = result {
                    error!("{:?} 运行失败: {:#}", mode, e);
                    // 任一组件失败时整体退出
                    shutdown.cancel();
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("组件任务异常退出: {}", e);
            }
        }

        info!("所有组件已停止");
        Ok(())
    }

    fn clone_for_mode(&self, mode: AppMode) -> Self {
        Self {
            mode,
            // 只有顶层实例负责关闭数据库
            database: None,
            ..self.clone()
        }
    }
}

fn check_mode_enabled(mode: AppMode, config: &AppConfig) -> Result<()> {
    let enabled = match mode {
        AppMode::Dispatcher => config.dispatcher.enabled,
        AppMode::Worker => config.worker.enabled,
        AppMode::Api => config.api.enabled,
        AppMode::All => true,
    };
    if enabled {
        Ok(())
    } else {
        Err(anyhow::anyhow!("{mode:?}模式被禁用，请检查配置"))
    }
}

type Storage = (
    Arc<dyn FilterRepository>,
    Arc<dyn MetaStore>,
    Arc<dyn TaskStore>,
    Option<Arc<DatabaseManager>>,
);

async fn create_storage(config: &AppConfig) -> Result<Storage> {
    match config.database.storage {
        StorageKind::Memory => {
            warn!("使用内存存储，进程退出后数据丢失");
            Ok((
                Arc::new(InMemoryFilterRepository::new()),
                Arc::new(InMemoryMetaStore::new()),
                Arc::new(InMemoryTaskStore::new()),
                None,
            ))
        }
        StorageKind::Sqlite => {
            info!("连接数据库: {}", mask_database_url(&config.database.url));
            let database = DatabaseManager::new(&config.database).await?;
            database.migrate().await?;
            info!("数据库连接成功");

            let pool = database.pool().clone();
            Ok((
                Arc::new(SqliteFilterRepository::new(pool.clone())),
                Arc::new(SqliteMetaStore::new(pool.clone())),
                Arc::new(SqliteTaskStore::new(pool)),
                Some(Arc::new(database)),
            ))
        }
    }
}

/// 周期性执行任务创建
///
/// 同一时刻最多一轮；上一轮未结束时本次触发直接跳过。
async fn run_creation_loop(
    controller: Arc<TaskCreationController>,
    period: Duration,
    run_on_startup: bool,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if !run_on_startup {
        interval.tick().await;
    }
    let ctx = CallerContext::processing();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match controller.create_tasks(&ctx, &shutdown).await {
                    Ok(Some(report)) => debug!(
                        "本轮任务创建完成: 访问过滤器 {} 个, 创建任务 {} 个, 耗时 {}ms",
                        report.filters_visited, report.tasks_created, report.duration_ms
                    ),
                    Ok(None) => debug!("上一轮任务创建尚未结束，跳过"),
                    Err(e) => StructuredLogger::log_system_error("dispatcher", "create_tasks", &e),
                }
            }
            _ = shutdown.cancelled() => {
                info!("任务创建循环收到关闭信号");
                break;
            }
        }
    }
}

/// 周期性回收超时未完成的任务
async fn run_reclaim_loop(
    reclaimer: Arc<TaskReclaimService>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctx = CallerContext::processing();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match reclaimer.reclaim_expired(&ctx, Utc::now()).await {
                    Ok(report) if !report.reclaimed_task_ids.is_empty() => info!(
                        "回收超时任务 {} 个, 冲突 {} 个",
                        report.reclaimed_task_ids.len(), report.conflicts
                    ),
                    Ok(_) => {}
                    Err(e) => StructuredLogger::log_system_error("dispatcher", "reclaim_expired", &e),
                }
            }
            _ = shutdown.cancelled() => {
                info!("超时回收循环收到关闭信号");
                break;
            }
        }
    }
}

/// 屏蔽数据库URL中的敏感信息
pub fn mask_database_url(url: &str) -> String {
    let start = url.find("://").map(|pos| pos + 3).unwrap_or(0);
    if let Some(at_pos) = url[start..].find('@').map(|pos| pos + start) {
        if let Some(colon_pos) = url[start..at_pos].rfind(':').map(|pos| pos + start) {
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "***");
            return masked;
        }
    }
    url.to_string()
}
