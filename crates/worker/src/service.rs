use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_core::config::WorkerConfig;
use scheduler_core::SchedulerResult;

use crate::components::{TaskExecutionManager, TaskSource};
use crate::executor_registry::ExecutorRegistry;

/// 处理节点：按空闲槽位从调度器领取任务，执行后汇报结果
pub struct WorkerService {
    manager: Arc<TaskExecutionManager>,
    source: Arc<dyn TaskSource>,
    poll_interval: Duration,
    enabled: Arc<AtomicBool>,
}

pub struct WorkerServiceBuilder {
    source: Arc<dyn TaskSource>,
    executors: ExecutorRegistry,
    node_name: Option<String>,
    max_concurrent_tasks: usize,
    poll_interval: Duration,
    enabled: bool,
}

impl WorkerServiceBuilder {
    pub fn node_name(mut self, node_name: impl Into<String>) -> Self {
        let node_name = node_name.into();
        if !node_name.trim().is_empty() {
            self.node_name = Some(node_name);
        }
        self
    }

    pub fn max_concurrent_tasks(mut self, max_concurrent_tasks: usize) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn build(self) -> WorkerService {
        let node_name = self.node_name.unwrap_or_else(|| {
            hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string()
        });
        let manager = Arc::new(TaskExecutionManager::new(
            node_name,
            self.executors,
            Arc::clone(&self.source),
            self.max_concurrent_tasks,
        ));
        WorkerService {
            manager,
            source: self.source,
            poll_interval: self.poll_interval,
            enabled: Arc::new(AtomicBool::new(self.enabled)),
        }
    }
}

impl WorkerService {
    pub fn builder(source: Arc<dyn TaskSource>, executors: ExecutorRegistry) -> WorkerServiceBuilder {
        WorkerServiceBuilder {
            source,
            executors,
            node_name: None,
            max_concurrent_tasks: 5,
            poll_interval: Duration::from_secs(5),
            enabled: true,
        }
    }

    pub fn from_config(config: &WorkerConfig, source: Arc<dyn TaskSource>) -> SchedulerResult<Self> {
        let executors = ExecutorRegistry::from_config(config)?;
        Ok(Self::builder(source, executors)
            .node_name(config.node_name.clone())
            .max_concurrent_tasks(config.max_concurrent_tasks)
            .poll_interval(Duration::from_secs(config.poll_interval_seconds))
            .build())
    }

    pub fn node_name(&self) -> &str {
        self.manager.node_name()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// 关闭后节点不再领取新任务，已在执行的任务照常完成
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!("节点 {} 任务领取已{}", self.node_name(), if enabled { "开启" } else { "关闭" });
        }
    }

    pub fn manager(&self) -> &Arc<TaskExecutionManager> {
        &self.manager
    }

    /// 归还上一次运行遗留的任务
    pub async fn release_stale_tasks(&self) -> SchedulerResult<usize> {
        let released = self.source.release_node_tasks(self.node_name()).await?;
        if released > 0 {
            info!("节点 {} 启动时归还遗留任务 {} 个", self.node_name(), released);
        }
        Ok(released)
    }

    /// 按空闲槽位领取一次任务并在后台执行，返回领取的数量
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> SchedulerResult<usize> {
        if !self.is_enabled() || shutdown.is_cancelled() {
            return Ok(0);
        }

        let slots = self.manager.reserve_slots();
        if slots.is_empty() {
            debug!("节点 {} 没有空闲槽位", self.node_name());
            return Ok(0);
        }

        let handles = self
            .source
            .assign_tasks(self.node_name(), slots.len() as i64)
            .await?;
        if handles.is_empty() {
            return Ok(0);
        }

        if shutdown.is_cancelled() {
            let ids: Vec<i64> = handles.iter().map(|h| h.task_id).collect();
            self.abandon(&ids).await;
            return Ok(0);
        }

        let mut slots = slots.into_iter();
        let mut surplus = Vec::new();
        let mut started = 0;
        for handle in handles {
            match slots.next() {
                Some(permit) => {
                    self.manager.spawn(handle, permit);
                    started += 1;
                }
                None => surplus.push(handle.task_id),
            }
        }
        if !surplus.is_empty() {
            warn!("调度器返回的任务数超过请求数量，归还 {} 个", surplus.len());
            self.abandon(&surplus).await;
        }

        debug!("节点 {} 领取任务 {} 个", self.node_name(), started);
        Ok(started)
    }

    async fn abandon(&self, task_ids: &[i64]) {
        match self.source.abandon_tasks(self.node_name(), task_ids).await {
            Ok(released) => info!("节点 {} 归还未执行的任务 {} 个", self.node_name(), released),
            Err(e) => error!("归还任务失败: {}", e),
        }
    }

    pub async fn wait_idle(&self) -> SchedulerResult<()> {
        self.manager.wait_idle().await
    }

    /// 运行领取循环直到收到停止信号，退出前等待执行中的任务结束
    pub async fn run(&self, shutdown: CancellationToken) -> SchedulerResult<()> {
        info!(
            "启动处理节点: {}, 处理器类型: {:?}",
            self.node_name(),
            self.manager.supported_kinds()
        );

        if let Err(e) = self.release_stale_tasks().await {
            warn!("归还遗留任务失败，继续启动: {}", e);
        }

        // 多个节点同时启动时错开领取时间
        let jitter_ms = rand::rng().random_range(0..=self.poll_interval.as_millis() as u64 / 2);
        tokio::select! {
            _ = sleep(Duration::from_millis(jitter_ms)) => {}
            _ = shutdown.cancelled() => {}
        }

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(&shutdown).await {
                        error!("领取任务失败: {}", e);
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("处理节点 {} 收到停止信号", self.node_name());
                    break;
                }
            }
        }

        let running = self.manager.running_task_ids().await;
        if !running.is_empty() {
            info!("等待 {} 个执行中的任务结束", running.len());
        }
        self.wait_idle().await?;
        info!("处理节点 {} 已停止", self.node_name());
        Ok(())
    }
}
