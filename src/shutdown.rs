use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 优雅关闭管理器
///
/// 所有后台循环持有同一个令牌的子令牌；触发关闭后正在进行的任务创建也会在
/// 下一个过滤器边界停下。
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    is_shutdown: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            is_shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 订阅关闭信号
    pub fn subscribe(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// 触发关闭，重复调用无效果
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            debug!("关闭管理器已经触发过关闭");
            return;
        }
        info!("触发系统关闭");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// 等待关闭信号
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscribers_receive_shutdown() {
        let manager = ShutdownManager::new();
        let first = manager.subscribe();
        let second = manager.subscribe();
        assert!(!first.is_cancelled());

        manager.shutdown();

        tokio::time::timeout(Duration::from_secs(1), first.cancelled())
            .await
            .unwrap();
        assert!(second.is_cancelled());
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown_is_cancelled() {
        let manager = ShutdownManager::new();
        manager.shutdown();
        manager.shutdown();
        assert!(manager.subscribe().is_cancelled());
        manager.wait_for_shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelling_subscriber_does_not_shut_down() {
        let manager = ShutdownManager::new();
        let token = manager.subscribe();
        token.cancel();
        assert!(!manager.is_shutdown());
        assert!(!manager.subscribe().is_cancelled());
    }
}
