use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use scheduler_core::config::ShellProcessorConfig;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::entities::{OutcomeStats, TaskHandle, TaskOutcome};

/// 错误标记最多保留的条数
const MAX_ERROR_MARKERS: usize = 20;

/// 单个任务的执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    pub outcome: TaskOutcome,
    pub stats: OutcomeStats,
}

impl ExecutionOutput {
    pub fn complete(stats: OutcomeStats) -> Self {
        Self {
            outcome: TaskOutcome::Complete,
            stats,
        }
    }

    pub fn failed(stats: OutcomeStats) -> Self {
        Self {
            outcome: TaskOutcome::Failed,
            stats,
        }
    }
}

/// 某一处理器类型的执行适配器
///
/// 返回 `Err` 表示执行本身出错，调用方按失败汇报。
#[async_trait]
pub trait ExecutorAdapter: Send + Sync {
    fn processor_kind(&self) -> &str;

    async fn execute(&self, handle: &TaskHandle) -> SchedulerResult<ExecutionOutput>;
}

/// 不做任何处理直接完成
pub struct NoopExecutor {
    kind: String,
}

impl NoopExecutor {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

#[async_trait]
impl ExecutorAdapter for NoopExecutor {
    fn processor_kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, handle: &TaskHandle) -> SchedulerResult<ExecutionOutput> {
        debug!("空处理器完成任务 {}", handle.task_id);
        Ok(ExecutionOutput::complete(OutcomeStats {
            records_read: 1,
            ..Default::default()
        }))
    }
}

/// 为每个任务启动一次外部命令
///
/// 任务信息通过环境变量 `TASK_ID`、`META_ID`、`FILTER_ID`、`PROCESSOR_KIND` 传入。
/// 标准输出的每一行计为一条写出记录，标准错误的每一行作为错误标记。
pub struct ShellExecutor {
    kind: String,
    config: ShellProcessorConfig,
}

impl ShellExecutor {
    pub fn new(kind: impl Into<String>, config: ShellProcessorConfig) -> Self {
        Self {
            kind: kind.into(),
            config,
        }
    }

    async fn run(&self, handle: &TaskHandle) -> SchedulerResult<(Option<i32>, Vec<String>, Vec<String>)> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .env("TASK_ID", handle.task_id.to_string())
            .env("META_ID", handle.meta_id.to_string())
            .env("FILTER_ID", handle.filter_id.to_string())
            .env("PROCESSOR_KIND", &handle.processor_kind)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SchedulerError::Execution(format!("启动命令 {} 失败: {e}", self.config.command)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SchedulerError::Execution("无法获取stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SchedulerError::Execution("无法获取stderr".to_string()))?;

        let (stdout_lines, stderr_lines) = tokio::join!(read_lines(stdout), read_lines(stderr));

        let status = child
            .wait()
            .await
            .map_err(|e| SchedulerError::Execution(format!("等待进程结束失败: {e}")))?;

        Ok((status.code(), stdout_lines, stderr_lines))
    }
}

async fn read_lines<R: AsyncRead + Unpin>(reader: R) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut collected = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        collected.push(line);
    }
    collected
}

#[async_trait]
impl ExecutorAdapter for ShellExecutor {
    fn processor_kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, handle: &TaskHandle) -> SchedulerResult<ExecutionOutput> {
        let started = Instant::now();
        info!(
            "执行命令: task_id={}, command={}, args={:?}",
            handle.task_id, self.config.command, self.config.args
        );

        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let (exit_code, stdout_lines, stderr_lines) = tokio::time::timeout(timeout, self.run(handle))
            .await
            .map_err(|_| {
                SchedulerError::Execution(format!("命令执行超时 ({} 秒)", self.config.timeout_seconds))
            })??;

        let mut error_markers: Vec<String> = stderr_lines
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .take(MAX_ERROR_MARKERS)
            .collect();
        let success = exit_code == Some(0);
        if !success {
            error_markers.push(format!("命令执行失败，退出码: {exit_code:?}"));
        }

        let stats = OutcomeStats {
            records_read: 1,
            records_written: stdout_lines.len() as u64,
            error_markers,
        };

        info!(
            "命令执行完成: task_id={}, success={}, exit_code={:?}, duration={}ms",
            handle.task_id,
            success,
            exit_code,
            started.elapsed().as_millis()
        );

        if success {
            Ok(ExecutionOutput::complete(stats))
        } else {
            warn!("任务 {} 的处理命令失败", handle.task_id);
            Ok(ExecutionOutput::failed(stats))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TaskHandle {
        TaskHandle {
            task_id: 7,
            filter_id: 1,
            meta_id: 42,
            processor_kind: "shell".to_string(),
        }
    }

    fn shell(script: &str, timeout_seconds: u64) -> ShellExecutor {
        ShellExecutor::new(
            "shell",
            ShellProcessorConfig {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                timeout_seconds,
            },
        )
    }

    #[tokio::test]
    async fn test_noop_executor_completes() {
        let output = NoopExecutor::new("noop").execute(&handle()).await.unwrap();
        assert_eq!(output.outcome, TaskOutcome::Complete);
        assert_eq!(output.stats.records_read, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_counts_output_lines() {
        let output = shell("echo $META_ID; echo $TASK_ID", 10)
            .execute(&handle())
            .await
            .unwrap();
        assert_eq!(output.outcome, TaskOutcome::Complete);
        assert_eq!(output.stats.records_written, 2);
        assert!(output.stats.error_markers.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_reports_failure() {
        let output = shell("echo broken >&2; exit 3", 10)
            .execute(&handle())
            .await
            .unwrap();
        assert_eq!(output.outcome, TaskOutcome::Failed);
        assert_eq!(output.stats.error_markers[0], "broken");
        assert_eq!(output.stats.error_markers.len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_timeout() {
        let result = shell("sleep 5", 1).execute(&handle()).await;
        assert!(matches!(result, Err(SchedulerError::Execution(_))));
    }

    #[tokio::test]
    async fn test_missing_command_is_execution_error() {
        let executor = ShellExecutor::new(
            "shell",
            ShellProcessorConfig {
                command: "/nonexistent/processor-command".to_string(),
                args: vec![],
                timeout_seconds: 5,
            },
        );
        let result = executor.execute(&handle()).await;
        assert!(matches!(result, Err(SchedulerError::Execution(_))));
    }
}
