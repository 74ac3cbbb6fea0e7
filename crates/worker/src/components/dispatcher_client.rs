use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::entities::{OutcomeReport, TaskHandle};

use super::task_source::TaskSource;

/// 调度器接口返回的统一结构
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[derive(Debug, Deserialize)]
struct ReleasedCount {
    released: usize,
}

/// 通过HTTP访问远程调度器
pub struct DispatcherClient {
    dispatcher_url: String,
    http_client: reqwest::Client,
}

impl DispatcherClient {
    pub fn new(dispatcher_url: impl Into<String>) -> Self {
        Self {
            dispatcher_url: dispatcher_url.into().trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn dispatcher_url(&self) -> &str {
        &self.dispatcher_url
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> SchedulerResult<T> {
        let url = format!("{}{}", self.dispatcher_url, path);
        debug!("POST {}", url);

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| SchedulerError::Network(format!("连接调度器失败: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let envelope: Envelope<T> = response
                .json()
                .await
                .map_err(|e| SchedulerError::Serialization(format!("解析调度器响应失败: {e}")))?;
            if !envelope.success {
                return Err(SchedulerError::Internal(
                    envelope.message.unwrap_or_else(|| "调度器返回失败".to_string()),
                ));
            }
            return envelope
                .data
                .ok_or_else(|| SchedulerError::Serialization("调度器响应缺少数据".to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| format!("{} ({})", b.error.message, b.error.error_type))
            .unwrap_or(body);
        warn!("调度器请求失败: HTTP {} - {}", status, message);
        Err(map_status(status, message))
    }
}

fn map_status(status: StatusCode, message: String) -> SchedulerError {
    match status {
        StatusCode::CONFLICT => SchedulerError::TaskStateConflict { id: 0, message },
        StatusCode::FORBIDDEN => SchedulerError::PermissionDenied(message),
        StatusCode::BAD_REQUEST => SchedulerError::InvalidParams(message),
        _ => SchedulerError::Network(format!("HTTP {status}: {message}")),
    }
}

#[async_trait]
impl TaskSource for DispatcherClient {
    async fn assign_tasks(&self, node_name: &str, max_count: i64) -> SchedulerResult<Vec<TaskHandle>> {
        self.post(
            &format!("/api/nodes/{node_name}/tasks/assign"),
            &json!({ "max_count": max_count }),
        )
        .await
    }

    async fn report_outcome(&self, report: &OutcomeReport) -> SchedulerResult<()> {
        let _: serde_json::Value = self
            .post(&format!("/api/tasks/{}/outcome", report.task_id), report)
            .await?;
        Ok(())
    }

    async fn abandon_tasks(&self, node_name: &str, task_ids: &[i64]) -> SchedulerResult<usize> {
        let released: ReleasedCount = self
            .post(
                &format!("/api/nodes/{node_name}/tasks/abandon"),
                &json!({ "task_ids": task_ids }),
            )
            .await?;
        Ok(released.released)
    }

    async fn release_node_tasks(&self, node_name: &str) -> SchedulerResult<usize> {
        let released: ReleasedCount = self
            .post(&format!("/api/nodes/{node_name}/tasks/release"), &json!({}))
            .await?;
        Ok(released.released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_trimmed() {
        let client = DispatcherClient::new("http://localhost:8080/");
        assert_eq!(client.dispatcher_url(), "http://localhost:8080");
    }

    #[test]
    fn test_status_mapping() {
        assert!(map_status(StatusCode::CONFLICT, "x".to_string()).is_conflict());
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, "x".to_string()),
            SchedulerError::Network(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_dispatcher_is_network_error() {
        let client = DispatcherClient::new("http://127.0.0.1:9");
        let result = client.assign_tasks("node-a", 1).await;
        assert!(matches!(result, Err(SchedulerError::Network(_))));
    }
}
