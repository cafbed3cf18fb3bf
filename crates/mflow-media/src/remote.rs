//! Processors backed by an HTTP inference service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mflow_models::{StagePayload, TaskOutput, WorkerKind};

use crate::error::{MediaError, MediaResult};
use crate::processor::{ProcessContext, ProcessInput, Processor};

/// Configuration for a remote processor.
#[derive(Debug, Clone)]
pub struct RemoteProcessorConfig {
    /// Base URL of the service
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// Max retries
    pub max_retries: u32,
    /// Sent as a bearer token when set
    pub api_key: Option<String>,
}

impl Default for RemoteProcessorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            timeout: Duration::from_secs(600),
            max_retries: 2,
            api_key: None,
        }
    }
}

impl RemoteProcessorConfig {
    /// Create config from `<KIND>_SERVICE_URL`, `<KIND>_SERVICE_TIMEOUT`,
    /// `<KIND>_SERVICE_API_KEY` and `REMOTE_SERVICE_RETRIES`.
    pub fn from_env(kind: WorkerKind) -> Self {
        let defaults = Self::default();
        let prefix = kind.as_str().to_uppercase();
        let var = |suffix: &str| std::env::var(format!("{}_SERVICE_{}", prefix, suffix)).ok();

        Self {
            base_url: var("URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            timeout: var("TIMEOUT")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_retries: std::env::var("REMOTE_SERVICE_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            api_key: var("API_KEY").filter(|k| !k.is_empty()),
        }
    }
}

/// Request body sent to the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRequest {
    pub job_id: String,
    pub task_id: String,
    /// Media the service should read
    pub media_url: String,
    pub source_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<StagePayload>,
}

/// Delegates a stage to `POST {base_url}/v1/{kind}`. The response body is
/// the stage output for that kind.
pub struct RemoteProcessor {
    kind: WorkerKind,
    http: Client,
    config: RemoteProcessorConfig,
}

impl RemoteProcessor {
    pub fn new(kind: WorkerKind, config: RemoteProcessorConfig) -> MediaResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(MediaError::Network)?;

        Ok(Self { kind, http, config })
    }

    /// Create from environment variables.
    pub fn from_env(kind: WorkerKind) -> MediaResult<Self> {
        Self::new(kind, RemoteProcessorConfig::from_env(kind))
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/{}", self.config.base_url, self.kind)
    }

    fn decode(&self, body: serde_json::Value) -> MediaResult<TaskOutput> {
        let output = match self.kind {
            WorkerKind::Thumbnail => TaskOutput::Thumbnail(serde_json::from_value(body)?),
            WorkerKind::Transcode => TaskOutput::Transcode(serde_json::from_value(body)?),
            WorkerKind::Subtitle => TaskOutput::Subtitle(serde_json::from_value(body)?),
            WorkerKind::Ai => TaskOutput::Ai(serde_json::from_value(body)?),
        };
        Ok(output)
    }

    async fn call(&self, request: &RemoteRequest) -> MediaResult<serde_json::Value> {
        let url = self.endpoint();
        debug!("Sending {} request to {}", self.kind, url);

        let mut builder = self.http.post(&url).json(request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("{} service returned {}: {}", self.kind, status, body);
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(MediaError::ServiceUnavailable(message))
        } else {
            Err(MediaError::request_failed(message))
        }
    }

    /// Execute with retry logic.
    async fn with_retry<F, Fut, T>(&self, operation: F) -> MediaResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = MediaResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                    warn!(
                        "{} request failed (attempt {}), retrying in {:?}: {}",
                        self.kind,
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl Processor for RemoteProcessor {
    fn kind(&self) -> WorkerKind {
        self.kind
    }

    async fn process(&self, input: &ProcessInput, ctx: &ProcessContext) -> MediaResult<TaskOutput> {
        let payload = input.payload_for(self.kind)?.cloned();
        let request = RemoteRequest {
            job_id: input.job_id.to_string(),
            task_id: input.task_id.to_string(),
            media_url: input.input_url.clone(),
            source_url: input.source_url.clone(),
            payload,
        };

        ctx.progress.report(10.0);
        let body = self.with_retry(|| self.call(&request)).await?;
        ctx.progress.report(95.0);

        self.decode(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_config_defaults() {
        let config = RemoteProcessorConfig::default();
        assert_eq!(config.base_url, "http://localhost:8001");
        assert_eq!(config.timeout, Duration::from_secs(600));
    }

    #[test]
    #[serial]
    fn test_config_from_env_is_per_kind() {
        std::env::set_var("SUBTITLE_SERVICE_URL", "http://stt:9000/");
        std::env::set_var("SUBTITLE_SERVICE_TIMEOUT", "30");
        let subtitle = RemoteProcessorConfig::from_env(WorkerKind::Subtitle);
        let ai = RemoteProcessorConfig::from_env(WorkerKind::Ai);
        std::env::remove_var("SUBTITLE_SERVICE_URL");
        std::env::remove_var("SUBTITLE_SERVICE_TIMEOUT");

        assert_eq!(subtitle.base_url, "http://stt:9000");
        assert_eq!(subtitle.timeout, Duration::from_secs(30));
        assert_eq!(ai.base_url, "http://localhost:8001");
    }

    #[test]
    fn test_decode_matches_kind() {
        let processor =
            RemoteProcessor::new(WorkerKind::Ai, RemoteProcessorConfig::default()).unwrap();
        let output = processor
            .decode(serde_json::json!({"summary": "a cat", "tags": ["cat"]}))
            .unwrap();
        assert!(matches!(output, TaskOutput::Ai(ref o) if o.tags == vec!["cat".to_string()]));
        assert_eq!(processor.endpoint(), "http://localhost:8001/v1/ai");
    }
}
