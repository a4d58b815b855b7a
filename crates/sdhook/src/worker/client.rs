//! HTTP client for one Stable Diffusion WebUI worker.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::SDHOOK_VERSION;
use crate::params::GenerationParams;

use super::types::{
    Capabilities, CheckpointInfo, EmbeddingList, Named, ProgressInfo, QueueInfo, RawProgress,
    RefreshTarget, SystemInfo,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

const PING: &str = "/internal/ping";
const SYSINFO: &str = "/internal/sysinfo";
const QUEUE_STATUS: &str = "/queue/status";
const OPTIONS: &str = "/sdapi/v1/options";
const TXT2IMG: &str = "/sdapi/v1/txt2img";
const PROGRESS: &str = "/sdapi/v1/progress?skip_current_image=false";
const SKIP: &str = "/sdapi/v1/skip";
const INTERRUPT: &str = "/sdapi/v1/interrupt";
const SD_MODELS: &str = "/sdapi/v1/sd-models";
const EMBEDDINGS: &str = "/sdapi/v1/embeddings";
const LORAS: &str = "/sdapi/v1/loras";
const SAMPLERS: &str = "/sdapi/v1/samplers";

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("Worker returned {status}: {body}")]
    Remote { status: u16, body: String },
    #[error("Failed to decode worker response: {0}")]
    Decode(String),
    #[error("Invalid worker endpoint '{0}'")]
    InvalidEndpoint(String),
}

impl WorkerError {
    fn from_request(e: reqwest::Error) -> Self {
        if e.is_decode() {
            WorkerError::Decode(e.to_string())
        } else {
            WorkerError::Unreachable(e)
        }
    }
}

/// Operations the dispatcher needs from a worker.
#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// Base URL, used for logging and reporting.
    fn endpoint(&self) -> &str;

    async fn ping(&self) -> Result<(), WorkerError>;

    async fn system_info(&self) -> Result<SystemInfo, WorkerError>;

    async fn options(&self) -> Result<Map<String, Value>, WorkerError>;

    async fn set_options(&self, options: Map<String, Value>) -> Result<(), WorkerError>;

    /// Read the current options, merge `changes` over them and post the result.
    async fn update_options(&self, changes: Map<String, Value>) -> Result<(), WorkerError> {
        let mut options = self.options().await?;
        options.extend(changes);
        self.set_options(options).await
    }

    /// Run txt2img and return the base64 PNG images.
    async fn txt2img(&self, params: &GenerationParams) -> Result<Vec<String>, WorkerError>;

    async fn progress(&self) -> Result<ProgressInfo, WorkerError>;

    async fn queue_status(&self) -> Result<QueueInfo, WorkerError>;

    async fn skip(&self) -> Result<(), WorkerError>;

    async fn interrupt(&self) -> Result<(), WorkerError>;

    async fn refresh(&self, target: RefreshTarget) -> Result<(), WorkerError>;

    async fn capabilities(&self) -> Result<Capabilities, WorkerError>;
}

/// reqwest-backed [`WorkerApi`].
pub struct HttpWorkerClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpWorkerClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, WorkerError> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(WorkerError::InvalidEndpoint(endpoint));
        }

        let client = reqwest::Client::builder()
            .user_agent(format!("sdhook/{}", SDHOOK_VERSION))
            .timeout(timeout)
            .build()
            .map_err(WorkerError::Unreachable)?;

        Ok(Self::with_client(client, endpoint))
    }

    /// Reuse a client (and its connection pool) across workers.
    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, WorkerError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(WorkerError::from_request)?;
        Self::parse_response(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, WorkerError> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(WorkerError::from_request)?;
        Self::parse_response(response).await
    }

    async fn post_empty(&self, path: &str) -> Result<(), WorkerError> {
        let response = self
            .client
            .post(self.url(path))
            .send()
            .await
            .map_err(WorkerError::from_request)?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, WorkerError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(WorkerError::Remote {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, WorkerError> {
        let response = Self::ensure_success(response).await?;
        let bytes = response.bytes().await.map_err(WorkerError::from_request)?;
        serde_json::from_slice(&bytes).map_err(|e| WorkerError::Decode(e.to_string()))
    }
}

#[async_trait]
impl WorkerApi for HttpWorkerClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> Result<(), WorkerError> {
        let response = self
            .client
            .get(self.url(PING))
            .send()
            .await
            .map_err(WorkerError::from_request)?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn system_info(&self) -> Result<SystemInfo, WorkerError> {
        let raw: Value = self.get_json(SYSINFO).await?;
        Ok(SystemInfo::from_sysinfo(&raw))
    }

    async fn options(&self) -> Result<Map<String, Value>, WorkerError> {
        self.get_json(OPTIONS).await
    }

    async fn set_options(&self, options: Map<String, Value>) -> Result<(), WorkerError> {
        let response = self
            .client
            .post(self.url(OPTIONS))
            .json(&options)
            .send()
            .await
            .map_err(WorkerError::from_request)?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn txt2img(&self, params: &GenerationParams) -> Result<Vec<String>, WorkerError> {
        #[derive(serde::Deserialize)]
        struct Txt2ImgResponse {
            #[serde(default)]
            images: Vec<String>,
        }

        let response: Txt2ImgResponse = self.post_json(TXT2IMG, &params.txt2img_body()).await?;
        Ok(response.images)
    }

    async fn progress(&self) -> Result<ProgressInfo, WorkerError> {
        let raw: RawProgress = self.get_json(PROGRESS).await?;
        Ok(raw.into())
    }

    async fn queue_status(&self) -> Result<QueueInfo, WorkerError> {
        self.get_json(QUEUE_STATUS).await
    }

    async fn skip(&self) -> Result<(), WorkerError> {
        self.post_empty(SKIP).await
    }

    async fn interrupt(&self) -> Result<(), WorkerError> {
        self.post_empty(INTERRUPT).await
    }

    async fn refresh(&self, target: RefreshTarget) -> Result<(), WorkerError> {
        self.post_empty(target.path()).await
    }

    async fn capabilities(&self) -> Result<Capabilities, WorkerError> {
        self.ping().await?;

        let (checkpoints, embeddings, loras, samplers) = tokio::join!(
            self.get_json::<Vec<CheckpointInfo>>(SD_MODELS),
            self.get_json::<EmbeddingList>(EMBEDDINGS),
            self.get_json::<Vec<Named>>(LORAS),
            self.get_json::<Vec<Named>>(SAMPLERS),
        );

        let names = |list: Vec<Named>| list.into_iter().map(|n| n.name).collect::<Vec<_>>();
        Ok(Capabilities {
            checkpoints: log_partial(&self.endpoint, SD_MODELS, checkpoints),
            embeddings: log_partial(&self.endpoint, EMBEDDINGS, embeddings)
                .map(|e| e.loaded.into_iter().map(|(name, _)| name).collect()),
            loras: log_partial(&self.endpoint, LORAS, loras).map(names),
            samplers: log_partial(&self.endpoint, SAMPLERS, samplers).map(names),
        })
    }
}

fn log_partial<T>(endpoint: &str, path: &str, result: Result<T, WorkerError>) -> Option<T> {
    result
        .inspect_err(|e| {
            tracing::debug!(worker = %endpoint, path, error = %e, "Capability list unavailable");
        })
        .ok()
}
