//! Payloads read from a worker and the summaries built from them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Generation progress with the preview image and free-text fields stripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub progress: f64,
    pub eta: Option<f64>,
    pub job_count: i64,
    pub sampling_step: i64,
    pub sampling_steps: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawProgressState {
    job_count: i64,
    sampling_step: i64,
    sampling_steps: i64,
}

/// `/sdapi/v1/progress` body. Unlisted fields (`current_image`, `textinfo`)
/// are dropped during deserialization.
#[derive(Debug, Deserialize)]
pub(crate) struct RawProgress {
    #[serde(default)]
    progress: f64,
    eta_relative: Option<f64>,
    #[serde(default)]
    state: RawProgressState,
}

impl From<RawProgress> for ProgressInfo {
    fn from(raw: RawProgress) -> Self {
        Self {
            progress: round3(raw.progress),
            eta: raw.eta_relative.map(round3),
            job_count: raw.state.job_count,
            sampling_step: raw.state.sampling_step,
            sampling_steps: raw.state.sampling_steps,
        }
    }
}

/// Worker queue status, passed through as reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueInfo(pub Value);

impl QueueInfo {
    pub fn queue_size(&self) -> Option<u64> {
        self.0.get("queue_size").and_then(Value::as_u64)
    }
}

/// Summary of `/internal/sysinfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub ram: Option<Value>,
    /// CPU details with a `name` entry, or `"unknown"`.
    pub cpu: Value,
    pub gpus: Option<Value>,
    pub python_version: Option<String>,
    pub torch_version: Option<String>,
}

impl SystemInfo {
    pub fn from_sysinfo(raw: &Value) -> Self {
        let torch = raw.get("Torch env info").filter(|t| t.is_object());
        let torch_str = |key: &str| torch.and_then(|t| t.get(key)).and_then(Value::as_str);

        let cpu = match torch {
            Some(torch) => {
                let mut cpu = raw
                    .get("CPU")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                cpu.remove("model");
                // lscpu output: line 8 is "Model name: ..."
                let name = torch
                    .get("cpu_info")
                    .and_then(|info| info.get(8))
                    .and_then(Value::as_str)
                    .and_then(|line| line.split_once(['=', ':']))
                    .map(|(_, name)| name.trim().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                cpu.insert("name".to_string(), Value::String(name));
                Value::Object(cpu)
            }
            None => Value::String("unknown".to_string()),
        };

        Self {
            os: torch_str("os").unwrap_or("unknown").to_string(),
            ram: raw.get("RAM").cloned(),
            cpu,
            gpus: torch
                .and_then(|t| t.get("nvidia_gpu_models"))
                .filter(|v| !v.is_null())
                .cloned(),
            python_version: torch_str("python_version")
                .and_then(|v| v.split_whitespace().next())
                .map(str::to_string),
            torch_version: torch_str("torch_version").map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub title: String,
    pub model_name: String,
}

/// What a worker can run. A list is `None` when its endpoint failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub checkpoints: Option<Vec<CheckpointInfo>>,
    pub embeddings: Option<Vec<String>>,
    pub loras: Option<Vec<String>>,
    pub samplers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Named {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingList {
    #[serde(default)]
    pub loaded: serde_json::Map<String, Value>,
}

/// Entry in `get_worker_infos`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub endpoint: String,
    pub busy: bool,
    pub pending: usize,
    pub sys_info: Option<SystemInfo>,
    pub sd_info: Option<Capabilities>,
}

/// A worker dropped by the liveness sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnavailableWorker {
    pub worker_id: String,
    pub endpoint: String,
}

/// Which worker caches `refresh` reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTarget {
    Checkpoints,
    Vae,
    Loras,
}

impl RefreshTarget {
    pub const ALL: [RefreshTarget; 3] = [Self::Checkpoints, Self::Vae, Self::Loras];

    pub fn path(&self) -> &'static str {
        match self {
            Self::Checkpoints => "/sdapi/v1/refresh-checkpoints",
            Self::Vae => "/sdapi/v1/refresh-vae",
            Self::Loras => "/sdapi/v1/refresh-loras",
        }
    }
}
