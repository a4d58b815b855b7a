//! In-memory [`WorkerApi`] for dispatcher and handle tests.

use std::io::Cursor;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;

use super::client::{WorkerApi, WorkerError};
use super::types::{Capabilities, ProgressInfo, QueueInfo, RefreshTarget, SystemInfo};
use crate::params::GenerationParams;

/// Solid-color PNG, base64 encoded.
pub(crate) fn png_base64(width: u32, height: u32, color: [u8; 3]) -> String {
    let img = RgbImage::from_pixel(width, height, Rgb(color));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn down() -> WorkerError {
    WorkerError::Remote {
        status: 503,
        body: "offline".to_string(),
    }
}

pub(crate) struct MockWorker {
    endpoint: String,
    calls: Mutex<Vec<&'static str>>,
    options: Mutex<Map<String, Value>>,
    offline: AtomicBool,
    fail_options: bool,
    fail_txt2img: bool,
    gate: Option<Semaphore>,
    image: String,
}

impl MockWorker {
    pub(crate) fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            calls: Mutex::new(Vec::new()),
            options: Mutex::new(Map::new()),
            offline: AtomicBool::new(false),
            fail_options: false,
            fail_txt2img: false,
            gate: None,
            image: png_base64(8, 8, [200, 40, 40]),
        }
    }

    pub(crate) fn offline(self) -> Self {
        self.offline.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn failing_options(mut self) -> Self {
        self.fail_options = true;
        self
    }

    pub(crate) fn failing_txt2img(mut self) -> Self {
        self.fail_txt2img = true;
        self
    }

    /// txt2img returns `data` instead of a PNG.
    pub(crate) fn with_image(mut self, data: &str) -> Self {
        self.image = data.to_string();
        self
    }

    /// txt2img blocks until [`MockWorker::release`] hands out a permit.
    pub(crate) fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub(crate) fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_online(&self) -> Result<(), WorkerError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(down())
        } else {
            Ok(())
        }
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    pub(crate) fn last_checkpoint(&self) -> Option<String> {
        self.options
            .lock()
            .unwrap()
            .get("sd_model_checkpoint")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub(crate) async fn wait_for_calls(&self, call: &str, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.count(call) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{call} was not called {n} times"));
    }
}

#[async_trait]
impl WorkerApi for MockWorker {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> Result<(), WorkerError> {
        self.record("ping");
        self.check_online()
    }

    async fn system_info(&self) -> Result<SystemInfo, WorkerError> {
        self.record("system_info");
        self.check_online()?;
        Ok(SystemInfo::from_sysinfo(&json!({"RAM": {"total": "16GB"}})))
    }

    async fn options(&self) -> Result<Map<String, Value>, WorkerError> {
        self.record("options");
        self.check_online()?;
        Ok(self.options.lock().unwrap().clone())
    }

    async fn set_options(&self, options: Map<String, Value>) -> Result<(), WorkerError> {
        self.record("set_options");
        self.check_online()?;
        *self.options.lock().unwrap() = options;
        Ok(())
    }

    async fn update_options(&self, changes: Map<String, Value>) -> Result<(), WorkerError> {
        self.record("update_options");
        self.check_online()?;
        if self.fail_options {
            return Err(WorkerError::Remote {
                status: 422,
                body: "unknown checkpoint".to_string(),
            });
        }
        self.options.lock().unwrap().extend(changes);
        Ok(())
    }

    async fn txt2img(&self, _params: &GenerationParams) -> Result<Vec<String>, WorkerError> {
        self.record("txt2img");
        if let Some(gate) = &self.gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
        self.check_online()?;
        if self.fail_txt2img {
            return Err(WorkerError::Remote {
                status: 500,
                body: "CUDA out of memory".to_string(),
            });
        }
        Ok(vec![self.image.clone()])
    }

    async fn progress(&self) -> Result<ProgressInfo, WorkerError> {
        self.record("progress");
        self.check_online()?;
        Ok(ProgressInfo {
            progress: 0.5,
            eta: Some(3.25),
            job_count: 1,
            sampling_step: 10,
            sampling_steps: 20,
        })
    }

    async fn queue_status(&self) -> Result<QueueInfo, WorkerError> {
        self.record("queue_status");
        self.check_online()?;
        Ok(QueueInfo(json!({"queue_size": 2})))
    }

    async fn skip(&self) -> Result<(), WorkerError> {
        self.record("skip");
        self.check_online()
    }

    async fn interrupt(&self) -> Result<(), WorkerError> {
        self.record("interrupt");
        self.check_online()
    }

    async fn refresh(&self, _target: RefreshTarget) -> Result<(), WorkerError> {
        self.record("refresh");
        self.check_online()
    }

    async fn capabilities(&self) -> Result<Capabilities, WorkerError> {
        self.record("capabilities");
        self.check_online()?;
        Ok(Capabilities {
            samplers: Some(vec!["Euler a".to_string()]),
            ..Default::default()
        })
    }
}
