//! Command-line and environment configuration.
//!
//! Every option can also be set through an `SDHOOK_` environment variable:
//!
//! - `SDHOOK_HOST` / `SDHOOK_PORT` - bind address (default 0.0.0.0:5000)
//! - `SDHOOK_WORKERS` - comma-separated worker base URLs
//! - `SDHOOK_OPERATION_EXPIRY` - seconds before an operation is dropped (default 60)
//! - `SDHOOK_SWEEP_INTERVAL` - seconds between expiry sweeps (default 3)
//! - `SDHOOK_LIVENESS_INTERVAL` - seconds between worker pings (off when unset)
//! - `SDHOOK_REDISCOVER_INTERVAL` - seconds between pings of removed workers (default 30)
//! - `SDHOOK_MAX_JOBS` - concurrent remote executions (default 8)
//! - `SDHOOK_QUANTIZE_DIVISOR` / `SDHOOK_MIN_RUN_LENGTH` - codec options (default 5 / 3)
//! - `SDHOOK_PREVIEW_SIZE` - downscale results to this longest side before encoding
//! - `SDHOOK_WORKER_TIMEOUT` - worker request timeout in seconds (default 300)

use std::time::Duration;

use clap::Parser;
use sdhook::transport::ServerConfig;
use sdhook::{DispatcherConfig, EncodeOptions};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_OPERATION_EXPIRY_SECS: u64 = 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3;
pub const DEFAULT_REDISCOVER_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_JOBS: usize = 8;
pub const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 300;

/// sdhook - dispatch txt2img jobs across Stable Diffusion workers.
#[derive(Parser, Debug, Clone)]
#[command(name = "sdhook")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "SDHOOK_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "SDHOOK_PORT")]
    pub port: u16,

    /// Worker base URLs (comma-separated).
    #[arg(short, long, env = "SDHOOK_WORKERS", value_delimiter = ',')]
    pub workers: Vec<String>,

    /// Seconds after submission before an operation is dropped.
    #[arg(long, default_value_t = DEFAULT_OPERATION_EXPIRY_SECS, env = "SDHOOK_OPERATION_EXPIRY")]
    pub operation_expiry: u64,

    /// Seconds between expiry sweeps.
    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_SECS, env = "SDHOOK_SWEEP_INTERVAL")]
    pub sweep_interval: u64,

    /// Seconds between worker liveness sweeps. Disabled when unset.
    #[arg(long, env = "SDHOOK_LIVENESS_INTERVAL")]
    pub liveness_interval: Option<u64>,

    /// Seconds between pings of removed workers; the ones that answer rejoin the pool.
    #[arg(long, default_value_t = DEFAULT_REDISCOVER_INTERVAL_SECS, env = "SDHOOK_REDISCOVER_INTERVAL")]
    pub rediscover_interval: u64,

    /// Maximum concurrent remote executions across all workers.
    #[arg(long, default_value_t = DEFAULT_MAX_JOBS, env = "SDHOOK_MAX_JOBS")]
    pub max_jobs: usize,

    /// Channel divisor applied before palette encoding.
    #[arg(long, default_value_t = EncodeOptions::DEFAULT_QUANTIZE_DIVISOR, env = "SDHOOK_QUANTIZE_DIVISOR")]
    pub quantize_divisor: u8,

    /// Shortest vertical run emitted as a palette token.
    #[arg(long, default_value_t = EncodeOptions::DEFAULT_MIN_RUN_LENGTH, env = "SDHOOK_MIN_RUN_LENGTH")]
    pub min_run_length: u32,

    /// Downscale results so neither side exceeds this many pixels.
    #[arg(long, env = "SDHOOK_PREVIEW_SIZE")]
    pub preview_size: Option<u32>,

    /// Worker request timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_WORKER_TIMEOUT_SECS, env = "SDHOOK_WORKER_TIMEOUT")]
    pub worker_timeout: u64,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.quantize_divisor == 0 {
            return Err("quantize_divisor must be greater than 0".to_string());
        }
        if self.min_run_length == 0 {
            return Err("min_run_length must be greater than 0".to_string());
        }
        if self.max_jobs == 0 {
            return Err("max_jobs must be greater than 0".to_string());
        }
        if self.sweep_interval == 0 {
            return Err("sweep_interval must be greater than 0".to_string());
        }
        if self.liveness_interval == Some(0) {
            return Err("liveness_interval must be greater than 0".to_string());
        }
        if self.rediscover_interval == 0 {
            return Err("rediscover_interval must be greater than 0".to_string());
        }
        if self.preview_size == Some(0) {
            return Err("preview_size must be greater than 0".to_string());
        }

        for worker in &self.workers {
            let url = url::Url::parse(worker)
                .map_err(|e| format!("Invalid worker URL '{}': {}", worker, e))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(format!(
                    "Invalid worker URL '{}': scheme must be http or https",
                    worker
                ));
            }
        }

        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            operation_expiry: Duration::from_secs(self.operation_expiry),
            sweep_interval: Duration::from_secs(self.sweep_interval),
            liveness_interval: self.liveness_interval.map(Duration::from_secs),
            rediscover_interval: Duration::from_secs(self.rediscover_interval),
            max_concurrent_jobs: self.max_jobs,
            codec: EncodeOptions {
                quantize_divisor: self.quantize_divisor,
                min_run_length: self.min_run_length,
            },
            preview_max_side: self.preview_size,
            worker_timeout: Duration::from_secs(self.worker_timeout),
            ..Default::default()
        }
    }
}
