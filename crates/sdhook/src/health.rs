//! Pool health reported by the health-check route.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolHealth {
    /// At least one worker is idle
    Ready,
    /// Every worker is running or has queued jobs
    Busy,
    /// Pool is empty
    NoWorkers,
}

impl PoolHealth {
    pub fn from_counts(total: usize, idle: usize) -> Self {
        match (total, idle) {
            (0, _) => PoolHealth::NoWorkers,
            (_, 0) => PoolHealth::Busy,
            _ => PoolHealth::Ready,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub status: PoolHealth,
    pub workers: usize,
    pub idle_workers: usize,
    pub version: &'static str,
}
