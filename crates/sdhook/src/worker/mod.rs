//! Remote worker access: the HTTP client, its payload types and the
//! stateful per-worker handle.

mod client;
mod handle;
#[cfg(test)]
pub(crate) mod mock;
mod types;

pub use client::{DEFAULT_REQUEST_TIMEOUT, HttpWorkerClient, WorkerApi, WorkerError};
pub use handle::{ExecutorContext, JobPlacement, WorkerHandle};
pub use types::{
    Capabilities, CheckpointInfo, ProgressInfo, QueueInfo, RefreshTarget, SystemInfo,
    UnavailableWorker, WorkerInfo,
};
