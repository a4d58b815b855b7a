//! sdhook: job dispatcher for Stable Diffusion worker pools.
//!
//! Jobs are queued onto remote txt2img workers, tracked through their
//! lifecycle and returned to clients in a compact palette/run-length form.

mod error;
mod health;
mod operation;
mod store;

pub mod dispatcher;
pub mod palette;
pub mod params;
pub mod transport;
pub mod wire;
pub mod worker;

pub use dispatcher::{Dispatcher, DispatcherConfig, PoolStats};
pub use error::DispatchError;
pub use health::{HealthSnapshot, PoolHealth};
pub use operation::{
    CancellationToken, GeneratedImage, JobId, JobOutcome, JobStatus, Operation,
    OperationMetadata, OperationState,
};
pub use palette::{EncodeOptions, EncodedImage, PaletteImage, RasterImage};
pub use params::{GenerationParams, SubmitRequest};
pub use store::OperationStore;
pub use worker::{HttpWorkerClient, WorkerApi, WorkerError};

pub const SDHOOK_VERSION: &str = env!("CARGO_PKG_VERSION");
