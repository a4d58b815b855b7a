//! Dispatcher: worker pool, job placement and lifecycle queries.
//!
//! The dispatcher owns:
//! - The worker pool (one [`WorkerHandle`] per endpoint)
//! - The operation store (job id to lifecycle record)
//! - The global execution permit semaphore
//!
//! Job execution happens on each worker's executor. The dispatcher only
//! chooses a worker, records the job and answers queries about it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::SDHOOK_VERSION;
use crate::error::DispatchError;
use crate::health::{HealthSnapshot, PoolHealth};
use crate::operation::{
    GeneratedImage, JobId, JobStatus, Operation, OperationMetadata, OperationState, new_job_id,
};
use crate::palette::{EncodeOptions, EncodedImage, RasterImage};
use crate::params::GenerationParams;
use crate::store::OperationStore;
use crate::worker::{
    DEFAULT_REQUEST_TIMEOUT, ExecutorContext, HttpWorkerClient, JobPlacement, ProgressInfo,
    QueueInfo, UnavailableWorker, WorkerApi, WorkerHandle, WorkerInfo,
};

const WORKER_REMOVED: &str = "Worker removed from pool";

/// Shortest period the maintenance loop will tick at.
const MIN_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Operations older than this are dropped, whatever their state.
    pub operation_expiry: Duration,
    pub sweep_interval: Duration,
    /// Period of the liveness sweep. `None` disables it.
    pub liveness_interval: Option<Duration>,
    /// Period at which removed workers are pinged and restored if they answer.
    pub rediscover_interval: Duration,
    /// In-flight remote executions across all workers.
    pub max_concurrent_jobs: usize,
    pub capability_ttl: Duration,
    pub codec: EncodeOptions,
    /// Downscale images so neither side exceeds this before encoding.
    pub preview_max_side: Option<u32>,
    /// Request timeout for workers added with [`Dispatcher::add_endpoint`].
    pub worker_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            operation_expiry: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(3),
            liveness_interval: None,
            rediscover_interval: Duration::from_secs(30),
            max_concurrent_jobs: 8,
            capability_ttl: Duration::from_secs(60),
            codec: EncodeOptions::default(),
            preview_max_side: None,
            worker_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_workers: usize,
    pub queue_length: usize,
    pub total_operations: usize,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    pool: RwLock<Vec<Arc<WorkerHandle>>>,
    store: Arc<OperationStore>,
    permits: Arc<Semaphore>,
    next_worker: AtomicUsize,
    /// Workers dropped by the liveness sweep, waiting to be rediscovered.
    retired: Mutex<Vec<Arc<dyn WorkerApi>>>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Arc::new(Self {
            config,
            pool: RwLock::new(Vec::new()),
            store: Arc::new(OperationStore::new()),
            permits,
            next_worker: AtomicUsize::new(0),
            retired: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<OperationStore> {
        &self.store
    }

    /// Add a worker to the pool and start its executor.
    pub async fn add_worker(&self, api: Arc<dyn WorkerApi>) -> String {
        let handle = WorkerHandle::spawn(
            api,
            ExecutorContext {
                store: Arc::clone(&self.store),
                permits: Arc::clone(&self.permits),
                capability_ttl: self.config.capability_ttl,
            },
        );
        let worker_id = handle.id().to_string();
        tracing::info!(worker_id = %worker_id, worker = %handle.endpoint(), "Added worker");
        self.pool.write().await.push(handle);
        worker_id
    }

    pub async fn add_endpoint(&self, endpoint: &str) -> Result<String, DispatchError> {
        let client = HttpWorkerClient::new(endpoint, self.config.worker_timeout)?;
        Ok(self.add_worker(Arc::new(client)).await)
    }

    pub async fn worker_count(&self) -> usize {
        self.pool.read().await.len()
    }

    async fn workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.pool.read().await.clone()
    }

    /// Queue a job and return its id without waiting for it to run.
    ///
    /// With a preferred index the job goes to that worker (clamped into the
    /// pool). Otherwise the first idle worker is claimed, falling back to
    /// round-robin when every worker has work.
    pub async fn submit(
        &self,
        params: GenerationParams,
        preferred_worker_index: Option<i64>,
    ) -> Result<JobId, DispatchError> {
        params.validate()?;

        let pool = self.pool.read().await;
        if pool.is_empty() {
            return Err(DispatchError::NoWorkersAvailable);
        }

        let job_id = new_job_id();
        self.store.insert(Operation::new(job_id.clone(), params));

        let Some(worker) = self.place(&pool, &job_id, preferred_worker_index) else {
            self.store.remove(&job_id);
            return Err(DispatchError::NoWorkersAvailable);
        };

        self.store.update(&job_id, |op| op.assign_worker(worker.id()));
        tracing::info!(
            job_id = %job_id,
            worker_id = %worker.id(),
            worker = %worker.endpoint(),
            "Job submitted"
        );
        Ok(job_id)
    }

    fn place(
        &self,
        pool: &[Arc<WorkerHandle>],
        job_id: &str,
        preferred: Option<i64>,
    ) -> Option<Arc<WorkerHandle>> {
        if let Some(index) = preferred {
            let index = index.clamp(0, pool.len() as i64 - 1) as usize;
            let worker = &pool[index];
            return worker.enqueue(job_id).then(|| Arc::clone(worker));
        }

        if let Some(worker) = pool.iter().find(|w| w.try_claim_idle(job_id)) {
            return Some(Arc::clone(worker));
        }

        let start = self.next_worker.fetch_add(1, Ordering::Relaxed);
        (0..pool.len())
            .map(|offset| &pool[(start + offset) % pool.len()])
            .find(|w| w.enqueue(job_id))
            .map(Arc::clone)
    }

    async fn locate(&self, job_id: &str) -> Option<(Arc<WorkerHandle>, JobPlacement)> {
        let pool = self.pool.read().await;
        pool.iter()
            .find_map(|w| w.placement(job_id).map(|p| (Arc::clone(w), p)))
    }

    pub async fn status(&self, job_id: &str) -> JobStatus {
        if let Some((_, placement)) = self.locate(job_id).await {
            return match placement {
                JobPlacement::Running => JobStatus::InProgress,
                JobPlacement::Queued(_) => JobStatus::InQueue,
                JobPlacement::Finished => JobStatus::Finished,
                JobPlacement::Errored => JobStatus::Errored,
            };
        }
        match self.store.state(job_id) {
            Some(OperationState::Errored) => JobStatus::Errored,
            Some(OperationState::Canceled) => JobStatus::Canceled,
            _ => JobStatus::NonExistent,
        }
    }

    pub fn metadata(&self, job_id: &str) -> Option<OperationMetadata> {
        self.store.metadata(job_id)
    }

    /// Live progress from the worker running the job. `None` unless in progress.
    pub async fn progress(&self, job_id: &str) -> Option<ProgressInfo> {
        let (worker, placement) = self.locate(job_id).await?;
        if placement != JobPlacement::Running {
            return None;
        }
        match worker.api().progress().await {
            Ok(progress) => Some(progress),
            Err(e) => {
                tracing::warn!(job_id, worker = %worker.endpoint(), error = %e, "Progress probe failed");
                None
            }
        }
    }

    /// Queue status of the worker holding the job. `None` unless queued.
    pub async fn queue_info(&self, job_id: &str) -> Option<QueueInfo> {
        let (worker, placement) = self.locate(job_id).await?;
        if !matches!(placement, JobPlacement::Queued(_)) {
            return None;
        }
        match worker.api().queue_status().await {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(job_id, worker = %worker.endpoint(), error = %e, "Queue probe failed");
                None
            }
        }
    }

    pub async fn result(&self, job_id: &str, pop: bool) -> Option<GeneratedImage> {
        let pool = self.pool.read().await;
        pool.iter().find_map(|w| w.result(job_id, pop))
    }

    /// The finished image in palette wire form.
    pub async fn encoded_result(
        &self,
        job_id: &str,
        pop: bool,
    ) -> Result<Option<EncodedImage>, DispatchError> {
        let found = {
            let pool = self.pool.read().await;
            pool.iter()
                .find_map(|w| w.result(job_id, pop).map(|image| (Arc::clone(w), image)))
        };
        let Some((worker, image)) = found else {
            return Ok(None);
        };

        match self.encode_image(&image) {
            Ok(encoded) => {
                tracing::debug!(
                    job_id,
                    width = encoded.width,
                    height = encoded.height,
                    bytes = encoded.data.len(),
                    "Encoded result"
                );
                Ok(Some(encoded))
            }
            Err(e) => {
                tracing::warn!(job_id, worker = %worker.endpoint(), error = %e, "Failed to encode result");
                if pop && self.store.contains(job_id) {
                    worker.restore_result(job_id, image);
                }
                Err(e)
            }
        }
    }

    fn encode_image(&self, image: &GeneratedImage) -> Result<EncodedImage, DispatchError> {
        let raster = RasterImage::from_base64_png(&image.data, self.config.preview_max_side)?;
        Ok(EncodedImage::from_raster(&raster, self.config.codec)?)
    }

    /// Cancel a job. Returns false if the id is unknown.
    pub async fn cancel(&self, job_id: &str) -> bool {
        if !self.store.contains(job_id) {
            return false;
        }

        let executing_on = {
            let pool = self.pool.read().await;
            pool.iter().find_map(|w| {
                w.remove_pending(job_id)
                    .map(|executing| (Arc::clone(w), executing))
            })
        };

        let changed = self
            .store
            .update(job_id, |op| op.set_canceled())
            .unwrap_or(false);
        tracing::info!(job_id, changed, "Job canceled");

        if let Some((worker, true)) = executing_on {
            if let Err(e) = worker.api().skip().await {
                tracing::warn!(job_id, worker = %worker.endpoint(), error = %e, "Skip failed");
            }
            if let Err(e) = worker.api().interrupt().await {
                tracing::warn!(job_id, worker = %worker.endpoint(), error = %e, "Interrupt failed");
            }
        }
        true
    }

    /// Drop operations older than the expiry, whatever their state.
    pub async fn sweep_expired(&self) -> Vec<JobId> {
        let removed = self.store.remove_expired(self.config.operation_expiry);
        if removed.is_empty() {
            return Vec::new();
        }

        let pool = self.pool.read().await;
        let ids: Vec<JobId> = removed
            .into_iter()
            .map(|op| {
                op.cancel_token().cancel();
                for worker in pool.iter() {
                    worker.purge(op.id());
                }
                op.id().to_string()
            })
            .collect();
        tracing::debug!(count = ids.len(), "Expired operations removed");
        ids
    }

    /// Ping every worker and remove the ones that fail.
    ///
    /// Jobs still queued on a removed worker are marked errored.
    pub async fn list_available_workers(&self) -> Vec<UnavailableWorker> {
        let workers = self.workers().await;
        let probes = join_all(workers.iter().map(|w| async move {
            let result = w.api().ping().await;
            (w, result)
        }))
        .await;

        let dead: Vec<Arc<WorkerHandle>> = probes
            .into_iter()
            .filter_map(|(w, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!(worker_id = %w.id(), worker = %w.endpoint(), error = %e, "Worker failed liveness probe");
                    Some(Arc::clone(w))
                }
            })
            .collect();
        if dead.is_empty() {
            return Vec::new();
        }

        // a concurrent sweep may already have taken some of them out
        let removed: Vec<Arc<WorkerHandle>> = {
            let mut pool = self.pool.write().await;
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *pool)
                .into_iter()
                .partition(|w| dead.iter().any(|d| Arc::ptr_eq(d, w)));
            *pool = kept;
            removed
        };

        let mut retired = self.retired.lock().await;
        removed
            .into_iter()
            .map(|worker| {
                worker.stop();
                retired.push(Arc::clone(worker.api()));
                for job_id in worker.drain_pending() {
                    self.store
                        .update(&job_id, |op| op.set_errored(WORKER_REMOVED.to_string()));
                }
                tracing::info!(worker_id = %worker.id(), worker = %worker.endpoint(), "Removed worker from pool");
                UnavailableWorker {
                    worker_id: worker.id().to_string(),
                    endpoint: worker.endpoint().to_string(),
                }
            })
            .collect()
    }

    /// Ping the workers the liveness sweep removed and put back the ones
    /// that answer. Returns the new worker ids.
    pub async fn rediscover(&self) -> Vec<String> {
        let candidates = std::mem::take(&mut *self.retired.lock().await);
        if candidates.is_empty() {
            return Vec::new();
        }

        let probes = join_all(candidates.into_iter().map(|api| async move {
            let alive = api.ping().await.is_ok();
            (api, alive)
        }))
        .await;

        let mut restored = Vec::new();
        let mut still_down = Vec::new();
        for (api, alive) in probes {
            if alive {
                tracing::info!(worker = %api.endpoint(), "Worker answered again, restoring to pool");
                restored.push(self.add_worker(api).await);
            } else {
                still_down.push(api);
            }
        }
        self.retired.lock().await.extend(still_down);
        restored
    }

    /// Refresh model lists on every worker, then report each worker's
    /// cached system info and capabilities.
    pub async fn worker_infos(&self) -> Vec<WorkerInfo> {
        let workers = self.workers().await;
        join_all(workers.iter().map(|w| async move {
            w.refresh_all().await;
            w.info().await
        }))
        .await
    }

    pub async fn stats(&self) -> PoolStats {
        let pool = self.pool.read().await;
        PoolStats {
            total_workers: pool.len(),
            queue_length: pool.iter().map(|w| w.pending_len()).sum(),
            total_operations: self.store.len(),
        }
    }

    pub async fn health(&self) -> HealthSnapshot {
        let pool = self.pool.read().await;
        let idle = pool
            .iter()
            .filter(|w| !w.is_busy() && w.pending_len() == 0)
            .count();
        HealthSnapshot {
            status: PoolHealth::from_counts(pool.len(), idle),
            workers: pool.len(),
            idle_workers: idle,
            version: SDHOOK_VERSION,
        }
    }

    /// Background maintenance: expiry sweep, rediscovery of removed workers
    /// and, when configured, liveness. Zero periods are raised to 1ms.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval.max(MIN_TICK));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut rediscover = delayed_interval(self.config.rediscover_interval);
        let mut liveness = self.config.liveness_interval.map(delayed_interval);

        tracing::info!(
            sweep_interval = ?self.config.sweep_interval,
            liveness_interval = ?self.config.liveness_interval,
            rediscover_interval = ?self.config.rediscover_interval,
            "Dispatcher maintenance loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => {
                    self.sweep_expired().await;
                }
                _ = rediscover.tick() => {
                    let restored = self.rediscover().await;
                    if !restored.is_empty() {
                        tracing::info!(count = restored.len(), "Rediscovered workers");
                    }
                }
                _ = async {
                    match liveness.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let removed = self.list_available_workers().await;
                    if !removed.is_empty() {
                        tracing::warn!(count = removed.len(), "Liveness sweep removed workers");
                    }
                }
            }
        }
        tracing::info!("Dispatcher maintenance loop stopped");
    }

    /// Stop every worker executor.
    pub async fn shutdown(&self) {
        let pool = self.pool.read().await;
        for worker in pool.iter() {
            worker.stop();
        }
        tracing::info!(workers = pool.len(), "Dispatcher shut down");
    }
}

/// Interval whose first tick is one period from now.
fn delayed_interval(period: Duration) -> tokio::time::Interval {
    let period = period.max(MIN_TICK);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
