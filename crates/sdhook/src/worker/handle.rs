//! Stateful proxy for one worker.
//!
//! A handle owns the worker's busy flag, FIFO pending queue, result map and
//! errored list behind one mutex, and runs an executor task that takes job
//! ids in enqueue order and runs them against the remote API one at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::operation::{GeneratedImage, JobId};
use crate::params::GenerationParams;
use crate::store::OperationStore;

use super::client::WorkerApi;
use super::types::{Capabilities, RefreshTarget, SystemInfo, WorkerInfo};

#[derive(Default)]
struct WorkerState {
    busy: bool,
    pending: VecDeque<JobId>,
    results: HashMap<JobId, GeneratedImage>,
    errored: Vec<JobId>,
}

struct Cached<T> {
    value: Option<T>,
    fetched_at: Option<Instant>,
}

impl<T: Clone> Cached<T> {
    fn empty() -> Self {
        Self {
            value: None,
            fetched_at: None,
        }
    }

    fn fresh(&self, ttl: Duration) -> Option<T> {
        match self.fetched_at {
            Some(at) if at.elapsed() < ttl => self.value.clone(),
            _ => None,
        }
    }

    fn set(&mut self, value: T) {
        self.value = Some(value);
        self.fetched_at = Some(Instant::now());
    }
}

/// Shared pieces every executor needs.
#[derive(Clone)]
pub struct ExecutorContext {
    pub store: Arc<OperationStore>,
    pub permits: Arc<Semaphore>,
    pub capability_ttl: Duration,
}

/// Where a job sits on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPlacement {
    Running,
    Queued(usize),
    Finished,
    Errored,
}

pub struct WorkerHandle {
    id: String,
    api: Arc<dyn WorkerApi>,
    state: StdMutex<WorkerState>,
    jobs_tx: mpsc::UnboundedSender<JobId>,
    stop: CancellationToken,
    ctx: ExecutorContext,
    sys_info: Mutex<Cached<SystemInfo>>,
    capabilities: Mutex<Cached<Capabilities>>,
}

impl WorkerHandle {
    /// Create the handle and start its executor.
    ///
    /// The executor only holds a weak reference, so dropping the last handle
    /// stops it.
    pub fn spawn(api: Arc<dyn WorkerApi>, ctx: ExecutorContext) -> Arc<Self> {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            api,
            state: StdMutex::new(WorkerState::default()),
            jobs_tx,
            stop: CancellationToken::new(),
            ctx,
            sys_info: Mutex::new(Cached::empty()),
            capabilities: Mutex::new(Cached::empty()),
        });

        tracing::debug!(worker_id = %handle.id, worker = %handle.endpoint(), "Starting worker executor");
        tokio::spawn(Self::run_executor(
            Arc::downgrade(&handle),
            handle.id.clone(),
            handle.stop.clone(),
            jobs_rx,
        ));
        handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &str {
        self.api.endpoint()
    }

    pub fn api(&self) -> &Arc<dyn WorkerApi> {
        &self.api
    }

    /// Lock the worker state. A poisoned lock is recovered; the state only
    /// holds plain collections, so the data is still usable.
    fn state(&self) -> MutexGuard<'_, WorkerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(worker_id = %self.id, "Worker state mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state().busy
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Enqueue `job_id` only if the worker is idle with an empty queue.
    pub fn try_claim_idle(&self, job_id: &str) -> bool {
        let mut state = self.state();
        if state.busy || !state.pending.is_empty() {
            return false;
        }
        self.enqueue_locked(&mut state, job_id)
    }

    pub fn enqueue(&self, job_id: &str) -> bool {
        let mut state = self.state();
        self.enqueue_locked(&mut state, job_id)
    }

    fn enqueue_locked(&self, state: &mut WorkerState, job_id: &str) -> bool {
        if self.is_stopped() {
            return false;
        }
        if self.jobs_tx.send(job_id.to_string()).is_err() {
            tracing::warn!(worker_id = %self.id, job_id, "Worker executor is gone, not enqueuing");
            return false;
        }
        state.pending.push_back(job_id.to_string());
        true
    }

    pub fn placement(&self, job_id: &str) -> Option<JobPlacement> {
        let state = self.state();
        if let Some(pos) = state.pending.iter().position(|id| id == job_id) {
            return Some(if pos == 0 {
                JobPlacement::Running
            } else {
                JobPlacement::Queued(pos)
            });
        }
        if state.results.contains_key(job_id) {
            return Some(JobPlacement::Finished);
        }
        if state.errored.iter().any(|id| id == job_id) {
            return Some(JobPlacement::Errored);
        }
        None
    }

    /// Fetch the stored image. With `pop` it is removed so it is handed out once.
    pub fn result(&self, job_id: &str, pop: bool) -> Option<GeneratedImage> {
        let mut state = self.state();
        if pop {
            state.results.remove(job_id)
        } else {
            state.results.get(job_id).cloned()
        }
    }

    /// Put back an image taken with `result(.., true)` that was not delivered.
    pub fn restore_result(&self, job_id: &str, image: GeneratedImage) {
        self.state()
            .results
            .entry(job_id.to_string())
            .or_insert(image);
    }

    /// Remove `job_id` from the pending queue. Returns whether it was executing.
    pub fn remove_pending(&self, job_id: &str) -> Option<bool> {
        let mut state = self.state();
        let pos = state.pending.iter().position(|id| id == job_id)?;
        state.pending.remove(pos);
        let executing = pos == 0 && state.busy;
        if executing {
            state.busy = false;
        }
        Some(executing)
    }

    /// Forget `job_id` everywhere on this worker.
    pub fn purge(&self, job_id: &str) {
        let mut state = self.state();
        state.pending.retain(|id| id != job_id);
        state.results.remove(job_id);
        state.errored.retain(|id| id != job_id);
    }

    pub fn drain_pending(&self) -> Vec<JobId> {
        let mut state = self.state();
        state.busy = false;
        state.pending.drain(..).collect()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    async fn run_executor(
        handle: Weak<Self>,
        worker_id: String,
        stop: CancellationToken,
        mut jobs_rx: mpsc::UnboundedReceiver<JobId>,
    ) {
        loop {
            let job_id = tokio::select! {
                _ = stop.cancelled() => break,
                job = jobs_rx.recv() => match job {
                    Some(id) => id,
                    None => break,
                },
            };

            let Some(worker) = handle.upgrade() else {
                break;
            };
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = worker.execute(&job_id) => {}
            }
        }
        tracing::debug!(worker_id = %worker_id, "Worker executor stopped");
    }

    async fn execute(&self, job_id: &str) {
        let Some(operation) = self.ctx.store.get(job_id) else {
            // expired before it was picked up
            self.purge(job_id);
            return;
        };
        let cancel = operation.cancel_token();
        if cancel.is_cancelled() || operation.is_terminal() {
            return;
        }

        let _permit = tokio::select! {
            permit = Arc::clone(&self.ctx.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = cancel.cancelled() => return,
        };

        {
            let mut state = self.state();
            if state.pending.front().map(String::as_str) != Some(job_id) {
                tracing::debug!(worker_id = %self.id, job_id, "Job left the queue before it started");
                return;
            }
            state.busy = true;
        }

        tracing::info!(worker_id = %self.id, worker = %self.endpoint(), job_id, "Starting txt2img job");
        let params = operation.params();

        let outcome = tokio::select! {
            result = self.generate(params) => Some(result),
            _ = cancel.cancelled() => None,
        };

        match outcome {
            None => {
                let mut state = self.state();
                state.busy = false;
                state.pending.retain(|id| id != job_id);
                tracing::info!(worker_id = %self.id, job_id, "Job canceled during execution");
            }
            Some(Ok(images)) => self.complete(job_id, params, images),
            Some(Err(error)) => self.fail(job_id, error),
        }
    }

    async fn generate(&self, params: &GenerationParams) -> Result<Vec<String>, String> {
        if let Some(ref checkpoint) = params.checkpoint {
            let mut changes = Map::new();
            changes.insert(
                "sd_model_checkpoint".to_string(),
                Value::String(checkpoint.clone()),
            );
            self.api
                .update_options(changes)
                .await
                .map_err(|e| format!("Failed to load checkpoint {checkpoint}: {e}"))?;
        }

        let images = self
            .api
            .txt2img(params)
            .await
            .map_err(|e| format!("txt2img request failed: {e}"))?;
        if images.is_empty() {
            return Err("Worker returned no images".to_string());
        }
        Ok(images)
    }

    fn complete(&self, job_id: &str, params: &GenerationParams, images: Vec<String>) {
        let images: Vec<GeneratedImage> = images
            .into_iter()
            .map(|data| GeneratedImage {
                width: params.width,
                height: params.height,
                data: Arc::from(data),
            })
            .collect();

        let mut state = self.state();
        state.busy = false;
        let Some(pos) = state.pending.iter().position(|id| id == job_id) else {
            tracing::info!(worker_id = %self.id, job_id, "Discarding result for canceled or expired job");
            return;
        };
        state.pending.remove(pos);

        let first = images[0].clone();
        let accepted = self
            .ctx
            .store
            .update(job_id, |op| op.set_finished(images))
            .unwrap_or(false);
        if accepted {
            state.results.insert(job_id.to_string(), first);
            tracing::info!(worker_id = %self.id, job_id, "Job finished");
        } else {
            tracing::info!(worker_id = %self.id, job_id, "Discarding result for canceled or expired job");
        }
    }

    fn fail(&self, job_id: &str, error: String) {
        tracing::error!(worker_id = %self.id, worker = %self.endpoint(), job_id, error = %error, "Job failed");
        let mut state = self.state();
        state.busy = false;
        let Some(pos) = state.pending.iter().position(|id| id == job_id) else {
            return;
        };
        state.pending.remove(pos);
        let recorded = self
            .ctx
            .store
            .update(job_id, |op| op.set_errored(error))
            .unwrap_or(false);
        if recorded {
            state.errored.push(job_id.to_string());
        }
    }

    /// Cached system info; refetched once older than the capability TTL.
    pub async fn system_info(&self) -> Option<SystemInfo> {
        let mut cache = self.sys_info.lock().await;
        if let Some(info) = cache.fresh(self.ctx.capability_ttl) {
            return Some(info);
        }
        match self.api.system_info().await {
            Ok(info) => {
                cache.set(info.clone());
                Some(info)
            }
            Err(e) => {
                tracing::warn!(worker = %self.endpoint(), error = %e, "Failed to fetch system info");
                None
            }
        }
    }

    /// Cached capability lists; refetched once older than the capability TTL.
    pub async fn capabilities(&self) -> Option<Capabilities> {
        let mut cache = self.capabilities.lock().await;
        if let Some(caps) = cache.fresh(self.ctx.capability_ttl) {
            return Some(caps);
        }
        match self.api.capabilities().await {
            Ok(caps) => {
                cache.set(caps.clone());
                Some(caps)
            }
            Err(e) => {
                tracing::warn!(worker = %self.endpoint(), error = %e, "Failed to fetch capabilities");
                None
            }
        }
    }

    /// Ask the worker to rescan checkpoints, VAEs and LoRAs.
    pub async fn refresh_all(&self) -> bool {
        let mut ok = true;
        for target in RefreshTarget::ALL {
            if let Err(e) = self.api.refresh(target).await {
                tracing::warn!(worker = %self.endpoint(), path = target.path(), error = %e, "Refresh failed");
                ok = false;
            }
        }
        ok
    }

    pub async fn info(&self) -> WorkerInfo {
        let (busy, pending) = {
            let state = self.state();
            (state.busy, state.pending.len())
        };
        WorkerInfo {
            worker_id: self.id.clone(),
            endpoint: self.endpoint().to_string(),
            busy,
            pending,
            sys_info: self.system_info().await,
            sd_info: self.capabilities().await,
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{JobOutcome, Operation, OperationState};
    use crate::worker::mock::MockWorker;

    fn ctx(permits: usize) -> ExecutorContext {
        ExecutorContext {
            store: Arc::new(OperationStore::new()),
            permits: Arc::new(Semaphore::new(permits)),
            capability_ttl: Duration::from_secs(60),
        }
    }

    fn submit(handle: &WorkerHandle, ctx: &ExecutorContext, id: &str, params: GenerationParams) {
        ctx.store.insert(Operation::new(id.to_string(), params));
        assert!(handle.enqueue(id));
    }

    async fn wait_for_state(ctx: &ExecutorContext, id: &str, want: OperationState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while ctx.store.state(id) != Some(want) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {id} never reached {want:?}"));
    }

    #[tokio::test]
    async fn runs_job_and_stores_first_image() {
        let ctx = ctx(4);
        let mock = Arc::new(MockWorker::new("http://w1"));
        let handle = WorkerHandle::spawn(mock.clone(), ctx.clone());

        submit(&handle, &ctx, "job-1", GenerationParams::default());
        wait_for_state(&ctx, "job-1", OperationState::Finished).await;

        assert_eq!(handle.placement("job-1"), Some(JobPlacement::Finished));
        assert!(!handle.is_busy());
        assert_eq!(handle.pending_len(), 0);

        let image = handle.result("job-1", false).unwrap();
        assert_eq!((image.width, image.height), (512, 512));
        assert!(handle.result("job-1", true).is_some());
        assert!(handle.result("job-1", true).is_none());

        let op = ctx.store.get("job-1").unwrap();
        assert!(matches!(op.outcome(), JobOutcome::Images(images) if images.len() == 1));
        assert_eq!(mock.count("update_options"), 0);
    }

    #[tokio::test]
    async fn checkpoint_is_pushed_before_generation() {
        let ctx = ctx(4);
        let mock = Arc::new(MockWorker::new("http://w1"));
        let handle = WorkerHandle::spawn(mock.clone(), ctx.clone());

        let params = GenerationParams {
            checkpoint: Some("anything-v5".to_string()),
            ..Default::default()
        };
        submit(&handle, &ctx, "job-1", params);
        wait_for_state(&ctx, "job-1", OperationState::Finished).await;

        assert_eq!(mock.calls(), vec!["update_options", "txt2img"]);
        assert_eq!(
            mock.last_checkpoint().as_deref(),
            Some("anything-v5")
        );
    }

    #[tokio::test]
    async fn failed_checkpoint_update_skips_generation() {
        let ctx = ctx(4);
        let mock = Arc::new(MockWorker::new("http://w1").failing_options());
        let handle = WorkerHandle::spawn(mock.clone(), ctx.clone());

        let params = GenerationParams {
            checkpoint: Some("missing".to_string()),
            ..Default::default()
        };
        submit(&handle, &ctx, "job-1", params);
        wait_for_state(&ctx, "job-1", OperationState::Errored).await;

        assert_eq!(mock.count("txt2img"), 0);
        assert_eq!(handle.placement("job-1"), Some(JobPlacement::Errored));
        assert!(!handle.is_busy());
        let error = ctx.store.metadata("job-1").unwrap().error.unwrap();
        assert!(error.contains("Failed to load checkpoint missing"), "{error}");
    }

    #[tokio::test]
    async fn failed_generation_moves_job_to_errored() {
        let ctx = ctx(4);
        let mock = Arc::new(MockWorker::new("http://w1").failing_txt2img());
        let handle = WorkerHandle::spawn(mock.clone(), ctx.clone());

        submit(&handle, &ctx, "job-1", GenerationParams::default());
        wait_for_state(&ctx, "job-1", OperationState::Errored).await;

        assert_eq!(handle.placement("job-1"), Some(JobPlacement::Errored));
        assert_eq!(handle.pending_len(), 0);
        assert!(handle.result("job-1", false).is_none());
    }

    #[tokio::test]
    async fn jobs_run_in_fifo_order_one_at_a_time() {
        let ctx = ctx(4);
        let mock = Arc::new(MockWorker::new("http://w1").gated());
        let handle = WorkerHandle::spawn(mock.clone(), ctx.clone());

        for id in ["a", "b", "c"] {
            submit(&handle, &ctx, id, GenerationParams::default());
        }
        mock.wait_for_calls("txt2img", 1).await;

        assert!(handle.is_busy());
        assert_eq!(handle.placement("a"), Some(JobPlacement::Running));
        assert_eq!(handle.placement("b"), Some(JobPlacement::Queued(1)));
        assert_eq!(handle.placement("c"), Some(JobPlacement::Queued(2)));

        mock.release(3);
        wait_for_state(&ctx, "c", OperationState::Finished).await;
        assert_eq!(mock.count("txt2img"), 3);
        assert_eq!(ctx.store.state("a"), Some(OperationState::Finished));
        assert_eq!(ctx.store.state("b"), Some(OperationState::Finished));
    }

    #[tokio::test]
    async fn canceled_job_result_is_discarded() {
        let ctx = ctx(4);
        let mock = Arc::new(MockWorker::new("http://w1").gated());
        let handle = WorkerHandle::spawn(mock.clone(), ctx.clone());

        submit(&handle, &ctx, "job-1", GenerationParams::default());
        mock.wait_for_calls("txt2img", 1).await;

        assert_eq!(handle.remove_pending("job-1"), Some(true));
        ctx.store.update("job-1", |op| op.set_canceled());
        mock.release(1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.store.state("job-1"), Some(OperationState::Canceled));
        assert!(handle.result("job-1", false).is_none());
        assert!(!handle.is_busy());
    }

    #[tokio::test]
    async fn try_claim_idle_only_claims_empty_workers() {
        let ctx = ctx(4);
        let mock = Arc::new(MockWorker::new("http://w1").gated());
        let handle = WorkerHandle::spawn(mock.clone(), ctx.clone());

        ctx.store.insert(Operation::new("a".to_string(), GenerationParams::default()));
        assert!(handle.try_claim_idle("a"));
        assert!(!handle.try_claim_idle("b"));
        assert_eq!(handle.pending_len(), 1);
        mock.release(1);
    }

    #[tokio::test]
    async fn purge_forgets_job_everywhere() {
        let ctx = ctx(4);
        let mock = Arc::new(MockWorker::new("http://w1"));
        let handle = WorkerHandle::spawn(mock, ctx.clone());

        submit(&handle, &ctx, "job-1", GenerationParams::default());
        wait_for_state(&ctx, "job-1", OperationState::Finished).await;

        handle.purge("job-1");
        assert_eq!(handle.placement("job-1"), None);
    }

    #[tokio::test]
    async fn drain_and_stop() {
        let ctx = ctx(4);
        let mock = Arc::new(MockWorker::new("http://w1").gated());
        let handle = WorkerHandle::spawn(mock.clone(), ctx.clone());

        submit(&handle, &ctx, "a", GenerationParams::default());
        submit(&handle, &ctx, "b", GenerationParams::default());
        mock.wait_for_calls("txt2img", 1).await;

        handle.stop();
        let drained = handle.drain_pending();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(!handle.is_busy());
        assert!(!handle.try_claim_idle("c"));
    }

    #[tokio::test]
    async fn dropping_last_handle_stops_executor() {
        let ctx = ctx(4);
        let mock = Arc::new(MockWorker::new("http://w1"));
        let handle = WorkerHandle::spawn(mock.clone(), ctx.clone());

        submit(&handle, &ctx, "job-1", GenerationParams::default());
        wait_for_state(&ctx, "job-1", OperationState::Finished).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while Arc::strong_count(&handle) > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stop = handle.stop.clone();
        drop(handle);
        assert!(stop.is_cancelled());
        assert_eq!(Arc::strong_count(&mock), 1);
    }

    #[tokio::test]
    async fn restored_result_can_be_popped_again() {
        let ctx = ctx(4);
        let mock = Arc::new(MockWorker::new("http://w1"));
        let handle = WorkerHandle::spawn(mock, ctx.clone());

        submit(&handle, &ctx, "job-1", GenerationParams::default());
        wait_for_state(&ctx, "job-1", OperationState::Finished).await;

        let image = handle.result("job-1", true).unwrap();
        assert_eq!(handle.placement("job-1"), None);
        handle.restore_result("job-1", image.clone());
        assert_eq!(handle.placement("job-1"), Some(JobPlacement::Finished));
        assert_eq!(handle.result("job-1", true), Some(image));
    }

    #[tokio::test]
    async fn capabilities_are_cached_within_ttl() {
        let ctx = ctx(4);
        let mock = Arc::new(MockWorker::new("http://w1"));
        let handle = WorkerHandle::spawn(mock.clone(), ctx);

        assert!(handle.capabilities().await.is_some());
        assert!(handle.capabilities().await.is_some());
        assert!(handle.system_info().await.is_some());
        assert!(handle.system_info().await.is_some());

        assert_eq!(mock.count("capabilities"), 1);
        assert_eq!(mock.count("system_info"), 1);
    }

    #[tokio::test]
    async fn expired_ttl_refetches() {
        let mut ctx = ctx(4);
        ctx.capability_ttl = Duration::ZERO;
        let mock = Arc::new(MockWorker::new("http://w1"));
        let handle = WorkerHandle::spawn(mock.clone(), ctx);

        handle.capabilities().await;
        handle.capabilities().await;
        assert_eq!(mock.count("capabilities"), 2);
    }

    #[tokio::test]
    async fn info_reports_none_for_offline_worker() {
        let mock = Arc::new(MockWorker::new("http://w1").offline());
        let handle = WorkerHandle::spawn(mock, ctx(1));

        let info = handle.info().await;
        assert_eq!(info.endpoint, "http://w1");
        assert!(info.sys_info.is_none());
        assert!(info.sd_info.is_none());
        assert!(!handle.refresh_all().await);
    }
}
