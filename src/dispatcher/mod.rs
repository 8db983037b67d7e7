//! The dispatch facade: every submission flows through here.
//!
//! For one submitted request the dispatcher (1) computes the fingerprint,
//! (2) consults the response cache, (3) on miss attaches to or opens a
//! batch for the capability, (4) awaits admission, (5) invokes the
//! routed backend with a deadline, (6) settles the job, (7) populates the
//! cache, and (8) hands the result back through the job handle.
//!
//! Retry policy lives here, not in the pool, so backoff can coordinate
//! with admission, routing and job state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, PendingGuard};
use crate::batcher::{BatchGroup, BatchMember, Batcher};
use crate::cache::{CacheStats, InFlightOutcome, Lookup, ResponseCache};
use crate::config::GatewayConfig;
use crate::error::{ErrorKind, GatewayError};
use crate::fingerprint;
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::jobs::{JobHandle, JobManager, JobRecord, JobSnapshot, JobState, ListFilter};
use crate::metrics;
use crate::pool::BackendPool;
use crate::registry::{Backend, BackendRegistry};
use crate::types::{AiRequest, Capability, Priority, SubmitOptions};

/// Retry backoff parameters: exponential base 2 from 50 ms, capped at
/// 2 s, with full jitter.
const BACKOFF_INITIAL: Duration = Duration::from_millis(50);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Aggregated view for the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub backends: Vec<HealthSnapshot>,
    pub jobs_queued: usize,
    pub jobs_running: usize,
    pub pending: usize,
    pub batcher_depth: usize,
    pub cache: CacheStats,
}

impl HealthReport {
    /// Overall status word: degraded as soon as any backend is not
    /// healthy, unhealthy when none is routable.
    pub fn overall(&self) -> &'static str {
        use crate::health::BackendStatus;
        let routable = self
            .backends
            .iter()
            .filter(|b| b.status != BackendStatus::Unhealthy)
            .count();
        if routable == 0 {
            "unhealthy"
        } else if routable < self.backends.len() {
            "degraded"
        } else {
            "healthy"
        }
    }
}

/// Everything one job needs to travel the dispatch pipeline.
struct DispatchContext {
    job: Arc<JobRecord>,
    request: AiRequest,
    use_cache: bool,
    is_origin: bool,
    pending: Option<PendingGuard>,
}

/// The request dispatcher and job control plane.
pub struct Dispatcher {
    config: GatewayConfig,
    registry: Arc<BackendRegistry>,
    pool: Arc<BackendPool>,
    jobs: Arc<JobManager>,
    cache: Arc<ResponseCache>,
    admission: Arc<AdmissionController>,
    batcher: Arc<Batcher>,
    shutdown: CancellationToken,
    accepting: AtomicBool,
}

impl Dispatcher {
    /// Build the control plane from configuration and spawn its
    /// background tasks (batch worker, retention janitor, health prober).
    pub fn start(config: GatewayConfig) -> Result<Arc<Self>, GatewayError> {
        let registry = Arc::new(BackendRegistry::from_config(&config));
        Self::start_with_registry(config, registry)
    }

    /// Like [`Dispatcher::start`], with an explicit backend set. Tests
    /// wire mock backends through this.
    pub fn start_with_registry(
        config: GatewayConfig,
        registry: Arc<BackendRegistry>,
    ) -> Result<Arc<Self>, GatewayError> {
        metrics::register_metrics();

        let pool = Arc::new(BackendPool::new(registry.all(), &config)?);
        let jobs = Arc::new(JobManager::new(config.retention_window));
        let cache = Arc::new(ResponseCache::new(config.cache_max_entries, config.cache_ttl));
        let admission = Arc::new(AdmissionController::new(config.global_queue_cap));
        let (batcher, sealed_rx) = Batcher::new(config.max_batch_size, config.max_batch_wait);
        let shutdown = CancellationToken::new();

        let dispatcher = Arc::new(Self {
            config,
            registry,
            pool,
            jobs,
            cache,
            admission,
            batcher,
            shutdown,
            accepting: AtomicBool::new(true),
        });

        tokio::spawn(Arc::clone(&dispatcher).run_group_worker(sealed_rx));
        tokio::spawn(Arc::clone(&dispatcher.jobs).run_janitor(
            dispatcher.config.janitor_interval,
            dispatcher.shutdown.clone(),
        ));
        {
            let cache = Arc::clone(&dispatcher.cache);
            let shutdown = dispatcher.shutdown.clone();
            let interval = dispatcher.config.janitor_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.cancelled() => return,
                    }
                    cache.evict_expired();
                }
            });
        }
        let monitor = HealthMonitor::new(
            Arc::clone(&dispatcher.registry),
            Arc::clone(&dispatcher.pool),
            dispatcher.config.probe_interval,
        );
        tokio::spawn(monitor.run(dispatcher.shutdown.clone()));

        Ok(dispatcher)
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Submit one request. Returns a handle immediately; the job settles
    /// asynchronously unless a cache hit short-circuits it.
    pub fn submit(
        self: &Arc<Self>,
        capability: Capability,
        body: Value,
        options: SubmitOptions,
    ) -> Result<JobHandle, GatewayError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(GatewayError::new(
                ErrorKind::Overloaded,
                "gateway is shutting down",
            ));
        }

        let request = AiRequest::decode(capability, body)?;
        let fp = fingerprint::compute(capability, &request);
        let use_cache = options.allow_cache
            && request.is_pure(options.allow_cache)
            && self.cache.storage_enabled();
        let coalesce = options.allow_cache && request.is_pure(options.allow_cache);

        // Fast path: a live cache entry settles the job before it ever
        // counts against the pending queue.
        if use_cache {
            if let Some(result) = self.cache.peek(fp) {
                let job = self.jobs.create(capability, fp, options.deadline);
                job.succeed(result);
                self.finish_metrics(&job);
                debug!(job_id = %job.id, capability = %capability, "cache hit");
                return Ok(job.handle());
            }
        }

        let pending = self.admission.try_enter_queue().map_err(|e| {
            metrics::record_error(capability.as_str(), e.kind().as_str());
            e
        })?;

        let job = self.jobs.create(capability, fp, options.deadline);
        let handle = job.handle();
        let mut ctx = DispatchContext {
            job,
            request,
            use_cache,
            is_origin: false,
            pending: Some(pending),
        };

        if coalesce {
            match self.cache.lookup(fp, &ctx.job.id) {
                Lookup::Hit(result) => {
                    ctx.job.succeed(result);
                    self.finish_metrics(&ctx.job);
                    return Ok(handle);
                }
                Lookup::Join(rx) => {
                    tokio::spawn(Arc::clone(self).run_waiter(ctx, rx));
                    return Ok(handle);
                }
                Lookup::MissInstalled => {
                    ctx.is_origin = true;
                }
            }
        }

        self.route(ctx, options.priority);
        Ok(handle)
    }

    /// Hand a context to the batcher or straight to a dispatch task.
    fn route(self: &Arc<Self>, ctx: DispatchContext, priority: Priority) {
        if ctx.job.capability.batchable() && priority == Priority::Normal {
            self.batcher.append(BatchMember {
                job: ctx.job,
                request: ctx.request,
                allow_cache: ctx.use_cache,
                is_cache_origin: ctx.is_origin,
                pending: ctx.pending,
            });
        } else {
            tokio::spawn(Arc::clone(self).run_job(ctx));
        }
    }

    pub fn get(&self, id: &str) -> Option<JobSnapshot> {
        self.jobs.get(id)
    }

    pub fn list(&self, filter: &ListFilter) -> (Vec<JobSnapshot>, usize) {
        self.jobs.list(filter)
    }

    /// Cancel a job. Idempotent; returns the snapshot after the attempt,
    /// or None for an unknown id.
    pub fn cancel(&self, id: &str) -> Option<JobSnapshot> {
        let record = self.jobs.record(id)?;
        record.cancel.cancel();
        self.batcher.remove(id);
        // Promote any single-flight waiters if this job was their origin.
        self.cache.cancel_origin(record.fingerprint, &record.id);
        if record.state() == JobState::Queued && record.mark_cancelled() {
            self.finish_metrics(&record);
        }
        Some(record.snapshot())
    }

    pub fn health(&self) -> HealthReport {
        let (jobs_queued, jobs_running) = self.jobs.depth();
        HealthReport {
            backends: self.registry.all().iter().map(|b| b.health_snapshot()).collect(),
            jobs_queued,
            jobs_running,
            pending: self.admission.pending_count(),
            batcher_depth: self.batcher.depth(),
            cache: self.cache.stats(),
        }
    }

    /// Graceful shutdown: stop intake, flush the batcher, drain running
    /// jobs up to `grace`, cancel what remains, stop background tasks.
    pub async fn shutdown(&self, grace: Duration) {
        info!("dispatcher shutting down");
        self.accepting.store(false, Ordering::Release);
        self.batcher.flush_all();

        let deadline = Instant::now() + grace;
        loop {
            if self.jobs.live_records().is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let remaining = self.jobs.live_records();
        if !remaining.is_empty() {
            warn!(count = remaining.len(), "cancelling jobs at shutdown deadline");
            for record in remaining {
                record.cancel.cancel();
                if record.mark_cancelled() {
                    self.finish_metrics(&record);
                }
            }
        }
        self.shutdown.cancel();
    }

    /// Consumes sealed batch groups for the life of the process.
    async fn run_group_worker(
        self: Arc<Self>,
        mut sealed_rx: mpsc::UnboundedReceiver<BatchGroup>,
    ) {
        loop {
            tokio::select! {
                group = sealed_rx.recv() => match group {
                    Some(group) => {
                        tokio::spawn(Arc::clone(&self).execute_group(group));
                    }
                    None => return,
                },
                _ = self.shutdown.cancelled() => {
                    debug!("group worker stopping");
                    return;
                }
            }
        }
    }

    /// Execute one sealed group: drop dead members, then either one
    /// batched call or individual dispatches when the backend does not
    /// advertise batch support.
    async fn execute_group(self: Arc<Self>, group: BatchGroup) {
        let capability = group.capability;
        let mut members = Vec::with_capacity(group.members.len());
        for member in group.members {
            if member.job.is_terminal() {
                continue;
            }
            if member.job.cancel.is_cancelled() {
                self.settle_cancelled(&member.job, member.is_cache_origin);
                continue;
            }
            if member.job.remaining().is_none() {
                self.settle_error(
                    &member.job,
                    member.is_cache_origin,
                    GatewayError::timeout("job deadline"),
                );
                continue;
            }
            members.push(member);
        }
        if members.is_empty() {
            return;
        }

        if members.len() > 1 {
            match self.registry.resolve(capability, None) {
                Ok(backend) if backend.supports_batch => {
                    self.run_batch(capability, members, backend).await;
                    return;
                }
                Ok(_) => {
                    // The selected backend takes one request per call;
                    // fall through to individual dispatch.
                }
                Err(e) => {
                    for member in &members {
                        self.settle_error(&member.job, member.is_cache_origin, e.clone());
                    }
                    return;
                }
            }
        }

        for member in members {
            let ctx = DispatchContext {
                job: member.job,
                request: member.request,
                use_cache: member.allow_cache,
                is_origin: member.is_cache_origin,
                pending: member.pending,
            };
            tokio::spawn(Arc::clone(&self).run_job(ctx));
        }
    }

    /// One batched backend call for the whole group, with the same retry
    /// policy as single dispatch. Responses are distributed to members in
    /// submission order; a short response fails the remainder.
    async fn run_batch(
        self: &Arc<Self>,
        capability: Capability,
        mut members: Vec<BatchMember>,
        first_backend: Arc<Backend>,
    ) {
        let deadline = members
            .iter()
            .map(|m| m.job.deadline)
            .min()
            .expect("members non-empty");
        // Member cancellation does not abort a shared call; terminal
        // transitions absorb individual results instead.
        let no_cancel = CancellationToken::new();
        let mut backend = first_backend;
        let mut attempt = 0u32;

        loop {
            let token = match self.admission.acquire(&backend, deadline, &no_cancel).await {
                Ok(token) => token,
                Err(e) => {
                    for member in &members {
                        self.settle_error(&member.job, member.is_cache_origin, e.clone());
                    }
                    return;
                }
            };

            for member in &mut members {
                member.job.mark_admitted();
                member.pending.take();
                member.job.mark_running();
            }

            let bodies: Vec<Value> = members.iter().map(|m| m.request.to_body()).collect();
            let outcome = self.pool.call_batch(&backend, capability, &bodies, deadline).await;
            drop(token);

            match outcome {
                Ok(results) => {
                    backend.breaker.record_success();
                    metrics::record_inference(capability.as_str(), "success");
                    for (i, member) in members.iter().enumerate() {
                        match results.get(i) {
                            Some(result) => self.settle_success(
                                &member.job,
                                member.is_cache_origin,
                                member.allow_cache,
                                Arc::new(result.clone()),
                            ),
                            None => self.settle_error(
                                &member.job,
                                member.is_cache_origin,
                                GatewayError::new(
                                    ErrorKind::BatchShortResponse,
                                    "backend returned fewer results than batch members",
                                ),
                            ),
                        }
                    }
                    return;
                }
                Err(e) => {
                    metrics::record_inference(capability.as_str(), "error");
                    if e.retryable() {
                        backend.breaker.record_failure();
                    }
                    if self.may_retry(&e, attempt, deadline) {
                        let delay = backoff_delay(attempt);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        match self.registry.resolve(capability, Some(backend.id.as_str())) {
                            Ok(next) => {
                                backend = next;
                                continue;
                            }
                            Err(resolve_err) => {
                                for member in &members {
                                    self.settle_error(
                                        &member.job,
                                        member.is_cache_origin,
                                        resolve_err.clone(),
                                    );
                                }
                                return;
                            }
                        }
                    }
                    for member in &members {
                        self.settle_error(&member.job, member.is_cache_origin, e.clone());
                    }
                    return;
                }
            }
        }
    }

    /// The per-job attempt loop: resolve, admit, call, settle, with
    /// retries across distinct backends.
    async fn run_job(self: Arc<Self>, mut ctx: DispatchContext) {
        let job = Arc::clone(&ctx.job);
        let capability = job.capability;
        let deadline = job.deadline;
        let mut exclude: Option<String> = None;
        let mut attempt = 0u32;

        loop {
            if job.is_terminal() {
                return;
            }
            if job.cancel.is_cancelled() {
                self.settle_cancelled(&job, ctx.is_origin);
                return;
            }
            if job.remaining().is_none() {
                self.settle_error(&job, ctx.is_origin, GatewayError::timeout("job deadline"));
                return;
            }

            let backend = match self.registry.resolve(capability, exclude.as_deref()) {
                Ok(backend) => backend,
                Err(e) => {
                    self.settle_error(&job, ctx.is_origin, e);
                    return;
                }
            };

            let token = match self.admission.acquire(&backend, deadline, &job.cancel).await {
                Ok(token) => token,
                Err(e) if e.kind() == ErrorKind::Cancelled => {
                    self.settle_cancelled(&job, ctx.is_origin);
                    return;
                }
                Err(e) => {
                    self.settle_error(&job, ctx.is_origin, e);
                    return;
                }
            };

            job.mark_admitted();
            ctx.pending.take();

            if job.cancel.is_cancelled() {
                drop(token);
                self.settle_cancelled(&job, ctx.is_origin);
                return;
            }

            job.mark_running();

            let body = ctx.request.to_body();
            let outcome = tokio::select! {
                result = self.pool.call(&backend, capability, &body, deadline) => result,
                _ = job.cancel.cancelled() => {
                    // Best-effort abort: dropping the call future tears
                    // down the outbound request; the token follows.
                    drop(token);
                    self.settle_cancelled(&job, ctx.is_origin);
                    return;
                }
            };
            drop(token);

            match outcome {
                Ok(result) => {
                    backend.breaker.record_success();
                    metrics::record_inference(capability.as_str(), "success");
                    self.settle_success(&job, ctx.is_origin, ctx.use_cache, Arc::new(result));
                    return;
                }
                Err(e) => {
                    metrics::record_inference(capability.as_str(), "error");
                    if e.retryable() {
                        backend.breaker.record_failure();
                    }
                    if self.may_retry(&e, attempt, deadline) {
                        let delay = backoff_delay(attempt);
                        debug!(
                            job_id = %job.id,
                            backend = %backend.id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            kind = %e.kind(),
                            "retrying on another backend"
                        );
                        exclude = Some(backend.id.clone());
                        attempt += 1;
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = job.cancel.cancelled() => {
                                self.settle_cancelled(&job, ctx.is_origin);
                                return;
                            }
                        }
                    }
                    self.settle_error(&job, ctx.is_origin, e);
                    return;
                }
            }
        }
    }

    /// Single-flight waiter: parks on the origin's wake-up channel and
    /// takes over as origin if the original submission is cancelled.
    async fn run_waiter(
        self: Arc<Self>,
        mut ctx: DispatchContext,
        mut rx: broadcast::Receiver<InFlightOutcome>,
    ) {
        let job = Arc::clone(&ctx.job);
        loop {
            tokio::select! {
                outcome = rx.recv() => match outcome {
                    Ok(InFlightOutcome::Completed(result)) => {
                        if job.succeed(result) {
                            self.finish_metrics(&job);
                        }
                        return;
                    }
                    Ok(InFlightOutcome::Failed(error)) => {
                        self.settle_error(&job, false, error);
                        return;
                    }
                    // Origin gone without a result: re-dispute the
                    // fingerprint. The first waiter here becomes the new
                    // origin; the rest re-join it.
                    Ok(InFlightOutcome::OriginCancelled) | Err(_) => {
                        match self.cache.lookup(job.fingerprint, &job.id) {
                            Lookup::Hit(result) => {
                                if job.succeed(result) {
                                    self.finish_metrics(&job);
                                }
                                return;
                            }
                            Lookup::Join(new_rx) => {
                                rx = new_rx;
                                continue;
                            }
                            Lookup::MissInstalled => {
                                ctx.is_origin = true;
                                let this = Arc::clone(&self);
                                this.run_job(ctx).await;
                                return;
                            }
                        }
                    }
                },
                _ = job.cancel.cancelled() => {
                    self.settle_cancelled(&job, false);
                    return;
                }
                _ = tokio::time::sleep_until(job.deadline) => {
                    self.settle_error(&job, false, GatewayError::timeout("job deadline"));
                    return;
                }
            }
        }
    }

    fn may_retry(&self, error: &GatewayError, attempt: u32, deadline: Instant) -> bool {
        error.retryable()
            && attempt + 1 < self.config.retry_max_attempts
            && Instant::now() + backoff_delay_max(attempt) < deadline
    }

    fn settle_success(
        &self,
        job: &Arc<JobRecord>,
        is_origin: bool,
        use_cache: bool,
        result: Arc<Value>,
    ) {
        if job.succeed(Arc::clone(&result)) {
            if is_origin {
                if use_cache {
                    self.cache.publish(job.fingerprint, result, None);
                } else {
                    // Single-flight without storage: wake waiters, keep
                    // nothing.
                    self.cache.publish(job.fingerprint, result, Some(Duration::ZERO));
                }
            }
            self.finish_metrics(job);
        } else if is_origin {
            // The job went terminal under us (cancel race); make sure no
            // waiter is left parked on a dead marker.
            self.cache.cancel_origin(job.fingerprint, &job.id);
        }
    }

    fn settle_error(&self, job: &Arc<JobRecord>, is_origin: bool, error: GatewayError) {
        if is_origin {
            self.cache.fail(job.fingerprint, error.clone());
        }
        let transitioned = match error.kind() {
            ErrorKind::Timeout => job.mark_timed_out(),
            ErrorKind::Cancelled => job.mark_cancelled(),
            _ => job.fail(error.clone()),
        };
        if transitioned {
            metrics::record_error(job.capability.as_str(), error.kind().as_str());
            self.finish_metrics(job);
        }
    }

    fn settle_cancelled(&self, job: &Arc<JobRecord>, is_origin: bool) {
        if is_origin {
            self.cache.cancel_origin(job.fingerprint, &job.id);
        }
        if job.mark_cancelled() {
            self.finish_metrics(job);
        }
    }

    /// Record the terminal metrics for one job, exactly once.
    fn finish_metrics(&self, job: &Arc<JobRecord>) {
        let snapshot = job.snapshot();
        let status = match snapshot.status {
            JobState::Succeeded => "success",
            JobState::Failed => "error",
            JobState::Cancelled => "cancelled",
            JobState::TimedOut => "timeout",
            _ => return,
        };
        let duration = (chrono::Utc::now() - snapshot.submitted_at)
            .to_std()
            .unwrap_or_default();
        metrics::record_request(job.capability.as_str(), status, duration.as_secs_f64());
    }
}

/// Full-jitter exponential backoff for `attempt` (0-based).
fn backoff_delay(attempt: u32) -> Duration {
    let max = backoff_delay_max(attempt);
    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

fn backoff_delay_max(attempt: u32) -> Duration {
    let exp = BACKOFF_INITIAL.saturating_mul(1u32 << attempt.min(16));
    exp.min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff_delay_max(0), Duration::from_millis(50));
        assert_eq!(backoff_delay_max(1), Duration::from_millis(100));
        assert_eq!(backoff_delay_max(2), Duration::from_millis(200));
        assert_eq!(backoff_delay_max(10), Duration::from_secs(2));
        assert_eq!(backoff_delay_max(32), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_jitter_within_bounds() {
        for attempt in 0..5 {
            for _ in 0..50 {
                assert!(backoff_delay(attempt) <= backoff_delay_max(attempt));
            }
        }
    }
}
