//! Admission control: per-backend concurrency caps and the global
//! pending-queue bound.
//!
//! Each backend gets a counting semaphore sized to its configured cap. A
//! token is an owned permit: dropping it releases the slot, so success,
//! failure and cancellation all return capacity. Degraded backends cost
//! two permits per token, which halves the effective cap without revoking
//! anything already issued.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::health::BackendStatus;
use crate::registry::Backend;

/// An unforgeable permit for one concurrent call to one backend.
#[derive(Debug)]
pub struct AdmissionToken {
    backend_id: String,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionToken {
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }
}

/// Issues admission tokens and enforces the global pending bound.
#[derive(Debug)]
pub struct AdmissionController {
    semaphores: DashMap<String, Arc<Semaphore>>,
    pending: AtomicUsize,
    global_cap: usize,
}

impl AdmissionController {
    pub fn new(global_cap: usize) -> Self {
        Self { semaphores: DashMap::new(), pending: AtomicUsize::new(0), global_cap }
    }

    fn semaphore_for(&self, backend: &Backend) -> Arc<Semaphore> {
        self.semaphores
            .entry(backend.id.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(backend.max_in_flight)))
            .clone()
    }

    /// Reserve a pending slot for a new submission, or reject with
    /// `Overloaded` when the global queue is at capacity. The guard frees
    /// the slot when the job leaves the pending set.
    pub fn try_enter_queue(self: &Arc<Self>) -> Result<PendingGuard, GatewayError> {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current >= self.global_cap {
                return Err(GatewayError::overloaded());
            }
            match self.pending.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(PendingGuard { controller: Arc::clone(self) }),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Acquire a token for `backend`, waiting until the deadline.
    ///
    /// FIFO among one backend's waiters comes from the semaphore's own
    /// queue order. Degraded status is read at acquire time, so a newly
    /// degraded backend sees its cap halve for subsequent acquires while
    /// existing tokens run to completion.
    pub async fn acquire(
        &self,
        backend: &Arc<Backend>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<AdmissionToken, GatewayError> {
        let semaphore = self.semaphore_for(backend);
        let weight = admission_weight(backend);

        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| GatewayError::timeout("admission"))?;

        let permit = tokio::select! {
            acquired = tokio::time::timeout(remaining, semaphore.acquire_many_owned(weight)) => {
                acquired
                    .map_err(|_| GatewayError::timeout("admission"))?
                    .map_err(|_| GatewayError::internal("admission semaphore closed"))?
            }
            _ = cancel.cancelled() => {
                return Err(GatewayError::cancelled());
            }
        };

        Ok(AdmissionToken { backend_id: backend.id.clone(), _permit: permit })
    }

    /// Non-blocking acquire, used by tests and the shutdown drain.
    pub fn try_acquire(&self, backend: &Arc<Backend>) -> Option<AdmissionToken> {
        let semaphore = self.semaphore_for(backend);
        let weight = admission_weight(backend);
        semaphore
            .try_acquire_many_owned(weight)
            .ok()
            .map(|permit| AdmissionToken { backend_id: backend.id.clone(), _permit: permit })
    }

    /// Free permits on one backend's semaphore.
    pub fn available(&self, backend_id: &str) -> Option<usize> {
        self.semaphores.get(backend_id).map(|s| s.available_permits())
    }
}

/// Permits one token costs on its backend's semaphore. Degraded backends
/// pay double, halving the effective cap; a cap of one cannot halve
/// without starving the backend entirely, so it stays at one.
fn admission_weight(backend: &Backend) -> u32 {
    match backend.breaker.status() {
        BackendStatus::Degraded if backend.max_in_flight > 1 => 2,
        _ => 1,
    }
}

/// RAII guard for one occupied slot in the global pending queue.
#[derive(Debug)]
pub struct PendingGuard {
    controller: Arc<AdmissionController>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.controller.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::error::ErrorKind;
    use crate::registry::BackendRegistry;
    use crate::types::Capability;
    use std::time::Duration;

    fn backend(max_in_flight: usize) -> Arc<Backend> {
        let config = GatewayConfig { max_in_flight, ..Default::default() };
        BackendRegistry::make_backend(
            "b",
            "http://127.0.0.1:9".to_string(),
            vec![Capability::NlpAnalyze],
            false,
            &config,
        )
    }

    #[tokio::test]
    async fn test_cap_enforced() {
        let controller = Arc::new(AdmissionController::new(100));
        let backend = backend(2);
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_millis(50);

        let _t1 = controller.acquire(&backend, deadline, &cancel).await.unwrap();
        let _t2 = controller.acquire(&backend, deadline, &cancel).await.unwrap();
        let err = controller.acquire(&backend, deadline, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let controller = Arc::new(AdmissionController::new(100));
        let backend = backend(1);
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_millis(50);

        {
            let _token = controller.acquire(&backend, deadline, &cancel).await.unwrap();
            assert_eq!(controller.available("b"), Some(0));
        }
        assert_eq!(controller.available("b"), Some(1));
    }

    #[tokio::test]
    async fn test_degraded_halves_cap() {
        let controller = Arc::new(AdmissionController::new(100));
        let backend = backend(4);
        // One failure leaves the circuit closed but status Degraded.
        backend.breaker.record_failure();
        assert_eq!(backend.breaker.status(), BackendStatus::Degraded);

        let _t1 = controller.try_acquire(&backend).unwrap();
        let _t2 = controller.try_acquire(&backend).unwrap();
        assert!(controller.try_acquire(&backend).is_none(), "half of 4 is 2 tokens");
    }

    #[tokio::test]
    async fn test_global_queue_cap() {
        let controller = Arc::new(AdmissionController::new(2));
        let g1 = controller.try_enter_queue().unwrap();
        let _g2 = controller.try_enter_queue().unwrap();
        let err = controller.try_enter_queue().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overloaded);

        drop(g1);
        assert!(controller.try_enter_queue().is_ok(), "slot freed after drop");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_acquire() {
        let controller = Arc::new(AdmissionController::new(100));
        let backend = backend(1);
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(5);

        let _held = controller.acquire(&backend, deadline, &cancel).await.unwrap();

        let controller2 = controller.clone();
        let backend2 = backend.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move {
            controller2.acquire(&backend2, deadline, &cancel2).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
