//! Micro-batching for inference capabilities.
//!
//! Jobs sharing a capability and compatible parameters gather into a
//! `BatchGroup` keyed by `(capability, bucket_key)`. A group opens on its
//! first member and seals when it reaches the size cap, when the wait
//! window expires, or on explicit flush. Sealed groups are handed to the
//! dispatch worker over a channel as single units.
//!
//! ```text
//!  submit ──> open group ──(size | wait | flush)──> sealed ──> dispatcher
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::admission::PendingGuard;
use crate::jobs::JobRecord;
use crate::types::{AiRequest, Capability};

/// One job waiting in a batch group, with the dispatch context it needs
/// after sealing.
pub struct BatchMember {
    pub job: Arc<JobRecord>,
    pub request: AiRequest,
    pub allow_cache: bool,
    /// Whether this job installed the in-flight cache marker and owes the
    /// cache a publish/fail.
    pub is_cache_origin: bool,
    /// Occupies one slot of the global pending queue until admission.
    pub pending: Option<PendingGuard>,
}

/// A sealed gathering of jobs dispatched together.
pub struct BatchGroup {
    pub capability: Capability,
    pub bucket_key: String,
    pub open_ts: Instant,
    /// Members in submission order; responses are distributed in this
    /// order.
    pub members: Vec<BatchMember>,
}

struct OpenGroup {
    group: BatchGroup,
    epoch: u64,
}

type BucketKey = (Capability, String);

/// Collects members into groups and seals them.
pub struct Batcher {
    max_batch_size: usize,
    max_batch_wait: Duration,
    buckets: Mutex<HashMap<BucketKey, OpenGroup>>,
    sealed_tx: mpsc::UnboundedSender<BatchGroup>,
    epoch: AtomicU64,
}

impl Batcher {
    pub fn new(
        max_batch_size: usize,
        max_batch_wait: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<BatchGroup>) {
        let (sealed_tx, sealed_rx) = mpsc::unbounded_channel();
        let batcher = Arc::new(Self {
            max_batch_size: max_batch_size.max(1),
            max_batch_wait,
            buckets: Mutex::new(HashMap::new()),
            sealed_tx,
            epoch: AtomicU64::new(0),
        });
        (batcher, sealed_rx)
    }

    /// Append a member to its bucket's open group, opening one if needed.
    /// A group reaching the size cap seals immediately.
    pub fn append(self: &Arc<Self>, member: BatchMember) {
        let capability = member.job.capability;
        let bucket_key = member.request.bucket_key();
        let key = (capability, bucket_key.clone());

        let seal_now = {
            let mut buckets = self.buckets.lock();
            let open = buckets.entry(key.clone()).or_insert_with(|| {
                let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
                debug!(capability = %capability, bucket = %bucket_key, "batch group opened");
                let batcher = Arc::clone(self);
                let timer_key = key.clone();
                let wait = self.max_batch_wait;
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    batcher.seal_if_epoch(&timer_key, epoch);
                });
                OpenGroup {
                    group: BatchGroup {
                        capability,
                        bucket_key: bucket_key.clone(),
                        open_ts: Instant::now(),
                        members: Vec::new(),
                    },
                    epoch,
                }
            });
            open.group.members.push(member);
            if open.group.members.len() >= self.max_batch_size {
                buckets.remove(&key)
            } else {
                None
            }
        };

        if let Some(open) = seal_now {
            self.seal(open.group);
        }
    }

    /// Seal the group at `key` if it is still the one the timer was armed
    /// for. A group that sealed by size and re-opened keeps its new epoch
    /// and its own timer.
    fn seal_if_epoch(&self, key: &BucketKey, epoch: u64) {
        let sealed = {
            let mut buckets = self.buckets.lock();
            match buckets.get(key) {
                Some(open) if open.epoch == epoch => buckets.remove(key),
                _ => None,
            }
        };
        if let Some(open) = sealed {
            self.seal(open.group);
        }
    }

    fn seal(&self, group: BatchGroup) {
        if group.members.is_empty() {
            return;
        }
        debug!(
            capability = %group.capability,
            bucket = %group.bucket_key,
            members = group.members.len(),
            waited_ms = group.open_ts.elapsed().as_millis() as u64,
            "batch group sealed"
        );
        // The receiver only closes on shutdown; members are settled by
        // the drain path then.
        let _ = self.sealed_tx.send(group);
    }

    /// Remove a still-queued member (cancellation). Returns true when the
    /// job was found in an open group.
    pub fn remove(&self, job_id: &str) -> bool {
        let mut buckets = self.buckets.lock();
        let mut emptied = None;
        let mut removed = false;
        for (key, open) in buckets.iter_mut() {
            if let Some(pos) = open.group.members.iter().position(|m| m.job.id == job_id) {
                open.group.members.remove(pos);
                removed = true;
                if open.group.members.is_empty() {
                    emptied = Some(key.clone());
                }
                break;
            }
        }
        if let Some(key) = emptied {
            buckets.remove(&key);
        }
        removed
    }

    /// Seal every open group, regardless of size or age. Used on
    /// shutdown.
    pub fn flush_all(&self) {
        let drained: Vec<OpenGroup> = {
            let mut buckets = self.buckets.lock();
            buckets.drain().map(|(_, open)| open).collect()
        };
        for open in drained {
            self.seal(open.group);
        }
    }

    /// Total members across open groups.
    pub fn depth(&self) -> usize {
        self.buckets.lock().values().map(|o| o.group.members.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member(prompt: &str) -> BatchMember {
        let request = AiRequest::decode(
            Capability::LlmCompletion,
            json!({"prompt": prompt, "model": "m"}),
        )
        .unwrap();
        let job = JobRecord::new(
            Capability::LlmCompletion,
            0,
            Duration::from_secs(10),
            Duration::from_secs(60),
        );
        BatchMember { job, request, allow_cache: false, is_cache_origin: false, pending: None }
    }

    #[tokio::test]
    async fn test_seals_at_size() {
        let (batcher, mut rx) = Batcher::new(3, Duration::from_secs(60));
        for i in 0..3 {
            batcher.append(member(&format!("p{i}")));
        }
        let group = rx.recv().await.unwrap();
        assert_eq!(group.members.len(), 3);
        assert_eq!(batcher.depth(), 0);
    }

    #[tokio::test]
    async fn test_seals_on_wait() {
        let (batcher, mut rx) = Batcher::new(8, Duration::from_millis(20));
        batcher.append(member("only"));
        let group = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("group seals within the wait window")
            .unwrap();
        assert_eq!(group.members.len(), 1);
    }

    #[tokio::test]
    async fn test_overflow_opens_new_group() {
        let (batcher, mut rx) = Batcher::new(2, Duration::from_millis(20));
        for i in 0..3 {
            batcher.append(member(&format!("p{i}")));
        }
        let first = rx.recv().await.unwrap();
        assert_eq!(first.members.len(), 2);
        let second = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.members.len(), 1);
    }

    #[tokio::test]
    async fn test_submission_order_preserved() {
        let (batcher, mut rx) = Batcher::new(3, Duration::from_secs(60));
        let ids: Vec<String> = (0..3)
            .map(|i| {
                let m = member(&format!("p{i}"));
                let id = m.job.id.clone();
                batcher.append(m);
                id
            })
            .collect();
        let group = rx.recv().await.unwrap();
        let got: Vec<String> = group.members.iter().map(|m| m.job.id.clone()).collect();
        assert_eq!(got, ids);
    }

    #[tokio::test]
    async fn test_buckets_are_separate() {
        let (batcher, mut rx) = Batcher::new(2, Duration::from_secs(60));
        let a = member("a");
        let mut b = member("b");
        // Different model → different bucket.
        b.request = AiRequest::decode(
            Capability::LlmCompletion,
            json!({"prompt": "b", "model": "other"}),
        )
        .unwrap();
        batcher.append(a);
        batcher.append(b);
        assert_eq!(batcher.depth(), 2, "two open single-member groups");
        batcher.flush_all();
        let g1 = rx.recv().await.unwrap();
        let g2 = rx.recv().await.unwrap();
        assert_eq!(g1.members.len() + g2.members.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_cancelled_member() {
        let (batcher, mut rx) = Batcher::new(8, Duration::from_millis(50));
        let m1 = member("keep");
        let m2 = member("drop");
        let drop_id = m2.job.id.clone();
        batcher.append(m1);
        batcher.append(m2);
        assert!(batcher.remove(&drop_id));
        assert!(!batcher.remove(&drop_id), "second removal finds nothing");
        let group = rx.recv().await.unwrap();
        assert_eq!(group.members.len(), 1);
        assert_ne!(group.members[0].job.id, drop_id);
    }

    #[tokio::test]
    async fn test_flush_all() {
        let (batcher, mut rx) = Batcher::new(8, Duration::from_secs(60));
        batcher.append(member("a"));
        batcher.append(member("b"));
        batcher.flush_all();
        let group = rx.recv().await.unwrap();
        assert_eq!(group.members.len(), 2);
        assert_eq!(batcher.depth(), 0);
    }
}
