//! C5 — Memory Supervisor: periodic tiered recovery so allocation
//! pressure is relieved before it causes an allocation failure (spec
//! section 4.5).

pub mod allocator;

pub use allocator::{ExternalBackend, FallbackAllocator, InternalBackend, LargeMemoryAllocator, MemorySource};

use crate::queue::{ObservationQueue, RetryQueue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

const HEALTHY_THRESHOLD: usize = 50_000;
const WARNING_THRESHOLD: usize = 30_000;
const CRITICAL_THRESHOLD: usize = 15_000;
const EMERGENCY_THRESHOLD: usize = 10_000;
const FATAL_CONSECUTIVE_TICKS: u32 = 3;
const CRITICAL_DEFRAG_ALLOC_BYTES: usize = 4096;
const OBSERVATION_DROP_COUNT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum MemoryTier {
    Healthy,
    Warning,
    Critical,
    Emergency,
    Fatal,
}

/// Tier boundaries are cascading (most severe first); the 30-50KB band
/// has no action named in spec section 4.5's table, so it is folded into
/// Healthy (an Open Question resolution, see DESIGN.md).
fn tier_for(free_internal: usize) -> MemoryTier {
    if free_internal <= EMERGENCY_THRESHOLD {
        MemoryTier::Emergency
    } else if free_internal <= CRITICAL_THRESHOLD {
        MemoryTier::Critical
    } else if free_internal <= WARNING_THRESHOLD {
        MemoryTier::Warning
    } else {
        MemoryTier::Healthy
    }
}

/// Manual recovery hook for tests (spec section 4.5 "exposes
/// `force_recovery(action)` for manual tests").
#[derive(Debug, Clone, Copy)]
pub enum RecoveryAction {
    ClearExpiredRetry,
    DropOldestObservations,
    Defragment,
}

#[derive(Debug, Default)]
pub struct MemoryHealth {
    pub current_tier: Option<MemoryTier>,
    pub emergency_count: u64,
    pub consecutive_low_ticks: u32,
    pub restart_requested: bool,
}

pub struct MemorySupervisor {
    memory_source: Arc<dyn MemorySource>,
    allocator: Arc<dyn LargeMemoryAllocator>,
    observation_queue: Arc<ObservationQueue>,
    retry_queue: Arc<RetryQueue>,
    emergency_count: AtomicU64,
    consecutive_low_ticks: Mutex<u32>,
    current_tier: Mutex<Option<MemoryTier>>,
    restart_requested: Notify,
    restart_flag: std::sync::atomic::AtomicBool,
}

impl MemorySupervisor {
    pub fn new(
        memory_source: Arc<dyn MemorySource>,
        allocator: Arc<dyn LargeMemoryAllocator>,
        observation_queue: Arc<ObservationQueue>,
        retry_queue: Arc<RetryQueue>,
    ) -> Self {
        Self {
            memory_source,
            allocator,
            observation_queue,
            retry_queue,
            emergency_count: AtomicU64::new(0),
            consecutive_low_ticks: Mutex::new(0),
            current_tier: Mutex::new(None),
            restart_requested: Notify::new(),
            restart_flag: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Run one supervisory tick, applying the tiered policy in spec
    /// section 4.5's table. Returns the tier actually reached (which may
    /// be `Fatal`, escalated from three consecutive Emergency ticks).
    pub async fn tick(&self, now_rtc_valid_ms: i64) -> MemoryTier {
        let free_internal = self.memory_source.free_internal_bytes();
        let raw_tier = tier_for(free_internal);

        let mut consecutive = self.consecutive_low_ticks.lock().await;
        let tier = match raw_tier {
            MemoryTier::Healthy => {
                *consecutive = 0;
                MemoryTier::Healthy
            }
            MemoryTier::Warning => {
                *consecutive = 0;
                self.clear_expired_retry().await;
                MemoryTier::Warning
            }
            MemoryTier::Critical => {
                *consecutive = 0;
                self.drop_oldest_observations().await;
                self.clear_expired_retry().await;
                self.defragment().await;
                MemoryTier::Critical
            }
            MemoryTier::Emergency => {
                self.drop_oldest_observations().await;
                self.clear_expired_retry().await;
                self.defragment().await;
                self.emergency_count.fetch_add(1, Ordering::Relaxed);
                *consecutive += 1;

                if *consecutive >= FATAL_CONSECUTIVE_TICKS {
                    tracing::error!(target: "memory", "fatal: {} bytes free internal memory for {} consecutive ticks", free_internal, *consecutive);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    self.restart_flag.store(true, Ordering::SeqCst);
                    self.restart_requested.notify_waiters();
                    MemoryTier::Fatal
                } else {
                    MemoryTier::Emergency
                }
            }
            MemoryTier::Fatal => unreachable!("tier_for never returns Fatal directly"),
        };

        let _ = now_rtc_valid_ms;
        *self.current_tier.lock().await = Some(tier);
        tier
    }

    async fn clear_expired_retry(&self) {
        let removed = self.retry_queue.clear_expired(i64::MAX).await;
        if removed > 0 {
            tracing::info!(target: "memory", "cleared {} expired retry-queue entries under memory pressure", removed);
        }
    }

    async fn drop_oldest_observations(&self) {
        let dropped = self.observation_queue.drop_oldest(OBSERVATION_DROP_COUNT).await;
        if dropped > 0 {
            tracing::warn!(target: "memory", "dropped {} oldest observations under memory pressure", dropped);
        }
    }

    async fn defragment(&self) {
        if let Some(buf) = self.allocator.try_alloc(CRITICAL_DEFRAG_ALLOC_BYTES) {
            drop(buf);
        } else {
            tracing::warn!(target: "memory", "defragmentation allocation failed");
        }
    }

    /// Manual recovery hook for tests (spec section 4.5).
    pub async fn force_recovery(&self, action: RecoveryAction) {
        match action {
            RecoveryAction::ClearExpiredRetry => self.clear_expired_retry().await,
            RecoveryAction::DropOldestObservations => self.drop_oldest_observations().await,
            RecoveryAction::Defragment => self.defragment().await,
        }
    }

    pub async fn health_report(&self) -> MemoryHealth {
        MemoryHealth {
            current_tier: *self.current_tier.lock().await,
            emergency_count: self.emergency_count.load(Ordering::Relaxed),
            consecutive_low_ticks: *self.consecutive_low_ticks.lock().await,
            restart_requested: self.restart_flag.load(Ordering::SeqCst),
        }
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_flag.load(Ordering::SeqCst)
    }

    /// Resolves once a Fatal tick has requested a restart.
    pub async fn wait_for_restart_request(&self) {
        if self.restart_flag.load(Ordering::SeqCst) {
            return;
        }
        self.restart_requested.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::AtomicUsize;

    struct StubSource {
        free_internal: AtomicUsize,
    }
    impl MemorySource for StubSource {
        fn free_internal_bytes(&self) -> usize {
            self.free_internal.load(Ordering::SeqCst)
        }
        fn free_external_bytes(&self) -> usize {
            8_000_000
        }
    }

    async fn harness(free: usize) -> (MemorySupervisor, Arc<StubSource>) {
        let source = Arc::new(StubSource { free_internal: AtomicUsize::new(free) });
        let allocator: Arc<dyn LargeMemoryAllocator> = Arc::new(ExternalBackend);
        let dir = tempfile::tempdir().unwrap();
        let obs = Arc::new(ObservationQueue::new(100));
        let retry = Arc::new(RetryQueue::mount(dir.path().join("q.json"), 100, Arc::new(SystemClock::new())).await.unwrap());
        (MemorySupervisor::new(source.clone(), allocator, obs, retry), source)
    }

    #[tokio::test]
    async fn healthy_tier_does_nothing_destructive() {
        let (sup, _source) = harness(60_000).await;
        let tier = sup.tick(0).await;
        assert_eq!(tier, MemoryTier::Healthy);
    }

    #[tokio::test]
    async fn three_consecutive_emergency_ticks_escalate_to_fatal() {
        let (sup, _source) = harness(5_000).await;
        assert_eq!(sup.tick(0).await, MemoryTier::Emergency);
        assert_eq!(sup.tick(0).await, MemoryTier::Emergency);
        assert_eq!(sup.tick(0).await, MemoryTier::Fatal);
        assert!(sup.restart_requested());
    }

    #[tokio::test]
    async fn recovery_between_emergency_ticks_resets_the_counter() {
        let (sup, source) = harness(5_000).await;
        assert_eq!(sup.tick(0).await, MemoryTier::Emergency);
        assert_eq!(sup.tick(0).await, MemoryTier::Emergency);

        source.free_internal.store(60_000, Ordering::SeqCst);
        assert_eq!(sup.tick(0).await, MemoryTier::Healthy);

        source.free_internal.store(5_000, Ordering::SeqCst);
        assert_eq!(sup.tick(0).await, MemoryTier::Emergency);
        assert_eq!(sup.tick(0).await, MemoryTier::Emergency);
        assert!(!sup.restart_requested(), "should not have reached 3 consecutive ticks");
    }

    #[tokio::test]
    async fn critical_tier_drops_oldest_observations() {
        let (sup, _source) = harness(12_000).await;
        for _ in 0..30 {
            sup.observation_queue
                .enqueue(&crate::queue::Observation {
                    device_id: crate::config::DeviceId("d".into()),
                    register_id: crate::config::RegisterId("r".into()),
                    register_name: "x".into(),
                    timestamp: crate::queue::ObservationTimestamp::Monotonic(0),
                    raw: vec![1],
                    value: 1.0,
                    unit: String::new(),
                })
                .await;
        }
        assert_eq!(sup.observation_queue.size().await, 30);
        sup.tick(0).await;
        assert_eq!(sup.observation_queue.size().await, 10);
    }
}
