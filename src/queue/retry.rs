//! C3 — Persistent Retry Queue: three priority buckets of MQTT payloads
//! that failed to publish, mirrored to disk so they survive a restart
//! (spec section 4.3).
//!
//! Disk persistence is deliberately deferred outside the queue mutex
//! (spec section 9 "deferred I/O replaces I/O-in-lock"): the in-memory
//! enqueue completes and releases the lock, then a background task
//! mirrors the current image to disk. Losing the last few seconds of
//! buffered messages on a hard crash is the accepted, documented cost.

use crate::clock::Clock;
use crate::error::{Domain, GatewayError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl QueuedMessage {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct RetryQueueHealth {
    pub pending_high: usize,
    pub pending_normal: usize,
    pub pending_low: usize,
    pub dropped_overflow: u64,
    pub expired_total: u64,
}

struct Buckets {
    high: VecDeque<QueuedMessage>,
    normal: VecDeque<QueuedMessage>,
    low: VecDeque<QueuedMessage>,
    dropped_overflow: u64,
    expired_total: u64,
}

impl Buckets {
    fn total(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn bucket_mut(&mut self, p: Priority) -> &mut VecDeque<QueuedMessage> {
        match p {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }
}

/// Disk-backed, priority-ordered retry queue (spec section 4.3).
pub struct RetryQueue {
    buckets: Mutex<Buckets>,
    capacity: usize,
    image_path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl RetryQueue {
    /// Mount the queue: replay the on-disk image, dropping anything
    /// already expired at boot time. If the RTC is not yet valid, every
    /// entry is treated as expired (spec section 4.3, "conservative
    /// rule").
    pub async fn mount(image_path: PathBuf, capacity: usize, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let mut buckets = Buckets {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            dropped_overflow: 0,
            expired_total: 0,
        };

        if image_path.exists() {
            let content = std::fs::read_to_string(&image_path)?;
            let messages: Vec<QueuedMessage> = serde_json::from_str(&content).unwrap_or_default();
            let rtc_valid = clock.rtc_now().is_some();
            let now_ms = clock.monotonic_millis() as i64;

            for msg in messages {
                if !rtc_valid || msg.is_expired(now_ms) {
                    buckets.expired_total += 1;
                    continue;
                }
                buckets.bucket_mut(msg.priority).push_back(msg);
            }
            if buckets.expired_total > 0 {
                tracing::warn!(target: "queue::retry", "dropped {} expired entries replaying retry queue image", buckets.expired_total);
            }
        }

        Ok(Self { buckets: Mutex::new(buckets), capacity, image_path, clock })
    }

    /// Enqueue a failed publish. Rejects poison messages (too large for
    /// the broker send buffer) outright rather than retrying them
    /// forever (spec section 4.3 "poison-message rule").
    pub async fn enqueue(
        &self,
        topic: String,
        payload: Vec<u8>,
        priority: Priority,
        ttl_ms: i64,
        max_payload_bytes: usize,
    ) -> Result<(), GatewayError> {
        if payload.len() > max_payload_bytes {
            return Err(GatewayError::new(
                Domain::Mqtt,
                crate::error::Severity::Error,
                5,
                format!("payload ({} bytes) exceeds broker send buffer ({} bytes), rejecting as poison", payload.len(), max_payload_bytes),
            ));
        }

        let now_ms = self.clock.monotonic_millis() as i64;
        let message =
            QueuedMessage { topic, payload, priority, created_at_ms: now_ms, expires_at_ms: now_ms + ttl_ms, retry_count: 0, last_error: None };

        {
            let mut buckets = self.buckets.lock().await;
            if buckets.total() >= self.capacity {
                if !buckets.low.is_empty() {
                    buckets.low.pop_front();
                    buckets.dropped_overflow += 1;
                } else if !buckets.normal.is_empty() {
                    buckets.normal.pop_front();
                    buckets.dropped_overflow += 1;
                } else {
                    return Err(GatewayError::new(Domain::Mqtt, crate::error::Severity::Warn, 6, "retry queue full, no LOW/NORMAL entry to evict"));
                }
            }
            buckets.bucket_mut(message.priority).push_back(message);
        }

        self.persist_deferred().await;
        Ok(())
    }

    /// Snapshot the current state and write it to disk. Called after the
    /// mutex guarding in-memory state has already been released (spec
    /// section 4.3/9: disk write is deferred outside the queue mutex).
    async fn persist_deferred(&self) {
        let snapshot: Vec<QueuedMessage> = {
            let buckets = self.buckets.lock().await;
            buckets.high.iter().chain(buckets.normal.iter()).chain(buckets.low.iter()).cloned().collect()
        };
        let path = self.image_path.clone();
        tokio::task::spawn_blocking(move || {
            if let Ok(bytes) = serde_json::to_vec_pretty(&snapshot) {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!(target: "queue::retry", "failed to mirror retry queue image to disk: {e}");
                }
            }
        });
    }

    /// Drain due messages HIGH -> NORMAL -> LOW, oldest-first within a
    /// bucket. Stops at the first publish failure within a bucket
    /// (head-of-line blocking, spec section 4.3) but still proceeds to
    /// lower-priority buckets only after the current one is fully
    /// drained or blocked.
    pub async fn drain_due<F, Fut>(&self, now_ms: i64, mut publish_fn: F) -> usize
    where
        F: FnMut(String, Vec<u8>) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let mut published = 0usize;
        let mut changed = false;

        for priority in [Priority::High, Priority::Normal, Priority::Low] {
            loop {
                let candidate = {
                    let mut buckets = self.buckets.lock().await;
                    let bucket = buckets.bucket_mut(priority);
                    match bucket.front() {
                        None => None,
                        Some(front) if front.is_expired(now_ms) => {
                            bucket.pop_front();
                            buckets.expired_total += 1;
                            changed = true;
                            continue;
                        }
                        Some(front) => Some(front.clone()),
                    }
                };

                let Some(msg) = candidate else { break };
                if publish_fn(msg.topic.clone(), msg.payload.clone()).await {
                    let mut buckets = self.buckets.lock().await;
                    buckets.bucket_mut(priority).pop_front();
                    published += 1;
                    changed = true;
                } else {
                    let mut buckets = self.buckets.lock().await;
                    if let Some(front) = buckets.bucket_mut(priority).front_mut() {
                        front.retry_count += 1;
                    }
                    break;
                }
            }
        }

        if changed {
            self.persist_deferred().await;
        }
        published
    }

    pub async fn clear_expired(&self, now_ms: i64) -> usize {
        let mut buckets = self.buckets.lock().await;
        let mut removed = 0;
        for bucket in [&mut buckets.high, &mut buckets.normal, &mut buckets.low] {
            let before = bucket.len();
            bucket.retain(|m| !m.is_expired(now_ms));
            removed += before - bucket.len();
        }
        buckets.expired_total += removed as u64;
        drop(buckets);
        if removed > 0 {
            self.persist_deferred().await;
        }
        removed
    }

    pub async fn pending_count(&self) -> usize {
        self.buckets.lock().await.total()
    }

    pub async fn health_report(&self) -> RetryQueueHealth {
        let b = self.buckets.lock().await;
        RetryQueueHealth {
            pending_high: b.high.len(),
            pending_normal: b.normal.len(),
            pending_low: b.low.len(),
            dropped_overflow: b.dropped_overflow,
            expired_total: b.expired_total,
        }
    }

    /// Drop every entry (used by C5's Warning-tier recovery action).
    pub async fn clear_all(&self) {
        let mut b = self.buckets.lock().await;
        b.high.clear();
        b.normal.clear();
        b.low.clear();
        drop(b);
        self.persist_deferred().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    async fn queue(dir: &std::path::Path) -> RetryQueue {
        RetryQueue::mount(dir.join("mqtt_queue.json"), 3, Arc::new(FixedClock::rtc_valid_at(2025, 1, 1))).await.unwrap()
    }

    #[tokio::test]
    async fn drain_order_is_high_then_normal_then_low() {
        let dir = tempfile::tempdir().unwrap();
        let q = RetryQueue::mount(dir.path().join("q.json"), 10, Arc::new(FixedClock::rtc_valid_at(2025, 1, 1))).await.unwrap();

        q.enqueue("t/low".into(), b"l".to_vec(), Priority::Low, 60_000, 1024).await.unwrap();
        q.enqueue("t/high".into(), b"h".to_vec(), Priority::High, 60_000, 1024).await.unwrap();
        q.enqueue("t/normal".into(), b"n".to_vec(), Priority::Normal, 60_000, 1024).await.unwrap();

        let mut order = Vec::new();
        q.drain_due(0, |topic, _payload| {
            order.push(topic);
            async { true }
        })
        .await;

        assert_eq!(order, vec!["t/high", "t/normal", "t/low"]);
    }

    #[tokio::test]
    async fn overflow_drops_low_before_normal_and_rejects_when_only_high() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path()).await;

        q.enqueue("a".into(), b"1".to_vec(), Priority::High, 60_000, 1024).await.unwrap();
        q.enqueue("b".into(), b"2".to_vec(), Priority::High, 60_000, 1024).await.unwrap();
        q.enqueue("c".into(), b"3".to_vec(), Priority::High, 60_000, 1024).await.unwrap();

        let err = q.enqueue("d".into(), b"4".to_vec(), Priority::High, 60_000, 1024).await.unwrap_err();
        assert_eq!(err.domain, crate::error::Domain::Mqtt);
    }

    #[tokio::test]
    async fn poison_payload_is_rejected_not_enqueued() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path()).await;
        let big = vec![0u8; 2048];
        let err = q.enqueue("t".into(), big, Priority::Normal, 60_000, 1024).await.unwrap_err();
        assert_eq!(err.code(), 105);
        assert_eq!(q.pending_count().await, 0);
    }

    #[tokio::test]
    async fn head_of_line_failure_stops_bucket_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path()).await;
        q.enqueue("a".into(), b"1".to_vec(), Priority::Normal, 60_000, 1024).await.unwrap();
        q.enqueue("b".into(), b"2".to_vec(), Priority::Normal, 60_000, 1024).await.unwrap();

        let published = q.drain_due(0, |_t, _p| async { false }).await;
        assert_eq!(published, 0);
        assert_eq!(q.pending_count().await, 2);
    }

    #[tokio::test]
    async fn expired_entries_are_dropped_without_publish() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path()).await;
        q.enqueue("a".into(), b"1".to_vec(), Priority::Normal, 10, 1024).await.unwrap();

        let mut calls = 0;
        let published = q
            .drain_due(10_000, |_t, _p| {
                calls += 1;
                async { true }
            })
            .await;
        assert_eq!(published, 0);
        assert_eq!(calls, 0);
        assert_eq!(q.pending_count().await, 0);
    }

    #[tokio::test]
    async fn restart_with_invalid_rtc_expires_everything() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = RetryQueue::mount(dir.path().join("q.json"), 10, Arc::new(FixedClock::rtc_valid_at(2025, 1, 1))).await.unwrap();
            q.enqueue("a".into(), b"1".to_vec(), Priority::High, 3_600_000, 1024).await.unwrap();
        }

        let reloaded = RetryQueue::mount(dir.path().join("q.json"), 10, Arc::new(FixedClock::rtc_invalid())).await.unwrap();
        assert_eq!(reloaded.pending_count().await, 0);
    }

    #[tokio::test]
    async fn restart_with_valid_rtc_replays_unexpired_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = RetryQueue::mount(dir.path().join("q.json"), 10, Arc::new(FixedClock::rtc_valid_at(2025, 1, 1))).await.unwrap();
            q.enqueue("a".into(), b"1".to_vec(), Priority::High, 3_600_000, 1024).await.unwrap();
        }

        let reloaded = RetryQueue::mount(dir.path().join("q.json"), 10, Arc::new(FixedClock::rtc_valid_at(2025, 1, 1))).await.unwrap();
        assert_eq!(reloaded.pending_count().await, 1);
    }
}
