//! C2 — Live Observation Queue: a bounded, multi-producer single-consumer
//! FIFO of freshly-read register samples (spec section 4.2).
//!
//! Entries are stored pre-serialized (as the embedded original keeps them
//! as raw JSON in a large-memory ring buffer) so that [`ObservationQueue::flush_device`]
//! can scan for the `device_id` field without paying for a full JSON parse
//! per entry — spec section 4.2 forbids exactly that in the flush path,
//! because it would block producers behind a consumer-side operation.

use crate::clock::Timestamp;
use crate::config::{DeviceId, RegisterId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::{broadcast, Mutex};

/// One register reading, produced by C6 and consumed by C7 (spec section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub device_id: DeviceId,
    pub register_id: RegisterId,
    pub register_name: String,
    pub timestamp: ObservationTimestamp,
    pub raw: Vec<u16>,
    pub value: f64,
    pub unit: String,
}

/// [`Timestamp`] isn't directly serde-friendly (it wraps a `DateTime` in one
/// arm and a bare integer in the other) — this mirrors it in a shape the
/// on-disk/on-wire format uses everywhere else in this crate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ObservationTimestamp {
    Rtc(chrono::DateTime<chrono::Utc>),
    Monotonic(u64),
}

impl From<Timestamp> for ObservationTimestamp {
    fn from(t: Timestamp) -> Self {
        match t {
            Timestamp::Rtc(dt) => ObservationTimestamp::Rtc(dt),
            Timestamp::Monotonic(ms) => ObservationTimestamp::Monotonic(ms),
        }
    }
}

impl ObservationTimestamp {
    pub fn to_display_string(&self) -> String {
        match self {
            ObservationTimestamp::Rtc(dt) => dt.format("%d/%m/%Y %H:%M:%S").to_string(),
            ObservationTimestamp::Monotonic(ms) => ms.to_string(),
        }
    }
}

/// Cheap scan for `"device_id":"<id>"` in a serialized [`Observation`],
/// avoiding a full `serde_json::from_slice` (spec section 4.2, section 9
/// "filtered parse for per-device flush").
fn scan_device_id(bytes: &[u8]) -> Option<String> {
    const NEEDLE: &[u8] = b"\"device_id\":\"";
    let pos = bytes.windows(NEEDLE.len()).position(|w| w == NEEDLE)?;
    let start = pos + NEEDLE.len();
    let end = bytes[start..].iter().position(|&b| b == b'"')? + start;
    std::str::from_utf8(&bytes[start..end]).ok().map(|s| s.to_string())
}

struct Entry {
    bytes: Vec<u8>,
}

struct Inner {
    entries: VecDeque<Entry>,
    capacity: usize,
    dropped_on_overflow: u64,
}

/// Bounded FIFO of serialized observations (spec section 4.2).
pub struct ObservationQueue {
    inner: Mutex<Inner>,
    taps: broadcast::Sender<Observation>,
}

impl ObservationQueue {
    pub fn new(capacity: usize) -> Self {
        let (taps, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner { entries: VecDeque::with_capacity(capacity), capacity, dropped_on_overflow: 0 }),
            taps,
        }
    }

    /// A best-effort live feed of every enqueued observation, independent
    /// of the FIFO itself — used by consumers (BLE `data` streaming
    /// sessions, spec section 4.8) that must observe fresh samples
    /// without competing with C7 for the same entries. Lagging
    /// subscribers drop frames rather than block producers.
    pub fn subscribe(&self) -> broadcast::Receiver<Observation> {
        self.taps.subscribe()
    }

    /// Enqueue a sample. Returns `false` (never blocks) on the rare
    /// serialization failure; on overflow the oldest entry is dropped and
    /// `true` is still returned, per the drop-oldest load-shed policy.
    pub async fn enqueue(&self, obs: &Observation) -> bool {
        let bytes = match serde_json::to_vec(obs) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(target: "queue::observation", "failed to serialize observation: {e}");
                return false;
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.entries.len() >= inner.capacity {
            inner.entries.pop_front();
            inner.dropped_on_overflow += 1;
            metrics::counter!("fieldbridge_c2_dropped_oldest").increment(1);
        }
        inner.entries.push_back(Entry { bytes });
        drop(inner);
        let _ = self.taps.send(obs.clone());
        true
    }

    pub async fn dequeue_nonblocking(&self) -> Option<Observation> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entries.pop_front()?;
        match serde_json::from_slice(&entry.bytes) {
            Ok(obs) => Some(obs),
            Err(e) => {
                tracing::warn!(target: "queue::observation", "dropping unparseable observation: {e}");
                None
            }
        }
    }

    /// Drain up to `max` observations (used by C7 step 4).
    pub async fn drain_up_to(&self, max: usize) -> Vec<Observation> {
        let mut inner = self.inner.lock().await;
        let mut out = Vec::with_capacity(max.min(inner.entries.len()));
        while out.len() < max {
            let Some(entry) = inner.entries.pop_front() else { break };
            match serde_json::from_slice(&entry.bytes) {
                Ok(obs) => out.push(obs),
                Err(e) => tracing::warn!(target: "queue::observation", "dropping unparseable observation: {e}"),
            }
        }
        out
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.size().await == 0
    }

    /// Remove every entry whose `device_id` matches, using the cheap
    /// field-only scan rather than a full parse (spec section 4.2).
    pub async fn flush_device(&self, device_id: &DeviceId) -> usize {
        let mut inner = self.inner.lock().await;
        let target = device_id.0.as_str();
        let before = inner.entries.len();
        inner.entries.retain(|entry| scan_device_id(&entry.bytes).as_deref() != Some(target));
        before - inner.entries.len()
    }

    pub async fn clear_stream(&self) {
        self.inner.lock().await.entries.clear();
    }

    /// Drop up to `n` oldest entries (C5 Critical/Emergency-tier recovery
    /// action, spec section 4.5).
    pub async fn drop_oldest(&self, n: usize) -> usize {
        let mut inner = self.inner.lock().await;
        let to_drop = n.min(inner.entries.len());
        for _ in 0..to_drop {
            inner.entries.pop_front();
        }
        inner.dropped_on_overflow += to_drop as u64;
        to_drop
    }

    pub async fn dropped_on_overflow(&self) -> u64 {
        self.inner.lock().await.dropped_on_overflow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(device: &str, register: &str) -> Observation {
        Observation {
            device_id: DeviceId(device.to_string()),
            register_id: RegisterId(register.to_string()),
            register_name: "temp".to_string(),
            timestamp: ObservationTimestamp::Monotonic(0),
            raw: vec![275],
            value: 27.5,
            unit: "°C".to_string(),
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_keeps_capacity() {
        let q = ObservationQueue::new(2);
        assert!(q.enqueue(&sample("d1", "r1")).await);
        assert!(q.enqueue(&sample("d1", "r2")).await);
        assert!(q.enqueue(&sample("d1", "r3")).await);

        assert_eq!(q.size().await, 2);
        let first = q.dequeue_nonblocking().await.unwrap();
        assert_eq!(first.register_id, RegisterId("r2".to_string()));
    }

    #[tokio::test]
    async fn flush_device_removes_only_matching_entries_and_reindexes() {
        let q = ObservationQueue::new(10);
        q.enqueue(&sample("d1", "r1")).await;
        q.enqueue(&sample("d2", "r1")).await;
        q.enqueue(&sample("d1", "r2")).await;

        let removed = q.flush_device(&DeviceId("d1".to_string())).await;
        assert_eq!(removed, 2);
        assert_eq!(q.size().await, 1);
        let remaining = q.dequeue_nonblocking().await.unwrap();
        assert_eq!(remaining.device_id, DeviceId("d2".to_string()));
    }

    #[tokio::test]
    async fn subscribers_observe_enqueued_samples_without_consuming_them() {
        let q = ObservationQueue::new(10);
        let mut tap = q.subscribe();
        q.enqueue(&sample("d1", "r1")).await;

        let seen = tap.recv().await.unwrap();
        assert_eq!(seen.device_id, DeviceId("d1".to_string()));
        // the tap is a side channel: the FIFO entry is still there for C7.
        assert_eq!(q.size().await, 1);
    }

    #[tokio::test]
    async fn per_device_fifo_order_is_preserved() {
        let q = ObservationQueue::new(10);
        q.enqueue(&sample("d1", "r1")).await;
        q.enqueue(&sample("d2", "r1")).await;
        q.enqueue(&sample("d1", "r2")).await;

        let drained = q.drain_up_to(10).await;
        let d1_order: Vec<_> = drained.iter().filter(|o| o.device_id.0 == "d1").map(|o| o.register_id.0.clone()).collect();
        assert_eq!(d1_order, vec!["r1", "r2"]);
    }
}
