//! C4 — Network Supervisor: tracks every configured interface and elects
//! an active one with hysteresis so failover/failback never flaps (spec
//! section 4.4).

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Ethernet,
    Wifi,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum InterfaceStatus {
    Down,
    Up(IpAddr),
    Degraded(String),
}

impl InterfaceStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, InterfaceStatus::Up(_))
    }
}

#[derive(Debug, Clone)]
struct InterfaceState {
    status: InterfaceStatus,
    last_transition_ms: i64,
    rssi: Option<i8>,
}

/// The platform's WiFi/Ethernet link-state stack, a named external
/// collaborator (spec section 1). Mockable for tests.
#[async_trait]
pub trait LinkStateSource: Send + Sync {
    async fn probe(&self, interface: InterfaceKind) -> InterfaceStatus;
}

#[derive(Debug, Clone)]
pub struct NetworkTransition {
    pub from: InterfaceKind,
    pub to: InterfaceKind,
    pub reason: &'static str,
}

/// Opaque handle MQTT/HTTP publishers use to address the active
/// interface without knowing the underlying transport (spec section 4.4).
#[derive(Debug, Clone, Copy)]
pub struct NetworkHandle {
    pub interface: InterfaceKind,
    pub ip: Option<IpAddr>,
}

pub struct NetworkSupervisor {
    primary: InterfaceKind,
    states: Mutex<HashMap<InterfaceKind, InterfaceState>>,
    active: Mutex<InterfaceKind>,
    hysteresis_ms: u64,
    failover_delay_ms: u64,
    link_source: Arc<dyn LinkStateSource>,
    transitions: broadcast::Sender<NetworkTransition>,
}

impl NetworkSupervisor {
    pub fn new(primary: InterfaceKind, interfaces: &[InterfaceKind], hysteresis_ms: u64, failover_delay_ms: u64, link_source: Arc<dyn LinkStateSource>, now_ms: i64) -> Self {
        let mut states = HashMap::new();
        for &kind in interfaces {
            states.insert(kind, InterfaceState { status: InterfaceStatus::Down, last_transition_ms: now_ms, rssi: None });
        }
        let (tx, _) = broadcast::channel(32);
        Self {
            primary,
            states: Mutex::new(states),
            active: Mutex::new(primary),
            hysteresis_ms,
            failover_delay_ms,
            link_source,
            transitions: tx,
        }
    }

    /// Probe every interface and record its status (spec section 4.4
    /// "periodic liveness probing, default 5 s").
    pub async fn probe_all(&self, now_ms: i64) {
        let kinds: Vec<InterfaceKind> = self.states.lock().await.keys().copied().collect();
        for kind in kinds {
            let status = self.link_source.probe(kind).await;
            self.on_link_state_change(kind, status, now_ms).await;
        }
    }

    /// Apply a link-state callback from the platform stack. A changed
    /// status always resets that interface's stability timer — this is
    /// the hysteresis rule: an up->down->up flap within the window
    /// starts the clock over (spec section 4.4).
    pub async fn on_link_state_change(&self, kind: InterfaceKind, status: InterfaceStatus, now_ms: i64) {
        let mut states = self.states.lock().await;
        let entry = states.entry(kind).or_insert(InterfaceState { status: InterfaceStatus::Down, last_transition_ms: now_ms, rssi: None });
        if entry.status != status {
            entry.status = status;
            entry.last_transition_ms = now_ms;
        }
    }

    pub async fn set_rssi(&self, kind: InterfaceKind, rssi: i8) {
        if let Some(entry) = self.states.lock().await.get_mut(&kind) {
            entry.rssi = Some(rssi);
        }
    }

    /// Evaluate failover/failback rules. Call periodically (same cadence
    /// as `probe_all`, or right after it).
    pub async fn tick(&self, now_ms: i64) {
        let mut active = self.active.lock().await;
        let states = self.states.lock().await;

        let active_state = states.get(&*active);
        let active_is_stable_up = active_state.map(|s| s.status.is_up()).unwrap_or(false);

        if !active_is_stable_up {
            let down_duration = active_state.map(|s| (now_ms - s.last_transition_ms).max(0) as u64).unwrap_or(u64::MAX);
            if down_duration >= self.failover_delay_ms {
                if let Some((&candidate, _)) = states.iter().find(|(&k, s)| k != *active && s.status.is_up()) {
                    drop(states);
                    let from = *active;
                    *active = candidate;
                    let _ = self.transitions.send(NetworkTransition { from, to: candidate, reason: "failover" });
                    tracing::warn!(target: "network", "failing over from {:?} to {:?}", from, candidate);
                    return;
                }
            }
            return;
        }

        if *active != self.primary {
            if let Some(primary_state) = states.get(&self.primary) {
                if primary_state.status.is_up() {
                    let stable_for = (now_ms - primary_state.last_transition_ms).max(0) as u64;
                    if stable_for >= self.hysteresis_ms {
                        drop(states);
                        let from = *active;
                        *active = self.primary;
                        let _ = self.transitions.send(NetworkTransition { from, to: self.primary, reason: "failback" });
                        tracing::info!(target: "network", "failing back from {:?} to {:?}", from, self.primary);
                    }
                }
            }
        }
    }

    pub async fn current(&self) -> (InterfaceKind, Option<IpAddr>) {
        let active = *self.active.lock().await;
        let ip = self.states.lock().await.get(&active).and_then(|s| match &s.status {
            InterfaceStatus::Up(ip) => Some(*ip),
            _ => None,
        });
        (active, ip)
    }

    pub async fn is_available(&self) -> bool {
        let active = *self.active.lock().await;
        self.states.lock().await.get(&active).map(|s| s.status.is_up()).unwrap_or(false)
    }

    pub async fn active_client(&self) -> NetworkHandle {
        let (interface, ip) = self.current().await;
        NetworkHandle { interface, ip }
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<NetworkTransition> {
        self.transitions.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubLinkSource;
    #[async_trait]
    impl LinkStateSource for StubLinkSource {
        async fn probe(&self, _interface: InterfaceKind) -> InterfaceStatus {
            InterfaceStatus::Down
        }
    }

    fn up(octet: u8) -> InterfaceStatus {
        InterfaceStatus::Up(IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, octet)))
    }

    #[tokio::test]
    async fn fails_over_after_sustained_down() {
        let sup = NetworkSupervisor::new(InterfaceKind::Ethernet, &[InterfaceKind::Ethernet, InterfaceKind::Wifi], 10_000, 1_000, Arc::new(StubLinkSource), 0);
        sup.on_link_state_change(InterfaceKind::Ethernet, up(1), 0).await;
        sup.on_link_state_change(InterfaceKind::Wifi, up(2), 0).await;
        sup.tick(0).await;
        assert_eq!(sup.current().await.0, InterfaceKind::Ethernet);

        sup.on_link_state_change(InterfaceKind::Ethernet, InterfaceStatus::Down, 100).await;
        sup.tick(500).await;
        assert_eq!(sup.current().await.0, InterfaceKind::Ethernet, "not yet past failover_delay_ms");

        sup.tick(1_200).await;
        assert_eq!(sup.current().await.0, InterfaceKind::Wifi);
    }

    #[tokio::test]
    async fn fails_back_to_primary_only_after_hysteresis_window() {
        let sup = NetworkSupervisor::new(InterfaceKind::Ethernet, &[InterfaceKind::Ethernet, InterfaceKind::Wifi], 10_000, 1_000, Arc::new(StubLinkSource), 0);
        sup.on_link_state_change(InterfaceKind::Ethernet, InterfaceStatus::Down, 0).await;
        sup.on_link_state_change(InterfaceKind::Wifi, up(2), 0).await;
        sup.tick(2_000).await;
        assert_eq!(sup.current().await.0, InterfaceKind::Wifi);

        sup.on_link_state_change(InterfaceKind::Ethernet, up(1), 2_000).await;
        sup.tick(5_000).await;
        assert_eq!(sup.current().await.0, InterfaceKind::Wifi, "primary not stable long enough yet");

        sup.tick(12_500).await;
        assert_eq!(sup.current().await.0, InterfaceKind::Ethernet);
    }

    #[tokio::test]
    async fn flap_within_hysteresis_window_resets_stability_timer() {
        let sup = NetworkSupervisor::new(InterfaceKind::Ethernet, &[InterfaceKind::Ethernet, InterfaceKind::Wifi], 10_000, 1_000, Arc::new(StubLinkSource), 0);
        sup.on_link_state_change(InterfaceKind::Ethernet, InterfaceStatus::Down, 0).await;
        sup.on_link_state_change(InterfaceKind::Wifi, up(2), 0).await;
        sup.tick(2_000).await;

        sup.on_link_state_change(InterfaceKind::Ethernet, up(1), 2_000).await;
        sup.on_link_state_change(InterfaceKind::Ethernet, InterfaceStatus::Down, 5_000).await;
        sup.on_link_state_change(InterfaceKind::Ethernet, up(1), 5_500).await;

        // stable only since 5_500, so at 14_000 (8_500ms stable) it should not have failed back yet
        sup.tick(14_000).await;
        assert_eq!(sup.current().await.0, InterfaceKind::Wifi);

        sup.tick(16_000).await;
        assert_eq!(sup.current().await.0, InterfaceKind::Ethernet);
    }
}
