//! Operational mode of the control plane.
//!
//! | Mode     | Writes | Entered when                                   |
//! |----------|--------|------------------------------------------------|
//! | normal   | yes    | start, or store reachable and holding state    |
//! | degraded | no     | store retries exhausted, or probe fails        |
//! | recovery | no     | store reachable again but empty after degraded |
//!
//! Entering degraded captures a [`FrozenState`] from the caches so read RPCs
//! can keep serving the last known view.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::model::{AssignmentRecord, Node, Workload};
use crate::store::{keys, BackendError, ClusterCache, KvBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Normal,
    Degraded,
    Recovery,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Normal, Mode::Degraded, Mode::Recovery];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Degraded => "degraded",
            Self::Recovery => "recovery",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last-known cluster view captured when writes froze.
#[derive(Debug, Clone)]
pub struct FrozenState {
    pub nodes: Vec<Node>,
    pub workloads: Vec<Workload>,
    pub assignments: Vec<AssignmentRecord>,
    pub captured_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug)]
struct ModeState {
    mode: Mode,
    reason: String,
    since: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ModeController {
    state: RwLock<ModeState>,
    frozen: RwLock<Option<Arc<FrozenState>>>,
    cache: Arc<ClusterCache>,
}

impl ModeController {
    pub fn new(cache: Arc<ClusterCache>) -> Self {
        Self {
            state: RwLock::new(ModeState {
                mode: Mode::Normal,
                reason: "startup".to_string(),
                since: Utc::now(),
            }),
            frozen: RwLock::new(None),
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<ClusterCache> {
        &self.cache
    }

    pub fn mode(&self) -> Mode {
        self.state.read().unwrap_or_else(PoisonError::into_inner).mode
    }

    pub fn reason(&self) -> String {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .reason
            .clone()
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).since
    }

    pub fn writes_allowed(&self) -> bool {
        self.mode() == Mode::Normal
    }

    /// Mode and reason when writes are refused.
    pub fn write_block(&self) -> Option<(Mode, String)> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        (state.mode != Mode::Normal).then(|| (state.mode, state.reason.clone()))
    }

    pub fn frozen(&self) -> Option<Arc<FrozenState>> {
        self.frozen
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Freeze writes. Returns false if already degraded.
    pub fn enter_degraded(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if !self.transition(Mode::Degraded, &reason) {
            return false;
        }
        let mut frozen = self.frozen.write().unwrap_or_else(PoisonError::into_inner);
        if frozen.is_none() {
            *frozen = Some(Arc::new(FrozenState {
                nodes: self.cache.nodes(),
                workloads: self.cache.workloads(),
                assignments: self.cache.assignments(),
                captured_at: Utc::now(),
                reason: reason.clone(),
            }));
        }
        error!(reason = %reason, "Entering degraded mode; writes are frozen");
        true
    }

    pub fn enter_recovery(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let changed = self.transition(Mode::Recovery, &reason);
        if changed {
            warn!(reason = %reason, "Entering recovery mode; waiting for state restore");
        }
        changed
    }

    /// Resume normal service and drop the frozen snapshot.
    pub fn enter_normal(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let changed = self.transition(Mode::Normal, &reason);
        if changed {
            *self.frozen.write().unwrap_or_else(PoisonError::into_inner) = None;
            info!(reason = %reason, "Resuming normal mode");
        }
        changed
    }

    fn transition(&self, to: Mode, reason: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.mode == to {
            return false;
        }
        state.mode = to;
        state.reason = reason.to_string();
        state.since = Utc::now();
        true
    }
}

/// Periodically probes the store and drives mode transitions.
pub struct ModeSupervisor {
    backend: Arc<dyn KvBackend>,
    controller: Arc<ModeController>,
    interval: Duration,
}

impl ModeSupervisor {
    pub fn new(backend: Arc<dyn KvBackend>, controller: Arc<ModeController>, interval: Duration) -> Self {
        Self {
            backend,
            controller,
            interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Starting mode supervisor");

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Mode supervisor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe the store once and apply the resulting transition.
    pub async fn probe_once(&self) -> Mode {
        let current = self.controller.mode();
        match self.store_has_state().await {
            Err(e) => {
                self.controller
                    .enter_degraded(format!("state store unreachable: {e}"));
            }
            Ok(true) => {
                if current != Mode::Normal {
                    self.controller
                        .enter_normal("state store reachable with persisted state");
                }
            }
            Ok(false) => {
                if current == Mode::Degraded {
                    self.controller
                        .enter_recovery("state store reachable but empty");
                }
            }
        }
        self.controller.mode()
    }

    async fn store_has_state(&self) -> Result<bool, BackendError> {
        let nodes = self.backend.count(keys::NODES_PREFIX).await?;
        if nodes > 0 {
            return Ok(true);
        }
        Ok(self.backend.count(keys::WORKLOADS_PREFIX).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    fn supervisor() -> (ModeSupervisor, Arc<MemoryBackend>, Arc<ModeController>) {
        let backend = Arc::new(MemoryBackend::new());
        let controller = Arc::new(ModeController::new(Arc::new(ClusterCache::new())));
        let supervisor = ModeSupervisor::new(
            backend.clone(),
            controller.clone(),
            Duration::from_millis(10),
        );
        (supervisor, backend, controller)
    }

    #[test]
    fn test_degraded_captures_snapshot_once() {
        let cache = Arc::new(ClusterCache::new());
        cache.upsert_node(&Node::register("n1", "10.0.0.1:7000", 1000, 1024, Utc::now()));
        let controller = ModeController::new(cache.clone());

        assert!(controller.enter_degraded("store down"));
        assert!(!controller.enter_degraded("store still down"));
        let frozen = controller.frozen().unwrap();
        assert_eq!(frozen.nodes.len(), 1);
        assert_eq!(frozen.reason, "store down");
        assert_eq!(controller.write_block().unwrap().0, Mode::Degraded);

        assert!(controller.enter_normal("back"));
        assert!(controller.frozen().is_none());
        assert!(controller.writes_allowed());
    }

    #[tokio::test]
    async fn test_empty_store_stays_normal_at_startup() {
        let (supervisor, _, _) = supervisor();
        assert_eq!(supervisor.probe_once().await, Mode::Normal);
    }

    #[tokio::test]
    async fn test_outage_and_recovery_transitions() {
        let (supervisor, backend, controller) = supervisor();
        backend.put("/nodes/n1", b"{}".to_vec()).await.unwrap();

        backend.set_available(false);
        assert_eq!(supervisor.probe_once().await, Mode::Degraded);

        backend.set_available(true);
        assert_eq!(supervisor.probe_once().await, Mode::Normal);

        backend.set_available(false);
        supervisor.probe_once().await;
        backend.wipe().await;
        backend.set_available(true);
        assert_eq!(supervisor.probe_once().await, Mode::Recovery);
        assert!(!controller.writes_allowed());

        backend.put("/workloads/w1", b"{}".to_vec()).await.unwrap();
        assert_eq!(supervisor.probe_once().await, Mode::Normal);
    }
}
