//! Per-peer sync bookkeeping.

use {
    crate::types::NodeId,
    dashmap::DashMap,
    log::debug,
    std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc, Mutex, MutexGuard, TryLockError,
        },
        time::{Duration, Instant},
    },
};

/// Sync state for one configured neighbor.
#[derive(Debug)]
pub struct NeighborSyncState {
    id: NodeId,
    /// Failed exchanges since the last success. Only used for back-off.
    consecutive_failures: AtomicU32,
    /// Whoever holds this owns the connection to the peer: an exchange, a
    /// heartbeat or a reconnect. Never waited on, only try-locked.
    connection_lock: Mutex<()>,
    last_heartbeat: Mutex<Option<Instant>>,
}

impl NeighborSyncState {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            consecutive_failures: AtomicU32::new(0),
            connection_lock: Mutex::new(()),
            last_heartbeat: Mutex::new(None),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Take exclusive use of the connection, or `None` if someone else has it.
    pub fn try_lock_connection(&self) -> Option<MutexGuard<'_, ()>> {
        match self.connection_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            // The lock guards no data, so a panic while holding it left
            // nothing inconsistent behind.
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Returns the failure count including this one.
    pub fn record_failure(&self) -> u32 {
        let previous = self
            .consecutive_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |failures| {
                Some(failures.saturating_add(1))
            })
            .unwrap_or(u32::MAX);
        previous.saturating_add(1)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn heartbeat_due(&self, now: Instant, period: Duration) -> bool {
        match *self.last_heartbeat.lock().unwrap() {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= period,
        }
    }

    pub fn record_heartbeat(&self, now: Instant) {
        *self.last_heartbeat.lock().unwrap() = Some(now);
    }
}

/// All configured neighbors, fixed at construction.
#[derive(Debug)]
pub struct NeighborTable {
    ids: Vec<NodeId>,
    states: DashMap<NodeId, Arc<NeighborSyncState>>,
}

impl NeighborTable {
    pub fn new(ids: impl IntoIterator<Item = NodeId>) -> Self {
        let states = DashMap::new();
        let mut ordered = Vec::new();
        for id in ids {
            if states
                .insert(id, Arc::new(NeighborSyncState::new(id)))
                .is_none()
            {
                ordered.push(id);
            }
        }
        Self {
            ids: ordered,
            states,
        }
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<NeighborSyncState>> {
        self.states.get(&id).map(|state| Arc::clone(state.value()))
    }

    /// Clear every neighbor's failure counter.
    pub fn reset_backoff(&self) {
        for state in self.states.iter() {
            state.record_success();
        }
        debug!("reset sync back-off for {} neighbors", self.ids.len());
    }
}
