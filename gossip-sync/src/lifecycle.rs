//! Halt/resume switch shared by the controller and the reconnect path.

use {
    crate::{neighbor::NeighborTable, permit_pool::PermitPool},
    log::info,
    std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

/// Whether new exchanges may start.
///
/// Syncing is halted while any of these holds: the operator paused it, a
/// reconnect cycle is running, or shutdown has begun. Each source is lifted
/// only by its own owner, so a resume from one never cancels another.
///
/// Pausing only stops *new* exchanges and then waits for the ones in flight;
/// it never interrupts an exchange.
#[derive(Debug)]
pub struct SyncLifecycle {
    /// Paused by the operator; only [`release_hold`](Self::release_hold)
    /// lifts it.
    held: AtomicBool,
    /// Live [`ReconnectPause`] guards.
    reconnecting: AtomicUsize,
    exiting: AtomicBool,
    pool: Arc<PermitPool>,
    neighbors: Arc<NeighborTable>,
}

impl SyncLifecycle {
    pub fn new(pool: Arc<PermitPool>, neighbors: Arc<NeighborTable>) -> Self {
        Self {
            held: AtomicBool::new(false),
            reconnecting: AtomicUsize::new(0),
            exiting: AtomicBool::new(false),
            pool,
            neighbors,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.is_exiting() || self.is_held() || self.is_reconnecting()
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst) > 0
    }

    /// Operator pause: stop new exchanges and wait for in-flight ones to
    /// return their permits. Lasts until [`release_hold`](Self::release_hold).
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
        self.pool.drain_and_wait_for_all_to_finish();
    }

    /// Lift the operator pause. Returns `false` if there was none.
    ///
    /// Per-peer back-off is forgotten before workers can see the change.
    /// Syncing stays halted if a reconnect is still running.
    pub fn release_hold(&self) -> bool {
        if !self.is_held() {
            return false;
        }
        self.neighbors.reset_backoff();
        self.held.store(false, Ordering::SeqCst);
        true
    }

    /// Halt syncing for a reconnect cycle and drain in-flight exchanges.
    /// Syncing resumes when the returned guard drops, including on unwind.
    pub fn pause_for_reconnect(&self) -> ReconnectPause<'_> {
        self.reconnecting.fetch_add(1, Ordering::SeqCst);
        let pause = ReconnectPause { lifecycle: self };
        self.pool.drain_and_wait_for_all_to_finish();
        pause
    }

    /// Halt for good; only [`arm`](Self::arm) undoes it.
    pub fn begin_exit(&self) {
        self.exiting.store(true, Ordering::SeqCst);
        info!("gossip sync halting for shutdown");
    }

    /// Clear the exit and operator flags before (re)starting the loops.
    pub fn arm(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.exiting.store(false, Ordering::SeqCst);
    }
}

/// Keeps syncing halted for the duration of a reconnect cycle.
#[must_use = "dropping the pause resumes syncing immediately"]
#[derive(Debug)]
pub struct ReconnectPause<'a> {
    lifecycle: &'a SyncLifecycle,
}

impl Drop for ReconnectPause<'_> {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle;
        if !lifecycle.is_held() && !lifecycle.is_exiting() {
            lifecycle.neighbors.reset_backoff();
        }
        lifecycle.reconnecting.fetch_sub(1, Ordering::SeqCst);
    }
}
