//! Counting gate for concurrent sync exchanges.
//!
//! The [`PermitPool`] is the only thing bounding how many exchanges run at
//! once; there is no global exchange lock. A permit is unavailable to workers
//! when it is:
//!
//! - **in use**: held by a worker for the duration of one exchange,
//! - **snarfed**: held idle by the [`PermitSnarfer`] as backpressure, or
//! - **suspended**: covered by the smoothed suspension pressure reported
//!   through [`PermitPool::report_suspension`].
//!
//! All counters live behind one mutex and are only touched through the
//! methods below. A condvar is signalled on every release so that drains and
//! the snarfer's blocking acquire wake without spinning.
//!
//! [`PermitSnarfer`]: crate::snarfer::PermitSnarfer

use {
    crate::{
        clock::Clock,
        decay::DecayEngine,
        error::{GossipSyncError, Result},
    },
    log::debug,
    std::{
        sync::{Arc, Condvar, Mutex, MutexGuard},
        time::{Duration, Instant},
    },
};

#[derive(Debug)]
struct PoolState {
    in_use: usize,
    snarfed: usize,
    /// Number of drains in progress. Non-zero means the pool is treated as full.
    draining: usize,
    reported_suspension: f64,
    decay: DecayEngine,
}

impl PoolState {
    /// Permits currently unavailable, refreshing the decayed suspension.
    fn committed(&mut self) -> usize {
        let suspended = self
            .decay
            .current_suspension_count(self.reported_suspension)
            .ceil() as usize;
        self.in_use
            .saturating_add(self.snarfed)
            .saturating_add(suspended)
    }
}

/// Fixed-capacity pool of sync permits.
#[derive(Debug)]
pub struct PermitPool {
    capacity: usize,
    state: Mutex<PoolState>,
    released: Condvar,
    drain_poll_interval: Duration,
}

impl PermitPool {
    /// Create a pool with `capacity` permits.
    ///
    /// Returns `Err` for a zero capacity or a non-positive decay rate.
    pub fn new(
        capacity: usize,
        decay_rate: f64,
        drain_poll_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(GossipSyncError::InvalidConfig(
                "permit capacity must be positive".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            state: Mutex::new(PoolState {
                in_use: 0,
                snarfed: 0,
                draining: 0,
                reported_suspension: 0.0,
                decay: DecayEngine::new(decay_rate, clock)?,
            }),
            released: Condvar::new(),
            drain_poll_interval,
        })
    }

    // A poisoned pool means a thread panicked mid-update (e.g. an unmatched
    // release). Nothing may keep running on those counters.
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held by exchanges.
    pub fn in_use(&self) -> usize {
        self.lock_state().in_use
    }

    /// Permits currently held idle by the snarfer.
    pub fn snarfed(&self) -> usize {
        self.lock_state().snarfed
    }

    pub fn is_draining(&self) -> bool {
        self.lock_state().draining > 0
    }

    /// Permits a worker could acquire right now.
    pub fn available(&self) -> usize {
        let mut state = self.lock_state();
        if state.draining > 0 {
            return 0;
        }
        self.capacity.saturating_sub(state.committed())
    }

    /// Record the instantaneous suspension pressure. It takes effect through
    /// the decay engine on the next acquire.
    pub fn report_suspension(&self, count: u32) {
        self.lock_state().reported_suspension = f64::from(count);
    }

    /// Take a permit without blocking. Returns `false` if none is free.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock_state();
        if state.draining > 0 || state.committed() >= self.capacity {
            return false;
        }
        state.in_use = state.in_use.saturating_add(1);
        true
    }

    /// Guard form of [`try_acquire`](Self::try_acquire); the permit is
    /// released when the guard drops.
    pub fn try_acquire_permit(&self) -> Option<SyncPermit<'_>> {
        // The guard must only exist once the permit is held: dropping it
        // releases.
        if self.try_acquire() {
            Some(SyncPermit { pool: self })
        } else {
            None
        }
    }

    /// Return a permit taken with [`try_acquire`](Self::try_acquire).
    ///
    /// # Panics
    ///
    /// Panics if no permit is outstanding; an unmatched release means the
    /// counters can no longer be trusted.
    pub fn release(&self) {
        let mut state = self.lock_state();
        let Some(in_use) = state.in_use.checked_sub(1) else {
            panic!("sync permit released without a matching acquire");
        };
        state.in_use = in_use;
        drop(state);
        self.released.notify_all();
    }

    /// Blocking acquire used by the snarfer. Gives up after `timeout` so the
    /// caller can notice shutdown.
    pub fn acquire_snarfed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock_state();
        loop {
            if state.draining == 0 && state.committed() < self.capacity {
                state.snarfed = state.snarfed.saturating_add(1);
                return true;
            }
            let now = Instant::now();
            let remaining = match deadline {
                Some(deadline) if deadline > now => deadline.saturating_duration_since(now),
                Some(_) => return false,
                None => timeout,
            };
            // Suspension decays without any release being signalled, so never
            // sleep longer than one poll interval.
            let wait = remaining.min(self.drain_poll_interval);
            state = self.released.wait_timeout(state, wait).unwrap().0;
        }
    }

    /// Return a permit taken with [`acquire_snarfed`](Self::acquire_snarfed).
    ///
    /// # Panics
    ///
    /// Panics if the snarfer holds no permit.
    pub fn release_snarfed(&self) {
        let mut state = self.lock_state();
        let Some(snarfed) = state.snarfed.checked_sub(1) else {
            panic!("snarfed permit released without a matching acquire");
        };
        state.snarfed = snarfed;
        drop(state);
        self.released.notify_all();
    }

    /// Block new acquisitions and wait until every in-flight exchange has
    /// returned its permit.
    ///
    /// Snarfed permits are not waited for; they never belong to an exchange.
    /// Concurrent drains are allowed and each one waits independently.
    pub fn drain_and_wait_for_all_to_finish(&self) {
        let start = Instant::now();
        let mut state = self.lock_state();
        state.draining = state.draining.saturating_add(1);
        while state.in_use > 0 {
            state = self
                .released
                .wait_timeout(state, self.drain_poll_interval)
                .unwrap()
                .0;
        }
        state.draining = state.draining.saturating_sub(1);
        drop(state);
        // Wake anyone in acquire_snarfed that was blocked by the drain.
        self.released.notify_all();
        debug!("permit pool drained in {:?}", start.elapsed());
    }
}

/// A permit held for one exchange. Released on drop.
#[must_use = "dropping the permit releases it immediately"]
#[derive(Debug)]
pub struct SyncPermit<'a> {
    pool: &'a PermitPool,
}

impl Drop for SyncPermit<'_> {
    fn drop(&mut self) {
        self.pool.release();
    }
}
