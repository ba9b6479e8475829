//! Recovery from having fallen behind.
//!
//! Once the [`FallenBehindTracker`] says incremental sync cannot catch us up,
//! the [`ReconnectCoordinator`] pauses ordinary syncing, fetches a state
//! snapshot from one of the peers that reported us behind, validates and
//! installs it, and resumes.
//!
//! Candidates are tried strictly in order and the first success wins, so at
//! most one snapshot is installed per attempt. Each snapshot arrives as a
//! [`StateReservation`], which releases itself when dropped; every exit from
//! [`ReconnectCoordinator::attempt_reconnect`] therefore leaves no snapshot
//! pinned, whichever candidate it failed on and however.

use {
    crate::{
        clock::Clock,
        collaborators::{
            ConnectionManager, ReservedState, SnapshotTransport, SnapshotValidator, StateInstaller,
        },
        fallen_behind::FallenBehindTracker,
        lifecycle::SyncLifecycle,
        neighbor::NeighborTable,
        status::{StatusReporter, SyncStatus},
        types::NodeId,
    },
    log::{debug, info, warn},
    rand::seq::SliceRandom,
    std::{
        sync::{Arc, Mutex, TryLockError},
        time::{Duration, Instant},
    },
};

/// What happened with one reconnect candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// No live connection to the candidate.
    NoConnection,
    /// Someone else (usually a heartbeat) holds the connection.
    ConnectionLockBusy,
    PeerDeclined,
    /// The peer agreed but had no state to send.
    NoStateOffered,
    ValidationFailed(String),
    Installed { round: u64 },
    Exception(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectAttemptRecord {
    pub candidate: NodeId,
    pub outcome: ReconnectOutcome,
}

/// Per-candidate results of one [`ReconnectCoordinator::attempt_reconnect`]
/// call, in the order tried.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconnectReport {
    pub attempts: Vec<ReconnectAttemptRecord>,
}

impl ReconnectReport {
    /// The peer and round installed, if any.
    pub fn installed(&self) -> Option<(NodeId, u64)> {
        self.attempts.iter().find_map(|record| match record.outcome {
            ReconnectOutcome::Installed { round } => Some((record.candidate, round)),
            _ => None,
        })
    }

    pub fn succeeded(&self) -> bool {
        self.installed().is_some()
    }
}

/// Exponential back-off between failed reconnects.
#[derive(Debug)]
pub struct ReconnectThrottle {
    clock: Arc<dyn Clock>,
    min_backoff: Duration,
    max_backoff: Duration,
    consecutive_failures: u32,
    next_allowed: Option<Instant>,
}

impl ReconnectThrottle {
    pub fn new(min_backoff: Duration, max_backoff: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            min_backoff,
            max_backoff,
            consecutive_failures: 0,
            next_allowed: None,
        }
    }

    pub fn may_attempt(&self) -> bool {
        self.next_allowed
            .map_or(true, |next_allowed| self.clock.now() >= next_allowed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Back-off that follows the current run of failures.
    pub fn current_backoff(&self) -> Duration {
        let doublings = self.consecutive_failures.saturating_sub(1).min(31);
        self.min_backoff
            .saturating_mul(2u32.saturating_pow(doublings))
            .min(self.max_backoff)
    }

    /// Returns the failure count including this one.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.next_allowed = self.clock.now().checked_add(self.current_backoff());
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.next_allowed = None;
    }
}

/// Validator that additionally insists on a minimum round, used for
/// emergency recovery.
struct MinRoundValidator<'a> {
    inner: &'a dyn SnapshotValidator,
    min_round: u64,
}

impl SnapshotValidator for MinRoundValidator<'_> {
    fn validate(&self, state: &dyn ReservedState) -> Result<(), String> {
        if state.round() < self.min_round {
            return Err(format!(
                "round {} is older than emergency round {}",
                state.round(),
                self.min_round
            ));
        }
        self.inner.validate(state)
    }
}

pub struct ReconnectCoordinator {
    neighbors: Arc<NeighborTable>,
    connections: Arc<dyn ConnectionManager>,
    snapshots: Arc<dyn SnapshotTransport>,
    validator: Arc<dyn SnapshotValidator>,
    installer: Arc<dyn StateInstaller>,
    tracker: Arc<FallenBehindTracker>,
    lifecycle: Arc<SyncLifecycle>,
    status: Arc<dyn StatusReporter>,
    throttle: Mutex<ReconnectThrottle>,
    /// Held for the whole suspend/reconnect/resume cycle.
    in_progress: Mutex<()>,
    emergency_round: Mutex<Option<u64>>,
    max_reconnect_failures: u32,
}

impl ReconnectCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        neighbors: Arc<NeighborTable>,
        connections: Arc<dyn ConnectionManager>,
        snapshots: Arc<dyn SnapshotTransport>,
        validator: Arc<dyn SnapshotValidator>,
        installer: Arc<dyn StateInstaller>,
        tracker: Arc<FallenBehindTracker>,
        lifecycle: Arc<SyncLifecycle>,
        status: Arc<dyn StatusReporter>,
        throttle: ReconnectThrottle,
        max_reconnect_failures: u32,
    ) -> Self {
        Self {
            neighbors,
            connections,
            snapshots,
            validator,
            installer,
            tracker,
            lifecycle,
            status,
            throttle: Mutex::new(throttle),
            in_progress: Mutex::new(()),
            emergency_round: Mutex::new(None),
            max_reconnect_failures,
        }
    }

    /// Try each candidate in order until one snapshot is installed.
    ///
    /// Does not pause syncing or touch the tracker; see
    /// [`reconnect_if_behind`](Self::reconnect_if_behind) for the full cycle.
    pub fn attempt_reconnect(&self, candidates: &[NodeId]) -> ReconnectReport {
        self.attempt_reconnect_with(candidates, self.validator.as_ref())
    }

    fn attempt_reconnect_with(
        &self,
        candidates: &[NodeId],
        validator: &dyn SnapshotValidator,
    ) -> ReconnectReport {
        let mut report = ReconnectReport::default();
        for &candidate in candidates {
            let outcome = self.attempt_one(candidate, validator);
            let installed = matches!(outcome, ReconnectOutcome::Installed { .. });
            if !installed {
                debug!("reconnect from {candidate} failed: {outcome:?}");
            }
            report.attempts.push(ReconnectAttemptRecord { candidate, outcome });
            if installed {
                break;
            }
        }
        report
    }

    fn attempt_one(
        &self,
        candidate: NodeId,
        validator: &dyn SnapshotValidator,
    ) -> ReconnectOutcome {
        let Some(neighbor) = self.neighbors.get(candidate) else {
            return ReconnectOutcome::NoConnection;
        };
        let Some(_connection_lock) = neighbor.try_lock_connection() else {
            return ReconnectOutcome::ConnectionLockBusy;
        };
        let Some(connection) = self
            .connections
            .get_connection(candidate)
            .filter(|connection| connection.connected())
        else {
            return ReconnectOutcome::NoConnection;
        };

        match self.snapshots.request_reconnect(connection.as_ref()) {
            Ok(true) => {}
            Ok(false) => return ReconnectOutcome::PeerDeclined,
            Err(err) => {
                connection.disconnect();
                return ReconnectOutcome::Exception(err.to_string());
            }
        }

        let reservation = match self.snapshots.receive_state(connection.as_ref()) {
            Ok(reservation) => reservation,
            Err(err) => {
                connection.disconnect();
                return ReconnectOutcome::Exception(err.to_string());
            }
        };
        let Some(state) = reservation.state() else {
            return ReconnectOutcome::NoStateOffered;
        };
        if let Err(reason) = validator.validate(state) {
            return ReconnectOutcome::ValidationFailed(reason);
        }
        if let Err(reason) = self.installer.install(state) {
            return ReconnectOutcome::Exception(reason);
        }
        let round = state.round();
        reservation.release();
        ReconnectOutcome::Installed { round }
    }

    /// Run a full reconnect cycle if the node is behind and the throttle
    /// allows it. Returns `None` if nothing was attempted.
    pub fn reconnect_if_behind(&self) -> Option<ReconnectReport> {
        if !self.tracker.has_fallen_behind() {
            return None;
        }
        self.run_cycle(|| self.tracker.neighbors_for_reconnect(), false)
    }

    /// Like [`reconnect_if_behind`](Self::reconnect_if_behind) but only
    /// tries `peer`, and only if the tracker considers it a good source.
    pub fn reconnect_from(&self, peer: NodeId) -> Option<ReconnectReport> {
        if !self.tracker.should_reconnect_from(peer) {
            return None;
        }
        self.run_cycle(|| vec![peer], false)
    }

    /// Ask for a state at or after `min_round` from whichever peer can
    /// provide one, regardless of fallen-behind reports.
    pub fn request_emergency_reconnect(&self, min_round: u64) {
        info!("emergency reconnect requested for round >= {min_round}");
        *self.emergency_round.lock().unwrap() = Some(min_round);
    }

    pub fn emergency_round(&self) -> Option<u64> {
        *self.emergency_round.lock().unwrap()
    }

    /// Try to satisfy a pending emergency request from `peer`.
    pub fn attempt_emergency_reconnect(&self, peer: NodeId) -> Option<ReconnectReport> {
        self.emergency_round()?;
        self.run_cycle(|| vec![peer], true)
    }

    /// Try to satisfy a pending emergency request from any neighbor, in
    /// random order.
    pub fn attempt_emergency_reconnect_from_any(&self) -> Option<ReconnectReport> {
        self.emergency_round()?;
        self.run_cycle(
            || {
                let mut candidates = self.neighbors.ids().to_vec();
                candidates.shuffle(&mut rand::rng());
                candidates
            },
            true,
        )
    }

    fn run_cycle(
        &self,
        candidates: impl FnOnce() -> Vec<NodeId>,
        emergency: bool,
    ) -> Option<ReconnectReport> {
        // One cycle at a time; anyone else just carries on. A cycle that
        // panicked leaves nothing half-done behind this lock.
        let _in_progress = match self.in_progress.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return None,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        if !self.throttle.lock().unwrap().may_attempt() {
            return None;
        }
        let min_round = if emergency {
            Some(self.emergency_round()?)
        } else {
            None
        };
        let candidates = candidates();
        if candidates.is_empty() {
            return None;
        }

        self.status.report(SyncStatus::Reconnecting {
            candidates: candidates.len(),
        });
        let pause = self.lifecycle.pause_for_reconnect();
        let report = match min_round {
            Some(min_round) => {
                let validator = MinRoundValidator {
                    inner: self.validator.as_ref(),
                    min_round,
                };
                self.attempt_reconnect_with(&candidates, &validator)
            }
            None => self.attempt_reconnect(&candidates),
        };
        self.finish_cycle(&report, emergency);
        drop(pause);
        Some(report)
    }

    fn finish_cycle(&self, report: &ReconnectReport, emergency: bool) {
        if let Some((peer, round)) = report.installed() {
            self.throttle.lock().unwrap().record_success();
            self.tracker.reset_fallen_behind();
            if emergency {
                *self.emergency_round.lock().unwrap() = None;
            }
            self.status.report(SyncStatus::Reconnected { peer, round });
            return;
        }

        let (consecutive_failures, backoff) = {
            let mut throttle = self.throttle.lock().unwrap();
            (throttle.record_failure(), throttle.current_backoff())
        };
        warn!(
            "reconnect exhausted {} candidates, retrying in {backoff:?}",
            report.attempts.len()
        );
        self.status.report(SyncStatus::ReconnectFailed {
            attempts: report.attempts.len(),
            consecutive_failures,
        });
        if consecutive_failures >= self.max_reconnect_failures {
            self.status
                .report(SyncStatus::ReconnectFailuresExceeded { consecutive_failures });
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.throttle.lock().unwrap().consecutive_failures()
    }
}
