//! Top-level gossip sync service.
//!
//! [`GossipController`] owns the permit pool, the fallen-behind tracker and
//! the reconnect coordinator, and runs the permit snarfer plus whatever loops
//! the configured [`SyncStrategy`] asks for.

use {
    crate::{
        clock::MonotonicClock,
        collaborators::Collaborators,
        config::GossipSyncConfig,
        error::Result,
        fallen_behind::FallenBehindTracker,
        lifecycle::SyncLifecycle,
        neighbor::NeighborTable,
        permit_pool::PermitPool,
        reconnect::{ReconnectCoordinator, ReconnectThrottle},
        shutdown::{shutdown_channel, ShutdownTrigger},
        snarfer::PermitSnarfer,
        types::NodeId,
        worker::{SyncContext, SyncStrategy},
    },
    log::{error, info},
    std::{fmt, sync::Arc, thread::JoinHandle},
};

/// Background threads of a started controller.
struct RunningServices {
    shutdown: ShutdownTrigger,
    snarfer: PermitSnarfer,
    workers: Vec<JoinHandle<()>>,
}

pub struct GossipController {
    context: Arc<SyncContext>,
    strategy: Box<dyn SyncStrategy>,
    running: Option<RunningServices>,
}

impl GossipController {
    pub fn new(
        config: GossipSyncConfig,
        strategy: Box<dyn SyncStrategy>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            synchronizer,
            connections,
            intake_backlog,
            snapshots,
            validator,
            installer,
            topology,
            status,
        } = collaborators;

        let neighbors = Arc::new(NeighborTable::new(topology.neighbors()));
        let pool = Arc::new(PermitPool::new(
            config.resolved_capacity(neighbors.len()),
            config.suspension_decay_rate,
            config.drain_poll_interval(),
            Arc::new(MonotonicClock),
        )?);
        let tracker = Arc::new(FallenBehindTracker::new(
            topology,
            config.fallen_behind_threshold,
            status.clone(),
        ));
        let lifecycle = Arc::new(SyncLifecycle::new(pool.clone(), neighbors.clone()));
        let throttle = ReconnectThrottle::new(
            config.reconnect_backoff_min(),
            config.reconnect_backoff_max(),
            Arc::new(MonotonicClock),
        );
        let reconnect = Arc::new(ReconnectCoordinator::new(
            neighbors.clone(),
            connections.clone(),
            snapshots,
            validator,
            installer,
            tracker.clone(),
            lifecycle.clone(),
            status,
            throttle,
            config.max_reconnect_failures,
        ));

        Ok(Self {
            context: Arc::new(SyncContext {
                config,
                pool,
                tracker,
                neighbors,
                lifecycle,
                reconnect,
                synchronizer,
                connections,
                intake_backlog,
            }),
            strategy,
            running: None,
        })
    }

    /// Spawn the snarfer and the sync loops. No-op if already running.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let context = &self.context;
        info!(
            "starting gossip sync: {} strategy, {} neighbors, {} permits",
            self.strategy.name(),
            context.neighbors.len(),
            context.pool.capacity(),
        );
        context.lifecycle.arm();

        let (mut shutdown, signal) = shutdown_channel();
        let snarfer = PermitSnarfer::new(
            context.pool.clone(),
            context.intake_backlog.clone(),
            context.config.snarf.clone(),
            signal.clone(),
        )?;
        let workers = match self.strategy.spawn_workers(context, &signal) {
            Ok(workers) => workers,
            Err(err) => {
                context.lifecycle.begin_exit();
                shutdown.trigger();
                if snarfer.join().is_err() {
                    error!("permit snarfer panicked");
                }
                return Err(err);
            }
        };

        self.running = Some(RunningServices {
            shutdown,
            snarfer,
            workers,
        });
        Ok(())
    }

    /// Halt syncing, wait for in-flight exchanges, and join every thread.
    /// No-op if not running.
    pub fn stop(&mut self) {
        let Some(RunningServices {
            mut shutdown,
            snarfer,
            workers,
        }) = self.running.take()
        else {
            return;
        };
        self.context.lifecycle.begin_exit();
        self.context.pool.drain_and_wait_for_all_to_finish();
        shutdown.trigger();

        for worker in workers {
            let name = worker.thread().name().unwrap_or("sync").to_string();
            if worker.join().is_err() {
                error!("{name} panicked");
            }
        }
        if snarfer.join().is_err() {
            error!("permit snarfer panicked");
        }
        info!("gossip sync stopped");
    }

    /// Stop starting exchanges and wait for the running ones to finish.
    pub fn pause(&self) {
        if self.running.is_some() && !self.context.lifecycle.is_held() {
            self.context.lifecycle.hold();
        }
    }

    /// Undo [`pause`](Self::pause). Also forgets per-peer back-off and
    /// fallen-behind reports gathered so far.
    ///
    /// No-op unless paused. A reconnect in progress keeps syncing halted
    /// until it finishes.
    pub fn resume(&self) {
        if !self.is_paused() {
            return;
        }
        self.context.tracker.reset_fallen_behind();
        self.context.lifecycle.release_hold();
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.running.is_some() && self.context.lifecycle.is_held()
    }

    pub fn report_fallen_behind(&self, peer: NodeId) -> bool {
        self.context.tracker.report_fallen_behind(peer)
    }

    pub fn has_fallen_behind(&self) -> bool {
        self.context.tracker.has_fallen_behind()
    }

    pub fn num_reported_fallen_behind(&self) -> usize {
        self.context.tracker.num_reported_fallen_behind()
    }

    /// Feed the current number of suspended intake operations.
    pub fn report_suspension(&self, count: u32) {
        self.context.pool.report_suspension(count);
    }

    pub fn request_emergency_reconnect(&self, min_round: u64) {
        self.context.reconnect.request_emergency_reconnect(min_round);
    }

    pub fn permit_pool(&self) -> &Arc<PermitPool> {
        &self.context.pool
    }
}

impl fmt::Debug for GossipController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GossipController")
            .field("strategy", &self.strategy.name())
            .field("neighbors", &self.context.neighbors.len())
            .field("running", &self.is_running())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

impl Drop for GossipController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::{PermitCapacity, SnarfConfig},
            error::GossipSyncError,
            status::SyncStatus,
            test_utils::{MockExchange, MockNode, MockPeerState, MockSynchronizer},
            types::ExchangeOutcome,
            worker::{CallerPullStrategy, NegotiatedStrategy, SingleNodeStrategy},
        },
        assert_matches::assert_matches,
        std::{
            sync::atomic::Ordering,
            thread,
            time::{Duration, Instant},
        },
        test_case::test_case,
    };

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(10) {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    fn strategy(name: &str) -> Box<dyn SyncStrategy> {
        match name {
            "caller-pull" => Box::new(CallerPullStrategy { workers: 6 }),
            "negotiated" => Box::new(NegotiatedStrategy),
            _ => Box::new(SingleNodeStrategy),
        }
    }

    fn controller(node: &MockNode, config: GossipSyncConfig, name: &str) -> GossipController {
        GossipController::new(config, strategy(name), node.collaborators()).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let node = MockNode::new(2);
        let mut config = GossipSyncConfig::dev_default();
        config.snarf = SnarfConfig {
            lower_threshold: 10,
            upper_threshold: 10,
            max_snarf: 1,
            poll_period_ms: 5,
        };
        assert_matches!(
            GossipController::new(config, strategy("negotiated"), node.collaborators()),
            Err(GossipSyncError::InvalidConfig(_))
        );
    }

    #[test_case("caller-pull" ; "caller pull")]
    #[test_case("negotiated" ; "negotiated")]
    fn test_exchanges_bounded_by_permits(name: &str) {
        let node = MockNode::with_synchronizer(
            6,
            MockSynchronizer::with_delay(Duration::from_millis(2)),
        );
        let mut config = GossipSyncConfig::dev_default();
        config.permit_capacity = PermitCapacity::Fixed(2);
        let mut controller = controller(&node, config, name);

        controller.start().unwrap();
        assert!(wait_until(|| node.synchronizer.total_exchanges() >= 40));
        controller.stop();

        assert!(node.synchronizer.max_concurrent() <= 2);
        assert_eq!(controller.permit_pool().in_use(), 0);
        assert_eq!(controller.permit_pool().snarfed(), 0);
    }

    #[test]
    fn test_negotiated_sends_heartbeats() {
        let node = MockNode::new(3);
        let mut controller = controller(&node, GossipSyncConfig::dev_default(), "negotiated");
        controller.start().unwrap();
        assert!(wait_until(|| node.synchronizer.heartbeats() >= 3));
        controller.stop();
    }

    #[test]
    fn test_start_stop_idempotent() {
        let node = MockNode::new(2);
        let mut controller = controller(&node, GossipSyncConfig::dev_default(), "caller-pull");
        assert!(!controller.is_running());
        controller.stop();

        controller.start().unwrap();
        controller.start().unwrap();
        assert!(controller.is_running());
        controller.stop();
        controller.stop();
        assert!(!controller.is_running());

        controller.start().unwrap();
        let before = node.synchronizer.total_exchanges();
        assert!(wait_until(|| node.synchronizer.total_exchanges() > before));
        controller.stop();
    }

    #[test_case("caller-pull" ; "caller pull")]
    #[test_case("negotiated" ; "negotiated")]
    fn test_pause_stops_new_exchanges(name: &str) {
        let node = MockNode::with_synchronizer(
            3,
            MockSynchronizer::with_delay(Duration::from_millis(1)),
        );
        let mut controller = controller(&node, GossipSyncConfig::dev_default(), name);
        controller.start().unwrap();
        assert!(wait_until(|| node.synchronizer.total_exchanges() >= 5));

        controller.pause();
        controller.pause();
        assert!(controller.is_paused());
        assert_eq!(controller.permit_pool().in_use(), 0);
        let paused_at = node.synchronizer.total_exchanges();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(node.synchronizer.total_exchanges(), paused_at);

        controller.resume();
        assert!(!controller.is_paused());
        assert!(wait_until(|| node.synchronizer.total_exchanges() > paused_at));
        controller.stop();
    }

    #[test]
    fn test_resume_clears_fallen_behind_reports() {
        let node = MockNode::new(3);
        let mut controller = controller(&node, GossipSyncConfig::dev_default(), "single-node");
        controller.start().unwrap();
        controller.pause();
        assert!(controller.report_fallen_behind(NodeId(0)));
        assert!(controller.has_fallen_behind());
        assert_eq!(controller.num_reported_fallen_behind(), 1);
        controller.resume();
        assert!(!controller.has_fallen_behind());
        assert_eq!(controller.num_reported_fallen_behind(), 0);
        controller.stop();
    }

    #[test_case("caller-pull" ; "caller pull")]
    #[test_case("negotiated" ; "negotiated")]
    fn test_reconnect_after_falling_behind(name: &str) {
        let node = MockNode::new(3);
        node.synchronizer.script(
            NodeId(1),
            MockExchange::Outcome(ExchangeOutcome::SelfFallenBehind),
        );
        node.snapshots
            .set_peer(NodeId(1), MockPeerState::Offers { round: 42 });
        let mut controller = controller(&node, GossipSyncConfig::dev_default(), name);

        controller.start().unwrap();
        assert!(wait_until(|| !node.installer.installed().is_empty()));
        controller.stop();

        assert_eq!(node.installer.installed()[0], 42);
        assert!(node
            .status
            .statuses()
            .contains(&SyncStatus::Reconnected {
                peer: NodeId(1),
                round: 42
            }));
        assert_eq!(node.snapshots.released(), node.snapshots.reserved());
    }

    #[test_case("caller-pull" ; "caller pull")]
    #[test_case("negotiated" ; "negotiated")]
    fn test_emergency_reconnect_enforces_min_round(name: &str) {
        let node = MockNode::new(3);
        node.snapshots
            .set_peer(NodeId(0), MockPeerState::Offers { round: 30 });
        node.snapshots
            .set_peer(NodeId(2), MockPeerState::Offers { round: 45 });
        let mut controller = controller(&node, GossipSyncConfig::dev_default(), name);

        controller.request_emergency_reconnect(40);
        controller.start().unwrap();
        assert!(wait_until(|| !node.installer.installed().is_empty()));
        controller.stop();

        assert_eq!(node.installer.installed(), vec![45]);
        assert_eq!(node.snapshots.released(), node.snapshots.reserved());
    }

    #[test]
    fn test_resume_does_not_end_reconnect_pause() {
        let node = MockNode::new(2);
        let mut controller = controller(&node, GossipSyncConfig::dev_default(), "single-node");
        controller.start().unwrap();
        controller.report_fallen_behind(NodeId(1));
        let lifecycle = controller.context.lifecycle.clone();
        let pause = lifecycle.pause_for_reconnect();

        // Not paused by the operator, so nothing to undo.
        controller.resume();
        assert!(lifecycle.is_halted());
        assert!(controller.has_fallen_behind());

        controller.pause();
        controller.resume();
        assert!(!controller.is_paused());
        assert!(lifecycle.is_halted());

        drop(pause);
        assert!(!lifecycle.is_halted());
        controller.stop();
    }

    #[test_case("caller-pull" ; "caller pull")]
    #[test_case("negotiated" ; "negotiated")]
    fn test_failing_peers_back_off(name: &str) {
        let node = MockNode::new(3);
        node.synchronizer.set_default(MockExchange::IoError);
        node.connections.set_auto_reconnect(true);
        let mut config = GossipSyncConfig::dev_default();
        config.failure_sleep_ms = 60_000;
        let threshold = config.consecutive_failures_before_sleep;
        let mut controller = controller(&node, config, name);
        let neighbors = controller.context.neighbors.clone();
        let all_backed_off = || {
            neighbors
                .ids()
                .iter()
                .all(|&peer| neighbors.get(peer).unwrap().consecutive_failures() >= threshold)
        };

        controller.start().unwrap();
        assert!(wait_until(all_backed_off));
        thread::sleep(Duration::from_millis(50));
        let settled = node.synchronizer.total_exchanges();
        thread::sleep(Duration::from_millis(100));

        // Every loop is now sleeping off its failures.
        assert_eq!(node.synchronizer.total_exchanges(), settled);
        assert!(settled >= 9);
        assert!(settled <= 20, "{settled} exchanges");

        controller.pause();
        controller.resume();
        for &peer in neighbors.ids() {
            assert_eq!(neighbors.get(peer).unwrap().consecutive_failures(), 0);
        }
        controller.stop();
    }

    #[test]
    fn test_debug_shows_state() {
        let node = MockNode::new(2);
        let controller = controller(&node, GossipSyncConfig::dev_default(), "negotiated");
        let debug = format!("{controller:?}");
        assert!(debug.contains("negotiated"));
        assert!(debug.contains("running: false"));
    }

    #[test]
    fn test_single_node_runs_no_exchanges() {
        let node = MockNode::new(0);
        let mut config = GossipSyncConfig::dev_default();
        config.permit_capacity = PermitCapacity::OnePerPeer;
        let mut controller = controller(&node, config, "single-node");
        assert_eq!(controller.permit_pool().capacity(), 1);

        controller.start().unwrap();
        thread::sleep(Duration::from_millis(10));
        controller.stop();
        assert_eq!(node.synchronizer.total_exchanges(), 0);
    }

    #[test]
    fn test_report_suspension_reduces_available() {
        let node = MockNode::new(2);
        let controller = controller(&node, GossipSyncConfig::dev_default(), "single-node");
        controller.report_suspension(3);
        assert_eq!(controller.permit_pool().available(), 1);
    }

    #[test]
    fn test_stop_returns_snarfed_permits() {
        let node = MockNode::new(2);
        node.backlog.store(1_000_000, Ordering::SeqCst);
        let mut controller = controller(&node, GossipSyncConfig::dev_default(), "single-node");
        controller.start().unwrap();
        assert!(wait_until(|| controller.permit_pool().snarfed() == 2));
        controller.stop();
        assert_eq!(controller.permit_pool().snarfed(), 0);
        assert_eq!(
            controller.permit_pool().available(),
            controller.permit_pool().capacity()
        );
    }
}
