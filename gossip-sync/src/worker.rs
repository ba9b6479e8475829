//! Long-lived peer sync loops.
//!
//! Two ways of driving exchanges are supported, selected by the
//! [`SyncStrategy`] handed to the controller:
//!
//! - [`CallerPullStrategy`] runs a fixed number of worker slots. Each slot
//!   picks peers at random and syncs with the first one for which it can get
//!   both a permit and the connection lock.
//! - [`NegotiatedStrategy`] runs one loop per peer. Every round the loop picks
//!   a protocol (heartbeat, emergency reconnect, reconnect or sync) and runs
//!   it over that peer's connection.
//!
//! Either way, resources are always taken in the same order (permit, then
//! connection lock), never waited on, and handed back before moving on. A
//! loop never ends because of something a peer did; only shutdown stops it.

use {
    crate::{
        collaborators::{ConnectionManager, IntakeBacklog, Synchronizer},
        config::GossipSyncConfig,
        error::{GossipSyncError, Result},
        fallen_behind::FallenBehindTracker,
        lifecycle::SyncLifecycle,
        neighbor::{NeighborSyncState, NeighborTable},
        permit_pool::PermitPool,
        reconnect::ReconnectCoordinator,
        shutdown::ShutdownSignal,
        types::{ExchangeOutcome, NodeId},
    },
    log::{debug, info, warn},
    rand::seq::SliceRandom,
    std::{
        sync::Arc,
        thread::{Builder, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Everything a sync loop needs, shared by all loops.
pub struct SyncContext {
    pub config: GossipSyncConfig,
    pub pool: Arc<PermitPool>,
    pub tracker: Arc<FallenBehindTracker>,
    pub neighbors: Arc<NeighborTable>,
    pub lifecycle: Arc<SyncLifecycle>,
    pub reconnect: Arc<ReconnectCoordinator>,
    pub synchronizer: Arc<dyn Synchronizer>,
    pub connections: Arc<dyn ConnectionManager>,
    pub intake_backlog: IntakeBacklog,
}

impl SyncContext {
    fn intake_throttled(&self) -> bool {
        (self.intake_backlog)() >= self.config.sync_throttle_backlog
    }
}

/// How the sync loops are laid out.
pub trait SyncStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start the loops. They must all return once `shutdown` fires.
    fn spawn_workers(
        &self,
        context: &Arc<SyncContext>,
        shutdown: &ShutdownSignal,
    ) -> Result<Vec<JoinHandle<()>>>;
}

/// Result of trying one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAttempt {
    Exchanged(ExchangeOutcome),
    /// No live connection to the peer.
    NoConnection,
    /// The exchange failed and the connection was dropped.
    Failed,
}

impl SyncAttempt {
    fn is_failure(&self) -> bool {
        !matches!(self, Self::Exchanged(_))
    }
}

/// Run one exchange with `neighbor`. The caller must already hold a permit
/// and the neighbor's connection lock.
fn exchange_with(context: &SyncContext, neighbor: &NeighborSyncState) -> SyncAttempt {
    let peer = neighbor.id();
    let Some(connection) = context
        .connections
        .get_connection(peer)
        .filter(|connection| connection.connected())
    else {
        neighbor.record_failure();
        return SyncAttempt::NoConnection;
    };

    match context.synchronizer.exchange(connection.as_ref()) {
        Ok(outcome) => {
            neighbor.record_success();
            match outcome {
                ExchangeOutcome::SelfFallenBehind => {
                    context.tracker.report_fallen_behind(peer);
                }
                ExchangeOutcome::PeerFallenBehind => {
                    debug!("{peer} has fallen behind us");
                }
                ExchangeOutcome::Accepted | ExchangeOutcome::Declined => {}
            }
            SyncAttempt::Exchanged(outcome)
        }
        Err(err) => {
            let failures = neighbor.record_failure();
            warn!("sync with {peer} failed ({failures} in a row): {err}");
            connection.disconnect();
            SyncAttempt::Failed
        }
    }
}

/// Whether a loop should back off after `attempt` with `neighbor`.
fn should_back_off(
    context: &SyncContext,
    neighbor: &NeighborSyncState,
    attempt: SyncAttempt,
) -> bool {
    attempt.is_failure()
        && neighbor.consecutive_failures() >= context.config.consecutive_failures_before_sleep
}

fn spawn_loop(
    name: String,
    handles: &mut Vec<JoinHandle<()>>,
    body: impl FnOnce() + Send + 'static,
) -> Result<()> {
    let handle = Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|source| GossipSyncError::ThreadSpawn { name, source })?;
    handles.push(handle);
    Ok(())
}

/// A fixed pool of worker slots pulling from all peers.
///
/// Slot 0 is also responsible for reconnecting, both when the node falls
/// behind and when an emergency reconnect has been requested.
#[derive(Debug, Clone, Copy)]
pub struct CallerPullStrategy {
    pub workers: usize,
}

impl CallerPullStrategy {
    const RECONNECT_SLOT: usize = 0;

    fn run(slot: usize, context: &SyncContext, shutdown: &ShutdownSignal) {
        let mut peers = context.neighbors.ids().to_vec();
        let mut rng = rand::rng();
        loop {
            if shutdown.is_triggered() {
                break;
            }
            if context.lifecycle.is_halted() {
                if shutdown.wait(context.config.idle_sleep()) {
                    break;
                }
                continue;
            }
            if slot == Self::RECONNECT_SLOT {
                // The other slots sit idle while the cycle has syncing paused.
                Self::reconnect_if_needed(context);
            }

            peers.shuffle(&mut rng);
            Self::prioritize_unconfirmed(context, &mut peers);
            let sleep = match Self::sync_one(context, &peers) {
                Some((neighbor, attempt)) if should_back_off(context, &neighbor, attempt) => {
                    context.config.failure_sleep()
                }
                Some(_) => Duration::ZERO,
                None => context.config.idle_sleep(),
            };
            if !sleep.is_zero() && shutdown.wait(sleep) {
                break;
            }
        }
        debug!("sync caller {slot} exiting");
    }

    fn reconnect_if_needed(context: &SyncContext) {
        if context.reconnect.emergency_round().is_some() {
            context.reconnect.attempt_emergency_reconnect_from_any();
        } else if context.tracker.has_fallen_behind() {
            context.reconnect.reconnect_if_behind();
        }
    }

    /// While some peers say we are behind but not enough to act on, move
    /// the peers that have not reported to the front, keeping the shuffled
    /// order otherwise.
    fn prioritize_unconfirmed(context: &SyncContext, peers: &mut [NodeId]) {
        if context.tracker.num_reported_fallen_behind() == 0
            || context.tracker.has_fallen_behind()
        {
            return;
        }
        let unconfirmed = context.tracker.needed_for_fallen_behind();
        peers.sort_by_key(|peer| !unconfirmed.contains(peer));
    }

    /// Sync with the first peer in `peers` for which both a permit and the
    /// connection lock are available. Returns `None` if no exchange ran.
    fn sync_one(
        context: &SyncContext,
        peers: &[NodeId],
    ) -> Option<(Arc<NeighborSyncState>, SyncAttempt)> {
        if context.intake_throttled() {
            return None;
        }
        for &peer in peers {
            let permit = context.pool.try_acquire_permit()?;
            // Checked with the permit held so a concurrent pause either waits
            // for this exchange or is seen here.
            if context.lifecycle.is_halted() {
                return None;
            }
            let Some(neighbor) = context.neighbors.get(peer) else {
                continue;
            };
            let Some(connection_lock) = neighbor.try_lock_connection() else {
                // Hand the permit back before looking at the next peer.
                drop(permit);
                continue;
            };
            let attempt = exchange_with(context, &neighbor);
            drop(connection_lock);
            drop(permit);
            return Some((neighbor, attempt));
        }
        None
    }
}

impl SyncStrategy for CallerPullStrategy {
    fn name(&self) -> &'static str {
        "caller-pull"
    }

    fn spawn_workers(
        &self,
        context: &Arc<SyncContext>,
        shutdown: &ShutdownSignal,
    ) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(self.workers);
        for slot in 0..self.workers {
            let context = context.clone();
            let shutdown = shutdown.clone();
            spawn_loop(format!("trv1SyncCall{slot:02}"), &mut handles, move || {
                Self::run(slot, &context, &shutdown)
            })?;
        }
        info!("started {} sync caller threads", handles.len());
        Ok(handles)
    }
}

/// Protocols a per-peer loop can run in one round, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerProtocol {
    Heartbeat,
    EmergencyReconnect,
    Reconnect,
    Sync,
}

/// One loop per peer, negotiating a protocol each round.
#[derive(Debug, Default, Clone, Copy)]
pub struct NegotiatedStrategy;

impl NegotiatedStrategy {
    /// Pick what to run with `neighbor` this round, if anything.
    pub fn select_protocol(
        context: &SyncContext,
        neighbor: &NeighborSyncState,
        now: Instant,
    ) -> Option<PeerProtocol> {
        // Heartbeats keep flowing while syncing is paused.
        if neighbor.heartbeat_due(now, context.config.heartbeat_period()) {
            return Some(PeerProtocol::Heartbeat);
        }
        if context.lifecycle.is_halted() {
            return None;
        }
        if context.reconnect.emergency_round().is_some() {
            return Some(PeerProtocol::EmergencyReconnect);
        }
        if context.tracker.should_reconnect_from(neighbor.id()) {
            return Some(PeerProtocol::Reconnect);
        }
        if context.intake_throttled() || context.pool.available() == 0 {
            return None;
        }
        Some(PeerProtocol::Sync)
    }

    fn run(peer: NodeId, context: &SyncContext, shutdown: &ShutdownSignal) {
        let Some(neighbor) = context.neighbors.get(peer) else {
            warn!("no sync state for {peer}, loop not started");
            return;
        };
        loop {
            if shutdown.is_triggered() {
                break;
            }
            let protocol = Self::select_protocol(context, &neighbor, Instant::now());
            let sleep = match protocol {
                Some(PeerProtocol::Heartbeat) => {
                    Self::heartbeat(context, &neighbor);
                    Duration::ZERO
                }
                Some(PeerProtocol::EmergencyReconnect) => {
                    match context.reconnect.attempt_emergency_reconnect(peer) {
                        Some(report) if report.succeeded() => Duration::ZERO,
                        _ => context.config.idle_sleep(),
                    }
                }
                Some(PeerProtocol::Reconnect) => match context.reconnect.reconnect_from(peer) {
                    Some(report) if report.succeeded() => Duration::ZERO,
                    _ => context.config.idle_sleep(),
                },
                Some(PeerProtocol::Sync) => match Self::sync(context, &neighbor) {
                    Some(attempt) if should_back_off(context, &neighbor, attempt) => {
                        context.config.failure_sleep()
                    }
                    Some(_) => Duration::ZERO,
                    None => context.config.idle_sleep(),
                },
                None => context.config.idle_sleep(),
            };
            if !sleep.is_zero() && shutdown.wait(sleep) {
                break;
            }
        }
        debug!("sync loop for {peer} exiting");
    }

    fn heartbeat(context: &SyncContext, neighbor: &NeighborSyncState) {
        let Some(_connection_lock) = neighbor.try_lock_connection() else {
            return;
        };
        let peer = neighbor.id();
        neighbor.record_heartbeat(Instant::now());
        let Some(connection) = context
            .connections
            .get_connection(peer)
            .filter(|connection| connection.connected())
        else {
            return;
        };
        if let Err(err) = context.synchronizer.heartbeat(connection.as_ref()) {
            let failures = neighbor.record_failure();
            warn!("heartbeat to {peer} failed ({failures} in a row): {err}");
            connection.disconnect();
        }
    }

    /// One exchange, holding a permit only for its duration.
    fn sync(context: &SyncContext, neighbor: &NeighborSyncState) -> Option<SyncAttempt> {
        let permit = context.pool.try_acquire_permit()?;
        if context.lifecycle.is_halted() {
            return None;
        }
        let connection_lock = neighbor.try_lock_connection()?;
        let attempt = exchange_with(context, neighbor);
        drop(connection_lock);
        drop(permit);
        Some(attempt)
    }
}

impl SyncStrategy for NegotiatedStrategy {
    fn name(&self) -> &'static str {
        "negotiated"
    }

    fn spawn_workers(
        &self,
        context: &Arc<SyncContext>,
        shutdown: &ShutdownSignal,
    ) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(context.neighbors.len());
        for &peer in context.neighbors.ids() {
            let context = context.clone();
            let shutdown = shutdown.clone();
            spawn_loop(format!("trv1SyncPeer{}", peer.0), &mut handles, move || {
                Self::run(peer, &context, &shutdown)
            })?;
        }
        info!("started {} per-peer sync threads", handles.len());
        Ok(handles)
    }
}

/// A network of one: nothing to sync with.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleNodeStrategy;

impl SyncStrategy for SingleNodeStrategy {
    fn name(&self) -> &'static str {
        "single-node"
    }

    fn spawn_workers(
        &self,
        _context: &Arc<SyncContext>,
        _shutdown: &ShutdownSignal,
    ) -> Result<Vec<JoinHandle<()>>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            clock::MonotonicClock,
            collaborators::Collaborators,
            config::FallenBehindThreshold,
            reconnect::ReconnectThrottle,
            test_utils::{MockExchange, MockNode, MockPeerState},
        },
        std::sync::atomic::Ordering,
        test_case::test_case,
    };

    fn context(node: &MockNode, config: GossipSyncConfig) -> SyncContext {
        let Collaborators {
            synchronizer,
            connections,
            intake_backlog,
            snapshots,
            validator,
            installer,
            topology,
            status,
        } = node.collaborators();
        let neighbors = Arc::new(NeighborTable::new(topology.neighbors()));
        let pool = Arc::new(
            PermitPool::new(
                config.resolved_capacity(neighbors.len()),
                config.suspension_decay_rate,
                config.drain_poll_interval(),
                Arc::new(MonotonicClock),
            )
            .unwrap(),
        );
        let tracker = Arc::new(FallenBehindTracker::new(
            topology,
            config.fallen_behind_threshold,
            status.clone(),
        ));
        let lifecycle = Arc::new(SyncLifecycle::new(pool.clone(), neighbors.clone()));
        let reconnect = Arc::new(ReconnectCoordinator::new(
            neighbors.clone(),
            connections.clone(),
            snapshots,
            validator,
            installer,
            tracker.clone(),
            lifecycle.clone(),
            status,
            ReconnectThrottle::new(Duration::ZERO, Duration::ZERO, Arc::new(MonotonicClock)),
            config.max_reconnect_failures,
        ));
        SyncContext {
            config,
            pool,
            tracker,
            neighbors,
            lifecycle,
            reconnect,
            synchronizer,
            connections,
            intake_backlog,
        }
    }

    #[test]
    fn test_sync_one_releases_permit_when_lock_busy() {
        let node = MockNode::new(2);
        let context = context(&node, GossipSyncConfig::dev_default());
        let busy = context.neighbors.get(NodeId(0)).unwrap();
        let _held = busy.try_lock_connection().unwrap();

        let (neighbor, attempt) =
            CallerPullStrategy::sync_one(&context, &[NodeId(0), NodeId(1)]).unwrap();

        assert_eq!(neighbor.id(), NodeId(1));
        assert_eq!(attempt, SyncAttempt::Exchanged(ExchangeOutcome::Accepted));
        assert_eq!(node.synchronizer.exchanges_with(NodeId(0)), 0);
        assert_eq!(context.pool.in_use(), 0);
    }

    #[test]
    fn test_sync_one_with_every_lock_busy_holds_nothing() {
        let node = MockNode::new(2);
        let context = context(&node, GossipSyncConfig::dev_default());
        let a = context.neighbors.get(NodeId(0)).unwrap();
        let b = context.neighbors.get(NodeId(1)).unwrap();
        let _a = a.try_lock_connection().unwrap();
        let _b = b.try_lock_connection().unwrap();

        assert!(CallerPullStrategy::sync_one(&context, &[NodeId(0), NodeId(1)]).is_none());
        assert_eq!(context.pool.in_use(), 0);
        assert_eq!(node.synchronizer.total_exchanges(), 0);
    }

    #[test]
    fn test_sync_one_gives_up_without_permits() {
        let node = MockNode::new(2);
        let context = context(&node, GossipSyncConfig::dev_default());
        let _permits: Vec<_> = (0..context.pool.capacity())
            .map(|_| context.pool.try_acquire_permit().unwrap())
            .collect();
        assert!(CallerPullStrategy::sync_one(&context, &[NodeId(0)]).is_none());
        assert_eq!(node.synchronizer.total_exchanges(), 0);
    }

    #[test]
    fn test_sync_one_while_halted_runs_nothing() {
        let node = MockNode::new(2);
        let context = context(&node, GossipSyncConfig::dev_default());
        context.lifecycle.hold();
        assert!(CallerPullStrategy::sync_one(&context, &[NodeId(0), NodeId(1)]).is_none());
        assert_eq!(context.pool.in_use(), 0);
        assert_eq!(node.synchronizer.total_exchanges(), 0);
    }

    #[test]
    fn test_intake_backlog_throttles_sync() {
        let node = MockNode::new(2);
        let context = context(&node, GossipSyncConfig::dev_default());
        node.backlog
            .store(context.config.sync_throttle_backlog, Ordering::SeqCst);
        assert!(CallerPullStrategy::sync_one(&context, &[NodeId(0)]).is_none());
    }

    #[test_case(MockExchange::IoError; "io error")]
    #[test_case(MockExchange::ProtocolError; "protocol error")]
    fn test_exchange_failure_disconnects_and_counts(failure: MockExchange) {
        let node = MockNode::new(1);
        let context = context(&node, GossipSyncConfig::dev_default());
        node.synchronizer.script(NodeId(0), failure);
        let neighbor = context.neighbors.get(NodeId(0)).unwrap();

        for expected in 1..=3u32 {
            node.connections.connection(NodeId(0)).reconnect();
            assert_eq!(exchange_with(&context, &neighbor), SyncAttempt::Failed);
            assert_eq!(neighbor.consecutive_failures(), expected);
        }
        assert!(should_back_off(&context, &neighbor, SyncAttempt::Failed));
        assert_eq!(node.connections.connection(NodeId(0)).disconnects(), 3);

        // A disconnected peer counts as a failure too, without an exchange.
        assert_eq!(exchange_with(&context, &neighbor), SyncAttempt::NoConnection);
        assert_eq!(node.synchronizer.exchanges_with(NodeId(0)), 3);
    }

    #[test]
    fn test_fallen_behind_outcome_is_reported() {
        let node = MockNode::new(3);
        let context = context(&node, GossipSyncConfig::dev_default());
        node.synchronizer.script(
            NodeId(2),
            MockExchange::Outcome(ExchangeOutcome::SelfFallenBehind),
        );
        let neighbor = context.neighbors.get(NodeId(2)).unwrap();
        exchange_with(&context, &neighbor);
        assert!(context.tracker.has_reported(NodeId(2)));
        assert!(context.tracker.has_fallen_behind());
    }

    #[test]
    fn test_select_protocol_priorities() {
        let node = MockNode::new(2);
        let context = context(&node, GossipSyncConfig::dev_default());
        let neighbor = context.neighbors.get(NodeId(0)).unwrap();
        let now = Instant::now();

        assert_eq!(
            NegotiatedStrategy::select_protocol(&context, &neighbor, now),
            Some(PeerProtocol::Heartbeat)
        );
        neighbor.record_heartbeat(now);
        assert_eq!(
            NegotiatedStrategy::select_protocol(&context, &neighbor, now),
            Some(PeerProtocol::Sync)
        );

        context.tracker.report_fallen_behind(NodeId(0));
        assert_eq!(
            NegotiatedStrategy::select_protocol(&context, &neighbor, now),
            Some(PeerProtocol::Reconnect)
        );

        context.reconnect.request_emergency_reconnect(9);
        assert_eq!(
            NegotiatedStrategy::select_protocol(&context, &neighbor, now),
            Some(PeerProtocol::EmergencyReconnect)
        );

        context.lifecycle.hold();
        assert_eq!(NegotiatedStrategy::select_protocol(&context, &neighbor, now), None);
    }

    #[test]
    fn test_select_protocol_throttled() {
        let node = MockNode::new(1);
        let context = context(&node, GossipSyncConfig::dev_default());
        let neighbor = context.neighbors.get(NodeId(0)).unwrap();
        let now = Instant::now();
        neighbor.record_heartbeat(now);
        node.backlog.store(5_000, Ordering::SeqCst);
        assert_eq!(NegotiatedStrategy::select_protocol(&context, &neighbor, now), None);
    }

    #[test]
    fn test_negotiated_sync_holds_permit_only_for_exchange() {
        let node = MockNode::new(1);
        let context = context(&node, GossipSyncConfig::dev_default());
        let neighbor = context.neighbors.get(NodeId(0)).unwrap();
        assert_eq!(
            NegotiatedStrategy::sync(&context, &neighbor),
            Some(SyncAttempt::Exchanged(ExchangeOutcome::Accepted))
        );
        assert_eq!(context.pool.in_use(), 0);

        let _held = neighbor.try_lock_connection().unwrap();
        assert_eq!(NegotiatedStrategy::sync(&context, &neighbor), None);
        assert_eq!(context.pool.in_use(), 0);
    }

    #[test]
    fn test_heartbeat_skips_busy_connection() {
        let node = MockNode::new(1);
        let context = context(&node, GossipSyncConfig::dev_default());
        let neighbor = context.neighbors.get(NodeId(0)).unwrap();
        {
            let _held = neighbor.try_lock_connection().unwrap();
            NegotiatedStrategy::heartbeat(&context, &neighbor);
        }
        assert_eq!(node.synchronizer.heartbeats(), 0);
        NegotiatedStrategy::heartbeat(&context, &neighbor);
        assert_eq!(node.synchronizer.heartbeats(), 1);
        assert!(!neighbor.heartbeat_due(Instant::now(), context.config.heartbeat_period()));
    }

    #[test]
    fn test_unconfirmed_peers_synced_first() {
        let node = MockNode::new(5);
        let mut config = GossipSyncConfig::dev_default();
        config.fallen_behind_threshold = FallenBehindThreshold::MinPeers(3);
        let context = context(&node, config);
        let mut peers: Vec<_> = (0..5).map(NodeId).collect();

        CallerPullStrategy::prioritize_unconfirmed(&context, &mut peers);
        assert_eq!(peers, (0..5).map(NodeId).collect::<Vec<_>>());

        context.tracker.report_fallen_behind(NodeId(0));
        context.tracker.report_fallen_behind(NodeId(3));
        CallerPullStrategy::prioritize_unconfirmed(&context, &mut peers);
        assert_eq!(
            peers,
            vec![NodeId(1), NodeId(2), NodeId(4), NodeId(0), NodeId(3)]
        );

        // Once behind, the order no longer matters.
        context.tracker.report_fallen_behind(NodeId(1));
        let mut peers: Vec<_> = (0..5).rev().map(NodeId).collect();
        CallerPullStrategy::prioritize_unconfirmed(&context, &mut peers);
        assert_eq!(peers, (0..5).rev().map(NodeId).collect::<Vec<_>>());
    }

    #[test]
    fn test_reconnect_slot_serves_emergency_request() {
        let node = MockNode::new(2);
        let context = context(&node, GossipSyncConfig::dev_default());
        node.snapshots.set_peer(NodeId(1), MockPeerState::Offers { round: 12 });

        CallerPullStrategy::reconnect_if_needed(&context);
        assert!(node.installer.installed().is_empty());

        context.reconnect.request_emergency_reconnect(10);
        CallerPullStrategy::reconnect_if_needed(&context);
        assert_eq!(node.installer.installed(), vec![12]);
        assert_eq!(context.reconnect.emergency_round(), None);
        assert!(!context.lifecycle.is_halted());
    }
}
