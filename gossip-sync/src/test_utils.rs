//! In-memory collaborators for exercising the control plane without a
//! network.

use {
    crate::{
        collaborators::{
            Collaborators, Connection, ConnectionManager, ReservedState, SnapshotTransport,
            SnapshotValidator, StateInstaller, StateReservation, Synchronizer, Topology,
        },
        error::ExchangeError,
        status::{StatusReporter, SyncStatus},
        types::{ExchangeOutcome, NodeId},
    },
    std::{
        collections::{HashMap, HashSet},
        io,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Mutex,
        },
        thread,
        time::Duration,
    },
};

/// Neighbors `0..n`, optionally with some peers barred from serving
/// reconnects.
#[derive(Debug, Default)]
pub struct StaticTopology {
    neighbors: Vec<NodeId>,
    blocked: HashSet<NodeId>,
}

impl StaticTopology {
    pub fn new(num_neighbors: u64) -> Self {
        Self {
            neighbors: (0..num_neighbors).map(NodeId).collect(),
            blocked: HashSet::new(),
        }
    }

    pub fn with_blocked(mut self, peer: NodeId) -> Self {
        self.blocked.insert(peer);
        self
    }
}

impl Topology for StaticTopology {
    fn neighbors(&self) -> Vec<NodeId> {
        self.neighbors.clone()
    }

    fn should_reconnect_from(&self, peer: NodeId) -> bool {
        !self.blocked.contains(&peer)
    }
}

#[derive(Debug, Default)]
pub struct RecordingStatusReporter {
    statuses: Mutex<Vec<SyncStatus>>,
}

impl RecordingStatusReporter {
    pub fn statuses(&self) -> Vec<SyncStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn behind_count(&self) -> usize {
        self.statuses()
            .iter()
            .filter(|status| matches!(status, SyncStatus::Behind { .. }))
            .count()
    }
}

impl StatusReporter for RecordingStatusReporter {
    fn report(&self, status: SyncStatus) {
        self.statuses.lock().unwrap().push(status);
    }
}

#[derive(Debug)]
pub struct MockConnection {
    peer: NodeId,
    connected: AtomicBool,
    disconnects: AtomicUsize,
}

impl MockConnection {
    pub fn new(peer: NodeId) -> Self {
        Self {
            peer,
            connected: AtomicBool::new(true),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }
}

impl Connection for MockConnection {
    fn peer_id(&self) -> NodeId {
        self.peer
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// One connection per peer. Disconnected connections stay disconnected
/// until [`MockConnection::reconnect`] is called, unless auto-reconnect is
/// on, in which case every lookup brings the connection back.
#[derive(Debug, Default)]
pub struct MockConnectionManager {
    connections: HashMap<NodeId, Arc<MockConnection>>,
    auto_reconnect: AtomicBool,
}

impl MockConnectionManager {
    pub fn new(peers: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            connections: peers
                .into_iter()
                .map(|peer| (peer, Arc::new(MockConnection::new(peer))))
                .collect(),
            auto_reconnect: AtomicBool::new(false),
        }
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    pub fn connection(&self, peer: NodeId) -> Arc<MockConnection> {
        self.connections[&peer].clone()
    }
}

impl ConnectionManager for MockConnectionManager {
    fn get_connection(&self, peer: NodeId) -> Option<Arc<dyn Connection>> {
        let connection = self.connections.get(&peer)?;
        if self.auto_reconnect.load(Ordering::SeqCst) {
            connection.reconnect();
        }
        Some(connection.clone() as Arc<dyn Connection>)
    }
}

/// Scripted behavior of a [`MockSynchronizer`] towards one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockExchange {
    Outcome(ExchangeOutcome),
    IoError,
    ProtocolError,
}

#[derive(Debug, Default)]
pub struct MockSynchronizer {
    default: Mutex<Option<MockExchange>>,
    scripts: Mutex<HashMap<NodeId, MockExchange>>,
    delay: Duration,
    exchanges: Mutex<HashMap<NodeId, usize>>,
    heartbeats: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockSynchronizer {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Behavior for peers without a script. Defaults to `Accepted`.
    pub fn set_default(&self, behavior: MockExchange) {
        *self.default.lock().unwrap() = Some(behavior);
    }

    pub fn script(&self, peer: NodeId, behavior: MockExchange) {
        self.scripts.lock().unwrap().insert(peer, behavior);
    }

    pub fn exchanges_with(&self, peer: NodeId) -> usize {
        self.exchanges
            .lock()
            .unwrap()
            .get(&peer)
            .copied()
            .unwrap_or_default()
    }

    pub fn total_exchanges(&self) -> usize {
        self.exchanges.lock().unwrap().values().sum()
    }

    pub fn heartbeats(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// Highest number of exchanges ever observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl Synchronizer for MockSynchronizer {
    fn exchange(&self, connection: &dyn Connection) -> Result<ExchangeOutcome, ExchangeError> {
        let peer = connection.peer_id();
        let active = self.active.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.max_active.fetch_max(active, Ordering::SeqCst);
        {
            let mut exchanges = self.exchanges.lock().unwrap();
            let count = exchanges.entry(peer).or_default();
            *count = count.saturating_add(1);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let behavior = self
            .scripts
            .lock()
            .unwrap()
            .get(&peer)
            .copied()
            .or(*self.default.lock().unwrap())
            .unwrap_or(MockExchange::Outcome(ExchangeOutcome::Accepted));
        match behavior {
            MockExchange::Outcome(outcome) => Ok(outcome),
            MockExchange::IoError => {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset").into())
            }
            MockExchange::ProtocolError => Err(ExchangeError::Protocol("bad frame".to_string())),
        }
    }

    fn heartbeat(&self, _connection: &dyn Connection) -> Result<(), ExchangeError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Snapshot handle that counts its own releases.
#[derive(Debug)]
pub struct MockReservedState {
    round: u64,
    releases: Arc<AtomicUsize>,
}

impl ReservedState for MockReservedState {
    fn round(&self) -> u64 {
        self.round
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// What a peer does when asked for its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockPeerState {
    Declines,
    NoState,
    Offers { round: u64 },
    TransferFails,
}

#[derive(Debug, Default)]
pub struct MockSnapshotTransport {
    peers: Mutex<HashMap<NodeId, MockPeerState>>,
    reserved: AtomicUsize,
    releases: Arc<AtomicUsize>,
}

impl MockSnapshotTransport {
    pub fn set_peer(&self, peer: NodeId, state: MockPeerState) {
        self.peers.lock().unwrap().insert(peer, state);
    }

    /// Non-null reservations handed out so far.
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn peer_state(&self, peer: NodeId) -> MockPeerState {
        self.peers
            .lock()
            .unwrap()
            .get(&peer)
            .copied()
            .unwrap_or(MockPeerState::Declines)
    }
}

impl SnapshotTransport for MockSnapshotTransport {
    fn request_reconnect(&self, connection: &dyn Connection) -> Result<bool, ExchangeError> {
        Ok(self.peer_state(connection.peer_id()) != MockPeerState::Declines)
    }

    fn receive_state(
        &self,
        connection: &dyn Connection,
    ) -> Result<StateReservation, ExchangeError> {
        match self.peer_state(connection.peer_id()) {
            MockPeerState::Declines | MockPeerState::NoState => Ok(StateReservation::null()),
            MockPeerState::TransferFails => Err(ExchangeError::Timeout(100)),
            MockPeerState::Offers { round } => {
                self.reserved.fetch_add(1, Ordering::SeqCst);
                Ok(StateReservation::new(Box::new(MockReservedState {
                    round,
                    releases: self.releases.clone(),
                })))
            }
        }
    }
}

/// Rejects snapshots whose round is in the bad set.
#[derive(Debug, Default)]
pub struct MockValidator {
    bad_rounds: Mutex<HashSet<u64>>,
}

impl MockValidator {
    pub fn reject_round(&self, round: u64) {
        self.bad_rounds.lock().unwrap().insert(round);
    }
}

impl SnapshotValidator for MockValidator {
    fn validate(&self, state: &dyn ReservedState) -> Result<(), String> {
        if self.bad_rounds.lock().unwrap().contains(&state.round()) {
            Err(format!("bad signature on round {}", state.round()))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
pub struct MockInstaller {
    installed: Mutex<Vec<u64>>,
    fail: AtomicBool,
    panic_next: AtomicBool,
    delay: Mutex<Duration>,
}

impl MockInstaller {
    pub fn installed(&self) -> Vec<u64> {
        self.installed.lock().unwrap().clone()
    }

    pub fn fail_installs(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Make the next install panic instead of returning.
    pub fn panic_on_next_install(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    /// Make every install take at least `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

impl StateInstaller for MockInstaller {
    fn install(&self, state: &dyn ReservedState) -> Result<(), String> {
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("installer crashed on round {}", state.round());
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err("disk full".to_string());
        }
        self.installed.lock().unwrap().push(state.round());
        Ok(())
    }
}

/// A full set of mocks wired for `num_peers` neighbors.
pub struct MockNode {
    pub topology: Arc<StaticTopology>,
    pub connections: Arc<MockConnectionManager>,
    pub synchronizer: Arc<MockSynchronizer>,
    pub snapshots: Arc<MockSnapshotTransport>,
    pub validator: Arc<MockValidator>,
    pub installer: Arc<MockInstaller>,
    pub status: Arc<RecordingStatusReporter>,
    pub backlog: Arc<AtomicUsize>,
}

impl MockNode {
    pub fn new(num_peers: u64) -> Self {
        Self::with_synchronizer(num_peers, MockSynchronizer::default())
    }

    pub fn with_synchronizer(num_peers: u64, synchronizer: MockSynchronizer) -> Self {
        let topology = Arc::new(StaticTopology::new(num_peers));
        Self {
            connections: Arc::new(MockConnectionManager::new(topology.neighbors())),
            topology,
            synchronizer: Arc::new(synchronizer),
            snapshots: Arc::new(MockSnapshotTransport::default()),
            validator: Arc::new(MockValidator::default()),
            installer: Arc::new(MockInstaller::default()),
            status: Arc::new(RecordingStatusReporter::default()),
            backlog: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        let backlog = self.backlog.clone();
        Collaborators {
            synchronizer: self.synchronizer.clone(),
            connections: self.connections.clone(),
            intake_backlog: Arc::new(move || backlog.load(Ordering::SeqCst)),
            snapshots: self.snapshots.clone(),
            validator: self.validator.clone(),
            installer: self.installer.clone(),
            topology: self.topology.clone(),
            status: self.status.clone(),
        }
    }
}
