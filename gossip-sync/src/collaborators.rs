//! Interfaces to the parts of the node this crate coordinates but does not
//! implement: the exchange protocol, connection handling, the intake
//! pipeline, snapshot transfer and the address book.

use {
    crate::{
        error::ExchangeError,
        status::StatusReporter,
        types::{ExchangeOutcome, NodeId},
    },
    std::{fmt::Debug, sync::Arc},
};

/// A live (or formerly live) connection to one peer.
pub trait Connection: Debug + Send + Sync {
    fn peer_id(&self) -> NodeId;
    fn connected(&self) -> bool;
    /// Tear the connection down. Must be safe to call more than once.
    fn disconnect(&self);
}

pub trait ConnectionManager: Send + Sync {
    /// The current connection to `peer`, if one has been established.
    fn get_connection(&self, peer: NodeId) -> Option<Arc<dyn Connection>>;
}

/// The event-graph exchange protocol.
pub trait Synchronizer: Send + Sync {
    /// Run one exchange over `connection`. Newly learned events go straight
    /// to the intake pipeline; only the outcome comes back here.
    fn exchange(&self, connection: &dyn Connection) -> Result<ExchangeOutcome, ExchangeError>;

    /// Liveness probe sent when a peer has been quiet for a heartbeat period.
    fn heartbeat(&self, _connection: &dyn Connection) -> Result<(), ExchangeError> {
        Ok(())
    }
}

/// Depth of the event intake pipeline.
pub type IntakeBacklog = Arc<dyn Fn() -> usize + Send + Sync>;

/// A state snapshot pinned in memory on our behalf. The holder must call
/// [`release`](ReservedState::release) exactly once.
pub trait ReservedState: Debug + Send {
    /// Consensus round the snapshot was taken at.
    fn round(&self) -> u64;
    fn release(&mut self);
}

/// Owned handle to a received snapshot, or to nothing if the peer had no
/// state to offer.
///
/// The underlying [`ReservedState`] is released exactly once: either by an
/// explicit [`release`](Self::release) or when the handle is dropped, which
/// covers early returns and unwinding alike.
#[derive(Debug)]
#[must_use = "dropping a reservation releases the snapshot"]
pub struct StateReservation {
    state: Option<Box<dyn ReservedState>>,
}

impl StateReservation {
    pub fn new(state: Box<dyn ReservedState>) -> Self {
        Self { state: Some(state) }
    }

    /// A reservation that holds nothing.
    pub fn null() -> Self {
        Self { state: None }
    }

    pub fn is_null(&self) -> bool {
        self.state.is_none()
    }

    pub fn state(&self) -> Option<&dyn ReservedState> {
        self.state.as_deref()
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(mut state) = self.state.take() {
            state.release();
        }
    }
}

impl Drop for StateReservation {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Learner side of the snapshot transfer protocol.
pub trait SnapshotTransport: Send + Sync {
    /// Ask the peer whether it is willing to send us its state.
    fn request_reconnect(&self, connection: &dyn Connection) -> Result<bool, ExchangeError>;

    /// Receive the peer's latest state.
    fn receive_state(&self, connection: &dyn Connection)
        -> Result<StateReservation, ExchangeError>;
}

pub trait SnapshotValidator: Send + Sync {
    /// Check signatures and hashes of a received snapshot.
    fn validate(&self, state: &dyn ReservedState) -> Result<(), String>;
}

pub trait StateInstaller: Send + Sync {
    /// Replace local state with `state`. Anything that must outlive the
    /// reservation has to be copied out here.
    fn install(&self, state: &dyn ReservedState) -> Result<(), String>;
}

/// Read-only view of the address book.
pub trait Topology: Send + Sync {
    fn neighbors(&self) -> Vec<NodeId>;

    /// Whether `peer` may serve us a reconnect state.
    fn should_reconnect_from(&self, _peer: NodeId) -> bool {
        true
    }
}

/// Everything the controller needs from the rest of the node.
#[derive(Clone)]
pub struct Collaborators {
    pub synchronizer: Arc<dyn Synchronizer>,
    pub connections: Arc<dyn ConnectionManager>,
    pub intake_backlog: IntakeBacklog,
    pub snapshots: Arc<dyn SnapshotTransport>,
    pub validator: Arc<dyn SnapshotValidator>,
    pub installer: Arc<dyn StateInstaller>,
    pub topology: Arc<dyn Topology>,
    pub status: Arc<dyn StatusReporter>,
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    #[derive(Debug)]
    struct CountingState(Arc<AtomicUsize>);

    impl ReservedState for CountingState {
        fn round(&self) -> u64 {
            7
        }

        fn release(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn reservation() -> (StateReservation, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        (
            StateReservation::new(Box::new(CountingState(releases.clone()))),
            releases,
        )
    }

    #[test]
    fn test_explicit_release_happens_once() {
        let (reservation, releases) = reservation();
        assert!(!reservation.is_null());
        assert_eq!(reservation.state().map(|state| state.round()), Some(7));
        reservation.release();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases() {
        let (reservation, releases) = reservation();
        drop(reservation);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unwind_releases() {
        let (reservation, releases) = reservation();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _reservation = reservation;
            panic!("install blew up");
        }));
        assert!(result.is_err());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_null_reservation() {
        let reservation = StateReservation::null();
        assert!(reservation.is_null());
        assert!(reservation.state().is_none());
        reservation.release();
    }
}
