//! Small value types shared across the crate.

use std::fmt;

/// Address-book index of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Result of a completed exchange with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// Both sides went through with the exchange.
    Accepted,
    /// The peer was busy or otherwise declined this round.
    Declined,
    /// The peer told us we are too far behind to catch up incrementally.
    SelfFallenBehind,
    /// The peer is too far behind *us*; nothing for this layer to do.
    PeerFallenBehind,
}
