//! Publishing of fallen-behind and reconnect transitions.

use {
    crate::types::NodeId,
    log::{error, info, warn},
    solana_metrics::{datapoint_info, datapoint_warn},
};

/// A lifecycle transition worth telling the rest of the node about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// Enough peers report us behind that incremental sync is hopeless.
    Behind { reported: usize, neighbors: usize },
    /// Ordinary syncing is paused while a reconnect runs.
    Reconnecting { candidates: usize },
    /// A snapshot from `peer` was installed.
    Reconnected { peer: NodeId, round: u64 },
    /// Every candidate failed; another attempt will follow after back-off.
    ReconnectFailed {
        attempts: usize,
        consecutive_failures: u32,
    },
    /// Reconnect has failed too many times in a row.
    ReconnectFailuresExceeded { consecutive_failures: u32 },
}

pub trait StatusReporter: Send + Sync {
    fn report(&self, status: SyncStatus);
}

/// Logs every transition and emits a metrics datapoint for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DatapointStatusReporter;

impl StatusReporter for DatapointStatusReporter {
    fn report(&self, status: SyncStatus) {
        match status {
            SyncStatus::Behind {
                reported,
                neighbors,
            } => {
                warn!("fallen behind: {reported} of {neighbors} neighbors report us behind");
                datapoint_warn!(
                    "gossip-sync-fallen-behind",
                    ("reported", reported as i64, i64),
                    ("neighbors", neighbors as i64, i64),
                );
            }
            SyncStatus::Reconnecting { candidates } => {
                info!("starting reconnect with {candidates} candidates");
                datapoint_info!(
                    "gossip-sync-reconnect-start",
                    ("candidates", candidates as i64, i64),
                );
            }
            SyncStatus::Reconnected { peer, round } => {
                info!("reconnect complete: installed round {round} from {peer}");
                datapoint_info!(
                    "gossip-sync-reconnected",
                    ("peer", peer.0 as i64, i64),
                    ("round", round as i64, i64),
                );
            }
            SyncStatus::ReconnectFailed {
                attempts,
                consecutive_failures,
            } => {
                warn!(
                    "reconnect failed after {attempts} candidates \
                     ({consecutive_failures} consecutive failures)"
                );
                datapoint_warn!(
                    "gossip-sync-reconnect-failed",
                    ("attempts", attempts as i64, i64),
                    ("consecutive_failures", i64::from(consecutive_failures), i64),
                );
            }
            SyncStatus::ReconnectFailuresExceeded {
                consecutive_failures,
            } => {
                error!(
                    "reconnect has failed {consecutive_failures} times in a row; \
                     node is stuck behind"
                );
                datapoint_warn!(
                    "gossip-sync-reconnect-stuck",
                    ("consecutive_failures", i64::from(consecutive_failures), i64),
                );
            }
        }
    }
}
