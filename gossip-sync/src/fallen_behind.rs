//! Aggregation of "you have fallen behind" reports.
//!
//! Detecting that a peer is ahead of us by more than the exchange protocol
//! can bridge is the synchronizer's job. It tells us by returning
//! [`ExchangeOutcome::SelfFallenBehind`], and the worker forwards that here.
//! The [`FallenBehindTracker`] only decides, from the set of peers that said
//! so, whether the node as a whole is behind and who to reconnect from.
//!
//! ```text
//!            threshold met              reconnect succeeded
//!   NORMAL ────────────────▶ BEHIND ─────────────────────▶ NORMAL
//!                             │  ▲
//!                             └──┘ candidates exhausted (retry after back-off)
//! ```
//!
//! [`ExchangeOutcome::SelfFallenBehind`]: crate::types::ExchangeOutcome::SelfFallenBehind

use {
    crate::{
        collaborators::Topology,
        config::FallenBehindThreshold,
        status::{StatusReporter, SyncStatus},
        types::NodeId,
    },
    log::{debug, info},
    rand::seq::SliceRandom,
    std::{
        collections::HashSet,
        sync::{Arc, Mutex, MutexGuard},
    },
};

pub struct FallenBehindTracker {
    neighbors: Vec<NodeId>,
    threshold: FallenBehindThreshold,
    topology: Arc<dyn Topology>,
    status: Arc<dyn StatusReporter>,
    /// Neighbors currently reporting us behind.
    reported: Mutex<HashSet<NodeId>>,
}

impl FallenBehindTracker {
    pub fn new(
        topology: Arc<dyn Topology>,
        threshold: FallenBehindThreshold,
        status: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            neighbors: topology.neighbors(),
            threshold,
            topology,
            status,
            reported: Mutex::new(HashSet::new()),
        }
    }

    fn lock_reported(&self) -> MutexGuard<'_, HashSet<NodeId>> {
        self.reported.lock().unwrap()
    }

    fn threshold_met(&self, reported: usize) -> bool {
        match self.threshold {
            FallenBehindThreshold::AnyPeer => reported >= 1,
            FallenBehindThreshold::MinPeers(min) => reported >= min,
            FallenBehindThreshold::FractionOfNeighbors(fraction) => {
                reported as f64 > fraction * self.neighbors.len() as f64
            }
        }
    }

    /// Record that `peer` says we are behind. Repeated reports from the same
    /// peer are no-ops.
    ///
    /// Returns `true` if this report tipped the node from normal to behind.
    pub fn report_fallen_behind(&self, peer: NodeId) -> bool {
        if !self.neighbors.contains(&peer) {
            debug!("ignoring fallen-behind report from non-neighbor {peer}");
            return false;
        }
        let mut reported = self.lock_reported();
        let was_behind = self.threshold_met(reported.len());
        if !reported.insert(peer) {
            return false;
        }
        let num_reported = reported.len();
        drop(reported);

        let became_behind = !was_behind && self.threshold_met(num_reported);
        if became_behind {
            self.status.report(SyncStatus::Behind {
                reported: num_reported,
                neighbors: self.neighbors.len(),
            });
        } else {
            debug!("{peer} reports us behind ({num_reported} reports)");
        }
        became_behind
    }

    /// Forget every report. Only called once we are known to be caught up
    /// again.
    pub fn reset_fallen_behind(&self) {
        let mut reported = self.lock_reported();
        if !reported.is_empty() {
            info!("clearing {} fallen-behind reports", reported.len());
            reported.clear();
        }
    }

    pub fn has_fallen_behind(&self) -> bool {
        let num_reported = self.lock_reported().len();
        self.threshold_met(num_reported)
    }

    pub fn num_reported_fallen_behind(&self) -> usize {
        self.lock_reported().len()
    }

    pub fn has_reported(&self, peer: NodeId) -> bool {
        self.lock_reported().contains(&peer)
    }

    /// Peers to try a reconnect from, in random order.
    ///
    /// Only peers that reported us behind are candidates: they are known to
    /// be ahead of us.
    pub fn neighbors_for_reconnect(&self) -> Vec<NodeId> {
        let mut candidates: Vec<NodeId> = self.lock_reported().iter().copied().collect();
        candidates.retain(|peer| self.topology.should_reconnect_from(*peer));
        candidates.shuffle(&mut rand::rng());
        candidates
    }

    /// Neighbors that have not reported us behind yet. Syncing with them
    /// confirms or refutes the reports we already have.
    pub fn needed_for_fallen_behind(&self) -> Vec<NodeId> {
        let reported = self.lock_reported();
        self.neighbors
            .iter()
            .filter(|peer| !reported.contains(peer))
            .copied()
            .collect()
    }

    /// Whether a reconnect from `peer` makes sense right now.
    pub fn should_reconnect_from(&self, peer: NodeId) -> bool {
        let eligible = {
            let reported = self.lock_reported();
            self.threshold_met(reported.len()) && reported.contains(&peer)
        };
        eligible && self.topology.should_reconnect_from(peer)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::test_utils::{RecordingStatusReporter, StaticTopology},
        test_case::test_case,
    };

    fn tracker(
        num_neighbors: u64,
        threshold: FallenBehindThreshold,
    ) -> (FallenBehindTracker, Arc<RecordingStatusReporter>) {
        let status = Arc::new(RecordingStatusReporter::default());
        let topology = Arc::new(StaticTopology::new(num_neighbors));
        (
            FallenBehindTracker::new(topology, threshold, status.clone()),
            status,
        )
    }

    #[test]
    fn test_two_reports_then_reset() {
        let (tracker, _status) = tracker(4, FallenBehindThreshold::MinPeers(2));
        assert!(!tracker.has_fallen_behind());
        tracker.report_fallen_behind(NodeId(0));
        assert!(!tracker.has_fallen_behind());
        tracker.report_fallen_behind(NodeId(1));
        assert!(tracker.has_fallen_behind());
        tracker.reset_fallen_behind();
        assert!(!tracker.has_fallen_behind());
        assert_eq!(tracker.num_reported_fallen_behind(), 0);
    }

    #[test]
    fn test_report_is_idempotent() {
        let (tracker, _status) = tracker(4, FallenBehindThreshold::MinPeers(2));
        tracker.report_fallen_behind(NodeId(2));
        tracker.report_fallen_behind(NodeId(2));
        tracker.report_fallen_behind(NodeId(2));
        assert_eq!(tracker.num_reported_fallen_behind(), 1);
        assert!(!tracker.has_fallen_behind());
        assert!(tracker.has_reported(NodeId(2)));
    }

    #[test_case(FallenBehindThreshold::AnyPeer, 1 ; "any peer")]
    #[test_case(FallenBehindThreshold::MinPeers(3), 3 ; "min peers")]
    #[test_case(FallenBehindThreshold::FractionOfNeighbors(0.5), 4 ; "more than half of six")]
    fn test_threshold_policy(threshold: FallenBehindThreshold, reports_needed: u64) {
        let (tracker, status) = tracker(6, threshold);
        for peer in 0..reports_needed.saturating_sub(1) {
            assert!(!tracker.report_fallen_behind(NodeId(peer)));
            assert!(!tracker.has_fallen_behind());
        }
        assert!(tracker.report_fallen_behind(NodeId(reports_needed.saturating_sub(1))));
        assert!(tracker.has_fallen_behind());
        // The transition is published once, not for every later report.
        tracker.report_fallen_behind(NodeId(5));
        assert_eq!(status.behind_count(), 1);
    }

    #[test]
    fn test_non_neighbor_report_ignored() {
        let (tracker, _status) = tracker(2, FallenBehindThreshold::AnyPeer);
        assert!(!tracker.report_fallen_behind(NodeId(42)));
        assert!(!tracker.has_fallen_behind());
    }

    #[test]
    fn test_reconnect_candidates_are_reporters() {
        let (tracker, _status) = tracker(5, FallenBehindThreshold::AnyPeer);
        tracker.report_fallen_behind(NodeId(1));
        tracker.report_fallen_behind(NodeId(3));
        let mut candidates = tracker.neighbors_for_reconnect();
        candidates.sort();
        assert_eq!(candidates, vec![NodeId(1), NodeId(3)]);
        assert_eq!(
            tracker.needed_for_fallen_behind(),
            vec![NodeId(0), NodeId(2), NodeId(4)]
        );
    }

    #[test]
    fn test_should_reconnect_from() {
        let (tracker, _status) = tracker(4, FallenBehindThreshold::MinPeers(2));
        tracker.report_fallen_behind(NodeId(0));
        // Not behind yet.
        assert!(!tracker.should_reconnect_from(NodeId(0)));
        tracker.report_fallen_behind(NodeId(1));
        assert!(tracker.should_reconnect_from(NodeId(0)));
        assert!(!tracker.should_reconnect_from(NodeId(2)));
    }

    #[test]
    fn test_topology_veto() {
        let status = Arc::new(RecordingStatusReporter::default());
        let topology = Arc::new(StaticTopology::new(3).with_blocked(NodeId(1)));
        let tracker = FallenBehindTracker::new(topology, FallenBehindThreshold::AnyPeer, status);
        tracker.report_fallen_behind(NodeId(1));
        tracker.report_fallen_behind(NodeId(2));
        assert!(!tracker.should_reconnect_from(NodeId(1)));
        assert_eq!(tracker.neighbors_for_reconnect(), vec![NodeId(2)]);
    }
}
