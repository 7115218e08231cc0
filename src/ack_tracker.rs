use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::site::SiteId;

/// Acknowledgment threshold for a stability frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StabilityThreshold {
    /// at least one live remote site acknowledged
    One,
    /// at least ceil((n+1)/2) of the n live remote sites acknowledged
    Majority,
    /// every live remote site acknowledged
    All,
}

/// Fired once per sequence number a frontier advances past, with the newly
///  stable sequence number and a snapshot of the per-site acked-message
///  counters (the "WAN SST" view of how far each remote site has caught up).
pub type StabilityCallback = Box<dyn Fn(u64, &FxHashMap<SiteId, u64>) + Send + Sync>;

/// Tracks, per sent message, which remote sites have acknowledged it, and
///  maintains the three stability frontiers incrementally as acks arrive.
///
/// A frontier is the largest sequence number N such that every message with a
///  sequence number <= N meets the frontier's threshold. Frontiers advance as
///  a contiguous prefix and never skip a hole: a message with too few acks
///  blocks all frontier advancement above it until it catches up. They are
///  monotonically non-decreasing.
///
/// All mutation goes through one owner (the sender agent guards the tracker
///  with a single mutex) - the check-then-advance update pattern is not safe
///  under concurrent access.
pub struct AckTracker {
    /// seq -> sites that acknowledged it. Entries are only added to, until
    ///  [AckTracker::prune_stable] drops them below the all-ack frontier.
    ack_table: BTreeMap<u64, FxHashSet<SiteId>>,
    /// remote sites still participating in frontier denominators
    live_sites: FxHashSet<SiteId>,
    /// number of messages acked per remote site, the snapshot handed to callbacks
    message_counters: FxHashMap<SiteId, u64>,

    one_ack_frontier: Option<u64>,
    majority_ack_frontier: Option<u64>,
    all_ack_frontier: Option<u64>,

    /// the sequence number the next call to [AckTracker::record_pending] must use
    next_pending: u64,

    one_callbacks: Vec<StabilityCallback>,
    majority_callbacks: Vec<StabilityCallback>,
    all_callbacks: Vec<StabilityCallback>,
}

impl AckTracker {
    pub fn new(remote_sites: impl IntoIterator<Item = SiteId>) -> AckTracker {
        let live_sites: FxHashSet<SiteId> = remote_sites.into_iter().collect();
        let message_counters = live_sites.iter()
            .map(|&site| (site, 0))
            .collect();

        AckTracker {
            ack_table: BTreeMap::new(),
            live_sites,
            message_counters,
            one_ack_frontier: None,
            majority_ack_frontier: None,
            all_ack_frontier: None,
            next_pending: 0,
            one_callbacks: Vec::new(),
            majority_callbacks: Vec::new(),
            all_callbacks: Vec::new(),
        }
    }

    /// Registers a pending message at send time, before any ack for it can
    ///  arrive. Sequence numbers must be registered in order without gaps.
    pub fn record_pending(&mut self, seq: u64) {
        debug_assert_eq!(seq, self.next_pending, "sequence numbers must be registered in order");
        self.ack_table.insert(seq, FxHashSet::default());
        self.next_pending = seq + 1;
    }

    /// Records that `site` acknowledged `seq` and advances the frontiers.
    ///
    /// Idempotent: a duplicate ack from the same site is a no-op. An ack for a
    ///  sequence number that was never registered, or that was already pruned,
    ///  is logged and ignored.
    pub fn record_ack(&mut self, seq: u64, site: SiteId) {
        if !self.live_sites.contains(&site) {
            debug!("ignoring ack from dead site {} for seq {}", site, seq);
            return;
        }

        match self.ack_table.get_mut(&seq) {
            Some(acks) => {
                if !acks.insert(site) {
                    // duplicate delivery of the same ack
                    return;
                }
                *self.message_counters.entry(site).or_default() += 1;
                self.recompute_frontiers();
            }
            None => {
                if seq < self.next_pending {
                    debug!("ignoring ack from site {} for already-pruned seq {}", site, seq);
                }
                else {
                    warn!("ignoring ack from site {} for unknown seq {}", site, seq);
                }
            }
        }
    }

    /// Removes a site from frontier computation entirely: it leaves the
    ///  denominators, and its recorded acks no longer count towards any
    ///  threshold. Frontiers it already advanced stay where they are
    ///  (monotonicity), but the all-ack frontier no longer waits for it -
    ///  otherwise a single broken peer would stall the frontier forever.
    pub fn mark_site_dead(&mut self, site: SiteId) {
        if self.live_sites.remove(&site) {
            warn!("site {} removed from frontier computation, {} live remote sites remain", site, self.live_sites.len());
            self.recompute_frontiers();
        }
    }

    /// Drops ack-table entries at or below the all-ack frontier. Pure memory
    ///  reclamation: those entries can never influence a frontier again.
    pub fn prune_stable(&mut self) {
        if let Some(frontier) = self.all_ack_frontier {
            if frontier < u64::MAX {
                self.ack_table = self.ack_table.split_off(&(frontier + 1));
            }
        }
    }

    pub fn register_callback(&mut self, threshold: StabilityThreshold, callback: StabilityCallback) {
        match threshold {
            StabilityThreshold::One => self.one_callbacks.push(callback),
            StabilityThreshold::Majority => self.majority_callbacks.push(callback),
            StabilityThreshold::All => self.all_callbacks.push(callback),
        }
    }

    pub fn frontier(&self, threshold: StabilityThreshold) -> Option<u64> {
        match threshold {
            StabilityThreshold::One => self.one_ack_frontier,
            StabilityThreshold::Majority => self.majority_ack_frontier,
            StabilityThreshold::All => self.all_ack_frontier,
        }
    }

    pub fn one_ack_frontier(&self) -> Option<u64> {
        self.one_ack_frontier
    }

    pub fn majority_ack_frontier(&self) -> Option<u64> {
        self.majority_ack_frontier
    }

    pub fn all_ack_frontier(&self) -> Option<u64> {
        self.all_ack_frontier
    }

    pub fn is_live(&self, site: SiteId) -> bool {
        self.live_sites.contains(&site)
    }

    /// true if `site` has not yet acknowledged every registered message
    pub fn has_unacked_messages(&self, site: SiteId) -> bool {
        self.message_counters.get(&site).copied().unwrap_or(0) < self.next_pending
    }

    pub fn num_live_sites(&self) -> usize {
        self.live_sites.len()
    }

    pub fn message_counters(&self) -> FxHashMap<SiteId, u64> {
        self.message_counters.clone()
    }

    pub fn ack_set(&self, seq: u64) -> Option<&FxHashSet<SiteId>> {
        self.ack_table.get(&seq)
    }

    fn required_acks(&self, threshold: StabilityThreshold) -> usize {
        match threshold {
            StabilityThreshold::One => 1,
            StabilityThreshold::Majority => self.live_sites.len() / 2 + 1,
            StabilityThreshold::All => self.live_sites.len(),
        }
    }

    fn recompute_frontiers(&mut self) {
        self.advance(StabilityThreshold::One);
        self.advance(StabilityThreshold::Majority);
        self.advance(StabilityThreshold::All);
    }

    fn advance(&mut self, threshold: StabilityThreshold) {
        let required = self.required_acks(threshold);
        if required == 0 {
            // no live sites left - the frontier stays frozen rather than
            //  racing ahead on a vacuous threshold
            return;
        }

        let mut frontier = self.frontier(threshold);
        let mut crossed = Vec::new();
        loop {
            let next = match frontier {
                Some(f) => f + 1,
                None => 0,
            };
            if next >= self.next_pending {
                break;
            }
            let enough = match self.ack_table.get(&next) {
                Some(acks) => acks.iter().filter(|site| self.live_sites.contains(*site)).count() >= required,
                None => break,
            };
            if !enough {
                break;
            }
            frontier = Some(next);
            crossed.push(next);
        }

        if crossed.is_empty() {
            return;
        }

        debug!("{:?} frontier advanced to {:?}", threshold, frontier);
        match threshold {
            StabilityThreshold::One => self.one_ack_frontier = frontier,
            StabilityThreshold::Majority => self.majority_ack_frontier = frontier,
            StabilityThreshold::All => self.all_ack_frontier = frontier,
        }

        let callbacks = match threshold {
            StabilityThreshold::One => &self.one_callbacks,
            StabilityThreshold::Majority => &self.majority_callbacks,
            StabilityThreshold::All => &self.all_callbacks,
        };
        for seq in crossed {
            for callback in callbacks {
                callback(seq, &self.message_counters);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rstest::rstest;
    use rustc_hash::FxHashSet;

    use crate::ack_tracker::{AckTracker, StabilityThreshold};
    use crate::site::SiteId;

    fn tracker_with_pending(sites: &[SiteId], num_pending: u64) -> AckTracker {
        let mut tracker = AckTracker::new(sites.iter().copied());
        for seq in 0..num_pending {
            tracker.record_pending(seq);
        }
        tracker
    }

    fn frontiers(tracker: &AckTracker) -> (Option<u64>, Option<u64>, Option<u64>) {
        (tracker.one_ack_frontier(), tracker.majority_ack_frontier(), tracker.all_ack_frontier())
    }

    #[rstest]
    #[case::in_order(vec![(0, 2), (0, 3), (1, 2), (1, 3)])]
    #[case::out_of_order(vec![(1, 2), (1, 3), (0, 3), (0, 2)])]
    #[case::with_duplicates(vec![(0, 2), (0, 2), (1, 3), (0, 3), (1, 3), (1, 2)])]
    fn test_frontier_monotonicity_and_ordering(#[case] acks: Vec<(u64, SiteId)>) {
        let mut tracker = tracker_with_pending(&[2, 3], 2);

        let mut previous = frontiers(&tracker);
        for (seq, site) in acks {
            tracker.record_ack(seq, site);

            let current = frontiers(&tracker);
            assert!(current.0 >= previous.0, "one-ack frontier regressed: {:?} -> {:?}", previous, current);
            assert!(current.1 >= previous.1, "majority frontier regressed: {:?} -> {:?}", previous, current);
            assert!(current.2 >= previous.2, "all-ack frontier regressed: {:?} -> {:?}", previous, current);

            // one >= majority >= all at all times
            assert!(current.0 >= current.1, "frontier ordering violated: {:?}", current);
            assert!(current.1 >= current.2, "frontier ordering violated: {:?}", current);

            previous = current;
        }
    }

    #[test]
    fn test_prefix_property() {
        let mut tracker = tracker_with_pending(&[2, 3, 4], 4);
        for seq in 0..3 {
            tracker.record_ack(seq, 2);
            tracker.record_ack(seq, 3);
            tracker.record_ack(seq, 4);
        }
        tracker.record_ack(3, 2);

        assert_eq!(tracker.all_ack_frontier(), Some(2));

        let full_set: FxHashSet<SiteId> = [2, 3, 4].into_iter().collect();
        for seq in 0..=2 {
            assert_eq!(tracker.ack_set(seq), Some(&full_set));
        }
        assert_ne!(tracker.ack_set(3), Some(&full_set));
    }

    #[test]
    fn test_duplicate_ack_is_a_no_op() {
        let mut tracker = tracker_with_pending(&[2, 3], 2);

        tracker.record_ack(0, 2);
        let after_first = (frontiers(&tracker), tracker.message_counters());

        tracker.record_ack(0, 2);
        assert_eq!((frontiers(&tracker), tracker.message_counters()), after_first);
        assert_eq!(tracker.ack_set(0).unwrap().len(), 1);
    }

    /// with 2 remote peers, majority needs both of them
    #[test]
    fn test_three_site_majority_scenario() {
        let mut tracker = tracker_with_pending(&[2, 3], 1);

        tracker.record_ack(0, 2);
        assert_eq!(tracker.one_ack_frontier(), Some(0));
        assert_eq!(tracker.majority_ack_frontier(), None);
        assert_eq!(tracker.all_ack_frontier(), None);

        tracker.record_ack(0, 3);
        assert_eq!(tracker.majority_ack_frontier(), Some(0));
        assert_eq!(tracker.all_ack_frontier(), Some(0));
    }

    /// an ack for seq 1 must not surface before seq 0 is covered, and then the
    ///  frontier jumps the whole prefix in one step
    #[test]
    fn test_out_of_order_acks_held_back() {
        let mut tracker = tracker_with_pending(&[2, 3], 2);

        tracker.record_ack(1, 2);
        assert_eq!(tracker.one_ack_frontier(), None);

        tracker.record_ack(0, 3);
        assert_eq!(tracker.one_ack_frontier(), Some(1));
    }

    #[test]
    fn test_dead_site_excluded_from_denominator() {
        let mut tracker = tracker_with_pending(&[2, 3], 7);
        for seq in 0..=5 {
            tracker.record_ack(seq, 2);
            tracker.record_ack(seq, 3);
        }
        assert_eq!(tracker.all_ack_frontier(), Some(5));

        tracker.record_ack(6, 2);
        assert_eq!(tracker.all_ack_frontier(), Some(5));

        // from here on, only site 2 is required
        tracker.mark_site_dead(3);
        assert_eq!(tracker.all_ack_frontier(), Some(6));
        assert_eq!(tracker.majority_ack_frontier(), Some(6));

        tracker.record_pending(7);
        tracker.record_ack(7, 2);
        assert_eq!(tracker.all_ack_frontier(), Some(7));
    }

    #[test]
    fn test_dead_site_acks_no_longer_count_towards_thresholds() {
        let mut tracker = tracker_with_pending(&[2, 3, 4], 2);
        tracker.record_ack(0, 2);
        tracker.record_ack(0, 3);
        tracker.record_ack(1, 2);
        assert_eq!(tracker.majority_ack_frontier(), Some(0));

        tracker.mark_site_dead(2);

        // majority now needs 2 of the live sites {3, 4}; the dead site's ack
        //  is the only one recorded for seq 1 and does not count
        assert_eq!(tracker.majority_ack_frontier(), Some(0));
        tracker.record_ack(1, 3);
        assert_eq!(tracker.majority_ack_frontier(), Some(0));
        tracker.record_ack(1, 4);
        assert_eq!(tracker.majority_ack_frontier(), Some(1));
    }

    #[test]
    fn test_unacked_message_check_is_per_site() {
        let mut tracker = tracker_with_pending(&[2, 3], 2);
        assert!(tracker.has_unacked_messages(2));

        tracker.record_ack(0, 2);
        tracker.record_ack(1, 2);
        assert!(!tracker.has_unacked_messages(2));
        assert!(tracker.has_unacked_messages(3));
    }

    #[test]
    fn test_acks_from_dead_site_ignored() {
        let mut tracker = tracker_with_pending(&[2, 3], 2);
        tracker.mark_site_dead(3);

        tracker.record_ack(0, 3);
        assert_eq!(tracker.one_ack_frontier(), None);
        assert!(tracker.ack_set(0).unwrap().is_empty());
    }

    #[test]
    fn test_all_sites_dead_freezes_frontiers() {
        let mut tracker = tracker_with_pending(&[2], 2);
        tracker.record_ack(0, 2);
        assert_eq!(tracker.all_ack_frontier(), Some(0));

        tracker.mark_site_dead(2);

        // seq 1 never becomes stable on a vacuous threshold
        assert_eq!(tracker.all_ack_frontier(), Some(0));
        assert_eq!(tracker.num_live_sites(), 0);
    }

    #[test]
    fn test_ack_for_unknown_seq_ignored() {
        let mut tracker = tracker_with_pending(&[2, 3], 1);

        tracker.record_ack(17, 2);
        assert_eq!(frontiers(&tracker), (None, None, None));
        assert_eq!(tracker.message_counters()[&2], 0);
    }

    #[test]
    fn test_late_ack_after_pruning_ignored() {
        let mut tracker = tracker_with_pending(&[2, 3], 2);
        for seq in 0..2 {
            tracker.record_ack(seq, 2);
            tracker.record_ack(seq, 3);
        }
        assert_eq!(tracker.all_ack_frontier(), Some(1));

        tracker.prune_stable();
        assert_eq!(tracker.ack_set(0), None);
        assert_eq!(tracker.ack_set(1), None);

        // a very late duplicate from a reconnecting peer
        tracker.record_ack(0, 2);
        assert_eq!(tracker.all_ack_frontier(), Some(1));
        assert_eq!(tracker.message_counters()[&2], 2);
    }

    #[test]
    fn test_callbacks_fire_exactly_once_per_crossed_seq() {
        let mut tracker = tracker_with_pending(&[2, 3], 3);

        let one_fired = Arc::new(Mutex::new(Vec::new()));
        let all_fired = Arc::new(Mutex::new(Vec::new()));
        {
            let one_fired = one_fired.clone();
            tracker.register_callback(StabilityThreshold::One, Box::new(move |seq, _| {
                one_fired.lock().unwrap().push(seq);
            }));
        }
        {
            let all_fired = all_fired.clone();
            tracker.register_callback(StabilityThreshold::All, Box::new(move |seq, counters| {
                all_fired.lock().unwrap().push((seq, counters.clone()));
            }));
        }

        // acks for seq 1 and 2 first: nothing fires while seq 0 is uncovered
        for seq in [1, 2] {
            tracker.record_ack(seq, 2);
            tracker.record_ack(seq, 3);
        }
        assert!(one_fired.lock().unwrap().is_empty());
        assert!(all_fired.lock().unwrap().is_empty());

        tracker.record_ack(0, 2);
        assert_eq!(*one_fired.lock().unwrap(), vec![0, 1, 2]);
        assert!(all_fired.lock().unwrap().is_empty());

        tracker.record_ack(0, 3);
        let all_fired = all_fired.lock().unwrap();
        assert_eq!(all_fired.iter().map(|(seq, _)| *seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        // the snapshot reflects the counters at the time of the advancement
        assert_eq!(all_fired[2].1[&2], 3);
        assert_eq!(all_fired[2].1[&3], 3);
    }
}
