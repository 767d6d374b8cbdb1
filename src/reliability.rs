use std::sync::{Mutex, RwLock};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;
use crate::config::ReliabilityConfig;
use crate::frag_seq::FragSeq;
use crate::seq_tracking_list::SeqTrackingList;
use crate::Rank;

/// Per-destination sequence counters and per-source duplicate tracking.
///
/// There is one instance per engine, shared by all paths: a fragment that is re-sent on a
///  different path after failover keeps its sequence number, and the receiver must recognize it
///  as a duplicate no matter which path it arrives on.
pub struct ReliabilityContext {
    next_seq: RwLock<FxHashMap<Rank, Mutex<FragSeq>>>,
    recv_tracking: Mutex<FxHashMap<Rank, PeerRecvTracking>>,
    /// what destinations reported in their acknowledgements about the fragments they have
    peer_in_order: Mutex<FxHashMap<Rank, PeerInOrder>>,
    policy: RetransmitPolicy,
}

/// The largest sequence numbers up to which a destination has all fragments from us
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PeerInOrder {
    pub received: FragSeq,
    pub delivered: FragSeq,
}

#[derive(Default)]
struct PeerRecvTracking {
    /// fragments that arrived intact
    received: SeqTrackingList,
    /// fragments the receiver took responsibility for, i.e. that were (or will be) acknowledged
    delivered: SeqTrackingList,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DuplicateCheck {
    New,
    /// seen and acknowledged before - the ack was probably lost, so it should be sent again
    AlreadyDelivered,
    /// seen before, and its acknowledgement is held back until its message matches a receive
    Held,
}

impl ReliabilityContext {
    pub fn new(config: &ReliabilityConfig) -> ReliabilityContext {
        ReliabilityContext {
            next_seq: Default::default(),
            recv_tracking: Default::default(),
            peer_in_order: Default::default(),
            policy: RetransmitPolicy::new(config),
        }
    }

    pub fn policy(&self) -> &RetransmitPolicy {
        &self.policy
    }

    /// Assigns the next sequence number for a fragment to `dest`, under that destination's lock
    pub fn next_frag_seq(&self, dest: Rank) -> FragSeq {
        {
            let counters = self.next_seq.read().unwrap();
            if let Some(counter) = counters.get(&dest) {
                return Self::take_next(&mut counter.lock().unwrap());
            }
        }

        let mut counters = self.next_seq.write().unwrap();
        let counter = counters.entry(dest)
            .or_insert_with(|| Mutex::new(FragSeq::FIRST));
        let mut counter = counter.lock().unwrap();
        Self::take_next(&mut counter)
    }

    fn take_next(counter: &mut FragSeq) -> FragSeq {
        let result = *counter;
        *counter = counter.next();
        result
    }

    /// Checks an incoming fragment's sequence number against what was seen from `src` before,
    ///  recording it as received if it is new
    pub fn check_duplicate(&self, src: Rank, seq: FragSeq) -> DuplicateCheck {
        let mut tracking = self.recv_tracking.lock().unwrap();
        let peer = tracking.entry(src).or_default();

        if peer.received.record_if_not_recorded(seq) {
            return DuplicateCheck::New;
        }

        if peer.delivered.is_recorded(seq) {
            trace!("fragment #{} from {} is a duplicate of a delivered fragment", seq, src);
            DuplicateCheck::AlreadyDelivered
        }
        else {
            trace!("fragment #{} from {} is a duplicate of a held fragment", seq, src);
            DuplicateCheck::Held
        }
    }

    pub fn mark_delivered(&self, src: Rank, seq: FragSeq) {
        let mut tracking = self.recv_tracking.lock().unwrap();
        tracking.entry(src).or_default()
            .delivered.record_if_not_recorded(seq);
    }

    /// Erases all knowledge of a fragment, typically after its data turned out to be corrupt,
    ///  so that a retransmission is accepted as new
    pub fn forget(&self, src: Rank, seq: FragSeq) {
        let mut tracking = self.recv_tracking.lock().unwrap();
        if let Some(peer) = tracking.get_mut(&src) {
            peer.received.erase(seq);
            peer.delivered.erase(seq);
        }
    }

    /// (received, delivered) - the largest in-order sequence numbers for a source, as reported
    ///  in acknowledgements
    pub fn largest_in_order(&self, src: Rank) -> (FragSeq, FragSeq) {
        let tracking = self.recv_tracking.lock().unwrap();
        tracking.get(&src)
            .map(|peer| (peer.received.largest_in_order(), peer.delivered.largest_in_order()))
            .unwrap_or((FragSeq::UNASSIGNED, FragSeq::UNASSIGNED))
    }

    /// Records the in-order sequence numbers a destination reported in an acknowledgement.
    ///  Only `delivered` never goes back: a receiver forgets fragments that arrived corrupted.
    pub fn record_peer_in_order(&self, dest: Rank, received: FragSeq, delivered: FragSeq) {
        let mut peers = self.peer_in_order.lock().unwrap();
        let peer = peers.entry(dest).or_default();
        peer.received = received;
        peer.delivered = peer.delivered.max(delivered);
    }

    pub fn peer_in_order(&self, dest: Rank) -> PeerInOrder {
        self.peer_in_order.lock().unwrap()
            .get(&dest)
            .copied()
            .unwrap_or_default()
    }
}

/// Exponential backoff for retransmitting unacknowledged fragments
#[derive(Debug, Clone)]
pub struct RetransmitPolicy {
    retransmit_time: Duration,
    max_backoff_exponent: u32,
    max_transmits: u32,
}

impl RetransmitPolicy {
    pub fn new(config: &ReliabilityConfig) -> RetransmitPolicy {
        RetransmitPolicy {
            retransmit_time: config.retransmit_time,
            max_backoff_exponent: config.max_backoff_exponent,
            max_transmits: config.max_transmits_before_failover,
        }
    }

    /// The point in time after which a fragment that was sent `num_transmits` times (the
    ///  latest at `time_sent`) is eligible for retransmission
    pub fn deadline(&self, time_sent: Instant, num_transmits: u32) -> Instant {
        let exponent = num_transmits.saturating_sub(1).min(self.max_backoff_exponent);
        time_sent + self.retransmit_time.saturating_mul(1u32 << exponent)
    }

    /// `true` if a fragment that was sent this often without an ack should fail over to a
    ///  different path rather than be retransmitted on the same path again
    pub fn exceeded(&self, num_transmits: u32) -> bool {
        num_transmits >= self.max_transmits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;

    fn config() -> ReliabilityConfig {
        ReliabilityConfig {
            retransmit_time: Duration::from_millis(100),
            min_retransmit_scan_interval: Duration::from_millis(10),
            max_backoff_exponent: 3,
            max_transmits_before_failover: 5,
        }
    }

    #[test]
    fn test_frag_seq_per_destination() {
        let ctx = ReliabilityContext::new(&config());
        assert_eq!(ctx.next_frag_seq(1), FragSeq::from_raw(1));
        assert_eq!(ctx.next_frag_seq(1), FragSeq::from_raw(2));
        assert_eq!(ctx.next_frag_seq(2), FragSeq::from_raw(1));
        assert_eq!(ctx.next_frag_seq(1), FragSeq::from_raw(3));
    }

    #[test]
    fn test_frag_seq_concurrent_strictly_increasing() {
        let ctx = Arc::new(ReliabilityContext::new(&config()));

        let handles = (0..4)
            .map(|_| {
                let ctx = ctx.clone();
                std::thread::spawn(move || (0..250).map(|_| ctx.next_frag_seq(7).to_raw()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();

        let mut all = Vec::new();
        for h in handles {
            let seqs = h.join().unwrap();
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            all.extend(seqs);
        }
        all.sort();
        assert_eq!(all, (1..=1000).collect::<Vec<u64>>());
    }

    #[test]
    fn test_duplicate_detection() {
        let ctx = ReliabilityContext::new(&config());
        let seq = FragSeq::from_raw(1);

        assert_eq!(ctx.check_duplicate(3, seq), DuplicateCheck::New);
        assert_eq!(ctx.check_duplicate(3, seq), DuplicateCheck::Held);
        assert_eq!(ctx.check_duplicate(4, seq), DuplicateCheck::New);

        ctx.mark_delivered(3, seq);
        assert_eq!(ctx.check_duplicate(3, seq), DuplicateCheck::AlreadyDelivered);
        assert_eq!(ctx.largest_in_order(3), (seq, seq));
        assert_eq!(ctx.largest_in_order(5), (FragSeq::UNASSIGNED, FragSeq::UNASSIGNED));
    }

    #[test]
    fn test_peer_in_order() {
        let ctx = ReliabilityContext::new(&config());
        assert_eq!(ctx.peer_in_order(2), PeerInOrder::default());

        ctx.record_peer_in_order(2, FragSeq::from_raw(5), FragSeq::from_raw(3));
        assert_eq!(ctx.peer_in_order(2), PeerInOrder { received: FragSeq::from_raw(5), delivered: FragSeq::from_raw(3) });

        // an older ack arriving late does not take back deliveries
        ctx.record_peer_in_order(2, FragSeq::from_raw(4), FragSeq::from_raw(2));
        assert_eq!(ctx.peer_in_order(2), PeerInOrder { received: FragSeq::from_raw(4), delivered: FragSeq::from_raw(3) });

        assert_eq!(ctx.peer_in_order(3), PeerInOrder::default());
    }

    #[test]
    fn test_forget_allows_retransmission() {
        let ctx = ReliabilityContext::new(&config());
        let seq = FragSeq::from_raw(1);

        assert_eq!(ctx.check_duplicate(3, seq), DuplicateCheck::New);
        ctx.forget(3, seq);
        assert_eq!(ctx.check_duplicate(3, seq), DuplicateCheck::New);
    }

    #[rstest]
    #[case::first(1, 100)]
    #[case::second(2, 200)]
    #[case::third(3, 400)]
    #[case::capped(4, 800)]
    #[case::capped_more(20, 800)]
    #[case::never_sent(0, 100)]
    fn test_deadline(#[case] num_transmits: u32, #[case] expected_millis: u64) {
        let policy = RetransmitPolicy::new(&config());
        let now = Instant::now();
        assert_eq!(policy.deadline(now, num_transmits) - now, Duration::from_millis(expected_millis));
    }

    #[rstest]
    #[case(0, false)]
    #[case(4, false)]
    #[case(5, true)]
    #[case(6, true)]
    fn test_exceeded(#[case] num_transmits: u32, #[case] expected: bool) {
        assert_eq!(RetransmitPolicy::new(&config()).exceeded(num_transmits), expected);
    }
}
