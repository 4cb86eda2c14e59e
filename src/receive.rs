use crate::seq::Seq;
use crate::wire::RMessage;
use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Reassembles the inbound reliable stream into in-order deliveries and
///  schedules the coalesced acknowledgement for them.
///
/// Messages ahead of the cursor are parked in a reorder buffer; messages
///  behind it are duplicates of something already delivered and are dropped,
///  so redelivery to the application is impossible by construction.
pub struct ReceiveQueue {
    /// next expected inbound seq; everything strictly before it has been
    ///  delivered exactly once, in order
    rseq: Seq,
    waiting: FxHashMap<u16, RMessage>,
    ackseq: Seq,
    /// time the currently pending ack became pending; `None` while no
    ///  delivery is awaiting acknowledgement
    acktime: Option<Instant>,
}

impl ReceiveQueue {
    pub fn new() -> ReceiveQueue {
        ReceiveQueue {
            rseq: Seq::ZERO,
            waiting: FxHashMap::default(),
            ackseq: Seq::ZERO,
            acktime: None,
        }
    }

    /// Feeds one reassembled reliable message in. Returns the messages that
    ///  became deliverable, in sequence order; the caller hands them to the
    ///  application handler.
    pub fn on_rel(&mut self, msg: RMessage, now: Instant) -> Vec<RMessage> {
        let sd = msg.seq.dist(self.rseq);
        if sd == 0 {
            let mut out = Vec::new();
            let mut next = msg;
            let last_acked = loop {
                let delivered_seq = self.rseq;
                self.rseq = self.rseq.next();
                out.push(next);
                match self.waiting.remove(&self.rseq.to_raw()) {
                    Some(m) => next = m,
                    None => break delivered_seq,
                }
            };
            self.schedule_ack(last_acked, now);
            out
        } else if sd > 0 {
            trace!("seq {} ahead of cursor {} - buffering", msg.seq, self.rseq);
            self.waiting.insert(msg.seq.to_raw(), msg);
            Vec::new()
        } else {
            debug!("seq {} already delivered - dropping", msg.seq);
            Vec::new()
        }
    }

    fn schedule_ack(&mut self, seq: Seq, now: Instant) {
        if self.acktime.is_none() {
            self.acktime = Some(now);
        }
        self.ackseq = seq;
    }

    /// Yields the seq to acknowledge once the hold window has elapsed,
    ///  clearing the pending state. Further deliveries start a new window.
    pub fn take_due_ack(&mut self, now: Instant, hold: Duration) -> Option<Seq> {
        match self.acktime {
            Some(t) if now - t >= hold => {
                self.acktime = None;
                Some(self.ackseq)
            }
            _ => None,
        }
    }

    pub fn next_ack_deadline(&self, hold: Duration) -> Option<Instant> {
        self.acktime.map(|t| t + hold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const HOLD: Duration = Duration::from_millis(30);

    fn rmsg(seq: u16) -> RMessage {
        RMessage {
            seq: Seq::from_raw(seq),
            mtype: 1,
            payload: Bytes::new(),
        }
    }

    fn delivered_seqs(msgs: &[RMessage]) -> Vec<u16> {
        msgs.iter().map(|m| m.seq.to_raw()).collect()
    }

    #[test]
    fn test_in_order_delivery() {
        let now = Instant::now();
        let mut q = ReceiveQueue::new();
        assert_eq!(delivered_seqs(&q.on_rel(rmsg(0), now)), vec![0]);
        assert_eq!(delivered_seqs(&q.on_rel(rmsg(1), now)), vec![1]);
        assert_eq!(q.ackseq, Seq::from_raw(1));
    }

    #[test]
    fn test_out_of_order_delivery() {
        let now = Instant::now();
        let mut q = ReceiveQueue::new();
        q.rseq = Seq::from_raw(5);

        // seqs 7, 8, 9 arrive first, then 5, then 6
        assert!(q.on_rel(rmsg(7), now).is_empty());
        assert!(q.on_rel(rmsg(8), now).is_empty());
        assert!(q.on_rel(rmsg(9), now).is_empty());
        assert_eq!(delivered_seqs(&q.on_rel(rmsg(5), now)), vec![5]);
        assert_eq!(delivered_seqs(&q.on_rel(rmsg(6), now)), vec![6, 7, 8, 9]);
        assert_eq!(q.ackseq, Seq::from_raw(9));
        assert!(q.waiting.is_empty());
    }

    #[test]
    fn test_duplicate_dropped() {
        let now = Instant::now();
        let mut q = ReceiveQueue::new();
        q.on_rel(rmsg(0), now);
        assert!(q.on_rel(rmsg(0), now).is_empty());
        assert_eq!(q.rseq, Seq::from_raw(1));
    }

    #[test]
    fn test_delivery_across_seq_wrap() {
        let now = Instant::now();
        let mut q = ReceiveQueue::new();
        q.rseq = Seq::from_raw(0xffff);

        assert!(q.on_rel(rmsg(0), now).is_empty());
        assert_eq!(delivered_seqs(&q.on_rel(rmsg(0xffff), now)), vec![0xffff, 0]);
        assert_eq!(q.rseq, Seq::from_raw(1));
        assert_eq!(q.ackseq, Seq::ZERO);
    }

    #[test]
    fn test_ack_hold_coalesces_deliveries() {
        let t0 = Instant::now();
        let mut q = ReceiveQueue::new();

        // a burst of contiguous deliveries within the hold window
        q.on_rel(rmsg(0), t0);
        q.on_rel(rmsg(1), t0 + Duration::from_millis(5));
        q.on_rel(rmsg(2), t0 + Duration::from_millis(10));

        // the hold window runs from the first delivery
        assert_eq!(q.take_due_ack(t0 + Duration::from_millis(29), HOLD), None);
        assert_eq!(
            q.take_due_ack(t0 + Duration::from_millis(30), HOLD),
            Some(Seq::from_raw(2))
        );
        // no ack pending anymore
        assert_eq!(q.take_due_ack(t0 + Duration::from_millis(60), HOLD), None);
        assert_eq!(q.next_ack_deadline(HOLD), None);
    }

    #[test]
    fn test_ack_deadline_tracks_first_pending_delivery() {
        let t0 = Instant::now();
        let mut q = ReceiveQueue::new();
        assert_eq!(q.next_ack_deadline(HOLD), None);

        q.on_rel(rmsg(0), t0);
        assert_eq!(q.next_ack_deadline(HOLD), Some(t0 + HOLD));

        // a later delivery does not push the deadline out
        q.on_rel(rmsg(1), t0 + Duration::from_millis(20));
        assert_eq!(q.next_ack_deadline(HOLD), Some(t0 + HOLD));
    }

    #[test]
    fn test_buffered_seqs_are_in_future_half() {
        let now = Instant::now();
        let mut q = ReceiveQueue::new();
        q.rseq = Seq::from_raw(0x8000);

        q.on_rel(rmsg(0x8005), now);
        q.on_rel(rmsg(0x7fff), now); // just behind the cursor - dropped
        assert_eq!(q.waiting.len(), 1);
        for &key in q.waiting.keys() {
            assert!(Seq::from_raw(key).dist(q.rseq) > 0);
        }
    }
}
