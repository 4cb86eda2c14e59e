use crate::seq::Seq;
use crate::wire::{RMessage, LENGTH_PREFIXED};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Retransmission backoff, keyed on the number of transmissions so far. The
///  first send is immediate; after that the message is re-sent in widening
///  tiers until the peer acks it.
fn retx_delay(retx: u32) -> Duration {
    match retx {
        0 => Duration::ZERO,
        1 => Duration::from_millis(80),
        2..=3 => Duration::from_millis(200),
        4..=9 => Duration::from_millis(620),
        _ => Duration::from_millis(2000),
    }
}

struct PendingMessage {
    msg: RMessage,
    /// time of the most recent transmission; `None` until the first one
    last: Option<Instant>,
    /// transmissions so far
    retx: u32,
}

/// The ordered queue of outbound reliable messages awaiting acknowledgement.
///
/// Insertion order equals ascending sequence order modulo 2^16: `enqueue`
///  assigns the next sequence number and appends, and acks remove a prefix.
///  The whole struct is guarded by a single mutex at the connection level, so
///  sequence assignment is atomic with queue insertion.
pub struct PendingQueue {
    queue: VecDeque<PendingMessage>,
    tseq: Seq,
}

impl PendingQueue {
    pub fn new() -> PendingQueue {
        PendingQueue {
            queue: VecDeque::new(),
            tseq: Seq::ZERO,
        }
    }

    /// Appends a reliable message, assigning it the next outbound sequence
    ///  number. Returns the assigned seq.
    pub fn enqueue(&mut self, mtype: u8, payload: Bytes) -> Seq {
        let seq = self.tseq;
        self.tseq = self.tseq.next();
        self.queue.push_back(PendingMessage {
            msg: RMessage {
                seq,
                mtype: mtype & !LENGTH_PREFIXED,
                payload,
            },
            last: None,
            retx: 0,
        });
        seq
    }

    /// Removes every message acknowledged by `seq`: the queue prefix whose
    ///  signed distance to `seq` is <= 0, stopping at the first strictly
    ///  newer message.
    pub fn on_ack(&mut self, seq: Seq) {
        while let Some(front) = self.queue.front() {
            if front.msg.seq.dist(seq) <= 0 {
                trace!("seq {} acked by ack {}", front.msg.seq, seq);
                self.queue.pop_front();
            } else {
                break;
            }
        }
    }

    /// Collects the messages whose (re)transmission is due at `now`, marking
    ///  them as sent, and returns them together with the earliest future
    ///  transmission deadline of the messages that are not yet due.
    pub fn collect_due(&mut self, now: Instant) -> (Vec<RMessage>, Option<Instant>) {
        let mut due = Vec::new();
        let mut mint: Option<Instant> = None;
        for pm in &mut self.queue {
            let txtime = match pm.last {
                None => now,
                Some(last) => last + retx_delay(pm.retx),
            };
            if txtime <= now {
                pm.last = Some(now);
                pm.retx += 1;
                due.push(pm.msg.clone());
            } else {
                mint = Some(mint.map_or(txtime, |m| m.min(txtime)));
            }
        }
        (due, mint)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_seqs(q: &PendingQueue) -> Vec<u16> {
        q.queue.iter().map(|pm| pm.msg.seq.to_raw()).collect()
    }

    #[test]
    fn test_enqueue_assigns_consecutive_seqs() {
        let mut q = PendingQueue::new();
        for i in 0..5u16 {
            assert_eq!(q.enqueue(1, Bytes::new()), Seq::from_raw(i));
        }
        assert_eq!(queued_seqs(&q), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_tseq_wraps_after_full_cycle() {
        let mut q = PendingQueue::new();
        let mut last = Seq::ZERO;
        for _ in 0..65537 {
            last = q.enqueue(1, Bytes::new());
        }
        // the 65537th message gets seq 0 again
        assert_eq!(last, Seq::ZERO);
    }

    #[test]
    fn test_ack_removes_prefix() {
        let mut q = PendingQueue::new();
        for _ in 0..3 {
            q.enqueue(1, Bytes::new());
        }
        q.on_ack(Seq::from_raw(1));
        assert_eq!(queued_seqs(&q), vec![2]);
    }

    #[test]
    fn test_ack_of_unknown_older_seq_removes_nothing() {
        let mut q = PendingQueue::new();
        q.enqueue(1, Bytes::new());
        q.enqueue(1, Bytes::new());
        q.on_ack(Seq::from_raw(0x8000));
        assert_eq!(queued_seqs(&q), vec![0, 1]);
    }

    #[test]
    fn test_ack_across_seq_wrap() {
        let mut q = PendingQueue::new();
        q.tseq = Seq::from_raw(0xfffa);
        for _ in 0..8 {
            q.enqueue(1, Bytes::new());
        }
        assert_eq!(queued_seqs(&q), vec![0xfffa, 0xfffb, 0xfffc, 0xfffd, 0xfffe, 0xffff, 0, 1]);

        // an ack at the wrapped seq 0 removes everything up to and including it
        q.on_ack(Seq::ZERO);
        assert_eq!(queued_seqs(&q), vec![1]);

        q.on_ack(Seq::from_raw(1));
        assert!(q.is_empty());
    }

    #[test]
    fn test_collect_due_marks_transmissions() {
        let t0 = Instant::now();
        let mut q = PendingQueue::new();
        q.enqueue(1, Bytes::new());
        q.enqueue(2, Bytes::new());

        let (due, mint) = q.collect_due(t0);
        assert_eq!(due.len(), 2);
        assert_eq!(mint, None);

        // immediately afterwards nothing is due; next deadline is one tier away
        let (due, mint) = q.collect_due(t0);
        assert!(due.is_empty());
        assert_eq!(mint, Some(t0 + Duration::from_millis(80)));
    }

    #[test]
    fn test_retransmission_schedule() {
        // expected offsets of the first 11 transmissions of a single unacked
        //  message, per the backoff tiers
        let expected_ms: Vec<u64> = vec![0, 80, 280, 480, 1100, 1720, 2340, 2960, 3580, 4200, 6200];

        let t0 = Instant::now();
        let mut q = PendingQueue::new();
        q.enqueue(1, Bytes::new());

        let mut sent_at = Vec::new();
        for step_ms in 0..=6500u64 {
            let now = t0 + Duration::from_millis(step_ms);
            let (due, _) = q.collect_due(now);
            if !due.is_empty() {
                assert_eq!(due.len(), 1);
                sent_at.push(step_ms);
            }
        }
        assert_eq!(sent_at, expected_ms);
    }

    #[test]
    fn test_collect_due_reports_earliest_deadline() {
        let t0 = Instant::now();
        let mut q = PendingQueue::new();
        q.enqueue(1, Bytes::new());
        q.collect_due(t0);

        q.enqueue(2, Bytes::new());
        let (due, mint) = q.collect_due(t0 + Duration::from_millis(10));
        assert_eq!(due.len(), 1);
        // the first message's deadline (t0 + 80ms) comes before the second's
        assert_eq!(mint, Some(t0 + Duration::from_millis(80)));

        let (due, mint) = q.collect_due(t0 + Duration::from_millis(20));
        assert!(due.is_empty());
        assert_eq!(mint, Some(t0 + Duration::from_millis(80)));
    }
}
