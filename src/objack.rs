use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::time::Instant;

const OBJACK_IDLE: Duration = Duration::from_millis(80);
const OBJACK_MAX_AGE: Duration = Duration::from_millis(500);
/// Serialized size of one (id, frame) entry in an OBJACK packet.
const ENTRY_SIZE: usize = 8;

struct ObjAck {
    /// highest frame number observed for this object since the last flush
    frame: i32,
    /// first observation of the current unacked run; not moved by updates
    frecv: Instant,
    /// most recent observation
    lrecv: Instant,
}

/// Tracks per-object frame acknowledgements for the unreliable object-state
///  stream and batches them into bounded OBJACK packets.
pub struct ObjAckTracker {
    acks: FxHashMap<u32, ObjAck>,
}

impl ObjAckTracker {
    pub fn new() -> ObjAckTracker {
        ObjAckTracker {
            acks: FxHashMap::default(),
        }
    }

    /// Records one object-state record: a new entry starts a fresh run, an
    ///  existing one keeps the highest frame seen and refreshes `lrecv`.
    pub fn observe(&mut self, id: u32, frame: i32, now: Instant) {
        match self.acks.get_mut(&id) {
            None => {
                self.acks.insert(
                    id,
                    ObjAck {
                        frame,
                        frecv: now,
                        lrecv: now,
                    },
                );
            }
            Some(ack) => {
                if frame > ack.frame {
                    ack.frame = frame;
                }
                ack.lrecv = now;
            }
        }
    }

    /// Collects the entries to acknowledge at `now`, batched so that no
    ///  OBJACK payload grows past `budget`, and returns them together with
    ///  the earliest transmission time of the entries that stay behind.
    ///
    /// NB: an entry is selected while its txtime has *not* yet passed, which
    ///  in practice flushes entries on the first pass after they arrive; an
    ///  entry whose txtime is already behind `now` stays in the table.
    pub fn collect_due(
        &mut self,
        now: Instant,
        budget: usize,
    ) -> (Vec<Vec<(u32, i32)>>, Option<Instant>) {
        let mut due = Vec::new();
        let mut mint: Option<Instant> = None;
        self.acks.retain(|&id, ack| {
            let txtime = (ack.lrecv + OBJACK_IDLE).min(ack.frecv + OBJACK_MAX_AGE);
            if txtime >= now {
                due.push((id, ack.frame));
                false
            } else {
                mint = Some(mint.map_or(txtime, |m| m.min(txtime)));
                true
            }
        });

        // a packet is flushed once adding to it would grow past the budget,
        //  so each batch holds at most (budget - ENTRY_SIZE) / ENTRY_SIZE + 1
        //  entries
        let per_packet = (budget - ENTRY_SIZE) / ENTRY_SIZE + 1;
        let batches = due
            .chunks(per_packet)
            .map(|chunk| chunk.to_vec())
            .collect();
        (batches, mint)
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: usize = 1000;

    #[test]
    fn test_observe_keeps_highest_frame() {
        let t0 = Instant::now();
        let mut tracker = ObjAckTracker::new();
        tracker.observe(7, 3, t0);
        tracker.observe(7, 9, t0 + Duration::from_millis(10));
        tracker.observe(7, 5, t0 + Duration::from_millis(20));

        let ack = &tracker.acks[&7];
        assert_eq!(ack.frame, 9);
        assert_eq!(ack.frecv, t0);
        assert_eq!(ack.lrecv, t0 + Duration::from_millis(20));
    }

    #[test]
    fn test_lrecv_never_precedes_frecv() {
        let t0 = Instant::now();
        let mut tracker = ObjAckTracker::new();
        tracker.observe(1, 1, t0);
        tracker.observe(1, 2, t0 + Duration::from_millis(5));
        let ack = &tracker.acks[&1];
        assert!(ack.lrecv >= ack.frecv);
    }

    #[test]
    fn test_fresh_entries_flush_immediately() {
        let t0 = Instant::now();
        let mut tracker = ObjAckTracker::new();
        tracker.observe(7, 3, t0);

        let (batches, mint) = tracker.collect_due(t0, BUDGET);
        assert_eq!(batches, vec![vec![(7, 3)]]);
        assert_eq!(mint, None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_stale_entry_is_retained() {
        // once an entry's txtime lies in the past it is not selected; its
        //  txtime is reported as the next deadline instead
        let t0 = Instant::now();
        let mut tracker = ObjAckTracker::new();
        tracker.observe(7, 3, t0);

        let now = t0 + Duration::from_millis(100);
        let (batches, mint) = tracker.collect_due(now, BUDGET);
        assert!(batches.is_empty());
        assert_eq!(mint, Some(t0 + OBJACK_IDLE));
        assert!(!tracker.is_empty());
    }

    #[test]
    fn test_max_age_bounds_refreshed_entries() {
        // an entry refreshed continuously is capped by frecv + max age
        let t0 = Instant::now();
        let mut tracker = ObjAckTracker::new();
        tracker.observe(7, 0, t0);
        for i in 1..10 {
            tracker.observe(7, i, t0 + Duration::from_millis(60 * i as u64));
        }

        // at t0 + 540ms: lrecv + 80ms = 620ms, frecv + 500ms = 500ms < now
        let now = t0 + Duration::from_millis(540);
        let (batches, mint) = tracker.collect_due(now, BUDGET);
        assert!(batches.is_empty());
        assert_eq!(mint, Some(t0 + OBJACK_MAX_AGE));
    }

    #[test]
    fn test_batches_respect_packet_budget() {
        let t0 = Instant::now();
        let mut tracker = ObjAckTracker::new();
        for id in 0..130u32 {
            tracker.observe(id, id as i32, t0);
        }

        let (batches, _) = tracker.collect_due(t0, BUDGET);
        // 1000-byte budget: flushed once past 992 bytes, i.e. 125 entries
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 125);
        assert_eq!(batches[1].len(), 5);

        let mut all: Vec<u32> = batches.concat().iter().map(|&(id, _)| id).collect();
        all.sort_unstable();
        assert_eq!(all, (0..130).collect::<Vec<_>>());
    }
}
