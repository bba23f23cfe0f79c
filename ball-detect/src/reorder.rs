use std::collections::{BTreeMap, BTreeSet};

/// Restores frame_index order behind a multi-worker pool.
///
/// The enqueue side issues a ticket for every frame it accepts; workers
/// complete tickets in whatever order they finish. Completed entries are
/// released only once every older ticket has completed, so releases are
/// monotonically increasing in frame_index. Frames dropped before enqueue
/// never get a ticket and therefore never block the sequence.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    pending: BTreeSet<u64>,
    completed: BTreeMap<u64, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            pending: BTreeSet::new(),
            completed: BTreeMap::new(),
        }
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an accepted frame. Tickets must be issued in increasing
    /// frame_index order (the enqueue side is the single capture-ordered
    /// producer).
    pub fn ticket(&mut self, frame_index: u64) {
        self.pending.insert(frame_index);
    }

    /// Abandon a ticket whose frame never reached a worker.
    pub fn cancel(&mut self, frame_index: u64) {
        self.pending.remove(&frame_index);
    }

    /// Complete a ticket and return every entry now releasable, in order.
    pub fn complete(&mut self, frame_index: u64, value: T) -> Vec<(u64, T)> {
        self.pending.remove(&frame_index);
        self.completed.insert(frame_index, value);
        self.drain_ready()
    }

    fn drain_ready(&mut self) -> Vec<(u64, T)> {
        let mut out = Vec::new();
        loop {
            let next = match self.completed.keys().next() {
                Some(k) => *k,
                None => break,
            };
            // Releasable only if no older ticket is still in flight.
            if let Some(oldest_pending) = self.pending.iter().next() {
                if *oldest_pending < next {
                    break;
                }
            }
            let value = self.completed.remove(&next).unwrap();
            out.push((next, value));
        }
        out
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len() + self.completed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_completion_releases_immediately() {
        let mut buf = ReorderBuffer::new();
        buf.ticket(0);
        buf.ticket(1);
        assert_eq!(buf.complete(0, "a"), vec![(0, "a")]);
        assert_eq!(buf.complete(1, "b"), vec![(1, "b")]);
        assert_eq!(buf.in_flight(), 0);
    }

    #[test]
    fn out_of_order_completion_is_held_back() {
        let mut buf = ReorderBuffer::new();
        buf.ticket(0);
        buf.ticket(1);
        buf.ticket(2);
        assert!(buf.complete(1, "b").is_empty());
        assert!(buf.complete(2, "c").is_empty());
        assert_eq!(
            buf.complete(0, "a"),
            vec![(0, "a"), (1, "b"), (2, "c")]
        );
    }

    #[test]
    fn gaps_from_drops_do_not_block() {
        let mut buf = ReorderBuffer::new();
        // Frame 1 was dropped at the queue: no ticket.
        buf.ticket(0);
        buf.ticket(2);
        assert_eq!(buf.complete(0, "a"), vec![(0, "a")]);
        assert_eq!(buf.complete(2, "c"), vec![(2, "c")]);
    }

    #[test]
    fn cancelled_ticket_unblocks_younger_frames() {
        let mut buf = ReorderBuffer::new();
        buf.ticket(0);
        buf.ticket(1);
        assert!(buf.complete(1, "b").is_empty());
        // Frame 0 was dropped after its ticket was issued.
        buf.cancel(0);
        buf.ticket(2);
        assert_eq!(buf.complete(2, "c"), vec![(1, "b"), (2, "c")]);
    }
}
