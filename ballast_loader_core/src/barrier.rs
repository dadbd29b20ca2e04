//! Submission-order barriers for drain and close.
//!
//! Completions may arrive out of order relative to submission, so a barrier
//! cannot simply count completions: it records a watermark (the next
//! submission sequence number at arm time) and is satisfied only once every
//! outstanding submission below that watermark has completed.

pub(crate) struct CompletionTracker<T> {
    next_seq: u64,
    in_flight: Vec<u64>,
    waiting: Vec<Waiting<T>>,
}

struct Waiting<T> {
    watermark: u64,
    remaining: usize,
    payload: T,
}

impl<T> CompletionTracker<T> {
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            in_flight: Vec::new(),
            waiting: Vec::new(),
        }
    }

    /// Registers a new submission and returns its sequence number.
    pub fn begin(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.push(seq);
        seq
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Records the completion of `seq` and returns the payloads of every
    /// barrier it satisfied.
    pub fn complete(&mut self, seq: u64) -> Vec<T> {
        if let Some(pos) = self.in_flight.iter().position(|&s| s == seq) {
            self.in_flight.swap_remove(pos);
        }

        let mut fired = Vec::new();
        let mut i = 0;
        while i < self.waiting.len() {
            if seq < self.waiting[i].watermark {
                self.waiting[i].remaining -= 1;
                if self.waiting[i].remaining == 0 {
                    fired.push(self.waiting.swap_remove(i).payload);
                    continue;
                }
            }
            i += 1;
        }
        fired
    }

    /// Arms a barrier covering everything submitted so far. Returns the
    /// payload immediately if nothing is outstanding.
    pub fn arm(&mut self, payload: T) -> Option<T> {
        let remaining = self.in_flight.len();
        if remaining == 0 {
            return Some(payload);
        }
        self.waiting.push(Waiting {
            watermark: self.next_seq,
            remaining,
            payload,
        });
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_fires_immediately_when_idle() {
        let mut tracker: CompletionTracker<&str> = CompletionTracker::new();
        assert_eq!(tracker.arm("a"), Some("a"));
    }

    #[test]
    fn barrier_waits_for_everything_below_the_watermark() {
        let mut tracker: CompletionTracker<&str> = CompletionTracker::new();
        let first = tracker.begin();
        let second = tracker.begin();
        assert_eq!(tracker.arm("a"), None);

        assert!(tracker.complete(second).is_empty());
        assert_eq!(tracker.complete(first), vec!["a"]);
    }

    #[test]
    fn later_submissions_cannot_satisfy_an_armed_barrier() {
        let mut tracker: CompletionTracker<&str> = CompletionTracker::new();
        let before = tracker.begin();
        assert_eq!(tracker.arm("a"), None);

        // Submitted after the barrier: its completion must not count.
        let after = tracker.begin();
        assert!(tracker.complete(after).is_empty());
        assert_eq!(tracker.complete(before), vec!["a"]);
    }

    #[test]
    fn multiple_barriers_fire_independently() {
        let mut tracker: CompletionTracker<u32> = CompletionTracker::new();
        let a = tracker.begin();
        assert_eq!(tracker.arm(1), None);
        let b = tracker.begin();
        assert_eq!(tracker.arm(2), None);

        let fired = tracker.complete(a);
        assert_eq!(fired, vec![1]);
        let fired = tracker.complete(b);
        assert_eq!(fired, vec![2]);
    }
}
