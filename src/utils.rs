use crate::sync::{spin_hint, thread};
use std::time::{Duration, Instant};

/// Spins between two reads of the clock.
const SPINS_PER_DEADLINE_CHECK: u32 = 1024;

/// Busy-wait helper with an optional deadline.
///
/// Never sleeps: waiting parties are hardware polling loops whose latency
/// budget is a few microseconds.
#[derive(Debug)]
pub(crate) struct SpinWait {
    deadline: Option<Instant>,
    spins: u32,
}

impl SpinWait {
    /// `None` spins forever.
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|timeout| Instant::now() + timeout),
            spins: 0,
        }
    }

    /// Spins once. Returns `false` once the deadline has passed.
    #[inline]
    pub(crate) fn spin(&mut self) -> bool {
        spin_hint();
        self.spins = self.spins.wrapping_add(1);
        if self.spins % SPINS_PER_DEADLINE_CHECK != 0 {
            return true;
        }
        // Lets oversubscribed hosts run the party being waited for.
        thread::yield_now();
        self.deadline.map_or(true, |deadline| Instant::now() < deadline)
    }
}
