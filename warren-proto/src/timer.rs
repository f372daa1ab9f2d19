use std::collections::{binary_heap::PeekMut, BinaryHeap};
use std::time::Instant;

use rustc_hash::FxHashMap;

/// Per-stream timers
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum Timer {
    /// When a delayed ACK (possibly carrying NACKs) must go out
    Ack,
    /// When pacing next allows a packet to be sent
    Pacing,
    /// When unacknowledged packets are declared timed out and retransmitted
    Resend,
}

/// Keeps track of the nearest deadline for each [`Timer`]
///
/// Setting a timer again supersedes the previous deadline; superseded entries
/// are purged lazily when the queue is inspected.
#[derive(Debug, Clone, Default)]
pub(crate) struct TimerTable {
    most_recent_timeout: FxHashMap<Timer, Instant>,
    timeout_queue: BinaryHeap<TimerEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerEntry {
    time: Instant,
    timer: Timer,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // `timeout_queue` is a max heap so the ordering is reversed to pop
        // the nearest deadline first
        self.time
            .cmp(&other.time)
            .then_with(|| self.timer.cmp(&other.timer))
            .reverse()
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl TimerTable {
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self.most_recent_timeout.insert(timer, time);
        self.timeout_queue.push(TimerEntry { time, timer });
    }

    pub(crate) fn get(&self, timer: Timer) -> Option<Instant> {
        self.most_recent_timeout.get(&timer).copied()
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.most_recent_timeout.remove(&timer);
    }

    pub(crate) fn is_set(&self, timer: Timer) -> bool {
        self.most_recent_timeout.contains_key(&timer)
    }

    /// Next live deadline, purging obsolete queue entries
    pub(crate) fn peek(&mut self) -> Option<Instant> {
        while let Some(entry) = self.timeout_queue.peek_mut() {
            if self.most_recent_timeout.get(&entry.timer) != Some(&entry.time) {
                PeekMut::pop(entry);
                continue;
            }
            return Some(entry.time);
        }
        None
    }

    /// Remove and return the next timer expiring at or before `now`
    pub(crate) fn expire_before(&mut self, now: Instant) -> Option<Timer> {
        while let Some(entry) = self.timeout_queue.peek_mut() {
            if self.most_recent_timeout.get(&entry.timer) != Some(&entry.time) {
                PeekMut::pop(entry);
                continue;
            }
            if entry.time > now {
                return None;
            }
            let timer = entry.timer;
            PeekMut::pop(entry);
            self.most_recent_timeout.remove(&timer);
            return Some(timer);
        }
        None
    }

    pub(crate) fn reset(&mut self) {
        self.most_recent_timeout.clear();
        self.timeout_queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn supersede_and_expire() {
        let mut timers = TimerTable::default();
        let sec = Duration::from_secs(1);
        let now = Instant::now() + Duration::from_secs(10);
        timers.set(Timer::Ack, now - 3 * sec);
        timers.set(Timer::Resend, now - 2 * sec);
        timers.set(Timer::Ack, now);

        assert_eq!(timers.peek(), Some(now - 2 * sec));
        assert_eq!(timers.expire_before(now), Some(Timer::Resend));
        assert_eq!(timers.expire_before(now), Some(Timer::Ack));
        assert_eq!(timers.expire_before(now), None);
    }

    #[test]
    fn stopped_timer_never_fires() {
        let mut timers = TimerTable::default();
        let now = Instant::now();
        timers.set(Timer::Pacing, now);
        timers.stop(Timer::Pacing);
        assert_eq!(timers.peek(), None);
        assert_eq!(timers.expire_before(now + Duration::from_secs(1)), None);
    }
}
