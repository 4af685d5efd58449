// Bounded execution history
//
// Snapshots indexed by event number. Once the limit is reached the oldest snapshot is
// dropped, so the earliest reachable event moves forward.

use std::collections::VecDeque;

/// Snapshots kept by a recorded process before the oldest ones are dropped.
pub const HISTORY_LIMIT: usize = 100_000;

#[derive(Debug, Clone)]
pub struct History<T> {
    /// Event number of the first retained snapshot.
    base: usize,
    snapshots: VecDeque<T>,
    limit: usize,
}

impl<T> History<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            base: 0,
            snapshots: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    /// Event number the next snapshot will get.
    pub fn position(&self) -> usize {
        self.base + self.snapshots.len()
    }

    /// Earliest event still recorded.
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn push(&mut self, snapshot: T) {
        if self.snapshots.len() == self.limit {
            self.snapshots.pop_front();
            self.base += 1;
        }
        self.snapshots.push_back(snapshot);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.snapshots.pop_back()
    }

    pub fn get(&self, event: usize) -> Option<&T> {
        event
            .checked_sub(self.base)
            .and_then(|index| self.snapshots.get(index))
    }

    /// Forget every snapshot from `event` on.
    pub fn truncate(&mut self, event: usize) {
        if event < self.base {
            self.reset(event);
        } else {
            self.snapshots.truncate(event - self.base);
        }
    }

    /// Drop everything and continue numbering at `base`.
    pub fn reset(&mut self, base: usize) {
        self.snapshots.clear();
        self.base = base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_drops_oldest() {
        let mut history = History::new(3);
        for event in 0..5 {
            history.push(event);
        }
        assert_eq!(history.base(), 2);
        assert_eq!(history.position(), 5);
        assert_eq!(history.get(1), None);
        assert_eq!(history.get(2), Some(&2));
        assert_eq!(history.get(4), Some(&4));
        assert_eq!(history.pop(), Some(4));
        assert_eq!(history.position(), 4);
    }

    #[test]
    fn test_truncate_and_reset() {
        let mut history = History::new(10);
        for event in 0..6 {
            history.push(event);
        }
        history.truncate(3);
        assert_eq!(history.position(), 3);
        assert_eq!(history.get(2), Some(&2));

        history.reset(7);
        assert_eq!(history.base(), 7);
        assert_eq!(history.position(), 7);
        history.push(70);
        assert_eq!(history.get(7), Some(&70));
    }
}
