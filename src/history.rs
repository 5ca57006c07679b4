use std::collections::VecDeque;

use crate::types::Direction;

/// Bounded record of the most recent signal directions, oldest first.
#[derive(Debug, Clone)]
pub struct SignalHistory {
    entries: VecDeque<Direction>,
    capacity: usize,
}

impl SignalHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        SignalHistory { entries: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, direction: Direction) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(direction);
    }

    /// True when the last `n` entries all equal `direction`.
    /// `n == 0` is trivially satisfied; fewer than `n` entries never is.
    pub fn persisted(&self, direction: Direction, n: usize) -> bool {
        if self.entries.len() < n {
            return false;
        }
        self.entries.iter().rev().take(n).all(|d| *d == direction)
    }

    /// Count of direction changes among the last `window` non-HOLD entries.
    pub fn direction_changes(&self, window: usize) -> usize {
        let recent: Vec<Direction> = self
            .entries
            .iter()
            .rev()
            .filter(|d| **d != Direction::Hold)
            .take(window)
            .copied()
            .collect();
        recent.windows(2).filter(|w| w[0] != w[1]).count()
    }

    pub fn count(&self, direction: Direction) -> usize {
        self.entries.iter().filter(|d| **d == direction).count()
    }
}
