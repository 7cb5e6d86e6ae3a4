//! Thread-local visited set for graph traversal.
//!
//! An epoch array avoids clearing memory between searches: a slot counts as
//! visited when its stored epoch equals the current one.

use std::cell::RefCell;

thread_local! {
    static VISITED: RefCell<EpochVisited> = RefCell::new(EpochVisited::with_capacity(1024));
}

pub(crate) struct EpochVisited {
    epochs: Vec<u32>,
    current: u32,
}

impl EpochVisited {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            epochs: vec![0; capacity.max(1024)],
            current: 1,
        }
    }

    fn reset(&mut self, capacity: usize) {
        if self.epochs.len() < capacity {
            self.epochs.resize(capacity.next_power_of_two(), 0);
        }
        self.current = self.current.wrapping_add(1);
        if self.current == 0 {
            self.epochs.fill(0);
            self.current = 1;
        }
    }

    /// Mark `slot` visited. Returns `false` if it already was.
    #[inline]
    pub(crate) fn insert(&mut self, slot: u32) -> bool {
        let idx = slot as usize;
        if idx >= self.epochs.len() {
            self.epochs.resize((idx + 1).next_power_of_two(), 0);
        }
        if self.epochs[idx] == self.current {
            return false;
        }
        self.epochs[idx] = self.current;
        true
    }
}

/// Run `f` with a cleared visited set sized for `capacity` slots.
///
/// Falls back to a fresh set if the thread-local one is already borrowed.
pub(crate) fn with_visited<R>(capacity: usize, f: impl FnOnce(&mut EpochVisited) -> R) -> R {
    VISITED.with(|cell| match cell.try_borrow_mut() {
        Ok(mut visited) => {
            visited.reset(capacity);
            f(&mut visited)
        }
        Err(_) => {
            let mut fresh = EpochVisited::with_capacity(capacity);
            f(&mut fresh)
        }
    })
}
