//! Monotonic id sequences seeded from the store.

use std::sync::atomic::{AtomicI64, Ordering};

/// Hands out increasing ids.
///
/// Message ids are drawn when a message arrives, so id order is arrival order
/// even though rows reach the store in batches.
#[derive(Debug)]
pub struct IdSequence {
    last: AtomicI64,
}

impl IdSequence {
    /// A sequence whose first id is `last + 1`.
    pub fn starting_after(last: i64) -> Self {
        Self {
            last: AtomicI64::new(last.max(0)),
        }
    }

    pub fn next_id(&self) -> i64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently issued id, 0 if none.
    pub fn current(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::starting_after(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sequence_continues_after_seed() {
        let seq = IdSequence::starting_after(41);
        assert_eq!(seq.next_id(), 42);
        assert_eq!(seq.next_id(), 43);
        assert_eq!(seq.current(), 43);
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let seq = Arc::new(IdSequence::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || (0..250).map(|_| seq.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut ids: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 1000);
        assert_eq!(ids.last(), Some(&1000));
    }
}
