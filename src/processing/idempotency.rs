//! Idempotency guard
//!
//! Tracks which entity identifiers have already had their business effect
//! applied. The only operation is an atomic check-and-mark, so there is no
//! window between asking and recording.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

/// Membership store for processed entity identifiers
///
/// Implementations must make [`IdempotencyGuard::check_and_mark`] atomic:
/// concurrent calls with the same identifier yield exactly one `true`.
pub trait IdempotencyGuard: Send + Sync {
    /// Returns `true` the first time `entity_id` is seen and records it,
    /// `false` on every later call
    fn check_and_mark(&self, entity_id: &str) -> bool;

    /// Number of identifiers recorded so far
    fn processed_count(&self) -> usize;
}

/// Process-lifetime guard backed by a mutex-protected set
///
/// Identifiers are never removed.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyGuard {
    processed: Mutex<HashSet<String>>,
}

impl InMemoryIdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the set half-updated
    // (insert is the only mutation), so a poisoned lock is still usable.
    fn processed(&self) -> MutexGuard<'_, HashSet<String>> {
        self.processed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl IdempotencyGuard for InMemoryIdempotencyGuard {
    fn check_and_mark(&self, entity_id: &str) -> bool {
        let mut processed = self.processed();
        if processed.contains(entity_id) {
            return false;
        }
        processed.insert(entity_id.to_string())
    }

    fn processed_count(&self) -> usize {
        self.processed().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_call_marks() {
        let guard = InMemoryIdempotencyGuard::new();

        assert!(guard.check_and_mark("order-1"));
        assert!(!guard.check_and_mark("order-1"));
        assert!(!guard.check_and_mark("order-1"));
        assert_eq!(guard.processed_count(), 1);
    }

    #[test]
    fn test_identifiers_are_independent() {
        let guard = InMemoryIdempotencyGuard::new();

        assert!(guard.check_and_mark("order-1"));
        assert!(guard.check_and_mark("order-2"));
        assert!(guard.check_and_mark(""));
        assert_eq!(guard.processed_count(), 3);
    }

    #[test]
    fn test_concurrent_threads_single_winner() {
        let guard = Arc::new(InMemoryIdempotencyGuard::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.check_and_mark("order-race"))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|marked| *marked)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(guard.processed_count(), 1);
    }
}
