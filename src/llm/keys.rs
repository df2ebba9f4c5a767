//! Ordered API key set with a forward-only cursor.
//!
//! All workers share one cursor. When a request fails with a quota error the
//! worker calls [`ApiKeyCursor::rotate_from`] with the index of the key it
//! used; a compare-and-swap makes sure concurrent quota failures on the same
//! key advance the cursor exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Outcome of a rotation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    /// This call moved the cursor to the given index.
    Advanced(usize),
    /// Another worker already moved the cursor; it points at the given index.
    AlreadyMoved(usize),
    /// Every key has been used up.
    Exhausted,
}

/// Forward-only cursor over a list of API keys.
#[derive(Debug)]
pub struct ApiKeyCursor {
    keys: Vec<String>,
    index: AtomicUsize,
}

impl ApiKeyCursor {
    /// Creates a cursor positioned on the first key.
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            index: AtomicUsize::new(0),
        }
    }

    /// Returns the active key together with its index, or `None` once every
    /// key is exhausted.
    pub fn current(&self) -> Option<(usize, &str)> {
        let index = self.index.load(Ordering::Acquire);
        self.keys.get(index).map(|key| (index, key.as_str()))
    }

    /// Moves past the key at `observed`.
    ///
    /// If another worker already rotated away from `observed`, the cursor is
    /// left where it is.
    pub fn rotate_from(&self, observed: usize) -> Rotation {
        let next = observed.saturating_add(1);
        match self
            .index
            .compare_exchange(observed, next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) if next < self.keys.len() => Rotation::Advanced(next),
            Err(actual) if actual < self.keys.len() => Rotation::AlreadyMoved(actual),
            _ => Rotation::Exhausted,
        }
    }

    /// Whether no usable key is left.
    pub fn exhausted(&self) -> bool {
        self.index.load(Ordering::Acquire) >= self.keys.len()
    }

    /// Index of the active key.
    pub fn position(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Masks a key for logging.
pub fn masked(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cursor(keys: &[&str]) -> ApiKeyCursor {
        ApiKeyCursor::new(keys.iter().map(|k| k.to_string()).collect())
    }

    #[test]
    fn test_current_and_rotate() {
        let keys = cursor(&["key-a", "key-b"]);
        assert_eq!(keys.current(), Some((0, "key-a")));

        assert_eq!(keys.rotate_from(0), Rotation::Advanced(1));
        assert_eq!(keys.current(), Some((1, "key-b")));
        assert!(!keys.exhausted());

        assert_eq!(keys.rotate_from(1), Rotation::Exhausted);
        assert_eq!(keys.current(), None);
        assert!(keys.exhausted());
    }

    #[test]
    fn test_stale_rotation_does_not_skip_keys() {
        let keys = cursor(&["a", "b", "c"]);
        assert_eq!(keys.rotate_from(0), Rotation::Advanced(1));
        // A second worker saw the same quota error on key 0.
        assert_eq!(keys.rotate_from(0), Rotation::AlreadyMoved(1));
        assert_eq!(keys.position(), 1);
    }

    #[test]
    fn test_empty_cursor_is_exhausted() {
        let keys = cursor(&[]);
        assert!(keys.is_empty());
        assert!(keys.exhausted());
        assert_eq!(keys.current(), None);
    }

    #[test]
    fn test_concurrent_rotation_moves_once() {
        let keys = Arc::new(cursor(&["a", "b", "c", "d"]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let keys = Arc::clone(&keys);
                std::thread::spawn(move || keys.rotate_from(0))
            })
            .collect();

        let advanced = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|rotation| *rotation == Rotation::Advanced(1))
            .count();

        assert_eq!(advanced, 1);
        assert_eq!(keys.position(), 1);
    }

    #[test]
    fn test_masked() {
        assert_eq!(masked("abc"), "***");
        assert_eq!(masked("sk-1234567890abcdef"), "sk-1...cdef");
    }
}
