//! Memoized derived state with explicit invalidation.
//!
//! Range info, structure info and retime warp tables are all "recompute
//! lazily under a lock, at most once per invalidation, no matter how many
//! threads race to read" values. This cell is that policy in one place
//! instead of a dirty flag per member.

use std::sync::Mutex;

/// Lazily recomputed value guarded by a dirty flag and a lock.
///
/// `get_or_update` recomputes at most once per `invalidate()` call even when
/// called concurrently; readers that lose the race block on the lock and see
/// the freshly computed value.
#[derive(Debug, Default)]
pub struct Memoized<T: Clone> {
    state: Mutex<MemoState<T>>,
}

#[derive(Debug)]
struct MemoState<T> {
    value: Option<T>,
    dirty: bool,
}

impl<T> Default for MemoState<T> {
    fn default() -> Self {
        Self {
            value: None,
            dirty: true,
        }
    }
}

impl<T: Clone> Memoized<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoState::default()),
        }
    }

    /// Return the cached value, recomputing it first if invalidated.
    pub fn get_or_update(&self, compute: impl FnOnce() -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.dirty || state.value.is_none() {
            state.value = Some(compute());
            state.dirty = false;
        }
        state.value.clone().unwrap()
    }

    /// Mark the value stale; the next read recomputes.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.dirty = true;
    }

    /// Peek without recomputing. None when never computed or invalidated.
    pub fn peek(&self) -> Option<T> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.dirty { None } else { state.value.clone() }
    }
}

impl<T: Clone> Clone for Memoized<T> {
    fn clone(&self) -> Self {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self {
            state: Mutex::new(MemoState {
                value: state.value.clone(),
                dirty: state.dirty,
            }),
        }
    }
}
