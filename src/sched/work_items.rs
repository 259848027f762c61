//! Deferred work items: background jobs that must stay off the evaluation
//! threads (async media opens, index builds) but whose completion the
//! evaluation path may need to wait on.
//!
//! One executor thread drains a pending queue in order; items can be
//! removed while still pending, promoted to the front, and waited on by
//! id. Jobs report failure through an opaque error that is logged, never
//! rethrown. Submitting may run nothing immediately - no timing is
//! promised.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{trace, warn};

pub type WorkItemId = u64;

type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

struct PendingItem {
    id: WorkItemId,
    tag: String,
    job: Job,
}

struct WorkState {
    pending: VecDeque<PendingItem>,
    running: Option<WorkItemId>,
    done: HashSet<WorkItemId>,
    next_id: WorkItemId,
    shutdown: bool,
}

struct WorkShared {
    state: Mutex<WorkState>,
    cv: Condvar,
}

pub struct WorkItemQueue {
    shared: Arc<WorkShared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Default for WorkItemQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkItemQueue {
    pub fn new() -> Self {
        let shared = Arc::new(WorkShared {
            state: Mutex::new(WorkState {
                pending: VecDeque::new(),
                running: None,
                done: HashSet::new(),
                next_id: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("rushes-work".to_string())
            .spawn(move || {
                loop {
                    let item = {
                        let mut state = thread_shared
                            .state
                            .lock()
                            .unwrap_or_else(|e| e.into_inner());
                        loop {
                            if state.shutdown {
                                return;
                            }
                            if let Some(item) = state.pending.pop_front() {
                                state.running = Some(item.id);
                                break item;
                            }
                            state = thread_shared
                                .cv
                                .wait(state)
                                .unwrap_or_else(|e| e.into_inner());
                        }
                    };

                    trace!("work item {} ({}) starting", item.id, item.tag);
                    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(item.job)) {
                        Ok(Err(e)) => warn!("work item {} ({}) failed: {e:#}", item.id, item.tag),
                        Err(_) => warn!("work item {} ({}) panicked", item.id, item.tag),
                        Ok(Ok(())) => {}
                    }

                    let mut state = thread_shared
                        .state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    state.running = None;
                    state.done.insert(item.id);
                    drop(state);
                    thread_shared.cv.notify_all();
                }
            })
            .expect("failed to spawn work thread");

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Queue a deferred job; returns an id for remove/wait/prioritize.
    pub fn add(
        &self,
        f: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
        tag: &str,
    ) -> WorkItemId {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.next_id += 1;
        let id = state.next_id;
        state.pending.push_back(PendingItem {
            id,
            tag: tag.to_string(),
            job: Box::new(f),
        });
        drop(state);
        self.shared.cv.notify_all();
        id
    }

    /// Drop a still-pending item. No effect on running or finished items.
    pub fn remove(&self, id: WorkItemId) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.retain(|item| item.id != id);
    }

    /// Move a pending item to the front of the queue.
    pub fn prioritize(&self, id: WorkItemId) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = state.pending.iter().position(|item| item.id == id) {
            if let Some(item) = state.pending.remove(pos) {
                state.pending.push_front(item);
            }
        }
    }

    /// Block until the item finishes. Returns immediately for unknown or
    /// removed ids.
    pub fn wait(&self, id: WorkItemId) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if state.done.remove(&id) {
                return;
            }
            let queued = state.running == Some(id)
                || state.pending.iter().any(|item| item.id == id);
            if !queued {
                return;
            }
            state = self
                .shared
                .cv
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }
}

impl Drop for WorkItemQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.shutdown = true;
            state.pending.clear();
        }
        self.shared.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_items_execute_in_order() {
        let queue = WorkItemQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut ids = Vec::new();
        for i in 0..4 {
            let order = Arc::clone(&order);
            ids.push(queue.add(
                move || {
                    order.lock().unwrap().push(i);
                    Ok(())
                },
                "test",
            ));
        }
        for id in &ids {
            queue.wait(*id);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_wait_blocks_until_done() {
        let queue = WorkItemQueue::new();
        let flag = Arc::new(AtomicBool::new(false));
        let id = {
            let flag = Arc::clone(&flag);
            queue.add(
                move || {
                    thread::sleep(std::time::Duration::from_millis(30));
                    flag.store(true, Ordering::Relaxed);
                    Ok(())
                },
                "slow-open",
            )
        };
        queue.wait(id);
        assert!(flag.load(Ordering::Relaxed));
        // Waiting again is a no-op
        queue.wait(id);
    }

    #[test]
    fn test_remove_pending_item() {
        let queue = WorkItemQueue::new();
        let count = Arc::new(AtomicUsize::new(0));

        // Block the executor so later items stay pending
        let gate = Arc::new(AtomicBool::new(false));
        {
            let gate = Arc::clone(&gate);
            queue.add(
                move || {
                    while !gate.load(Ordering::Relaxed) {
                        thread::sleep(std::time::Duration::from_millis(1));
                    }
                    Ok(())
                },
                "gate",
            );
        }

        let doomed = {
            let count = Arc::clone(&count);
            queue.add(
                move || {
                    count.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                },
                "doomed",
            )
        };
        queue.remove(doomed);
        gate.store(true, Ordering::Relaxed);
        queue.wait(doomed);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_prioritize_moves_to_front() {
        let queue = WorkItemQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let gate = Arc::new(AtomicBool::new(false));
        {
            let gate = Arc::clone(&gate);
            queue.add(
                move || {
                    while !gate.load(Ordering::Relaxed) {
                        thread::sleep(std::time::Duration::from_millis(1));
                    }
                    Ok(())
                },
                "gate",
            );
        }

        let mut ids = Vec::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            ids.push(queue.add(
                move || {
                    order.lock().unwrap().push(i);
                    Ok(())
                },
                "test",
            ));
        }
        queue.prioritize(ids[2]);
        gate.store(true, Ordering::Relaxed);
        for id in &ids {
            queue.wait(*id);
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 0, 1]);
    }
}
