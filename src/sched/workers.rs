//! Evaluation worker pool with work-stealing deques.
//!
//! Prefetch jobs land in a global injector; workers drain their own deque
//! first, then the injector, then steal from each other. The shared epoch
//! counter cancels jobs that went stale while queued (play-head jumps,
//! graph edits) without touching the queue itself.

use crossbeam::deque::{Injector, Stealer, Worker};
use log::trace;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct EvalWorkers {
    injector: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    current_epoch: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
}

impl EvalWorkers {
    /// Spawn `num_threads` video evaluation workers sharing `epoch`.
    pub fn new(num_threads: usize, epoch: Arc<AtomicU64>) -> Self {
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut locals: Vec<Worker<Job>> = Vec::new();
        let mut stealers: Vec<Stealer<Job>> = Vec::new();
        let mut handles = Vec::new();

        for _ in 0..num_threads {
            let worker: Worker<Job> = Worker::new_fifo();
            stealers.push(worker.stealer());
            locals.push(worker);
        }

        for (worker_id, worker) in locals.into_iter().enumerate() {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let stealers = stealers.clone();

            let handle = thread::Builder::new()
                .name(format!("rushes-eval-{}", worker_id))
                .spawn(move || {
                    trace!("eval worker {} started", worker_id);

                    loop {
                        // Own queue first for cache locality
                        if let Some(job) = worker.pop() {
                            job();
                            continue;
                        }

                        if let Some(job) = injector.steal().success() {
                            job();
                            continue;
                        }

                        let mut found = false;
                        for stealer in &stealers {
                            if let Some(job) = stealer.steal().success() {
                                job();
                                found = true;
                                break;
                            }
                        }
                        if found {
                            continue;
                        }

                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        // Idle: short sleep instead of spinning
                        thread::sleep(std::time::Duration::from_millis(1));
                    }

                    trace!("eval worker {} stopped", worker_id);
                })
                .expect("failed to spawn eval worker");

            handles.push(handle);
        }

        trace!("eval workers initialized: {} threads", num_threads);

        Self {
            injector,
            handles,
            current_epoch: epoch,
            shutdown,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Relaxed)
    }

    /// Enqueue a job unconditionally.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.injector.push(Box::new(f));
    }

    /// Enqueue a job that only runs if the epoch still matches when a
    /// worker picks it up. Stale scrub/prefetch work cancels itself.
    pub fn execute_with_epoch<F>(&self, epoch: u64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let current_epoch = Arc::clone(&self.current_epoch);
        let wrapped = move || {
            if current_epoch.load(Ordering::Relaxed) == epoch {
                f();
            }
        };
        self.injector.push(Box::new(wrapped));
    }
}

impl Drop for EvalWorkers {
    fn drop(&mut self) {
        use std::time::{Duration, Instant};

        let num_threads = self.handles.len();
        trace!("eval workers shutting down ({} threads)...", num_threads);

        self.shutdown.store(true, Ordering::SeqCst);

        // Queued epoch-checked jobs skip themselves after shutdown bumps
        // the epoch; the timeout is a safety net for a stuck evaluation
        let deadline = Instant::now() + Duration::from_millis(500);

        let handles = std::mem::take(&mut self.handles);
        for handle in handles {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("worker shutdown timeout, detaching");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("all {} eval workers stopped", num_threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_jobs_run() {
        let epoch = Arc::new(AtomicU64::new(0));
        let workers = EvalWorkers::new(2, epoch);
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let count = Arc::clone(&count);
            workers.execute(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while count.load(Ordering::Relaxed) < 16 && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn test_stale_epoch_jobs_are_skipped() {
        let epoch = Arc::new(AtomicU64::new(0));
        let workers = EvalWorkers::new(1, Arc::clone(&epoch));
        let count = Arc::new(AtomicUsize::new(0));

        // Stale before it can run
        epoch.store(5, Ordering::Relaxed);
        {
            let count = Arc::clone(&count);
            workers.execute_with_epoch(4, move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }
        // Current epoch runs
        {
            let count = Arc::clone(&count);
            workers.execute_with_epoch(5, move || {
                count.fetch_add(100, Ordering::Relaxed);
            });
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while count.load(Ordering::Relaxed) < 100 && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::Relaxed), 100);
    }
}
