//! Fixed-size pool of OS threads for blocking work (inference, SQLite, socket I/O).
//!
//! Backed by a rayon pool. A panicking job is logged and does not take its
//! worker down; [`WorkerPool::shutdown`] waits for every job already spawned.

use std::panic::{self, AssertUnwindSafe};

use anyhow::{anyhow, Result};
use crossbeam::sync::WaitGroup;
use rayon::{ThreadPool, ThreadPoolBuilder};

pub struct WorkerPool {
    name: String,
    pool: Option<ThreadPool>,
    pending: Option<WaitGroup>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(anyhow!("worker pool needs at least one thread"));
        }
        let prefix = name.to_string();
        let pool = ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(move |idx| format!("{prefix}-{idx}"))
            .build()
            .map_err(|e| anyhow!("failed to build worker pool '{name}': {e}"))?;
        log::debug!("worker pool {} started with {} threads", name, size);
        Ok(Self {
            name: name.to_string(),
            pool: Some(pool),
            pending: Some(WaitGroup::new()),
        })
    }

    /// Queue `job` on the pool without waiting for it.
    pub fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let (Some(pool), Some(pending)) = (self.pool.as_ref(), self.pending.as_ref()) else {
            return Err(anyhow!("worker pool '{}' is shut down", self.name));
        };
        let guard = pending.clone();
        let name = self.name.clone();
        pool.spawn(move || {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
                log::error!("worker pool {} job panicked: {}", name, panic_message(&panic));
            }
            drop(guard);
        });
        Ok(())
    }

    /// Stop accepting jobs, wait for the spawned ones, and release the threads.
    pub fn shutdown(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.wait();
        }
        self.pool.take();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn runs_every_spawned_job() {
        let pool = WorkerPool::new("test", 2).unwrap();
        let (tx, rx) = channel::unbounded();
        for i in 0..8 {
            let tx = tx.clone();
            pool.spawn(move || tx.send(i * 2).unwrap()).unwrap();
        }
        drop(tx);
        let mut results: Vec<i32> = rx.iter().collect();
        results.sort();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn panicking_job_leaves_pool_usable() {
        let pool = WorkerPool::new("test", 1).unwrap();
        pool.spawn(|| panic!("boom")).unwrap();
        let (tx, rx) = channel::bounded(1);
        pool.spawn(move || tx.send(5).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 5);
    }

    #[test]
    fn slow_job_does_not_block_others() {
        let pool = WorkerPool::new("test", 2).unwrap();
        pool.spawn(|| std::thread::sleep(Duration::from_millis(300)))
            .unwrap();
        let started = Instant::now();
        let (tx, rx) = channel::bounded(1);
        pool.spawn(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[test]
    fn zero_threads_rejected() {
        assert!(WorkerPool::new("test", 0).is_err());
    }

    #[test]
    fn shutdown_waits_for_spawned_jobs_then_rejects_new_ones() {
        let mut pool = WorkerPool::new("test", 2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = done.clone();
            pool.spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert!(pool.spawn(|| ()).is_err());
    }
}
