//! Fixed-size pool of named worker threads fed through a channel.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one). Threads are named `<name>-<n>`.
    pub fn new(name: impl Into<String>, size: usize) -> std::io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(size.max(1));
        for index in 0..size.max(1) {
            let receiver = Arc::clone(&receiver);
            let in_flight = Arc::clone(&in_flight);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(&receiver, &in_flight))?;
            workers.push(handle);
        }

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            in_flight,
        })
    }

    /// Queue `job`. Returns false once the pool is shut down.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            tracing::debug!(pool = %self.name, "job rejected, pool is shut down");
            return false;
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if sender.send(Box::new(job)).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// No job queued or running.
    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop accepting jobs and wait for the queued ones to finish. A worker
    /// shutting down its own pool is not joined.
    pub fn shutdown(&self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
        let workers: Vec<JoinHandle<()>> =
            self.workers.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::warn!(pool = %self.name, "worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>, in_flight: &AtomicUsize) {
    loop {
        let job = receiver.lock().unwrap_or_else(PoisonError::into_inner).recv();
        match job {
            Ok(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(
                        thread = thread::current().name().unwrap_or("worker"),
                        "job panicked"
                    );
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_jobs_run_and_pool_drains() {
        let pool = WorkerPool::new("test", 3).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            assert!(pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert!(pool.is_idle());
        assert!(!pool.execute(|| {}));
    }

    #[test]
    fn test_panicking_job_does_not_kill_the_worker() {
        let pool = WorkerPool::new("test", 1).unwrap();
        pool.execute(|| panic!("boom"));
        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(42));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !pool.is_idle() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(pool.is_idle());
    }
}
