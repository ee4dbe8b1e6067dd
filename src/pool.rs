//! A fixed set of worker threads fed from one FIFO queue.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use error::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` workers.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("a worker pool needs at least one thread".to_owned()));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::with_capacity(size * 2),
                closed: false,
            }),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(size);
        for n in 0..size {
            let shared = shared.clone();
            let worker = thread::Builder::new()
                .name(format!("worker-{}", n))
                .spawn(move || work(&shared))?;
            workers.push(worker);
        }
        debug!("Started {} workers", size);

        Ok(WorkerPool { shared, workers })
    }

    /// Queue a task and wake one worker for it.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.shared.queue.lock()?;
            if queue.closed {
                return Err(Error::Shutdown);
            }
            queue.tasks.push_back(Box::new(task));
        }
        self.shared.available.notify_one();
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting tasks, let the workers finish what is queued, and wait for them.
    pub fn shutdown(&mut self) {
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.closed = true;
        }
        self.shared.available.notify_all();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("A worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(shared: &Shared) {
    loop {
        let task = {
            let mut queue = match shared.queue.lock() {
                Ok(queue) => queue,
                Err(_) => return,
            };
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                if queue.closed {
                    return;
                }
                queue = match shared.available.wait(queue) {
                    Ok(queue) => queue,
                    Err(_) => return,
                };
            }
        };

        // a panicking task must not take the worker down with it
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("A task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_every_task() {
        let mut pool = WorkerPool::new(4).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let count = count.clone();
            pool.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }).unwrap();
        }
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn tasks_run_in_parallel() {
        let pool = WorkerPool::new(2).unwrap();
        let (first_tx, first_rx) = mpsc::channel();
        let (second_tx, second_rx) = mpsc::channel();

        // each task waits for the other, so this only finishes with two workers running
        pool.submit(move || {
            first_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            second_tx.send(()).unwrap();
        }).unwrap();
        pool.submit(move || {
            first_tx.send(()).unwrap();
        }).unwrap();

        second_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let mut pool = WorkerPool::new(1).unwrap();
        pool.shutdown();
        match pool.submit(|| ()) {
            Err(Error::Shutdown) => {}
            other => panic!("expected shutdown error, got {:?}", other),
        }
    }

    #[test]
    fn survives_panicking_tasks() {
        let mut pool = WorkerPool::new(1).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        pool.submit(|| panic!("boom")).unwrap();
        let after = count.clone();
        pool.submit(move || {
            after.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn zero_workers_is_an_error() {
        assert!(WorkerPool::new(0).is_err());
    }
}
