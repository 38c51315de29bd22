//! Fixed-size worker pool with a FIFO task queue.
//!
//! Tasks start in enqueue order; completion order across workers is
//! unspecified. `wait_all` blocks until the queue is empty and nothing is
//! executing. Dropping the pool signals shutdown, wakes every worker, joins
//! them, and discards still-queued tasks (dropping a task drops whatever
//! completion channel it captured, which is how pending operations observe
//! the shutdown).

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Task>,
    running: usize,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    task_ready: Condvar,
    all_done: Condvar,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState::default()),
            task_ready: Condvar::new(),
            all_done: Condvar::new(),
        });

        let workers = (0..threads)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("world-state-worker-{worker}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        WorkerPool { shared, workers }
    }

    /// Queues a task. Never blocks waiting for a worker.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.shared.state.lock().expect("pool mutex poisoned");
            if state.shutdown {
                // Late tasks are dropped, same as queued tasks at shutdown.
                return;
            }
            state.queue.push_back(Box::new(task));
        }
        self.shared.task_ready.notify_one();
    }

    /// Blocks until the queue is empty and no task is executing.
    pub fn wait_all(&self) {
        let mut state = self.shared.state.lock().expect("pool mutex poisoned");
        while !state.queue.is_empty() || state.running > 0 {
            state = self
                .shared
                .all_done
                .wait(state)
                .expect("pool mutex poisoned");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let pending = {
            let mut state = self.shared.state.lock().expect("pool mutex poisoned");
            state.shutdown = true;
            // Pending tasks are dropped here; running ones finish.
            std::mem::take(&mut state.queue)
        };
        drop(pending);
        self.shared.task_ready.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.shared.all_done.notify_all();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let task = {
            let mut state = shared.state.lock().expect("pool mutex poisoned");
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(task) = state.queue.pop_front() {
                    state.running += 1;
                    break task;
                }
                state = shared.task_ready.wait(state).expect("pool mutex poisoned");
            }
        };

        task();

        let mut state = shared.state.lock().expect("pool mutex poisoned");
        state.running -= 1;
        if state.queue.is_empty() && state.running == 0 {
            shared.all_done.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Tasks run and wait_all observes quiescence.
    #[test]
    fn test_runs_tasks_to_completion() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_all();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    /// With a single worker, tasks execute in enqueue order.
    #[test]
    fn test_fifo_order_on_single_worker() {
        let pool = WorkerPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for task in 0..20 {
            let order = Arc::clone(&order);
            pool.enqueue(move || {
                order.lock().unwrap().push(task);
            });
        }
        pool.wait_all();
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    /// wait_all returns immediately on an idle pool.
    #[test]
    fn test_wait_all_idle() {
        let pool = WorkerPool::new(2);
        pool.wait_all();
    }

    /// Dropping the pool drops queued tasks, which hangs up their channels.
    #[test]
    fn test_shutdown_drops_pending_tasks() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (pending_tx, pending_rx) = mpsc::channel();

        let pool = WorkerPool::new(1);
        pool.enqueue(move || {
            started_tx.send(()).unwrap();
            // Hold the only worker until the pending task's fate is decided.
            let _ = release_rx.recv_timeout(Duration::from_secs(10));
        });
        pool.enqueue(move || {
            let _ = pending_tx.send(());
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Shut down while the worker is still busy: the queued task is
        // discarded before the join, so its sender hangs up.
        let shutdown = std::thread::spawn(move || drop(pool));
        assert!(matches!(
            pending_rx.recv_timeout(Duration::from_secs(5)),
            Err(mpsc::RecvTimeoutError::Disconnected)
        ));

        release_tx.send(()).unwrap();
        shutdown.join().unwrap();
    }
}
