//! A fixed-size worker pool backing pooled invoke activities.
//!
//! The pool never queues beyond its capacity: enqueueing with no idle
//! worker left is an error, not a wait. Workers finish the task they are
//! on before observing shutdown, and dropping the pool drains whatever was
//! already accepted.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::error::Error;

type Task = Box<dyn FnOnce() -> Result<(), Error> + Send>;

#[derive(Debug)]
struct CompletionCell {
    result: Mutex<Option<Result<(), Error>>>,
    ready: Condvar,
}

/// Handle to one accepted task; resolves when the worker finishes it.
#[derive(Debug)]
pub struct Completion {
    cell: Arc<CompletionCell>,
}

impl Completion {
    /// Blocks until the task has run and returns its result.
    pub fn wait(self) -> Result<(), Error> {
        let mut result = self.cell.result.lock();
        while result.is_none() {
            self.cell.ready.wait(&mut result);
        }
        result.take().expect("completion resolved")
    }
}

struct PoolState {
    tasks: VecDeque<(Task, Arc<CompletionCell>)>,
    idle: usize,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_ready: Condvar,
}

/// Cloneable submission handle to a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl PoolHandle {
    /// Hands a task to an idle worker. Fails with
    /// [`Error::PoolUnderflow`] when every worker is busy; the pool never
    /// blocks the caller.
    pub fn enqueue(&self, task: Task) -> Result<Completion, Error> {
        let cell = Arc::new(CompletionCell {
            result: Mutex::new(None),
            ready: Condvar::new(),
        });
        {
            let mut state = self.shared.state.lock();
            if state.idle == 0 || state.shutdown {
                return Err(Error::PoolUnderflow);
            }
            state.idle -= 1;
            state.tasks.push_back((task, Arc::clone(&cell)));
        }
        self.shared.work_ready.notify_one();
        Ok(Completion { cell })
    }
}

/// A fixed-size pool of worker threads.
///
/// The pool value can be moved freely (its workers follow it); dropping it
/// lets begun and accepted tasks finish, then joins every worker.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns a pool of `size` workers.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "the pool must have at least one worker");
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                idle: size,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
        });
        let workers = (0..size)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker(index, &shared))
            })
            .collect();
        Self { shared, workers }
    }

    /// A cloneable submission handle, e.g. for
    /// [`PooledInvoke`](crate::PooledInvoke).
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of workers without a task right now.
    pub fn idle_workers(&self) -> usize {
        self.shared.state.lock().idle
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work_ready.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker(index: usize, shared: &PoolShared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.tasks.pop_front() {
                    break Some(job);
                }
                if state.shutdown {
                    break None;
                }
                shared.work_ready.wait(&mut state);
            }
        };
        let Some((task, cell)) = job else {
            return;
        };

        trace!("pool worker {} picked up a task", index);
        let result = catch_unwind(AssertUnwindSafe(task))
            .unwrap_or_else(|_| Err(Error::hook("pool task panicked")));

        *cell.result.lock() = Some(result);
        cell.ready.notify_all();
        shared.state.lock().idle += 1;
    }
}
