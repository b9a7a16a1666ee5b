//! Long-running invoke activities owned by states.
//!
//! An invoke activity starts once the machine is quiescent after its state
//! was entered and is stopped cooperatively when the state leaves the
//! configuration: the engine signals an [`ExitSignal`] and joins. Worker
//! threads are never terminated forcibly; activity bodies are expected to
//! observe their signal.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::chart::StateHooks;
use crate::error::Error;
use crate::pool::{Completion, PoolHandle};

type InvokeBody = Arc<dyn Fn(&ExitSignal) -> Result<(), Error> + Send + Sync>;

/// Cooperative cancellation token handed to invoke activity bodies.
pub struct ExitSignal {
    requested: Mutex<bool>,
    signaled: Condvar,
}

impl ExitSignal {
    pub(crate) fn new() -> Self {
        Self {
            requested: Mutex::new(false),
            signaled: Condvar::new(),
        }
    }

    /// Blocks until an exit is requested.
    pub fn wait(&self) {
        let mut requested = self.requested.lock();
        while !*requested {
            self.signaled.wait(&mut requested);
        }
    }

    /// Blocks until an exit is requested or `timeout` elapses. Returns
    /// true if the exit was requested.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut requested = self.requested.lock();
        if *requested {
            return true;
        }
        self.signaled.wait_for(&mut requested, timeout);
        *requested
    }

    /// True once an exit has been requested.
    pub fn is_signaled(&self) -> bool {
        *self.requested.lock()
    }

    pub(crate) fn request(&self) {
        *self.requested.lock() = true;
        self.signaled.notify_all();
    }

    pub(crate) fn reset(&self) {
        *self.requested.lock() = false;
    }
}

/// [`StateHooks`] running an invoke activity in its own thread.
///
/// `enter_invoke` spawns the body; `exit_invoke` signals the token, joins
/// the thread and surfaces the body's result.
///
/// ```
/// use gearwork::ThreadedInvoke;
///
/// let hooks = ThreadedInvoke::new(|signal| {
///     while !signal.is_signaled() {
///         // ... poll some device ...
///         signal.wait_for(std::time::Duration::from_millis(10));
///     }
///     Ok(())
/// });
/// ```
pub struct ThreadedInvoke {
    body: InvokeBody,
    signal: Arc<ExitSignal>,
    worker: Option<JoinHandle<Result<(), Error>>>,
}

impl ThreadedInvoke {
    pub fn new(body: impl Fn(&ExitSignal) -> Result<(), Error> + Send + Sync + 'static) -> Self {
        Self {
            body: Arc::new(body),
            signal: Arc::new(ExitSignal::new()),
            worker: None,
        }
    }
}

impl<E> StateHooks<E> for ThreadedInvoke {
    fn enter_invoke(&mut self) -> Result<(), Error> {
        self.signal.reset();
        let body = Arc::clone(&self.body);
        let signal = Arc::clone(&self.signal);
        self.worker = Some(thread::spawn(move || body(&signal)));
        Ok(())
    }

    fn exit_invoke(&mut self) -> Result<(), Error> {
        self.signal.request();
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .unwrap_or_else(|_| Err(Error::hook("invoke activity panicked"))),
            None => Ok(()),
        }
    }
}

/// [`StateHooks`] running an invoke activity on a
/// [`WorkerPool`](crate::WorkerPool).
///
/// `enter_invoke` claims an idle worker; if none is left the pool refuses
/// with [`Error::PoolUnderflow`], which the engine treats as an entry-time
/// failure. `exit_invoke` signals the token and waits for the task.
pub struct PooledInvoke {
    pool: PoolHandle,
    body: InvokeBody,
    signal: Arc<ExitSignal>,
    completion: Option<Completion>,
}

impl PooledInvoke {
    pub fn new(
        pool: PoolHandle,
        body: impl Fn(&ExitSignal) -> Result<(), Error> + Send + Sync + 'static,
    ) -> Self {
        Self {
            pool,
            body: Arc::new(body),
            signal: Arc::new(ExitSignal::new()),
            completion: None,
        }
    }
}

impl<E> StateHooks<E> for PooledInvoke {
    fn enter_invoke(&mut self) -> Result<(), Error> {
        self.signal.reset();
        let body = Arc::clone(&self.body);
        let signal = Arc::clone(&self.signal);
        self.completion = Some(self.pool.enqueue(Box::new(move || body(&signal)))?);
        Ok(())
    }

    fn exit_invoke(&mut self) -> Result<(), Error> {
        self.signal.request();
        match self.completion.take() {
            Some(completion) => completion.wait(),
            None => Ok(()),
        }
    }
}
