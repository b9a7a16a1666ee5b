//! The asynchronous dispatcher: a dedicated worker thread owns macrostep
//! execution, fed through a condition variable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::chart::{Chart, StateId};
use crate::engine::{ConflictPolicy, Engine};
use crate::error::Error;
use crate::machine::Mailbox;
use crate::queue::EventQueue;
use crate::{ConfigView, Event};

struct Control<Q> {
    queue: Q,
    start_request: bool,
    stop_request: bool,
    shutdown: bool,
    loop_active: bool,
}

struct Shared<E, Q> {
    engine: Mutex<Engine<E>>,
    control: Mutex<Control<Q>>,
    signal: Condvar,
}

/// Clears the loop-active flag when the worker exits, however it exits.
struct LoopActiveGuard<'a, E, Q> {
    shared: &'a Shared<E, Q>,
}

impl<E, Q> Drop for LoopActiveGuard<'_, E, Q> {
    fn drop(&mut self) {
        self.shared.control.lock().loop_active = false;
        self.shared.signal.notify_all();
    }
}

/// A state machine owned by a worker thread.
///
/// `post` enqueues and signals; the worker pops events and runs one
/// macrostep per event under the machine lock. The worker idles until
/// [`start`](AsyncMachine::start) is requested; a stop request while
/// running leaves the configuration and returns the worker to idle, so the
/// machine can be started again. Dropping the machine (or calling
/// [`halt`](AsyncMachine::halt)) shuts the worker down and waits for it.
///
/// Errors from guards, actions or unrouted hook failures unwind the
/// machine and end the worker; [`join`](AsyncMachine::join) returns them.
pub struct AsyncMachine<E: Event, Q: EventQueue<E> + Send + 'static = VecDeque<E>> {
    shared: Arc<Shared<E, Q>>,
    worker: Option<JoinHandle<Result<(), Error>>>,
    view: ConfigView,
}

impl<E: Event> AsyncMachine<E, VecDeque<E>> {
    /// Creates a machine with the default FIFO queue and spawns its
    /// worker thread. The worker idles until `start`.
    pub fn new(chart: Chart<E>) -> Self {
        Self::with_queue(chart, VecDeque::new())
    }
}

impl<E: Event, Q: EventQueue<E> + Send + 'static> AsyncMachine<E, Q> {
    /// Creates a machine with a custom event queue and spawns its worker.
    pub fn with_queue(chart: Chart<E>, queue: Q) -> Self {
        let engine = Engine::new(chart);
        let view = engine.view();
        let shared = Arc::new(Shared {
            engine: Mutex::new(engine),
            control: Mutex::new(Control {
                queue,
                start_request: false,
                stop_request: false,
                shutdown: false,
                loop_active: true,
            }),
            signal: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || {
            let _guard = LoopActiveGuard {
                shared: &*worker_shared,
            };
            event_loop(&worker_shared)
        });
        Self {
            shared,
            worker: Some(worker),
            view,
        }
    }

    /// Requests the worker to enter the initial configuration and begin
    /// dispatching events.
    pub fn start(&self) {
        self.shared.control.lock().start_request = true;
        self.shared.signal.notify_all();
    }

    /// Requests the worker to leave the configuration. A running machine
    /// returns to idle and can be started again; an idle machine's worker
    /// exits.
    pub fn stop(&self) {
        self.shared.control.lock().stop_request = true;
        self.shared.signal.notify_all();
    }

    /// Enqueues an event and wakes the worker. A queue that refuses the
    /// enqueue surfaces its error here; the machine configuration is
    /// unchanged.
    pub fn post(&self, event: E) -> Result<(), Error> {
        self.shared.control.lock().queue.push_back(event)?;
        self.shared.signal.notify_all();
        Ok(())
    }

    /// True while the machine is running. Takes the machine lock.
    pub fn running(&self) -> bool {
        self.shared.engine.lock().running
    }

    /// True if `state` belonged to the configuration at the last
    /// macrostep boundary. Never takes the machine lock.
    pub fn is_active(&self, state: StateId) -> bool {
        self.view.is_active(state)
    }

    /// Number of configuration changes so far.
    pub fn configuration_changes(&self) -> usize {
        self.view.changes()
    }

    /// A cloneable snapshot view for other threads.
    pub fn view(&self) -> ConfigView {
        self.view.clone()
    }

    /// An enqueue-only handle for hooks and actions.
    pub fn mailbox(&self) -> Mailbox<E> {
        let shared = Arc::clone(&self.shared);
        Mailbox::new(Arc::new(move |event| {
            shared.control.lock().queue.push_back(event)?;
            shared.signal.notify_all();
            Ok(())
        }))
    }

    /// Shuts the worker down (leaving the configuration if the machine is
    /// running) and waits until its loop has ended.
    pub fn halt(&self) {
        let mut control = self.shared.control.lock();
        control.shutdown = true;
        self.shared.signal.notify_all();
        while control.loop_active {
            self.shared.signal.wait(&mut control);
        }
    }

    /// Halts the machine and returns the worker's result: `Ok` after a
    /// clean shutdown, or the error that ended dispatching.
    pub fn join(mut self) -> Result<(), Error> {
        self.halt();
        match self.worker.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(Error::hook("event loop panicked"))),
            None => Ok(()),
        }
    }

    /// Selects the transition-conflict policy.
    pub fn conflict_policy(&self, policy: ConflictPolicy) {
        self.shared.engine.lock().policy.conflict = policy;
    }

    /// See [`StateMachine::stop_after_first_match`](crate::StateMachine::stop_after_first_match).
    pub fn stop_after_first_match(&self, enabled: bool) {
        self.shared.engine.lock().policy.stop_after_first_match = enabled;
    }

    /// Called once per event popped from the queue.
    pub fn on_event_dispatched(&self, f: impl FnMut(&E) + Send + 'static) {
        self.shared.engine.lock().callbacks.event_dispatched = Some(Box::new(f));
    }

    /// Called when an event matched no transition.
    pub fn on_event_discarded(&self, f: impl FnMut(&E) + Send + 'static) {
        self.shared.engine.lock().callbacks.event_discarded = Some(Box::new(f));
    }

    /// Called once per macrostep that changed the configuration, plus on
    /// start and stop.
    pub fn on_configuration_changed(&self, f: impl FnMut() + Send + 'static) {
        self.shared.engine.lock().callbacks.configuration_changed = Some(Box::new(f));
    }

    /// Called for every state whose activeness flips to true.
    pub fn on_state_entered(&self, f: impl FnMut(StateId) + Send + 'static) {
        self.shared.engine.lock().callbacks.state_entered = Some(Box::new(f));
    }

    /// Called for every state whose activeness flips to false.
    pub fn on_state_exited(&self, f: impl FnMut(StateId) + Send + 'static) {
        self.shared.engine.lock().callbacks.state_exited = Some(Box::new(f));
    }

    /// Called with `(kept, dropped)` for discarded conflicting
    /// transitions.
    pub fn on_transition_conflict(
        &self,
        f: impl FnMut(crate::TransitionId, crate::TransitionId) + Send + 'static,
    ) {
        self.shared.engine.lock().callbacks.transition_conflict = Some(Box::new(f));
    }

    /// Consumes failures from entry/exit hooks and invoke activities.
    pub fn on_state_error(&self, f: impl FnMut(StateId, &Error) + Send + 'static) {
        self.shared.engine.lock().callbacks.state_error = Some(Box::new(f));
    }
}

impl<E: Event, Q: EventQueue<E> + Send + 'static> Drop for AsyncMachine<E, Q> {
    fn drop(&mut self) {
        self.halt();
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("event loop ended with an error: {}", err),
                Err(_) => warn!("event loop panicked"),
            }
        }
    }
}

fn event_loop<E: Event, Q: EventQueue<E> + Send>(shared: &Shared<E, Q>) -> Result<(), Error> {
    loop {
        // Idle: wait for a start request. A stop request or shutdown here
        // ends the loop.
        {
            let mut control = shared.control.lock();
            while !(control.start_request || control.stop_request || control.shutdown) {
                shared.signal.wait(&mut control);
            }
            control.start_request = false;
            if control.stop_request || control.shutdown {
                control.stop_request = false;
                debug!("event loop shutting down while idle");
                return Ok(());
            }
        }

        // Starting: bring up the initial configuration under the machine
        // lock. A failure has already unwound the engine; it ends the
        // loop and becomes the worker's result.
        shared.engine.lock().start()?;

        // Running: one macrostep per queued event until a stop request.
        loop {
            let (event, shutdown) = {
                let mut control = shared.control.lock();
                while !(!control.queue.is_empty() || control.stop_request || control.shutdown) {
                    shared.signal.wait(&mut control);
                }
                control.start_request = false;
                if control.stop_request || control.shutdown {
                    control.stop_request = false;
                    (None, control.shutdown)
                } else {
                    (control.queue.pop_front(), false)
                }
            };

            match event {
                Some(event) => {
                    let mut engine = shared.engine.lock();
                    if let Err(err) = engine.macrostep(event) {
                        engine.unwind();
                        return Err(err);
                    }
                }
                None => {
                    let mut engine = shared.engine.lock();
                    engine.stop()?;
                    drop(engine);
                    if shutdown {
                        debug!("event loop shutting down");
                        return Ok(());
                    }
                    break;
                }
            }
        }
    }
}
