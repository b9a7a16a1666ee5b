//! The synchronous dispatcher: macrosteps run on the calling thread.

use std::collections::VecDeque;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::chart::{Chart, StateId};
use crate::engine::{ConflictPolicy, Engine};
use crate::error::Error;
use crate::queue::EventQueue;
use crate::{ConfigView, Event};

/// An enqueue-only handle to a machine's event queue.
///
/// Actions, guards and state hooks capture a clone of this to feed events
/// back into the machine. Posting through a mailbox never dispatches; the
/// surrounding drain loop (or the async worker) picks the event up, which
/// is what makes re-entrant posting from inside a hook safe.
pub struct Mailbox<E> {
    post: Arc<dyn Fn(E) -> Result<(), Error> + Send + Sync>,
}

impl<E> Mailbox<E> {
    pub(crate) fn new(post: Arc<dyn Fn(E) -> Result<(), Error> + Send + Sync>) -> Self {
        Self { post }
    }

    /// Enqueues an event. Fails only if the queue refuses the enqueue.
    pub fn post(&self, event: E) -> Result<(), Error> {
        (self.post)(event)
    }
}

impl<E> Clone for Mailbox<E> {
    fn clone(&self) -> Self {
        Self {
            post: Arc::clone(&self.post),
        }
    }
}

/// A state machine driven by its callers: every `post` runs macrosteps on
/// the calling thread until the queue is drained.
///
/// Events posted while the machine is stopped, or from inside hooks via a
/// [`Mailbox`], stay queued until the machine runs again. Stopping leaves
/// the queue untouched: a restarted machine sees the events it left with.
pub struct StateMachine<E: Event, Q: EventQueue<E> + Send = VecDeque<E>> {
    engine: Engine<E>,
    queue: Arc<Mutex<Q>>,
}

impl<E: Event> StateMachine<E, VecDeque<E>> {
    /// Creates a machine with the default FIFO queue.
    pub fn new(chart: Chart<E>) -> Self {
        Self::with_queue(chart, VecDeque::new())
    }
}

impl<E: Event, Q: EventQueue<E> + Send + 'static> StateMachine<E, Q> {
    /// Creates a machine with a custom event queue, e.g. a
    /// [`PriorityQueue`](crate::PriorityQueue).
    pub fn with_queue(chart: Chart<E>, queue: Q) -> Self {
        Self {
            engine: Engine::new(chart),
            queue: Arc::new(Mutex::new(queue)),
        }
    }

    /// Enters the initial configuration, sets the machine running and
    /// drains any events that queued up while it was stopped.
    ///
    /// On failure the machine unwinds: the configuration is left, the
    /// machine stays stopped and the error is returned.
    pub fn start(&mut self) -> Result<(), Error> {
        self.engine.start()?;
        self.drain()
    }

    /// Leaves the configuration and stops the machine. The event queue is
    /// preserved.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.engine.stop()
    }

    /// Enqueues `event` and, if the machine is running, dispatches queued
    /// events one macrostep at a time until quiescence.
    ///
    /// Errors from guards, actions or unrouted hook failures unwind the
    /// machine (configuration left, running cleared) and surface here. A
    /// queue that refuses the enqueue surfaces [`Error::QueueFull`] with
    /// the configuration unchanged.
    pub fn post(&mut self, event: E) -> Result<(), Error> {
        self.queue.lock().push_back(event)?;
        self.drain()
    }

    /// True while the machine is running.
    pub fn running(&self) -> bool {
        self.engine.running
    }

    /// True if `state` belonged to the configuration at the last
    /// macrostep boundary.
    pub fn is_active(&self, state: StateId) -> bool {
        self.view().is_active(state)
    }

    /// Number of configuration changes so far.
    pub fn configuration_changes(&self) -> usize {
        self.engine.configuration_changes()
    }

    /// A cloneable snapshot view for other threads.
    pub fn view(&self) -> ConfigView {
        self.engine.view()
    }

    /// An enqueue-only handle for hooks and actions.
    pub fn mailbox(&self) -> Mailbox<E> {
        let queue = Arc::clone(&self.queue);
        Mailbox::new(Arc::new(move |event| queue.lock().push_back(event)))
    }

    /// The state tree.
    pub fn chart(&self) -> &Chart<E> {
        &self.engine.chart
    }

    /// Mutable access to the state tree, for re-parenting or wiring new
    /// transitions between runs. Must only be used while the machine is
    /// stopped; mutating a running machine's tree breaks the configuration
    /// invariants.
    pub fn chart_mut(&mut self) -> &mut Chart<E> {
        &mut self.engine.chart
    }

    /// Selects the transition-conflict policy.
    pub fn conflict_policy(&mut self, policy: ConflictPolicy) {
        self.engine.policy.conflict = policy;
    }

    /// Controls whether a single state contributes at most one transition
    /// per selection round (the default). Turning this off lets every
    /// matching transition into the enabled set so conflicts become
    /// observable.
    pub fn stop_after_first_match(&mut self, enabled: bool) {
        self.engine.policy.stop_after_first_match = enabled;
    }

    /// Called once per event popped from the queue.
    pub fn on_event_dispatched(&mut self, f: impl FnMut(&E) + Send + 'static) {
        self.engine.callbacks.event_dispatched = Some(Box::new(f));
    }

    /// Called when an event matched no transition.
    pub fn on_event_discarded(&mut self, f: impl FnMut(&E) + Send + 'static) {
        self.engine.callbacks.event_discarded = Some(Box::new(f));
    }

    /// Called once per macrostep that changed the configuration, plus on
    /// start and stop.
    pub fn on_configuration_changed(&mut self, f: impl FnMut() + Send + 'static) {
        self.engine.callbacks.configuration_changed = Some(Box::new(f));
    }

    /// Called for every state whose activeness flips to true.
    pub fn on_state_entered(&mut self, f: impl FnMut(StateId) + Send + 'static) {
        self.engine.callbacks.state_entered = Some(Box::new(f));
    }

    /// Called for every state whose activeness flips to false.
    pub fn on_state_exited(&mut self, f: impl FnMut(StateId) + Send + 'static) {
        self.engine.callbacks.state_exited = Some(Box::new(f));
    }

    /// Called with `(kept, dropped)` for every transition discarded by
    /// conflict resolution under
    /// [`ConflictPolicy::ReportToCallback`].
    pub fn on_transition_conflict(
        &mut self,
        f: impl FnMut(crate::TransitionId, crate::TransitionId) + Send + 'static,
    ) {
        self.engine.callbacks.transition_conflict = Some(Box::new(f));
    }

    /// Consumes failures from entry/exit hooks and invoke activities.
    /// Without this callback such failures unwind the machine.
    pub fn on_state_error(&mut self, f: impl FnMut(StateId, &Error) + Send + 'static) {
        self.engine.callbacks.state_error = Some(Box::new(f));
    }

    fn drain(&mut self) -> Result<(), Error> {
        if !self.engine.running {
            return Ok(());
        }
        loop {
            // The queue lock is released before the macrostep so hooks can
            // post through a mailbox without deadlocking.
            let Some(event) = self.queue.lock().pop_front() else {
                return Ok(());
            };
            if let Err(err) = self.engine.macrostep(event) {
                self.engine.unwind();
                return Err(err);
            }
        }
    }
}

impl<E: Event, Q: EventQueue<E> + Send> Drop for StateMachine<E, Q> {
    fn drop(&mut self) {
        if self.engine.running {
            if let Err(err) = self.engine.stop() {
                warn!("stop during drop failed: {}", err);
            }
        }
    }
}
