//! Transition records and the builder used to wire them.
//!
//! Each state owns a singly-linked chain of outbound transitions in
//! insertion order; order defines priority, first match wins.

use crate::chart::{Chart, StateId, TransitionId};
use crate::error::Error;
use crate::Event;

pub(crate) type Guard<E> = Box<dyn Fn(&E) -> Result<bool, Error> + Send>;
pub(crate) type Action<E> = Box<dyn FnMut(&E) -> Result<(), Error> + Send>;

pub(crate) struct TransitionRecord<E> {
    pub(crate) source: StateId,
    pub(crate) target: Option<StateId>,
    pub(crate) trigger: Option<E>,
    pub(crate) guard: Option<Guard<E>>,
    pub(crate) action: Option<Action<E>>,
    pub(crate) external: bool,
    pub(crate) next_in_source: Option<TransitionId>,
}

/// Builder for a single transition out of a source state.
///
/// Obtained from [`Chart::edge`]; finished with [`to`](EdgeBuilder::to) or
/// [`targetless`](EdgeBuilder::targetless). A transition without
/// [`on`](EdgeBuilder::on) is eventless: it fires during run-to-completion
/// rather than on an external event.
///
/// ```
/// # use gearwork::prelude::*;
/// # let mut chart: Chart<u32> = Chart::new("m");
/// # let a = chart.add_child(chart.root(), "a");
/// # let b = chart.add_child(chart.root(), "b");
/// chart
///     .edge(a)
///     .on(7)
///     .when(|event| Ok(*event < 100))
///     .run(|_event| Ok(()))
///     .to(b)?;
/// # Ok::<(), gearwork::Error>(())
/// ```
#[must_use = "an edge only exists once finished with `to` or `targetless`"]
pub struct EdgeBuilder<'a, E: Event> {
    chart: &'a mut Chart<E>,
    source: StateId,
    trigger: Option<E>,
    guard: Option<Guard<E>>,
    action: Option<Action<E>>,
    external: bool,
}

impl<E: Event> Chart<E> {
    /// Opens a transition builder out of `source`. Transitions are
    /// appended to the source's chain, so earlier edges win ties.
    pub fn edge(&mut self, source: StateId) -> EdgeBuilder<'_, E> {
        EdgeBuilder {
            chart: self,
            source,
            trigger: None,
            guard: None,
            action: None,
            external: true,
        }
    }
}

impl<E: Event> EdgeBuilder<'_, E> {
    /// Makes the transition fire on `event`. Without this call the
    /// transition is eventless.
    pub fn on(mut self, event: E) -> Self {
        self.trigger = Some(event);
        self
    }

    /// Gates the transition on a predicate over the current event.
    pub fn when(mut self, guard: impl Fn(&E) -> Result<bool, Error> + Send + 'static) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    /// Attaches an action, executed between the exit set and the enter
    /// set with the current event.
    pub fn run(mut self, action: impl FnMut(&E) -> Result<(), Error> + Send + 'static) -> Self {
        self.action = Some(Box::new(action));
        self
    }

    /// Marks the transition internal: when the source is compound and the
    /// target one of its descendants, the source is not exited.
    pub fn internal(mut self) -> Self {
        self.external = false;
        self
    }

    /// Marks the transition external (the default): the transition domain
    /// is the least common proper ancestor of source and target, so a
    /// self-transition re-enters the source.
    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    /// Finishes the edge with a target state.
    pub fn to(self, target: StateId) -> Result<TransitionId, Error> {
        self.finish(Some(target))
    }

    /// Finishes the edge without a target: the transition consumes its
    /// event and runs its action, but exits and enters nothing.
    pub fn targetless(self) -> Result<TransitionId, Error> {
        self.finish(None)
    }

    fn finish(self, target: Option<StateId>) -> Result<TransitionId, Error> {
        self.chart.install_edge(TransitionRecord {
            source: self.source,
            target,
            trigger: self.trigger,
            guard: self.guard,
            action: self.action,
            external: self.external,
            next_in_source: None,
        })
    }
}
