//! The macrostep engine shared by both dispatchers.
//!
//! A macrostep selects transitions for the incoming event, runs one
//! microstep, chases eventless transitions until quiescence, publishes the
//! visible configuration and advances the invoke lifecycle. The stages and
//! their ordering constraints (post-order selection and exit, pre-order
//! entry, history capture before ancestors are cleared) live here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::chart::{Chart, StateFlags, StateId, TransitionId};
use crate::error::Error;
use crate::Event;

/// What to do when two enabled transitions have overlapping exit sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Drop the later transition silently.
    #[default]
    Ignore,
    /// Drop the later transition and notify the transition-conflict
    /// callback with the surviving and the discarded transition.
    ReportToCallback,
    /// Fail the macrostep with [`Error::TransitionConflict`].
    Fail,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Policy {
    pub(crate) conflict: ConflictPolicy,
    /// When set (the default), a state contributes at most one transition
    /// per selection round. Turning it off lets every matching transition
    /// of a state into the enabled set, which is what makes conflicts
    /// reportable.
    pub(crate) stop_after_first_match: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            conflict: ConflictPolicy::Ignore,
            stop_after_first_match: true,
        }
    }
}

pub(crate) struct Callbacks<E> {
    pub(crate) event_dispatched: Option<Box<dyn FnMut(&E) + Send>>,
    pub(crate) event_discarded: Option<Box<dyn FnMut(&E) + Send>>,
    pub(crate) configuration_changed: Option<Box<dyn FnMut() + Send>>,
    pub(crate) state_entered: Option<Box<dyn FnMut(StateId) + Send>>,
    pub(crate) state_exited: Option<Box<dyn FnMut(StateId) + Send>>,
    pub(crate) transition_conflict: Option<Box<dyn FnMut(TransitionId, TransitionId) + Send>>,
    pub(crate) state_error: Option<Box<dyn FnMut(StateId, &Error) + Send>>,
}

impl<E> Default for Callbacks<E> {
    fn default() -> Self {
        Self {
            event_dispatched: None,
            event_discarded: None,
            configuration_changed: None,
            state_entered: None,
            state_exited: None,
            transition_conflict: None,
            state_error: None,
        }
    }
}

/// The externally observable configuration: one visible-active bit per
/// state plus the monotonic change counter. Published under its own short
/// lock at macrostep boundaries so observers never wait for a macrostep.
pub(crate) struct VisibleConfig {
    active: Mutex<Vec<bool>>,
    changes: AtomicUsize,
}

impl VisibleConfig {
    fn new(states: usize) -> Self {
        Self {
            active: Mutex::new(vec![false; states]),
            changes: AtomicUsize::new(0),
        }
    }
}

/// A cloneable, thread-safe view of a machine's visible configuration.
///
/// `is_active` and `changes` never take the machine lock; they read the
/// snapshot published at the last macrostep boundary.
#[derive(Clone)]
pub struct ConfigView {
    inner: Arc<VisibleConfig>,
}

impl ConfigView {
    /// True if `state` belonged to the configuration at the last
    /// macrostep boundary.
    pub fn is_active(&self, state: StateId) -> bool {
        self.inner
            .active
            .lock()
            .get(state.index())
            .copied()
            .unwrap_or(false)
    }

    /// Number of configuration changes so far. Bumped once per macrostep
    /// that changed the configuration and once per start/stop.
    pub fn changes(&self) -> usize {
        self.inner.changes.load(Ordering::SeqCst)
    }
}

pub(crate) struct Engine<E> {
    pub(crate) chart: Chart<E>,
    pub(crate) callbacks: Callbacks<E>,
    pub(crate) policy: Policy,
    pub(crate) running: bool,
    enabled: Vec<TransitionId>,
    visible: Arc<VisibleConfig>,
}

impl<E: Event> Engine<E> {
    pub(crate) fn new(chart: Chart<E>) -> Self {
        let visible = Arc::new(VisibleConfig::new(chart.state_count()));
        Self {
            chart,
            callbacks: Callbacks::default(),
            policy: Policy::default(),
            running: false,
            enabled: Vec::new(),
            visible,
        }
    }

    pub(crate) fn view(&self) -> ConfigView {
        ConfigView {
            inner: Arc::clone(&self.visible),
        }
    }

    pub(crate) fn configuration_changes(&self) -> usize {
        self.visible.changes.load(Ordering::SeqCst)
    }

    /// Brings the machine into its initial configuration and sets it
    /// running. Unwinds on failure, leaving the machine stopped.
    pub(crate) fn start(&mut self) -> Result<(), Error> {
        if self.running {
            return Ok(());
        }
        debug!("starting \"{}\"", self.chart.name(self.chart.root()));
        self.chart.reset_history_slots();
        let result = (|| {
            self.clear_transient_flags();
            self.chart
                .flags_mut(self.chart.root())
                .insert(StateFlags::IN_ENTER_SET);
            self.mark_descendants_for_entry();
            self.enter_states(&E::default())?;
            self.run_to_completion(true)
        })();
        match result {
            Ok(()) => {
                self.running = true;
                Ok(())
            }
            Err(err) => {
                self.unwind();
                Err(err)
            }
        }
    }

    /// Leaves the configuration and stops the machine. The event queue is
    /// untouched; a machine started again sees the events it left with.
    pub(crate) fn stop(&mut self) -> Result<(), Error> {
        if !self.running {
            return Ok(());
        }
        debug!("stopping \"{}\"", self.chart.name(self.chart.root()));
        self.running = false;
        match self.leave_configuration(false) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.unwind();
                Err(err)
            }
        }
    }

    /// One full event round: selection, microstep, run-to-completion.
    /// The caller unwinds on error.
    pub(crate) fn macrostep(&mut self, event: E) -> Result<(), Error> {
        debug!("dispatching {:?}", event);
        if let Some(cb) = self.callbacks.event_dispatched.as_mut() {
            cb(&event);
        }
        self.clear_transient_flags();
        self.select_transitions(false, &event)?;
        let mut changed = false;
        if self.enabled.is_empty() {
            debug!("{:?} matched no transition, discarding", event);
            if let Some(cb) = self.callbacks.event_discarded.as_mut() {
                cb(&event);
            }
        } else {
            changed = self.microstep(&event)?;
            self.enabled.clear();
        }
        self.run_to_completion(changed)
    }

    /// Error recovery: drop the enabled set, leave whatever configuration
    /// remains (best effort) and clear the running flag.
    pub(crate) fn unwind(&mut self) {
        warn!("unwinding \"{}\"", self.chart.name(self.chart.root()));
        self.enabled.clear();
        let _ = self.leave_configuration(true);
        self.running = false;
    }

    fn clear_transient_flags(&mut self) {
        for id in self.chart.state_ids() {
            self.chart.flags_mut(id).remove(StateFlags::TRANSIENT);
        }
    }

    /// Walks the tree in post-order so descendants offer their transitions
    /// before their ancestors. A match in a state suppresses every
    /// ancestor; the walk only continues past a match when a parallel
    /// ancestor may still contribute from an orthogonal region.
    fn select_transitions(&mut self, eventless_only: bool, event: &E) -> Result<(), Error> {
        let order: Vec<StateId> = self.chart.post_order(self.chart.root()).collect();
        for state in order {
            let flags = self.chart.flags(state);
            if !flags.contains(StateFlags::ACTIVE) || flags.contains(StateFlags::SKIP_SELECTION) {
                continue;
            }

            let mut found = false;
            let mut cursor = self.chart.first_transition(state);
            while let Some(transition) = cursor {
                cursor = self.chart.next_in_source(transition);

                // The transition kind has to match the selection mode:
                // eventless transitions fire only inside run-to-completion,
                // evented ones only on an equal trigger.
                match self.chart.transition_trigger(transition) {
                    None => {
                        if !eventless_only {
                            continue;
                        }
                    }
                    Some(trigger) => {
                        if eventless_only || trigger != event {
                            continue;
                        }
                    }
                }
                if !self.chart.check_guard(transition, event)? {
                    continue;
                }

                trace!(
                    "enabled {:?} out of \"{}\"",
                    transition,
                    self.chart.name(state)
                );
                self.enabled.push(transition);
                found = true;
                if self.policy.stop_after_first_match {
                    break;
                }
            }

            if found {
                let mut has_parallel_ancestor = false;
                let mut ancestor = self.chart.parent(state);
                while let Some(a) = ancestor {
                    self.chart.flags_mut(a).insert(StateFlags::SKIP_SELECTION);
                    has_parallel_ancestor |= self.chart.is_parallel(a);
                    ancestor = self.chart.parent(a);
                }
                // Without a parallel ancestor the remaining active states
                // are all ancestors of this one and cannot provide a more
                // specific match.
                if !has_parallel_ancestor {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// The subtree exited and re-entered by a targetful transition.
    fn transition_domain(&self, transition: TransitionId) -> StateId {
        let source = self.chart.transition_source(transition);
        let target = self
            .chart
            .transition_target(transition)
            .expect("targetless transitions have no domain");
        if !self.chart.transition_is_external(transition)
            && self.chart.is_compound(source)
            && self.chart.is_descendant(target, source)
        {
            return source;
        }
        self.chart
            .least_common_proper_ancestor(source, target)
            .unwrap_or(self.chart.root())
    }

    /// True if an active state strictly inside `domain` is already marked
    /// for exit, i.e. a previous transition's exit set overlaps.
    fn domain_overlaps_exit_set(&self, domain: StateId) -> bool {
        let mut walk = self.chart.pre_order(domain);
        walk.next();
        walk.any(|s| {
            self.chart
                .flags(s)
                .contains(StateFlags::ACTIVE | StateFlags::IN_EXIT_SET)
        })
    }

    fn microstep(&mut self, event: &E) -> Result<bool, Error> {
        let mut changed = false;

        // 1. Mark exit sets and target-ancestor chains, discarding
        //    conflicting transitions along the way.
        let mut index = 0;
        while index < self.enabled.len() {
            let transition = self.enabled[index];
            let Some(target) = self.chart.transition_target(transition) else {
                index += 1;
                continue;
            };
            changed = true;

            let domain = self.transition_domain(transition);
            if index > 0 && self.domain_overlaps_exit_set(domain) {
                warn!("discarding conflicting {:?}", transition);
                self.report_conflict(transition)?;
                self.enabled.remove(index);
                continue;
            }

            let subtree: Vec<StateId> = {
                let mut walk = self.chart.pre_order(domain);
                walk.next();
                walk.collect()
            };
            for state in subtree {
                if self.chart.flags(state).contains(StateFlags::ACTIVE) {
                    self.chart.flags_mut(state).insert(StateFlags::IN_EXIT_SET);
                }
            }

            // Mark the target and its ancestors up to and including the
            // domain, but nothing above it. A parallel domain re-marks
            // every region this way, while ancestors above the domain
            // stay untouched: marking them would drag orthogonal regions'
            // initial states into the enter set. The target's children
            // cannot be marked yet, another enabled transition may target
            // one of this target's descendants.
            let mut cursor = target;
            loop {
                if self.chart.flags(cursor).contains(StateFlags::IN_ENTER_SET) {
                    break;
                }
                self.chart.flags_mut(cursor).insert(StateFlags::IN_ENTER_SET);
                if cursor == domain {
                    break;
                }
                match self.chart.parent(cursor) {
                    Some(parent) => cursor = parent,
                    None => break,
                }
            }

            index += 1;
        }

        // 2. Propagate the entry mark down to the states actually entered.
        self.mark_descendants_for_entry();

        // 3. Leave the exit set.
        self.leave_states(event, false)?;

        // 4. Run the transition actions in enabled-set order.
        let mut index = 0;
        while index < self.enabled.len() {
            let transition = self.enabled[index];
            self.chart.run_action(transition, event)?;
            index += 1;
        }

        // 5. Enter the enter set.
        self.enter_states(event)?;

        Ok(changed)
    }

    /// Notifies about a discarded transition per the conflict policy. The
    /// surviving transition is the earliest enabled one whose domain holds
    /// a contested active state.
    fn report_conflict(&mut self, dropped: TransitionId) -> Result<(), Error> {
        let report = match self.policy.conflict {
            ConflictPolicy::Ignore => false,
            ConflictPolicy::ReportToCallback => self.callbacks.transition_conflict.is_some(),
            ConflictPolicy::Fail => true,
        };
        if !report {
            return Ok(());
        }

        let dropped_domain = self.transition_domain(dropped);
        let contested: Vec<StateId> = {
            let mut walk = self.chart.pre_order(dropped_domain);
            walk.next();
            walk.collect()
        };
        for state in contested {
            if self.chart.flags(state).contains(StateFlags::ACTIVE) {
                self.chart
                    .flags_mut(state)
                    .insert(StateFlags::PART_OF_CONFLICT);
            }
        }

        for position in 0..self.enabled.len() {
            let kept = self.enabled[position];
            if self.chart.transition_target(kept).is_none() {
                continue;
            }
            let domain = self.transition_domain(kept);
            let mut walk = self.chart.pre_order(domain);
            walk.next();
            let overlaps = walk.any(|s| {
                self.chart
                    .flags(s)
                    .contains(StateFlags::ACTIVE | StateFlags::PART_OF_CONFLICT)
            });
            if overlaps {
                if self.policy.conflict == ConflictPolicy::Fail {
                    return Err(Error::TransitionConflict { kept, dropped });
                }
                if let Some(cb) = self.callbacks.transition_conflict.as_mut() {
                    cb(kept, dropped);
                }
                return Ok(());
            }
        }
        Ok(())
    }

    /// Propagates the entry mark down the tree: a compound state marked
    /// for entry marks exactly one child (history slot, then initial
    /// designator chain, then first child), a parallel state marks all of
    /// them. Marks only ever flow downward, so a single pre-order pass
    /// reaches every mark it plants.
    fn mark_descendants_for_entry(&mut self) {
        let order: Vec<StateId> = self.chart.pre_order(self.chart.root()).collect();
        for state in order {
            if !self.chart.flags(state).contains(StateFlags::IN_ENTER_SET) {
                continue;
            }

            if self.chart.is_compound(state) {
                let children: Vec<StateId> = self.chart.children(state).collect();
                let child_marked = children
                    .iter()
                    .any(|&c| self.chart.flags(c).contains(StateFlags::IN_ENTER_SET));
                if child_marked {
                    continue;
                }
                if let Some(remembered) =
                    self.chart.history(state).and(self.chart.remembered(state))
                {
                    trace!(
                        "\"{}\" restores remembered child \"{}\"",
                        self.chart.name(state),
                        self.chart.name(remembered)
                    );
                    self.chart
                        .flags_mut(remembered)
                        .insert(StateFlags::IN_ENTER_SET);
                } else if let Some(initial) = self.chart.initial(state) {
                    let mut cursor = initial;
                    loop {
                        self.chart
                            .flags_mut(cursor)
                            .insert(StateFlags::IN_ENTER_SET);
                        match self.chart.parent(cursor) {
                            Some(parent) if parent != state => cursor = parent,
                            _ => break,
                        }
                    }
                } else {
                    let first = children[0];
                    self.chart.flags_mut(first).insert(StateFlags::IN_ENTER_SET);
                }
            } else if self.chart.is_parallel(state) {
                let children: Vec<StateId> = self.chart.children(state).collect();
                for &child in &children {
                    self.chart.flags_mut(child).insert(StateFlags::IN_ENTER_SET);
                }
            }
        }
    }

    /// Enters marked states in pre-order: entry callback, user hook, then
    /// the `Active` and `StartInvoke` bits.
    fn enter_states(&mut self, event: &E) -> Result<(), Error> {
        let order: Vec<StateId> = self.chart.pre_order(self.chart.root()).collect();
        for state in order {
            let flags = self.chart.flags(state);
            if flags.contains(StateFlags::IN_ENTER_SET) && !flags.contains(StateFlags::ACTIVE) {
                trace!("entering \"{}\"", self.chart.name(state));
                if let Some(cb) = self.callbacks.state_entered.as_mut() {
                    cb(state);
                }
                if let Err(err) = self.chart.run_entry_hook(state, event) {
                    self.route_state_error(state, err, false)?;
                }
                self.chart
                    .flags_mut(state)
                    .insert(StateFlags::ACTIVE | StateFlags::START_INVOKE);
            }
        }
        Ok(())
    }

    /// Exits marked states in post-order. History is captured first: every
    /// history-typed ancestor still inside the exit set remembers its
    /// child on the path from each exiting leaf, before any flag is
    /// cleared. Then, per state: exit callback, invoke teardown, flag
    /// clearing, user hook.
    ///
    /// With `lossy` set, hook failures that no state-error callback
    /// consumes are logged instead of propagated so an unwind can still
    /// complete the exit set.
    fn leave_states(&mut self, event: &E, lossy: bool) -> Result<(), Error> {
        let leaves: Vec<StateId> = self.chart.atomic_leaves(self.chart.root()).collect();
        for leaf in leaves {
            if !self.chart.flags(leaf).contains(StateFlags::IN_EXIT_SET) {
                continue;
            }
            let mut child = leaf;
            let mut parent = self.chart.parent(child);
            while let Some(p) = parent {
                if !self.chart.flags(p).contains(StateFlags::IN_EXIT_SET) {
                    break;
                }
                if self.chart.history(p).is_some() {
                    self.chart.set_remembered(p, child);
                }
                child = p;
                parent = self.chart.parent(child);
            }
        }

        let order: Vec<StateId> = self.chart.post_order(self.chart.root()).collect();
        for state in order {
            if !self.chart.flags(state).contains(StateFlags::IN_EXIT_SET) {
                continue;
            }
            trace!("exiting \"{}\"", self.chart.name(state));
            if let Some(cb) = self.callbacks.state_exited.as_mut() {
                cb(state);
            }

            self.chart.flags_mut(state).remove(StateFlags::START_INVOKE);
            if self.chart.flags(state).contains(StateFlags::INVOKED) {
                self.chart.flags_mut(state).remove(StateFlags::INVOKED);
                if let Err(err) = self.chart.run_exit_invoke(state) {
                    self.route_state_error(state, err, lossy)?;
                }
            }

            self.chart
                .flags_mut(state)
                .remove(StateFlags::ACTIVE | StateFlags::IN_EXIT_SET);

            if let Err(err) = self.chart.run_exit_hook(state, event) {
                self.route_state_error(state, err, lossy)?;
            }
        }
        Ok(())
    }

    /// Chases eventless transitions to quiescence, publishes the visible
    /// configuration, starts pending invokes and reports a single
    /// configuration change for the whole macrostep.
    fn run_to_completion(&mut self, mut changed: bool) -> Result<(), Error> {
        loop {
            self.clear_transient_flags();
            self.select_transitions(true, &E::default())?;
            if self.enabled.is_empty() {
                break;
            }
            changed |= self.microstep(&E::default())?;
            self.enabled.clear();
        }

        self.publish_configuration();

        // Quiescent now: start the invoke activity of every state that was
        // entered and stayed in the configuration.
        let order: Vec<StateId> = self.chart.pre_order(self.chart.root()).collect();
        for state in order {
            if !self.chart.flags(state).contains(StateFlags::START_INVOKE) {
                continue;
            }
            self.chart.flags_mut(state).remove(StateFlags::START_INVOKE);
            match self.chart.run_enter_invoke(state) {
                Ok(()) => {
                    self.chart.flags_mut(state).insert(StateFlags::INVOKED);
                }
                Err(err) => self.route_state_error(state, err, false)?,
            }
        }

        if changed {
            self.visible.changes.fetch_add(1, Ordering::SeqCst);
            if let Some(cb) = self.callbacks.configuration_changed.as_mut() {
                cb();
            }
        }
        Ok(())
    }

    /// Marks every active state for exit and executes the exit set; the
    /// machine ends with an empty configuration. Used by stop and by error
    /// unwinding (`lossy`).
    fn leave_configuration(&mut self, lossy: bool) -> Result<(), Error> {
        for id in self.chart.state_ids() {
            if self.chart.flags(id).contains(StateFlags::ACTIVE) {
                self.chart.flags_mut(id).insert(StateFlags::IN_EXIT_SET);
            }
        }
        self.leave_states(&E::default(), lossy)?;

        self.publish_configuration();
        self.visible.changes.fetch_add(1, Ordering::SeqCst);
        if let Some(cb) = self.callbacks.configuration_changed.as_mut() {
            cb();
        }
        Ok(())
    }

    /// Copies the internal `Active` bits into the visible snapshot under
    /// the active-flag lock.
    fn publish_configuration(&mut self) {
        let mut visible = self.visible.active.lock();
        visible.resize(self.chart.state_count(), false);
        for id in self.chart.state_ids() {
            visible[id.index()] = self.chart.flags(id).contains(StateFlags::ACTIVE);
        }
    }

    /// Routes a hook failure to the state-error callback. Without one, the
    /// error propagates, except during lossy unwinds where it is logged so
    /// the remaining exit set still runs.
    fn route_state_error(&mut self, state: StateId, err: Error, lossy: bool) -> Result<(), Error> {
        match self.callbacks.state_error.as_mut() {
            Some(cb) => {
                cb(state, &err);
                Ok(())
            }
            None if lossy => {
                warn!("\"{}\" failed while unwinding: {}", self.chart.name(state), err);
                Ok(())
            }
            None => Err(err),
        }
    }
}
