use std::fmt;

use bitflags::bitflags;

use crate::error::Error;
use crate::history::History;
use crate::iter::{AtomicLeaves, Children, PostOrder, PreOrder};
use crate::transitions::TransitionRecord;
use crate::Event;

/// Handle to a state owned by a [`Chart`].
///
/// Ids are plain typed indices; they stay valid for the lifetime of the
/// chart and are only ever produced by the chart that owns the state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub(crate) u32);

impl StateId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateId({})", self.0)
    }
}

/// Handle to a transition owned by a [`Chart`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransitionId(pub(crate) u32);

impl TransitionId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransitionId({})", self.0)
    }
}

/// How the children of a composite state are activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChildMode {
    /// Exactly one child of an active parent is active.
    #[default]
    Exclusive,
    /// Every child of an active parent is active simultaneously.
    Parallel,
}

bitflags! {
    /// Per-state flag word. The transient bits only live inside a
    /// macrostep and are cleared before the next selection round.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct StateFlags: u16 {
        const ACTIVE         = 1 << 0;
        const START_INVOKE   = 1 << 1;
        const INVOKED        = 1 << 2;

        const SKIP_SELECTION = 1 << 4;
        const IN_ENTER_SET   = 1 << 5;
        const IN_EXIT_SET    = 1 << 6;
        const PART_OF_CONFLICT = 1 << 7;

        const TRANSIENT = Self::SKIP_SELECTION.bits()
            | Self::IN_ENTER_SET.bits()
            | Self::IN_EXIT_SET.bits()
            | Self::PART_OF_CONFLICT.bits();
    }
}

/// Per-state behavior: entry/exit reactions and the optional long-running
/// invoke activity that spans the state's time in the configuration.
///
/// Every method defaults to a no-op so implementations only override what
/// they need. All methods are fallible; errors are routed to the machine's
/// state-error callback when one is installed, and unwind the dispatcher
/// otherwise.
pub trait StateHooks<E>: Send {
    /// Called when the state joins the configuration.
    fn on_entry(&mut self, _event: &E) -> Result<(), Error> {
        Ok(())
    }

    /// Called when the state leaves the configuration.
    fn on_exit(&mut self, _event: &E) -> Result<(), Error> {
        Ok(())
    }

    /// Called once the machine is quiescent after the state was entered.
    /// States that are entered and exited within the same macrostep never
    /// see this call.
    fn enter_invoke(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Called while the state leaves the configuration, but only if
    /// [`enter_invoke`](StateHooks::enter_invoke) succeeded.
    fn exit_invoke(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// [`StateHooks`] built from plain closures, for states whose behavior
/// does not warrant a dedicated type.
pub struct FnHooks<E> {
    entry: Option<Box<dyn FnMut(&E) -> Result<(), Error> + Send>>,
    exit: Option<Box<dyn FnMut(&E) -> Result<(), Error> + Send>>,
}

impl<E> FnHooks<E> {
    pub fn new() -> Self {
        Self {
            entry: None,
            exit: None,
        }
    }

    pub fn entry(mut self, f: impl FnMut(&E) -> Result<(), Error> + Send + 'static) -> Self {
        self.entry = Some(Box::new(f));
        self
    }

    pub fn exit(mut self, f: impl FnMut(&E) -> Result<(), Error> + Send + 'static) -> Self {
        self.exit = Some(Box::new(f));
        self
    }
}

impl<E> Default for FnHooks<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send> StateHooks<E> for FnHooks<E> {
    fn on_entry(&mut self, event: &E) -> Result<(), Error> {
        match self.entry.as_mut() {
            Some(f) => f(event),
            None => Ok(()),
        }
    }

    fn on_exit(&mut self, event: &E) -> Result<(), Error> {
        match self.exit.as_mut() {
            Some(f) => f(event),
            None => Ok(()),
        }
    }
}

pub(crate) struct Node<E> {
    name: String,
    parent: Option<StateId>,
    first_child: Option<StateId>,
    next_sibling: Option<StateId>,
    initial: Option<StateId>,
    first_transition: Option<TransitionId>,
    child_mode: ChildMode,
    history: Option<History>,
    remembered: Option<StateId>,
    pub(crate) flags: StateFlags,
    hooks: Option<Box<dyn StateHooks<E>>>,
}

impl<E> Node<E> {
    fn new(name: String, parent: Option<StateId>) -> Self {
        Self {
            name,
            parent,
            first_child: None,
            next_sibling: None,
            initial: None,
            first_transition: None,
            child_mode: ChildMode::Exclusive,
            history: None,
            remembered: None,
            flags: StateFlags::empty(),
            hooks: None,
        }
    }
}

/// The state tree: an arena owning every state node and transition record
/// of one machine.
///
/// A chart is created with an implicit root state carrying the machine
/// name; all user states attach below it. Build the tree, wire transitions
/// with [`Chart::edge`], then hand the chart to a
/// [`StateMachine`](crate::StateMachine) or
/// [`AsyncMachine`](crate::AsyncMachine).
pub struct Chart<E> {
    nodes: Vec<Node<E>>,
    pub(crate) transitions: Vec<TransitionRecord<E>>,
}

impl<E: Event> Chart<E> {
    /// Creates a chart whose root state carries `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            nodes: vec![Node::new(name.into(), None)],
            transitions: Vec::new(),
        }
    }

    /// The implicit root state.
    pub fn root(&self) -> StateId {
        StateId(0)
    }

    /// Number of states in the chart, root included.
    pub fn state_count(&self) -> usize {
        self.nodes.len()
    }

    /// Adds a plain state under `parent`, at the end of its child list.
    pub fn add_child(&mut self, parent: StateId, name: impl Into<String>) -> StateId {
        let id = StateId(self.nodes.len() as u32);
        self.nodes.push(Node::new(name.into(), Some(parent)));
        self.link_child(parent, id);
        id
    }

    /// Adds a state with history behavior under `parent`. The state
    /// remembers its active child when exited and restores it on the next
    /// entry, taking precedence over any initial-state designator.
    pub fn add_history_child(
        &mut self,
        parent: StateId,
        name: impl Into<String>,
        history: History,
    ) -> StateId {
        let id = self.add_child(parent, name);
        self.nodes[id.index()].history = Some(history);
        id
    }

    /// Switches `state` between exclusive and parallel child activation.
    /// Changing the mode of a running machine's state is not supported.
    pub fn set_child_mode(&mut self, state: StateId, mode: ChildMode) {
        self.nodes[state.index()].child_mode = mode;
    }

    /// Designates the state entered when `state` is targeted without a
    /// more specific target. `descendant` must be a proper descendant.
    pub fn set_initial(&mut self, state: StateId, descendant: StateId) -> Result<(), Error> {
        if !self.is_proper_ancestor(state, descendant) {
            return Err(Error::InvalidStateRelationship);
        }
        self.nodes[state.index()].initial = Some(descendant);
        Ok(())
    }

    /// Moves `state` under a new parent. The root cannot be re-parented
    /// and the new parent must not be `state` or one of its descendants.
    /// Only valid while the machine is not running.
    pub fn set_parent(&mut self, state: StateId, parent: StateId) -> Result<(), Error> {
        if state == self.root() || parent == state || self.is_proper_ancestor(state, parent) {
            return Err(Error::InvalidStateRelationship);
        }
        if self.nodes[state.index()].parent == Some(parent) {
            return Ok(());
        }
        self.unlink_child(state);
        self.nodes[state.index()].parent = Some(parent);
        self.link_child(parent, state);
        Ok(())
    }

    /// Attaches entry/exit/invoke behavior to a state.
    pub fn set_hooks(&mut self, state: StateId, hooks: impl StateHooks<E> + 'static) {
        self.nodes[state.index()].hooks = Some(Box::new(hooks));
    }

    /// The state's name.
    pub fn name(&self, state: StateId) -> &str {
        &self.nodes[state.index()].name
    }

    /// The state's parent, `None` for the root.
    pub fn parent(&self, state: StateId) -> Option<StateId> {
        self.nodes[state.index()].parent
    }

    /// The state's initial-state designator, if any.
    pub fn initial(&self, state: StateId) -> Option<StateId> {
        self.nodes[state.index()].initial
    }

    /// The state's child mode.
    pub fn child_mode(&self, state: StateId) -> ChildMode {
        self.nodes[state.index()].child_mode
    }

    /// The state's history variant, if it is a history state.
    pub fn history(&self, state: StateId) -> Option<History> {
        self.nodes[state.index()].history
    }

    /// True if the state has no children.
    pub fn is_atomic(&self, state: StateId) -> bool {
        self.nodes[state.index()].first_child.is_none()
    }

    /// True if the state has children activated exclusively.
    pub fn is_compound(&self, state: StateId) -> bool {
        !self.is_atomic(state) && self.child_mode(state) == ChildMode::Exclusive
    }

    /// True if the state has children activated in parallel.
    pub fn is_parallel(&self, state: StateId) -> bool {
        !self.is_atomic(state) && self.child_mode(state) == ChildMode::Parallel
    }

    /// Looks up a direct child by name.
    pub fn find_child(&self, state: StateId, name: &str) -> Option<StateId> {
        self.children(state).find(|&c| self.name(c) == name)
    }

    /// Walks a path of child names starting below `state`.
    ///
    /// `chart.find_descendant(root, &["a", "b"])` returns the grandchild
    /// `b` of child `a`.
    pub fn find_descendant(&self, state: StateId, path: &[&str]) -> Option<StateId> {
        let mut current = state;
        for name in path {
            current = self.find_child(current, name)?;
        }
        Some(current)
    }

    /// Pre-order traversal of the subtree rooted at `state`: parents
    /// before children, children in insertion order.
    pub fn pre_order(&self, state: StateId) -> PreOrder<'_, E> {
        PreOrder::new(self, state)
    }

    /// Post-order traversal of the subtree rooted at `state`: children
    /// before parents.
    pub fn post_order(&self, state: StateId) -> PostOrder<'_, E> {
        PostOrder::new(self, state)
    }

    /// The direct children of `state` in insertion order.
    pub fn children(&self, state: StateId) -> Children<'_, E> {
        Children::new(self, state)
    }

    /// The leaves of the subtree rooted at `state`, in the order a
    /// post-order walk visits them.
    pub fn atomic_leaves(&self, state: StateId) -> AtomicLeaves<'_, E> {
        AtomicLeaves::new(self, state)
    }

    /// True if `ancestor` lies on `descendant`'s parent chain. A non-atomic
    /// state counts as its own ancestor; an atomic state can contain
    /// nothing, itself included.
    pub fn is_ancestor(&self, ancestor: StateId, descendant: StateId) -> bool {
        if self.is_atomic(ancestor) {
            return false;
        }
        let mut current = Some(descendant);
        while let Some(s) = current {
            if s == ancestor {
                return true;
            }
            current = self.parent(s);
        }
        false
    }

    /// Like [`is_ancestor`](Chart::is_ancestor), but a state is never a
    /// proper ancestor of itself.
    pub fn is_proper_ancestor(&self, ancestor: StateId, descendant: StateId) -> bool {
        if self.is_atomic(ancestor) {
            return false;
        }
        let mut current = self.parent(descendant);
        while let Some(s) = current {
            if s == ancestor {
                return true;
            }
            current = self.parent(s);
        }
        false
    }

    /// True if `descendant` lies inside the subtree of `ancestor`.
    pub fn is_descendant(&self, descendant: StateId, ancestor: StateId) -> bool {
        self.is_ancestor(ancestor, descendant)
    }

    /// The deepest state that is a proper ancestor of both arguments.
    pub fn least_common_proper_ancestor(&self, a: StateId, b: StateId) -> Option<StateId> {
        let mut current = self.parent(a);
        while let Some(s) = current {
            if self.is_proper_ancestor(s, b) {
                return Some(s);
            }
            current = self.parent(s);
        }
        None
    }

    /// Source state of a transition.
    pub fn transition_source(&self, transition: TransitionId) -> StateId {
        self.transitions[transition.index()].source
    }

    /// Target state of a transition, `None` for targetless transitions.
    pub fn transition_target(&self, transition: TransitionId) -> Option<StateId> {
        self.transitions[transition.index()].target
    }

    /// Trigger event of a transition, `None` for eventless transitions.
    pub fn transition_trigger(&self, transition: TransitionId) -> Option<&E> {
        self.transitions[transition.index()].trigger.as_ref()
    }

    /// True for external transitions (the default).
    pub fn transition_is_external(&self, transition: TransitionId) -> bool {
        self.transitions[transition.index()].external
    }

    // ---- crate-internal accessors used by the engine -------------------

    pub(crate) fn first_child(&self, state: StateId) -> Option<StateId> {
        self.nodes[state.index()].first_child
    }

    pub(crate) fn next_sibling(&self, state: StateId) -> Option<StateId> {
        self.nodes[state.index()].next_sibling
    }

    pub(crate) fn flags(&self, state: StateId) -> StateFlags {
        self.nodes[state.index()].flags
    }

    pub(crate) fn flags_mut(&mut self, state: StateId) -> &mut StateFlags {
        &mut self.nodes[state.index()].flags
    }

    pub(crate) fn state_ids(&self) -> impl Iterator<Item = StateId> {
        (0..self.nodes.len() as u32).map(StateId)
    }

    pub(crate) fn remembered(&self, state: StateId) -> Option<StateId> {
        self.nodes[state.index()].remembered
    }

    pub(crate) fn set_remembered(&mut self, state: StateId, child: StateId) {
        self.nodes[state.index()].remembered = Some(child);
    }

    pub(crate) fn reset_history_slots(&mut self) {
        for node in &mut self.nodes {
            node.remembered = None;
        }
    }

    /// Descends along first-child links to the leftmost leaf.
    pub(crate) fn descend_first(&self, state: StateId) -> StateId {
        let mut current = state;
        while let Some(child) = self.first_child(current) {
            current = child;
        }
        current
    }

    pub(crate) fn first_transition(&self, state: StateId) -> Option<TransitionId> {
        self.nodes[state.index()].first_transition
    }

    pub(crate) fn next_in_source(&self, transition: TransitionId) -> Option<TransitionId> {
        self.transitions[transition.index()].next_in_source
    }

    pub(crate) fn check_guard(&self, transition: TransitionId, event: &E) -> Result<bool, Error> {
        match &self.transitions[transition.index()].guard {
            Some(guard) => guard(event),
            None => Ok(true),
        }
    }

    pub(crate) fn run_action(&mut self, transition: TransitionId, event: &E) -> Result<(), Error> {
        match self.transitions[transition.index()].action.as_mut() {
            Some(action) => action(event),
            None => Ok(()),
        }
    }

    pub(crate) fn run_entry_hook(&mut self, state: StateId, event: &E) -> Result<(), Error> {
        match self.nodes[state.index()].hooks.as_mut() {
            Some(hooks) => hooks.on_entry(event),
            None => Ok(()),
        }
    }

    pub(crate) fn run_exit_hook(&mut self, state: StateId, event: &E) -> Result<(), Error> {
        match self.nodes[state.index()].hooks.as_mut() {
            Some(hooks) => hooks.on_exit(event),
            None => Ok(()),
        }
    }

    pub(crate) fn run_enter_invoke(&mut self, state: StateId) -> Result<(), Error> {
        match self.nodes[state.index()].hooks.as_mut() {
            Some(hooks) => hooks.enter_invoke(),
            None => Ok(()),
        }
    }

    pub(crate) fn run_exit_invoke(&mut self, state: StateId) -> Result<(), Error> {
        match self.nodes[state.index()].hooks.as_mut() {
            Some(hooks) => hooks.exit_invoke(),
            None => Ok(()),
        }
    }

    pub(crate) fn contains_state(&self, state: StateId) -> bool {
        state.index() < self.nodes.len()
    }

    pub(crate) fn install_edge(
        &mut self,
        record: TransitionRecord<E>,
    ) -> Result<TransitionId, Error> {
        if !self.contains_state(record.source)
            || record.target.is_some_and(|t| !self.contains_state(t))
        {
            return Err(Error::InvalidStateRelationship);
        }
        let id = TransitionId(self.transitions.len() as u32);
        let source = record.source;
        self.transitions.push(record);
        // Append to the source's chain so insertion order is priority order.
        match self.nodes[source.index()].first_transition {
            None => self.nodes[source.index()].first_transition = Some(id),
            Some(first) => {
                let mut tail = first;
                while let Some(next) = self.transitions[tail.index()].next_in_source {
                    tail = next;
                }
                self.transitions[tail.index()].next_in_source = Some(id);
            }
        }
        Ok(id)
    }

    fn link_child(&mut self, parent: StateId, child: StateId) {
        match self.nodes[parent.index()].first_child {
            None => self.nodes[parent.index()].first_child = Some(child),
            Some(first) => {
                let mut tail = first;
                while let Some(next) = self.nodes[tail.index()].next_sibling {
                    tail = next;
                }
                self.nodes[tail.index()].next_sibling = Some(child);
            }
        }
    }

    fn unlink_child(&mut self, child: StateId) {
        let Some(parent) = self.nodes[child.index()].parent else {
            return;
        };
        let sibling = self.nodes[child.index()].next_sibling;
        if self.nodes[parent.index()].first_child == Some(child) {
            self.nodes[parent.index()].first_child = sibling;
        } else {
            let mut cursor = self.nodes[parent.index()].first_child;
            while let Some(s) = cursor {
                if self.nodes[s.index()].next_sibling == Some(child) {
                    self.nodes[s.index()].next_sibling = sibling;
                    break;
                }
                cursor = self.nodes[s.index()].next_sibling;
            }
        }
        self.nodes[child.index()].next_sibling = None;
    }
}
