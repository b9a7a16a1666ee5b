//! Forward-only cursors over a chart subtree.
//!
//! All four orders walk the parent/first-child/next-sibling links directly,
//! so they remain valid while flags or history slots change; only
//! re-parenting invalidates a cursor.

use crate::chart::{Chart, StateId};
use crate::Event;

/// Pre-order (parent before children) traversal of a subtree.
pub struct PreOrder<'a, E> {
    chart: &'a Chart<E>,
    root: StateId,
    yielded: Option<StateId>,
    started: bool,
    skip: bool,
}

impl<'a, E: Event> PreOrder<'a, E> {
    pub(crate) fn new(chart: &'a Chart<E>, root: StateId) -> Self {
        Self {
            chart,
            root,
            yielded: None,
            started: false,
            skip: false,
        }
    }

    /// Skips the children of the most recently yielded state on the next
    /// advance. The flag resets automatically.
    pub fn skip_children(&mut self) {
        self.skip = true;
    }
}

impl<E: Event> Iterator for PreOrder<'_, E> {
    type Item = StateId;

    fn next(&mut self) -> Option<StateId> {
        let next = if !self.started {
            Some(self.root)
        } else {
            match self.yielded {
                None => None,
                Some(current) => {
                    let mut following = if self.skip {
                        None
                    } else {
                        self.chart.first_child(current)
                    };
                    if following.is_none() {
                        // No child to visit: climb until a sibling exists,
                        // never walking past the subtree root.
                        let mut cursor = current;
                        while cursor != self.root {
                            if let Some(sibling) = self.chart.next_sibling(cursor) {
                                following = Some(sibling);
                                break;
                            }
                            cursor = self
                                .chart
                                .parent(cursor)
                                .expect("pre-order walk left its subtree");
                        }
                    }
                    following
                }
            }
        };
        self.started = true;
        self.skip = false;
        self.yielded = next;
        next
    }
}

/// Post-order (children before parent) traversal of a subtree.
pub struct PostOrder<'a, E> {
    chart: &'a Chart<E>,
    root: StateId,
    next: Option<StateId>,
}

impl<'a, E: Event> PostOrder<'a, E> {
    pub(crate) fn new(chart: &'a Chart<E>, root: StateId) -> Self {
        Self {
            chart,
            root,
            next: Some(chart.descend_first(root)),
        }
    }
}

impl<E: Event> Iterator for PostOrder<'_, E> {
    type Item = StateId;

    fn next(&mut self) -> Option<StateId> {
        let current = self.next?;
        self.next = if current == self.root {
            None
        } else if let Some(sibling) = self.chart.next_sibling(current) {
            Some(self.chart.descend_first(sibling))
        } else {
            self.chart.parent(current)
        };
        Some(current)
    }
}

/// The direct children of a state, in insertion order.
pub struct Children<'a, E> {
    chart: &'a Chart<E>,
    next: Option<StateId>,
}

impl<'a, E: Event> Children<'a, E> {
    pub(crate) fn new(chart: &'a Chart<E>, parent: StateId) -> Self {
        Self {
            chart,
            next: chart.first_child(parent),
        }
    }
}

impl<E: Event> Iterator for Children<'_, E> {
    type Item = StateId;

    fn next(&mut self) -> Option<StateId> {
        let current = self.next?;
        self.next = self.chart.next_sibling(current);
        Some(current)
    }
}

/// The leaves of a subtree, in post-order visitation order.
pub struct AtomicLeaves<'a, E> {
    chart: &'a Chart<E>,
    root: StateId,
    next: Option<StateId>,
}

impl<'a, E: Event> AtomicLeaves<'a, E> {
    pub(crate) fn new(chart: &'a Chart<E>, root: StateId) -> Self {
        Self {
            chart,
            root,
            next: Some(chart.descend_first(root)),
        }
    }
}

impl<E: Event> Iterator for AtomicLeaves<'_, E> {
    type Item = StateId;

    fn next(&mut self) -> Option<StateId> {
        let current = self.next?;
        self.next = {
            let mut cursor = current;
            let mut following = None;
            while cursor != self.root {
                if let Some(sibling) = self.chart.next_sibling(cursor) {
                    following = Some(self.chart.descend_first(sibling));
                    break;
                }
                cursor = self
                    .chart
                    .parent(cursor)
                    .expect("leaf walk left its subtree");
            }
            following
        };
        Some(current)
    }
}
