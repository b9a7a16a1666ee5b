/// Enables history behavior for a compound state.
/// When a state with history is exited and later re-entered,
/// it restores the previously active child instead of following its
/// initial-state designator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum History {
    /// Remember only the direct child state that was active when last
    /// exited. On re-entry, restore that direct child and follow normal
    /// initial-state logic from there.
    Shallow,
    /// Remember the active child and let restoration compose through any
    /// nested history states below it, so the previously active hierarchy
    /// comes back level by level.
    Deep,
}
