use thiserror::Error;

use crate::chart::TransitionId;

/// Errors raised by the engine or bubbled up from user code.
#[derive(Debug, Error)]
pub enum Error {
    /// A mutation would violate the tree shape: an initial-state designator
    /// that is not a proper descendant, a re-parenting that would form a
    /// cycle, or a transition referencing a state the chart does not own.
    #[error("invalid state relationship")]
    InvalidStateRelationship,

    /// Two enabled transitions have overlapping exit sets and the conflict
    /// policy is [`ConflictPolicy::Fail`](crate::ConflictPolicy::Fail).
    #[error("transition {dropped:?} conflicts with {kept:?}")]
    TransitionConflict {
        kept: TransitionId,
        dropped: TransitionId,
    },

    /// More concurrent invoke activities were requested than the worker
    /// pool has idle workers.
    #[error("no idle worker left in the pool")]
    PoolUnderflow,

    /// The event queue refused the enqueue. The machine configuration is
    /// unchanged when this surfaces from `post`.
    #[error("event queue is full")]
    QueueFull,

    /// A guard, action, entry/exit hook or invoke activity failed.
    #[error("{0}")]
    Hook(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps a user-side failure, typically from inside a guard, action or
    /// state hook.
    ///
    /// ```
    /// use gearwork::Error;
    ///
    /// let err = Error::hook("sensor offline");
    /// assert!(matches!(err, Error::Hook(_)));
    /// ```
    pub fn hook<T>(err: T) -> Self
    where
        T: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Hook(err.into())
    }
}
