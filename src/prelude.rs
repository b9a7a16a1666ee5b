//! One-stop imports for building and running machines.

pub use crate::chart::{Chart, ChildMode, FnHooks, StateHooks, StateId, TransitionId};
pub use crate::dispatcher::AsyncMachine;
pub use crate::engine::{ConfigView, ConflictPolicy};
pub use crate::error::Error;
pub use crate::history::History;
pub use crate::invoke::{ExitSignal, PooledInvoke, ThreadedInvoke};
pub use crate::machine::{Mailbox, StateMachine};
pub use crate::pool::{PoolHandle, WorkerPool};
pub use crate::queue::{BoundedFifo, EventQueue, PriorityQueue};
pub use crate::slot::Slot;
pub use crate::Event;
