//! Hierarchical state machines with run-to-completion semantics.
//!
//! States form a tree below an implicit root. Composite states activate
//! their children either exclusively (one of N) or in parallel (all of N),
//! history states restore the child they held when last exited, and
//! transitions carry guards, actions and an internal/external distinction.
//! Every posted event runs a *macrostep*: transitions are selected with
//! hierarchy-aware priorities, conflicting ones are dropped, the exit set
//! runs in post-order and the enter set in pre-order, then eventless
//! transitions are chased until the machine is quiescent. Only then does
//! the new configuration become visible to observers.
//!
//! Build the tree with a [`Chart`], wire transitions with [`Chart::edge`],
//! then run it either on your own threads ([`StateMachine`]) or on a
//! dedicated worker ([`AsyncMachine`]):
//!
//! ```
//! use gearwork::prelude::*;
//!
//! let mut chart = Chart::new("player");
//! let idle = chart.add_child(chart.root(), "idle");
//! let moving = chart.add_child(chart.root(), "moving");
//! let walk = chart.add_child(moving, "walk");
//! let sprint = chart.add_child(moving, "sprint");
//! chart.set_initial(moving, walk)?;
//!
//! chart.edge(idle).on("go").to(moving)?;
//! chart.edge(walk).on("shift").to(sprint)?;
//! chart.edge(moving).on("halt").to(idle)?;
//!
//! let mut player: StateMachine<&'static str> = StateMachine::new(chart);
//! player.start()?;
//! player.post("go")?;
//! assert!(player.is_active(walk));
//! player.post("shift")?;
//! assert!(player.is_active(sprint) && player.is_active(moving));
//! # Ok::<(), gearwork::Error>(())
//! ```
//!
//! States host behavior through [`StateHooks`]: entry/exit reactions plus
//! an optional long-running invoke activity ([`ThreadedInvoke`],
//! [`PooledInvoke`]) that spans the state's time in the configuration and
//! is cancelled cooperatively through an [`ExitSignal`].

use std::fmt::Debug;

pub mod chart;
pub mod dispatcher;
mod engine;
mod error;
pub mod history;
pub mod invoke;
pub mod iter;
pub mod machine;
pub mod pool;
pub mod prelude;
pub mod queue;
pub mod slot;
pub mod transitions;

pub use chart::{Chart, ChildMode, FnHooks, StateHooks, StateId, TransitionId};
pub use dispatcher::AsyncMachine;
pub use engine::{ConfigView, ConflictPolicy};
pub use error::Error;
pub use history::History;
pub use invoke::{ExitSignal, PooledInvoke, ThreadedInvoke};
pub use machine::{Mailbox, StateMachine};
pub use pool::{Completion, PoolHandle, WorkerPool};
pub use queue::{BoundedFifo, EventQueue, PriorityQueue};
pub use slot::Slot;
pub use transitions::EdgeBuilder;

/// The bounds an event type needs: cloned into guards and actions,
/// compared against transition triggers, and defaulted for the eventless
/// steps of run-to-completion.
pub trait Event: Clone + PartialEq + Default + Debug + Send + 'static {}

impl<T: Clone + PartialEq + Default + Debug + Send + 'static> Event for T {}
