//! Concurrency primitives used by the client and available to its host.
//!
//! - `task`: cancellable units of async work with cancellation propagation
//! - `channel`: bounded MPSC ring buffer for cross-thread handoff

pub mod channel;
pub mod task;

pub use channel::{ChannelError, Receiver, SendError, Sender, channel};
pub use task::{Task, TaskContext, TaskState, run};
