//! Reactor runtime for the listener.
//!
//! - `event_loop`: mio reactor, connection acceptance and lifecycle
//! - `session`: per-connection framing and write state
//! - `reply`: outbound queues and the reply route given to sinks
//! - `pool`: bounded worker pool for decode-and-dispatch tasks
//! - `allow_list`: permitted peer addresses

mod allow_list;
mod event_loop;
mod pool;
pub(crate) mod reply;
mod session;

pub use allow_list::AllowList;
pub use event_loop::{LifecycleState, Listener};
pub use pool::{PoolConfig, WorkerPool};
pub use reply::{ReplyHandle, ReplySender};
pub use session::{FramingPolicy, InboundState, ReadOutcome, Session, WriteOutcome};
