//! Collaborators the transport runs on: the outbound packet queue and the
//! timer facility.
//!
//! Both are traits so the same transport code runs on top of tokio on the
//! host, on a firmware scheduler, or on the deterministic simulator.

mod queue;
mod scheduler;

pub(crate) use scheduler::lock;
pub use queue::QueueSink;
pub use scheduler::{Scheduler, TimerCallback, TimerId};

#[cfg(feature = "tokio-runtime")]
pub use queue::{channel_queue, ChannelQueue, QueueReader};
#[cfg(feature = "tokio-runtime")]
pub use scheduler::TokioScheduler;
