//! # Stream Subscriber
//!
//! A resilient subscriber to an ordered, append-only event stream. Events are
//! consumed in sequence, handed to an application handler, and checkpointed so
//! a restarted process resumes where it left off. Dropped and silently stalled
//! connections are detected and recovered automatically.
//!
//! ## Core Concepts
//!
//! - **Event source**: Replays history and pushes live events through callbacks
//! - **Intake queue**: Bounded buffer decoupling delivery from dispatch
//! - **Dispatch loop**: Single worker handing events to the [`Dispatcher`]
//! - **Checkpoint**: Durable last-dispatched position used to resume
//! - **Heartbeats**: Marker events proving the subscription is still alive
//!
//! ## Example
//!
//! ```ignore
//! use stream_subscriber::{InMemoryEventSource, SubscribedEvent, Subscriber, SubscriberOptions};
//!
//! let source = InMemoryEventSource::new();
//! let subscriber = Subscriber::catch_up_from_checkpoint_file(
//!     source.clone(),
//!     "orders",
//!     "./orders.checkpoint",
//!     |event: &SubscribedEvent| {
//!         println!("{} at {}", event.event_type, event.position);
//!         Ok(())
//!     },
//!     SubscriberOptions::default()
//!         .with_heartbeat(Duration::from_secs(5), Duration::from_secs(30)),
//! )?;
//!
//! subscriber.start()?;
//! source.append("orders", "OrderPlaced", b"{}".to_vec())?;
//!
//! subscriber.shutdown();
//! subscriber.join()?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod liveness;
pub mod queue;
pub mod source;
pub mod subscriber;
mod timer;
pub mod types;
mod watchdog;

// Re-exports
pub use checkpoint::{CheckpointStore, FileCheckpoint, MemoryCheckpoint, DEFAULT_CHECKPOINT_SLOT, NO_CHECKPOINT};
pub use config::{HeartbeatSettings, SubscriberOptions, SubscriptionMode};
pub use dispatch::{DispatchError, DispatchLoop, DispatchOutcome, Dispatcher};
pub use error::{Result, SubscriberError};
pub use heartbeat::{HeartbeatStatus, HEARTBEAT_STREAM_MAX_COUNT, HEARTBEAT_STREAM_PREFIX};
pub use liveness::LivenessState;
pub use queue::IntakeQueue;
pub use source::{
    CatchUpSettings, CatchUpSubscription, EventSource, InMemoryEventSource, LiveSubscription,
    SubscribeRequest, SubscriptionCallbacks, SubscriptionHandle, ALL_STREAM,
};
pub use subscriber::{Subscriber, SubscriberState};
pub use types::*;
