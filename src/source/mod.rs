//! Event source capability consumed by the subscriber.
//!
//! An event source delivers an ordered stream of events either by replaying
//! history and then pushing live events (catch-up), or by pushing live events
//! only. Delivery happens through [`SubscriptionCallbacks`] on threads owned by
//! the source.
//!
//! # Callback contract
//!
//! - Callbacks are never invoked synchronously from inside `subscribe_*`,
//!   [`LiveSubscription::close`] or [`CatchUpSubscription::stop`].
//! - `close`/`stop` signal the subscription and return without waiting for
//!   in-flight callbacks.
//! - Events of one subscription are delivered one at a time, in position order.
//! - `on_dropped` is invoked at most once per subscription, after which no
//!   further callbacks arrive from it.

mod memory;

pub use memory::{InMemoryEventSource, SubscribeRequest, ALL_STREAM};

use crate::error::Result;
use crate::types::{DropReason, StreamPosition, SubscribedEvent};
use std::fmt;
use std::sync::Arc;

/// Receives each delivered event.
pub type EventCallback = Arc<dyn Fn(SubscribedEvent) + Send + Sync>;

/// Signals the switch from history replay to live push.
pub type LiveStartedCallback = Arc<dyn Fn() + Send + Sync>;

/// Receives the drop reason and an optional error description.
pub type DroppedCallback = Arc<dyn Fn(DropReason, Option<String>) + Send + Sync>;

/// Callbacks registered with a subscription.
#[derive(Clone)]
pub struct SubscriptionCallbacks {
    pub on_event: EventCallback,
    /// Only used by catch-up subscriptions.
    pub on_live_started: LiveStartedCallback,
    pub on_dropped: DroppedCallback,
}

impl fmt::Debug for SubscriptionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionCallbacks").finish_non_exhaustive()
    }
}

/// Paging and buffering for catch-up subscriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CatchUpSettings {
    /// Live events buffered while history is still being replayed.
    pub max_live_queue_size: usize,
    /// Events read per history page.
    pub read_batch_size: usize,
}

/// A live-only registration.
pub trait LiveSubscription: Send {
    /// Close the subscription. The source reports a user-initiated drop.
    fn close(&mut self);
}

/// A catch-up registration.
pub trait CatchUpSubscription: Send {
    /// Stop replay or live push. The source reports a user-initiated drop.
    fn stop(&mut self);
}

/// The single active registration owned by a subscriber.
pub enum SubscriptionHandle {
    Live(Box<dyn LiveSubscription>),
    CatchingUp(Box<dyn CatchUpSubscription>),
}

impl SubscriptionHandle {
    /// Tear the registration down with the capability its variant carries.
    pub fn release(self) {
        match self {
            SubscriptionHandle::Live(mut live) => live.close(),
            SubscriptionHandle::CatchingUp(mut catch_up) => catch_up.stop(),
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionHandle::Live(_) => f.write_str("SubscriptionHandle::Live"),
            SubscriptionHandle::CatchingUp(_) => f.write_str("SubscriptionHandle::CatchingUp"),
        }
    }
}

/// Capability for reading, subscribing to and appending to event streams.
pub trait EventSource: Send + Sync + 'static {
    /// Subscribe to events appended to `stream` from now on.
    fn subscribe_live(
        &self,
        stream: &str,
        callbacks: SubscriptionCallbacks,
    ) -> Result<Box<dyn LiveSubscription>>;

    /// Replay `stream` after `from` (from the start when `None`), then push
    /// live events. `on_live_started` fires between the two phases.
    fn subscribe_from(
        &self,
        stream: &str,
        from: Option<StreamPosition>,
        settings: CatchUpSettings,
        callbacks: SubscriptionCallbacks,
    ) -> Result<Box<dyn CatchUpSubscription>>;

    /// Append an event and return its position in `stream`.
    fn append(&self, stream: &str, event_type: &str, payload: Vec<u8>) -> Result<StreamPosition>;

    /// The last event currently in `stream`, if any.
    fn read_last_event(&self, stream: &str) -> Result<Option<SubscribedEvent>>;

    /// Limit `stream` to its most recent `max_count` events.
    fn set_max_count(&self, stream: &str, max_count: u64) -> Result<()>;
}

impl<S: EventSource> EventSource for Arc<S> {
    fn subscribe_live(
        &self,
        stream: &str,
        callbacks: SubscriptionCallbacks,
    ) -> Result<Box<dyn LiveSubscription>> {
        (**self).subscribe_live(stream, callbacks)
    }

    fn subscribe_from(
        &self,
        stream: &str,
        from: Option<StreamPosition>,
        settings: CatchUpSettings,
        callbacks: SubscriptionCallbacks,
    ) -> Result<Box<dyn CatchUpSubscription>> {
        (**self).subscribe_from(stream, from, settings, callbacks)
    }

    fn append(&self, stream: &str, event_type: &str, payload: Vec<u8>) -> Result<StreamPosition> {
        (**self).append(stream, event_type, payload)
    }

    fn read_last_event(&self, stream: &str) -> Result<Option<SubscribedEvent>> {
        (**self).read_last_event(stream)
    }

    fn set_max_count(&self, stream: &str, max_count: u64) -> Result<()> {
        (**self).set_max_count(stream, max_count)
    }
}
