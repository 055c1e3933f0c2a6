//! Single-threaded dispatch of queued events to the application handler.
//!
//! The loop takes events from the intake queue in order, hands each one to the
//! [`Dispatcher`], and checkpoints every event the handler accepts. A failing
//! event is logged and skipped: the checkpoint stays at the previous success and
//! the loop carries on with the next event.

use crate::checkpoint::CheckpointStore;
use crate::error::{Result, SubscriberError};
use crate::liveness::LivenessState;
use crate::queue::IntakeQueue;
use crate::types::SubscribedEvent;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Error returned by an application handler.
pub type DispatchError = Box<dyn std::error::Error + Send + Sync>;

/// Application handler for subscribed events.
///
/// Delivery is at-least-once: after a restart an event may be handed over
/// again, so implementations should be idempotent.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, event: &SubscribedEvent) -> std::result::Result<(), DispatchError>;
}

impl<F> Dispatcher for F
where
    F: Fn(&SubscribedEvent) -> std::result::Result<(), DispatchError> + Send + Sync,
{
    fn dispatch(&self, event: &SubscribedEvent) -> std::result::Result<(), DispatchError> {
        self(event)
    }
}

/// What happened to a single event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handled and checkpointed.
    Dispatched,
    /// System or heartbeat event, counted but not handed to the dispatcher.
    Skipped,
    /// The handler or the checkpoint failed; the checkpoint did not advance.
    Failed,
}

/// Consumer side of the intake queue.
pub struct DispatchLoop {
    stream: String,
    queue: IntakeQueue,
    dispatcher: Arc<dyn Dispatcher>,
    checkpoint: Option<Box<dyn CheckpointStore>>,
    liveness: Arc<LivenessState>,
}

impl DispatchLoop {
    pub fn new(
        stream: impl Into<String>,
        queue: IntakeQueue,
        dispatcher: Arc<dyn Dispatcher>,
        checkpoint: Option<Box<dyn CheckpointStore>>,
        liveness: Arc<LivenessState>,
    ) -> Self {
        Self {
            stream: stream.into(),
            queue,
            dispatcher,
            checkpoint,
            liveness,
        }
    }

    /// Run on a dedicated thread.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("subscriber-dispatch".to_string())
            .spawn(move || self.run())
            .map_err(SubscriberError::Io)
    }

    /// Process events until the queue is closed and drained.
    pub fn run(mut self) {
        tracing::debug!(stream = %self.stream, "dispatch loop started");
        while let Some(event) = self.queue.take() {
            self.process(&event);
            self.liveness.record_dispatched(event.position);
        }
        tracing::info!(
            stream = %self.stream,
            events_processed = self.liveness.events_processed(),
            "dispatch loop finished"
        );
    }

    /// Handle one event.
    pub fn process(&mut self, event: &SubscribedEvent) -> DispatchOutcome {
        self.liveness.increment_processed();

        if event.is_system() || event.is_heartbeat() {
            return DispatchOutcome::Skipped;
        }

        let dispatcher = &self.dispatcher;
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(event))) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };

        if let Some(error) = failure {
            self.liveness.increment_failures();
            tracing::error!(
                stream = %self.stream,
                event_stream = %event.stream_id,
                position = event.position.0,
                event_type = %event.event_type,
                error = %error,
                "error dispatching event from subscriber"
            );
            return DispatchOutcome::Failed;
        }

        if let Some(checkpoint) = self.checkpoint.as_mut() {
            checkpoint.write(event.position);
            if let Err(e) = checkpoint.flush() {
                self.liveness.increment_failures();
                tracing::error!(
                    stream = %self.stream,
                    position = event.position.0,
                    error = %e,
                    "failed to flush checkpoint"
                );
                return DispatchOutcome::Failed;
            }
        }

        DispatchOutcome::Dispatched
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("dispatcher panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("dispatcher panicked: {}", s)
    } else {
        "dispatcher panicked".to_string()
    }
}
