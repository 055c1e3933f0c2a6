//! Subscription lifecycle and recovery.
//!
//! A [`Subscriber`] owns one registration with an [`EventSource`], a bounded
//! intake queue fed by the source's callbacks, and a dispatch thread draining
//! that queue into the application's [`Dispatcher`]. Dropped subscriptions and
//! heartbeat timeouts are recovered by [`Subscriber::restart`], which resumes
//! from the last received position.
//!
//! ```text
//!                 start()
//! Uninitialized ──────────► Subscribing ──► CatchingUp ──live started──► Live
//!                               ▲               │                         │
//!                               └── drop / heartbeat timeout ◄────────────┘
//!
//! user-initiated drop or shutdown() ──► Dead
//! ```

use crate::checkpoint::{CheckpointStore, FileCheckpoint};
use crate::config::{SubscriberOptions, SubscriptionMode};
use crate::dispatch::{DispatchLoop, Dispatcher};
use crate::error::{Result, SubscriberError};
use crate::heartbeat::{self, HeartbeatMonitor, HeartbeatStatus, HEARTBEAT_STREAM_MAX_COUNT};
use crate::liveness::LivenessState;
use crate::queue::IntakeQueue;
use crate::source::{CatchUpSettings, EventSource, SubscriptionCallbacks, SubscriptionHandle};
use crate::types::{CatchUpProgress, DropReason, StreamPosition, SubscribedEvent, HEARTBEAT_EVENT_TYPE};
use crate::watchdog::LiveProcessingWatchdog;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

/// Observable lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriberState {
    /// Constructed, never started.
    Uninitialized,
    /// A subscribe call is in progress or the last one failed.
    Subscribing,
    /// Replaying history.
    CatchingUp,
    /// Receiving live events.
    Live,
    /// Shut down or dropped by the user. Terminal.
    Dead,
}

/// The registration and everything guarded with it.
struct SubscriptionSlot {
    handle: Option<SubscriptionHandle>,
    /// Exclusive position the next catch-up subscription starts after.
    resume_from: Option<StreamPosition>,
    state: SubscriberState,
    started: bool,
}

enum DispatchState {
    Pending(DispatchLoop),
    Running(JoinHandle<()>),
    Finished,
}

struct Inner<S: EventSource> {
    stream: String,
    mode: SubscriptionMode,
    options: SubscriberOptions,
    source: S,
    queue: IntakeQueue,
    liveness: Arc<LivenessState>,
    slot: Mutex<SubscriptionSlot>,
    /// Bumped on every subscribe and on shutdown. Callbacks carry the value
    /// current when they were registered.
    generation: AtomicU64,
    /// Held by event intake across the generation check, the queue add and
    /// `last_received`. Taken before `slot` by anything that resubscribes.
    intake: Mutex<()>,
    heartbeat_stream: String,
    heartbeat: Option<HeartbeatMonitor>,
    watchdog: LiveProcessingWatchdog,
    dispatch: Mutex<DispatchState>,
    starting_position: u64,
}

/// Resilient subscriber to a single event stream.
///
/// Dropping the subscriber shuts it down.
pub struct Subscriber<S: EventSource> {
    inner: Arc<Inner<S>>,
}

impl<S: EventSource> Subscriber<S> {
    /// Subscribe to events appended from now on. Nothing is replayed.
    pub fn live<D>(
        source: S,
        stream: impl Into<String>,
        dispatcher: D,
        options: SubscriberOptions,
    ) -> Result<Self>
    where
        D: Dispatcher + 'static,
    {
        Self::build(
            source,
            stream.into(),
            SubscriptionMode::LiveOnly,
            None,
            Arc::new(dispatcher),
            None,
            options,
        )
    }

    /// Replay the stream after `position` (from the start when `None`), then
    /// follow live events.
    pub fn catch_up_from_position<D>(
        source: S,
        stream: impl Into<String>,
        position: Option<StreamPosition>,
        dispatcher: D,
        options: SubscriberOptions,
    ) -> Result<Self>
    where
        D: Dispatcher + 'static,
    {
        Self::build(
            source,
            stream.into(),
            SubscriptionMode::CatchUp,
            position,
            Arc::new(dispatcher),
            None,
            options,
        )
    }

    /// Resume after the position recorded in the checkpoint file at `path`,
    /// creating the file if needed. Every dispatched event is checkpointed
    /// there.
    pub fn catch_up_from_checkpoint_file<D>(
        source: S,
        stream: impl Into<String>,
        path: impl AsRef<Path>,
        dispatcher: D,
        options: SubscriberOptions,
    ) -> Result<Self>
    where
        D: Dispatcher + 'static,
    {
        options.validate()?;
        let checkpoint = FileCheckpoint::open_default(path)?;
        Self::catch_up_with_checkpoint(source, stream, checkpoint, dispatcher, options)
    }

    /// Resume after the position held by `checkpoint` and advance it as
    /// events are dispatched.
    pub fn catch_up_with_checkpoint<C, D>(
        source: S,
        stream: impl Into<String>,
        checkpoint: C,
        dispatcher: D,
        options: SubscriberOptions,
    ) -> Result<Self>
    where
        C: CheckpointStore + 'static,
        D: Dispatcher + 'static,
    {
        options.validate()?;
        let position = checkpoint.read()?;
        Self::build(
            source,
            stream.into(),
            SubscriptionMode::CatchUp,
            position,
            Arc::new(dispatcher),
            Some(Box::new(checkpoint)),
            options,
        )
    }

    fn build(
        source: S,
        stream: String,
        mode: SubscriptionMode,
        position: Option<StreamPosition>,
        dispatcher: Arc<dyn Dispatcher>,
        checkpoint: Option<Box<dyn CheckpointStore>>,
        options: SubscriberOptions,
    ) -> Result<Self> {
        options.validate()?;
        let heartbeat = options.heartbeat()?.map(HeartbeatMonitor::new);
        let heartbeat_stream = heartbeat::instance_stream_name();

        let queue = IntakeQueue::new(options.upper_queue_bound);
        let liveness = Arc::new(LivenessState::new(position));
        let dispatch = DispatchLoop::new(
            stream.clone(),
            queue.clone(),
            dispatcher,
            checkpoint,
            Arc::clone(&liveness),
        );
        let watchdog = LiveProcessingWatchdog::new(stream.clone(), options.live_processing_timeout);

        tracing::debug!(
            stream = %stream,
            mode = ?mode,
            from = ?position,
            heartbeat_stream = %heartbeat_stream,
            heartbeats = heartbeat.is_some(),
            "subscriber created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                stream,
                mode,
                source,
                queue,
                liveness,
                slot: Mutex::new(SubscriptionSlot {
                    handle: None,
                    resume_from: position,
                    state: SubscriberState::Uninitialized,
                    started: false,
                }),
                generation: AtomicU64::new(0),
                intake: Mutex::new(()),
                heartbeat_stream,
                heartbeat,
                watchdog,
                dispatch: Mutex::new(DispatchState::Pending(dispatch)),
                starting_position: position.map_or(0, |p| p.0),
                options,
            }),
        })
    }

    /// Subscribe and start dispatching.
    ///
    /// Calling it again replaces the current registration; the dispatch loop
    /// is only ever spawned once.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// Discard the current registration and subscribe again from the last
    /// received position. Does nothing once the subscriber is dead.
    pub fn restart(&self) {
        self.inner.restart(None);
    }

    /// Release the registration, stop all timers and let the dispatch loop
    /// drain the queue and exit. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Wait for the dispatch loop to exit. Only returns after [`shutdown`](Self::shutdown)
    /// (or a user-initiated drop) has closed the queue.
    pub fn join(&self) -> Result<()> {
        let state = std::mem::replace(&mut *self.inner.dispatch.lock(), DispatchState::Finished);
        match state {
            DispatchState::Running(handle) => handle
                .join()
                .map_err(|_| SubscriberError::InvalidOperation("dispatch loop panicked".into())),
            DispatchState::Finished => Ok(()),
            DispatchState::Pending(dispatch) => {
                *self.inner.dispatch.lock() = DispatchState::Pending(dispatch);
                Err(SubscriberError::InvalidOperation(
                    "subscriber was never started".into(),
                ))
            }
        }
    }

    /// Append a heartbeat to this subscriber's heartbeat stream.
    pub fn send_heartbeat(&self) -> Result<StreamPosition> {
        self.inner.send_heartbeat()
    }

    pub fn events_processed(&self) -> u64 {
        self.inner.liveness.events_processed()
    }

    /// How far catch-up has come, measured against the current end of the stream.
    pub fn catch_up_progress(&self) -> Result<CatchUpProgress> {
        let last_position = self
            .inner
            .source
            .read_last_event(&self.inner.stream)?
            .map(|e| e.position);
        Ok(CatchUpProgress {
            events_processed: self.events_processed(),
            starting_position: self.inner.starting_position,
            stream_name: self.inner.stream.clone(),
            last_position,
        })
    }

    /// True once live processing has started and every event received while
    /// catching up has been dispatched.
    pub fn view_models_ready(&self) -> bool {
        self.inner.liveness.view_models_ready()
    }

    pub fn is_catching_up(&self) -> bool {
        self.inner.liveness.is_catching_up()
    }

    pub fn last_received_position(&self) -> Option<StreamPosition> {
        self.inner.liveness.last_received()
    }

    pub fn last_dispatched_position(&self) -> Option<StreamPosition> {
        self.inner.liveness.last_dispatched()
    }

    pub fn dispatch_failures(&self) -> u64 {
        self.inner.liveness.dispatch_failures()
    }

    /// Name of this instance's heartbeat stream.
    pub fn heartbeat_stream(&self) -> &str {
        &self.inner.heartbeat_stream
    }

    pub fn is_heartbeat_armed(&self) -> bool {
        self.inner.heartbeat.as_ref().is_some_and(|h| h.is_armed())
    }

    pub fn is_watchdog_armed(&self) -> bool {
        self.inner.watchdog.is_armed()
    }

    /// Number of times the watchdog reported a subscription stuck in catch-up.
    pub fn stalls_reported(&self) -> u64 {
        self.inner.watchdog.stalls_reported()
    }

    pub fn stream(&self) -> &str {
        &self.inner.stream
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.inner.mode
    }

    pub fn options(&self) -> &SubscriberOptions {
        &self.inner.options
    }

    pub fn state(&self) -> SubscriberState {
        self.inner.slot.lock().state
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }
}

impl<S: EventSource> std::fmt::Debug for Subscriber<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("stream", &self.inner.stream)
            .field("mode", &self.inner.mode)
            .field("state", &self.state())
            .field("events_processed", &self.events_processed())
            .finish()
    }
}

impl<S: EventSource> Drop for Subscriber<S> {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl<S: EventSource> Inner<S> {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn send_heartbeat(&self) -> Result<StreamPosition> {
        self.source
            .append(&self.heartbeat_stream, HEARTBEAT_EVENT_TYPE, Vec::new())
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        if self.slot.lock().state == SubscriberState::Dead {
            return Err(SubscriberError::ShutDown);
        }

        if self.heartbeat.is_some() {
            self.send_heartbeat()?;
            self.arm_heartbeat();
        }

        let _intake = self.intake.lock();
        let mut slot = self.slot.lock();
        if slot.state == SubscriberState::Dead {
            return Err(SubscriberError::ShutDown);
        }
        self.subscribe(&mut slot)?;

        if !slot.started {
            slot.started = true;
            self.spawn_dispatch()?;
            if self.heartbeat.is_some() {
                if let Err(e) = self
                    .source
                    .set_max_count(&self.heartbeat_stream, HEARTBEAT_STREAM_MAX_COUNT)
                {
                    tracing::warn!(
                        stream = %self.stream,
                        heartbeat_stream = %self.heartbeat_stream,
                        error = %e,
                        "failed to limit heartbeat stream length"
                    );
                }
            }
        }

        tracing::info!(
            stream = %self.stream,
            mode = ?self.mode,
            from = ?slot.resume_from,
            "subscription started"
        );
        Ok(())
    }

    /// Replace the registration. Must be called with the intake and slot locks held.
    fn subscribe(self: &Arc<Self>, slot: &mut SubscriptionSlot) -> Result<()> {
        if let Some(old) = slot.handle.take() {
            old.release();
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        slot.state = SubscriberState::Subscribing;
        let callbacks = self.callbacks(generation);

        match self.mode {
            SubscriptionMode::LiveOnly => {
                let live = self.source.subscribe_live(&self.stream, callbacks)?;
                slot.handle = Some(SubscriptionHandle::Live(live));
                slot.state = SubscriberState::Live;
            }
            SubscriptionMode::CatchUp => {
                let settings = CatchUpSettings {
                    max_live_queue_size: self.options.max_live_queue_size,
                    read_batch_size: self.options.catch_up_page_size,
                };
                let catch_up =
                    self.source
                        .subscribe_from(&self.stream, slot.resume_from, settings, callbacks)?;
                slot.handle = Some(SubscriptionHandle::CatchingUp(catch_up));
                slot.state = SubscriberState::CatchingUp;
            }
        }
        Ok(())
    }

    fn callbacks(self: &Arc<Self>, generation: u64) -> SubscriptionCallbacks {
        let on_event = Arc::downgrade(self);
        let on_live_started = Arc::downgrade(self);
        let on_dropped = Arc::downgrade(self);
        SubscriptionCallbacks {
            on_event: Arc::new(move |event| {
                if let Some(inner) = Weak::upgrade(&on_event) {
                    inner.on_event(generation, event);
                }
            }),
            on_live_started: Arc::new(move || {
                if let Some(inner) = Weak::upgrade(&on_live_started) {
                    inner.on_live_started(generation);
                }
            }),
            on_dropped: Arc::new(move |reason, error| {
                if let Some(inner) = Weak::upgrade(&on_dropped) {
                    inner.on_dropped(generation, reason, error);
                }
            }),
        }
    }

    fn spawn_dispatch(&self) -> Result<()> {
        let mut dispatch = self.dispatch.lock();
        match std::mem::replace(&mut *dispatch, DispatchState::Finished) {
            DispatchState::Pending(dispatch_loop) => {
                *dispatch = DispatchState::Running(dispatch_loop.spawn()?);
            }
            other => *dispatch = other,
        }
        Ok(())
    }

    fn on_event(&self, generation: u64, event: SubscribedEvent) {
        // Held while blocked in `add` so a resubscribe cannot capture its
        // resume position until this event is queued and recorded.
        let _intake = self.intake.lock();
        if !self.is_current(generation) {
            tracing::debug!(
                stream = %self.stream,
                position = event.position.0,
                "ignoring event from a replaced subscription"
            );
            return;
        }

        if event.is_heartbeat() {
            self.liveness.record_heartbeat(Instant::now());
            return;
        }

        if self.liveness.is_catching_up() {
            self.liveness.record_non_live_received(event.position);
        }

        let position = event.position;
        if let Err(e) = self.queue.add(event) {
            tracing::warn!(
                stream = %self.stream,
                position = position.0,
                error = %e,
                "event received after the intake queue was closed"
            );
            return;
        }
        self.liveness.record_received(position);
    }

    fn on_live_started(&self, generation: u64) {
        let mut slot = self.slot.lock();
        if !self.is_current(generation) || slot.state == SubscriberState::Dead {
            return;
        }
        self.watchdog.disarm();
        self.liveness.set_catching_up(false);
        slot.state = SubscriberState::Live;

        tracing::info!(
            stream = %self.stream,
            last_received = ?self.liveness.last_received(),
            "live event processing started"
        );
    }

    fn on_dropped(self: &Arc<Self>, generation: u64, reason: DropReason, error: Option<String>) {
        {
            let slot = self.slot.lock();
            if !self.is_current(generation) || slot.state == SubscriberState::Dead {
                tracing::debug!(
                    stream = %self.stream,
                    reason = %reason,
                    "ignoring drop of a replaced subscription"
                );
                return;
            }
        }

        tracing::info!(
            stream = %self.stream,
            reason = %reason,
            error = error.as_deref().unwrap_or(""),
            "subscription dropped"
        );

        if reason.is_user_initiated() {
            tracing::info!(
                stream = %self.stream,
                "not restarting a user-initiated drop; subscription is dead"
            );
            self.shutdown();
            return;
        }

        self.restart(Some(generation));
    }

    /// Resubscribe from the last received position. With `expected` set, only
    /// restarts while that generation is still current.
    fn restart(self: &Arc<Self>, expected: Option<u64>) {
        {
            let _intake = self.intake.lock();
            let mut slot = self.slot.lock();
            if slot.state == SubscriberState::Dead {
                return;
            }
            if expected.is_some_and(|generation| !self.is_current(generation)) {
                return;
            }

            if let Some(heartbeat) = &self.heartbeat {
                heartbeat.disarm();
            }
            if let Some(old) = slot.handle.take() {
                old.release();
            }

            slot.resume_from = self.liveness.last_received();
            self.liveness.reset_catch_up();
            if self.mode == SubscriptionMode::CatchUp && !self.watchdog.is_armed() {
                self.watchdog.arm();
            }

            tracing::info!(
                stream = %self.stream,
                from = ?slot.resume_from,
                "restarting subscription"
            );

            if let Err(e) = self.subscribe(&mut slot) {
                slot.state = SubscriberState::Subscribing;
                tracing::error!(
                    stream = %self.stream,
                    error = %e,
                    "failed to resubscribe"
                );
            }
        }

        if self.heartbeat.is_some() {
            if let Err(e) = self.send_heartbeat() {
                tracing::warn!(stream = %self.stream, error = %e, "failed to send heartbeat");
            }
            self.arm_heartbeat();
        }
    }

    fn arm_heartbeat(self: &Arc<Self>) {
        let Some(heartbeat) = &self.heartbeat else {
            return;
        };
        let weak = Arc::downgrade(self);
        heartbeat.arm(move || match weak.upgrade() {
            Some(inner) => inner.heartbeat_tick(),
            None => ControlFlow::Break(()),
        });
    }

    fn heartbeat_tick(self: &Arc<Self>) -> ControlFlow<()> {
        let Some(heartbeat) = &self.heartbeat else {
            return ControlFlow::Break(());
        };
        if self.slot.lock().state == SubscriberState::Dead {
            return ControlFlow::Break(());
        }

        if let Err(e) = self.send_heartbeat() {
            tracing::warn!(stream = %self.stream, error = %e, "failed to send heartbeat");
        }

        let last_heartbeat = self.liveness.last_heartbeat();
        match heartbeat::evaluate(
            self.liveness.view_models_ready(),
            last_heartbeat,
            Instant::now(),
            heartbeat.timeout(),
        ) {
            HeartbeatStatus::ViewReady | HeartbeatStatus::Healthy => ControlFlow::Continue(()),
            HeartbeatStatus::TimedOut { elapsed } => {
                tracing::error!(
                    stream = %self.stream,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "subscriber heartbeat timeout, restarting subscription"
                );
                // Restart arms a fresh timer; this one stops.
                self.restart(None);
                ControlFlow::Break(())
            }
        }
    }

    fn shutdown(&self) {
        {
            let mut slot = self.slot.lock();
            if slot.state == SubscriberState::Dead {
                return;
            }
            slot.state = SubscriberState::Dead;
            self.generation.fetch_add(1, Ordering::AcqRel);
            if let Some(handle) = slot.handle.take() {
                handle.release();
            }
        }

        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.disarm();
        }
        self.watchdog.disarm();
        self.queue.close();

        let mut dispatch = self.dispatch.lock();
        if let DispatchState::Pending(_) = &*dispatch {
            *dispatch = DispatchState::Finished;
        }

        tracing::info!(
            stream = %self.stream,
            events_processed = self.liveness.events_processed(),
            "subscriber shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchError;
    use crate::source::InMemoryEventSource;
    use std::thread;
    use std::time::Duration;

    fn noop(_: &SubscribedEvent) -> std::result::Result<(), DispatchError> {
        Ok(())
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_stale_generation_events_are_ignored() {
        let source = InMemoryEventSource::new();
        let subscriber = Subscriber::catch_up_from_position(
            source.clone(),
            "orders",
            None,
            noop,
            SubscriberOptions::default(),
        )
        .unwrap();
        subscriber.start().unwrap();
        assert!(wait_until(|| subscriber.state() == SubscriberState::Live));

        let inner = &subscriber.inner;
        let stale = inner.generation.load(Ordering::Acquire) - 1;
        inner.on_event(
            stale,
            SubscribedEvent::new(StreamPosition(77), "Late", vec![], "orders"),
        );
        assert_eq!(subscriber.last_received_position(), None);
        assert!(inner.queue.is_empty());

        inner.on_dropped(stale, DropReason::ConnectionClosed, None);
        assert_eq!(source.subscriptions_opened(), 1);
        assert_eq!(subscriber.state(), SubscriberState::Live);
    }

    #[test]
    fn test_heartbeat_events_refresh_clock_without_enqueueing() {
        let source = InMemoryEventSource::new();
        let subscriber =
            Subscriber::live(source, "orders", noop, SubscriberOptions::default()).unwrap();
        subscriber.start().unwrap();

        let inner = &subscriber.inner;
        let before = inner.liveness.last_heartbeat();
        thread::sleep(Duration::from_millis(2));
        let generation = inner.generation.load(Ordering::Acquire);
        inner.on_event(
            generation,
            SubscribedEvent::new(StreamPosition(3), HEARTBEAT_EVENT_TYPE, vec![], "hb"),
        );

        assert!(inner.liveness.last_heartbeat() > before);
        assert!(inner.queue.is_empty());
        assert_eq!(subscriber.last_received_position(), None);
    }

    #[test]
    fn test_shutdown_before_start() {
        let subscriber = Subscriber::live(
            InMemoryEventSource::new(),
            "orders",
            noop,
            SubscriberOptions::default(),
        )
        .unwrap();
        assert_eq!(subscriber.state(), SubscriberState::Uninitialized);
        assert!(subscriber.join().is_err());

        subscriber.shutdown();
        assert_eq!(subscriber.state(), SubscriberState::Dead);
        assert!(matches!(subscriber.start(), Err(SubscriberError::ShutDown)));
        subscriber.join().unwrap();
    }

    #[test]
    fn test_send_heartbeat_without_heartbeat_timer() {
        let source = InMemoryEventSource::new();
        let subscriber =
            Subscriber::live(source.clone(), "orders", noop, SubscriberOptions::default())
                .unwrap();
        assert!(subscriber
            .heartbeat_stream()
            .starts_with(crate::heartbeat::HEARTBEAT_STREAM_PREFIX));
        assert!(!subscriber.is_heartbeat_armed());

        let position = subscriber.send_heartbeat().unwrap();
        let stored = source.read_stream(subscriber.heartbeat_stream());
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].position, position);
        assert_eq!(stored[0].event_type, HEARTBEAT_EVENT_TYPE);
    }
}
