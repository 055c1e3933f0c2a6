//! In-process event source.
//!
//! Streams live in memory; every append is also linked into the all-stream
//! ([`ALL_STREAM`]) with its own position there. Each subscription is served by
//! a dedicated delivery thread, so callbacks run off the caller's thread just
//! as they would for a networked source. Connection failures can be simulated
//! with [`InMemoryEventSource::drop_subscriptions`] and
//! [`InMemoryEventSource::set_stalled`].

use super::{
    CatchUpSettings, CatchUpSubscription, EventSource, LiveSubscription, SubscriptionCallbacks,
};
use crate::error::{Result, SubscriberError};
use crate::types::{DropReason, StreamPosition, SubscribedEvent};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Name of the aggregate stream containing every appended event.
pub const ALL_STREAM: &str = "$all";

/// Buffer for live-only subscriptions.
const LIVE_ONLY_BUFFER: usize = 10_000;

/// How often a stalled delivery thread re-checks its state.
const STALL_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// A subscribe call observed by the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub stream: String,
    /// Exclusive start position of a catch-up subscription.
    pub from: Option<StreamPosition>,
    pub live_only: bool,
}

enum Control {
    Drop(DropReason, Option<String>),
}

#[derive(Default)]
struct StreamLog {
    events: VecDeque<SubscribedEvent>,
    next_position: u64,
    max_count: Option<u64>,
}

impl StreamLog {
    fn push(&mut self, event: SubscribedEvent) {
        self.events.push_back(event);
        self.next_position += 1;
        self.trim();
    }

    fn trim(&mut self) {
        if let Some(max) = self.max_count {
            while self.events.len() as u64 > max {
                self.events.pop_front();
            }
        }
    }

    /// Retained events at or after `from`, at most `limit` of them.
    fn read_from(&self, from: u64, limit: usize) -> Vec<SubscribedEvent> {
        let first = self
            .events
            .front()
            .map_or(self.next_position, |e| e.position.0);
        let skip = from.saturating_sub(first) as usize;
        self.events.iter().skip(skip).take(limit).cloned().collect()
    }
}

/// Live push target of a subscription.
struct Registration {
    stream: String,
    sender: Sender<SubscribedEvent>,
}

struct SourceInner {
    streams: RwLock<HashMap<String, StreamLog>>,
    /// Subscriptions receiving live pushes.
    live: Mutex<HashMap<u64, Registration>>,
    /// Control channel of every running delivery thread.
    workers: Mutex<HashMap<u64, Sender<Control>>>,
    next_id: AtomicU64,
    requests: Mutex<Vec<SubscribeRequest>>,
    stalled: AtomicBool,
    append_failure: Mutex<Option<String>>,
    subscribe_failure: Mutex<Option<String>>,
}

impl SourceInner {
    fn read_page(&self, stream: &str, from: u64, limit: usize) -> Vec<SubscribedEvent> {
        self.streams
            .read()
            .get(stream)
            .map(|log| log.read_from(from, limit))
            .unwrap_or_default()
    }

    /// Register `id` for live pushes. Returns the receiver and the stream head
    /// at registration time, or `None` if the subscription was already released.
    fn go_live(&self, id: u64, stream: &str, capacity: usize) -> Option<(Receiver<SubscribedEvent>, u64)> {
        // Holding the write lock keeps appends out until the registration exists.
        let streams = self.streams.write();
        if !self.workers.lock().contains_key(&id) {
            return None;
        }
        let head = streams.get(stream).map_or(0, |log| log.next_position);
        let (sender, receiver) = bounded(capacity.max(1));
        self.live.lock().insert(
            id,
            Registration {
                stream: stream.to_string(),
                sender,
            },
        );
        Some((receiver, head))
    }

    /// Push a freshly appended event to live subscribers. Called with the
    /// streams write lock held so pushes follow append order.
    fn push_live(&self, event: &SubscribedEvent, linked: &SubscribedEvent) {
        let mut overflowed = Vec::new();
        {
            let mut live = self.live.lock();
            let mut disconnected = Vec::new();
            for (id, registration) in live.iter() {
                let delivery = if registration.stream == event.stream_id {
                    event
                } else if registration.stream == ALL_STREAM {
                    linked
                } else {
                    continue;
                };
                match registration.sender.try_send(delivery.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => overflowed.push(*id),
                    Err(TrySendError::Disconnected(_)) => disconnected.push(*id),
                }
            }
            for id in overflowed.iter().chain(disconnected.iter()) {
                live.remove(id);
            }
        }

        for id in overflowed {
            self.release(id, DropReason::ProcessingQueueOverflow, None);
        }
    }

    /// Tell the delivery thread of `id` to drop and forget the subscription.
    fn release(&self, id: u64, reason: DropReason, error: Option<String>) -> bool {
        let control = self.workers.lock().remove(&id);
        // Signal before unregistering so the thread sees why its channel closed.
        let released = match control {
            Some(control) => {
                let _ = control.send(Control::Drop(reason, error));
                true
            }
            None => false,
        };
        self.live.lock().remove(&id);
        released
    }

    /// Block while stalled. Returns a pending drop if one arrives first.
    fn wait_for_delivery(&self, control: &Receiver<Control>) -> Option<(DropReason, Option<String>)> {
        loop {
            match control.try_recv() {
                Ok(Control::Drop(reason, error)) => return Some((reason, error)),
                Err(TryRecvError::Disconnected) => {
                    return Some((
                        DropReason::ConnectionClosed,
                        Some("event source control channel closed".into()),
                    ))
                }
                Err(TryRecvError::Empty) => {}
            }
            if !self.stalled.load(Ordering::Acquire) {
                return None;
            }
            thread::sleep(STALL_POLL_INTERVAL);
        }
    }

    fn check_subscribe_failure(&self) -> Result<()> {
        match self.subscribe_failure.lock().as_ref() {
            Some(message) => Err(SubscriberError::Source(message.clone())),
            None => Ok(()),
        }
    }

    fn register_worker(&self) -> (u64, Receiver<Control>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (control_tx, control_rx) = unbounded();
        self.workers.lock().insert(id, control_tx);
        (id, control_rx)
    }
}

/// Outcome of delivering a sequence of events.
enum Delivery {
    Continue,
    Dropped,
}

/// Delivery-thread state for one subscription.
struct Worker {
    source: Arc<SourceInner>,
    stream: String,
    callbacks: SubscriptionCallbacks,
    control: Receiver<Control>,
    /// Next position this subscription expects.
    next: u64,
}

impl Worker {
    fn deliver(&mut self, event: SubscribedEvent) -> Delivery {
        if event.position.0 < self.next {
            return Delivery::Continue;
        }
        if let Some((reason, error)) = self.source.wait_for_delivery(&self.control) {
            (self.callbacks.on_dropped)(reason, error);
            return Delivery::Dropped;
        }
        self.next = event.position.0 + 1;
        (self.callbacks.on_event)(event);
        Delivery::Continue
    }

    /// Replay history until a read returns nothing at or after `self.next`,
    /// or until `until` is reached.
    fn replay(&mut self, page_size: usize, until: Option<u64>) -> Delivery {
        loop {
            if until.is_some_and(|head| self.next >= head) {
                return Delivery::Continue;
            }
            let page = self.source.read_page(&self.stream, self.next, page_size);
            if page.is_empty() {
                return Delivery::Continue;
            }
            for event in page {
                if let Delivery::Dropped = self.deliver(event) {
                    return Delivery::Dropped;
                }
            }
        }
    }

    /// Report a drop that arrived while no channel was being watched.
    fn report_pending_drop(&self) {
        if let Ok(Control::Drop(reason, error)) = self.control.try_recv() {
            (self.callbacks.on_dropped)(reason, error);
        }
    }

    fn run_catch_up(mut self, id: u64, settings: CatchUpSettings) {
        if let Delivery::Dropped = self.replay(settings.read_batch_size, None) {
            return;
        }

        let Some((live, head)) = self.source.go_live(id, &self.stream, settings.max_live_queue_size)
        else {
            self.report_pending_drop();
            return;
        };

        // Events appended between the last page and the registration.
        if let Delivery::Dropped = self.replay(settings.read_batch_size, Some(head)) {
            return;
        }

        if let Some((reason, error)) = self.source.wait_for_delivery(&self.control) {
            (self.callbacks.on_dropped)(reason, error);
            return;
        }
        (self.callbacks.on_live_started)();

        self.run_live(live);
    }

    fn run_live(mut self, live: Receiver<SubscribedEvent>) {
        enum Step {
            Control(Option<Control>),
            Event(Option<SubscribedEvent>),
        }

        loop {
            let step = crossbeam_channel::select! {
                recv(self.control) -> msg => Step::Control(msg.ok()),
                recv(live) -> msg => Step::Event(msg.ok()),
            };
            match step {
                Step::Control(Some(Control::Drop(reason, error))) => {
                    (self.callbacks.on_dropped)(reason, error);
                    return;
                }
                Step::Control(None) => return,
                Step::Event(Some(event)) => {
                    if let Delivery::Dropped = self.deliver(event) {
                        return;
                    }
                }
                Step::Event(None) => {
                    self.report_pending_drop();
                    return;
                }
            }
        }
    }
}

/// Handle returned for both live and catch-up subscriptions.
struct MemorySubscription {
    id: u64,
    source: Arc<SourceInner>,
}

impl LiveSubscription for MemorySubscription {
    fn close(&mut self) {
        self.source.release(self.id, DropReason::UserInitiated, None);
    }
}

impl CatchUpSubscription for MemorySubscription {
    fn stop(&mut self) {
        self.source.release(self.id, DropReason::UserInitiated, None);
    }
}

/// Event source backed by process memory. Clones share the same streams.
#[derive(Clone)]
pub struct InMemoryEventSource {
    inner: Arc<SourceInner>,
}

impl InMemoryEventSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SourceInner {
                streams: RwLock::new(HashMap::new()),
                live: Mutex::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                requests: Mutex::new(Vec::new()),
                stalled: AtomicBool::new(false),
                append_failure: Mutex::new(None),
                subscribe_failure: Mutex::new(None),
            }),
        }
    }

    /// Drop every active subscription with `reason`, as a server restart would.
    /// Returns the number of subscriptions dropped.
    pub fn drop_subscriptions(&self, reason: DropReason, error: Option<&str>) -> usize {
        let ids: Vec<u64> = self.inner.workers.lock().keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.inner.release(*id, reason, error.map(str::to_string)))
            .count()
    }

    /// While stalled, delivery threads hold back every callback. Appends still
    /// succeed and live events accumulate in the subscriptions' buffers.
    pub fn set_stalled(&self, stalled: bool) {
        self.inner.stalled.store(stalled, Ordering::Release);
    }

    /// Make subsequent appends fail with `message`, or succeed again with `None`.
    pub fn fail_appends(&self, message: Option<&str>) {
        *self.inner.append_failure.lock() = message.map(str::to_string);
    }

    /// Make subsequent subscribe calls fail with `message`, or succeed again with `None`.
    pub fn fail_subscribes(&self, message: Option<&str>) {
        *self.inner.subscribe_failure.lock() = message.map(str::to_string);
    }

    /// Every successful subscribe call, oldest first.
    pub fn requests(&self) -> Vec<SubscribeRequest> {
        self.inner.requests.lock().clone()
    }

    /// Number of successful subscribe calls so far.
    pub fn subscriptions_opened(&self) -> usize {
        self.inner.requests.lock().len()
    }

    /// Subscriptions not yet released or dropped.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.workers.lock().len()
    }

    /// All retained events of `stream`.
    pub fn read_stream(&self, stream: &str) -> Vec<SubscribedEvent> {
        self.inner.read_page(stream, 0, usize::MAX)
    }

    /// Append a JSON-encoded payload.
    pub fn append_json(
        &self,
        stream: &str,
        event_type: &str,
        payload: &impl serde::Serialize,
    ) -> Result<StreamPosition> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| SubscriberError::Serialization(e.to_string()))?;
        self.append(stream, event_type, bytes)
    }

    fn spawn_worker<F>(&self, name: &str, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        thread::Builder::new()
            .name(format!("memory-source-{}", name))
            .spawn(work)
            .map(|_| ())
            .map_err(SubscriberError::Io)
    }
}

impl Default for InMemoryEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for InMemoryEventSource {
    fn subscribe_live(
        &self,
        stream: &str,
        callbacks: SubscriptionCallbacks,
    ) -> Result<Box<dyn LiveSubscription>> {
        self.inner.check_subscribe_failure()?;
        let (id, control) = self.inner.register_worker();
        let Some((live, head)) = self.inner.go_live(id, stream, LIVE_ONLY_BUFFER) else {
            return Err(SubscriberError::Source("subscription released during registration".into()));
        };

        let worker = Worker {
            source: Arc::clone(&self.inner),
            stream: stream.to_string(),
            callbacks,
            control,
            next: head,
        };
        if let Err(e) = self.spawn_worker("live", move || worker.run_live(live)) {
            self.inner.release(id, DropReason::SubscribingError, None);
            return Err(e);
        }
        self.inner.requests.lock().push(SubscribeRequest {
            stream: stream.to_string(),
            from: None,
            live_only: true,
        });

        Ok(Box::new(MemorySubscription {
            id,
            source: Arc::clone(&self.inner),
        }))
    }

    fn subscribe_from(
        &self,
        stream: &str,
        from: Option<StreamPosition>,
        settings: CatchUpSettings,
        callbacks: SubscriptionCallbacks,
    ) -> Result<Box<dyn CatchUpSubscription>> {
        self.inner.check_subscribe_failure()?;
        let (id, control) = self.inner.register_worker();

        let worker = Worker {
            source: Arc::clone(&self.inner),
            stream: stream.to_string(),
            callbacks,
            control,
            next: from.map_or(0, |p| p.0 + 1),
        };
        let settings = CatchUpSettings {
            read_batch_size: settings.read_batch_size.max(1),
            ..settings
        };
        if let Err(e) = self.spawn_worker("catch-up", move || worker.run_catch_up(id, settings)) {
            self.inner.release(id, DropReason::SubscribingError, None);
            return Err(e);
        }
        self.inner.requests.lock().push(SubscribeRequest {
            stream: stream.to_string(),
            from,
            live_only: false,
        });

        Ok(Box::new(MemorySubscription {
            id,
            source: Arc::clone(&self.inner),
        }))
    }

    fn append(&self, stream: &str, event_type: &str, payload: Vec<u8>) -> Result<StreamPosition> {
        if let Some(message) = self.inner.append_failure.lock().as_ref() {
            return Err(SubscriberError::Source(message.clone()));
        }
        if stream.is_empty() || stream == ALL_STREAM {
            return Err(SubscriberError::InvalidOperation(format!(
                "cannot append to stream '{}'",
                stream
            )));
        }

        let mut streams = self.inner.streams.write();

        let log = streams.entry(stream.to_string()).or_default();
        let event = SubscribedEvent::new(
            StreamPosition(log.next_position),
            event_type,
            payload,
            stream,
        );
        log.push(event.clone());

        let all = streams.entry(ALL_STREAM.to_string()).or_default();
        let linked = SubscribedEvent {
            position: StreamPosition(all.next_position),
            ..event.clone()
        };
        all.push(linked.clone());

        self.inner.push_live(&event, &linked);
        Ok(event.position)
    }

    fn read_last_event(&self, stream: &str) -> Result<Option<SubscribedEvent>> {
        Ok(self
            .inner
            .streams
            .read()
            .get(stream)
            .and_then(|log| log.events.back().cloned()))
    }

    fn set_max_count(&self, stream: &str, max_count: u64) -> Result<()> {
        let mut streams = self.inner.streams.write();
        let log = streams.entry(stream.to_string()).or_default();
        log.max_count = Some(max_count);
        log.trim();
        Ok(())
    }
}
