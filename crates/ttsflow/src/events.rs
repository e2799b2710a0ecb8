//! Playback events and their delivery to listeners.
//!
//! The controller publishes events into a bounded queue and returns
//! immediately; a separate task drains the queue and invokes listeners, so a
//! slow listener can delay other listeners but never the audio path.

use crate::types::{SessionOutcome, TimingSource};
use log::{debug, error, warn};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, watch};

/// Event kinds a listener can subscribe to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Word,
    Ended,
}

/// Event payloads, delivered in playback position order
#[derive(Clone, Debug, PartialEq)]
pub enum SpeechEvent {
    /// The session entered `Playing` for the first time
    Started { position: f64 },
    /// Playback reached the start of a word. Times are absolute seconds
    /// from the start of the utterance.
    Word {
        word: String,
        start: f64,
        end: f64,
        chunk: usize,
        source: TimingSource,
    },
    /// The session reached a terminal state
    Ended {
        outcome: SessionOutcome,
        position: f64,
    },
}

impl SpeechEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SpeechEvent::Started { .. } => EventKind::Started,
            SpeechEvent::Word { .. } => EventKind::Word,
            SpeechEvent::Ended { .. } => EventKind::Ended,
        }
    }

    /// Playback position the event belongs to
    pub fn position(&self) -> f64 {
        match self {
            SpeechEvent::Started { position } | SpeechEvent::Ended { position, .. } => *position,
            SpeechEvent::Word { start, .. } => *start,
        }
    }

    /// Word and Started/Ended events differ in delivery guarantees
    pub fn is_droppable(&self) -> bool {
        matches!(self, SpeechEvent::Word { .. })
    }
}

type Callback = Arc<dyn Fn(&SpeechEvent) + Send + Sync>;

#[derive(Clone)]
struct Listener {
    kinds: Vec<EventKind>,
    callback: Callback,
}

/// Listeners in registration order
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Vec<Listener>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for one event kind
    pub fn on<F>(&mut self, kind: EventKind, callback: F)
    where
        F: Fn(&SpeechEvent) + Send + Sync + 'static,
    {
        self.on_any(&[kind], callback);
    }

    /// Register one callback for several event kinds
    pub fn on_any<F>(&mut self, kinds: &[EventKind], callback: F)
    where
        F: Fn(&SpeechEvent) + Send + Sync + 'static,
    {
        self.listeners.push(Listener {
            kinds: kinds.to_vec(),
            callback: Arc::new(callback),
        });
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Invoke every listener registered for the event's kind. A panicking
    /// listener is logged and skipped.
    pub fn deliver(&self, event: &SpeechEvent) {
        let kind = event.kind();
        for (index, listener) in self.listeners.iter().enumerate() {
            if !listener.kinds.contains(&kind) {
                continue;
            }
            let callback = &listener.callback;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                error!(
                    "Listener #{} panicked while handling {:?} event: {}",
                    index,
                    kind,
                    panic_message(&*panic)
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<SpeechEvent>,
    closed: bool,
    dropped: u64,
}

/// Bounded event queue. On overflow the oldest `Word` event is dropped;
/// `Started` and `Ended` are always queued.
#[derive(Debug)]
struct EventQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: SpeechEvent) {
        {
            let mut state = self.lock();
            if state.closed {
                debug!("Dropping {:?} event published after the queue closed", event.kind());
                return;
            }
            if state.events.len() >= self.capacity && event.is_droppable() {
                match state.events.iter().position(SpeechEvent::is_droppable) {
                    Some(oldest) => {
                        state.events.remove(oldest);
                    }
                    None => {
                        state.dropped += 1;
                        warn!("Event queue full, dropped word event");
                        return;
                    }
                }
                state.dropped += 1;
                warn!(
                    "Event queue full ({} events), dropped oldest word event",
                    self.capacity
                );
            }
            if matches!(event, SpeechEvent::Ended { .. }) {
                state.closed = true;
            }
            state.events.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Next queued event, or `None` once the queue is closed and empty
    async fn next(&self) -> Option<SpeechEvent> {
        loop {
            {
                let mut state = self.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Refuse further events; queued ones are still delivered
    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Delivers a session's events to its listeners on a dedicated task.
///
/// The task outlives the dispatcher: dropping it closes the queue and the
/// task exits once everything already queued has been delivered.
#[derive(Debug)]
pub struct EventDispatcher {
    queue: Arc<EventQueue>,
    drained: watch::Receiver<bool>,
}

impl EventDispatcher {
    /// Spawn the dispatch task. Must be called within a Tokio runtime.
    pub fn spawn(listeners: ListenerRegistry, capacity: usize) -> Self {
        let queue = Arc::new(EventQueue {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        });
        let (drained_tx, drained) = watch::channel(false);

        {
            let queue = queue.clone();
            tokio::spawn(async move {
                while let Some(event) = queue.next().await {
                    let last = matches!(event, SpeechEvent::Ended { .. });
                    listeners.deliver(&event);
                    if last {
                        break;
                    }
                }
                let _ = drained_tx.send(true);
            });
        }

        Self { queue, drained }
    }

    /// Queue an event. Never blocks.
    pub fn publish(&self, event: SpeechEvent) {
        self.queue.publish(event);
    }

    /// Word events dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.queue.lock().dropped
    }

    /// Wait until the `Ended` event has been delivered to every listener
    pub async fn drained(&self) {
        let mut drained = self.drained.clone();
        let _ = drained.wait_for(|done| *done).await;
    }

    pub fn is_drained(&self) -> bool {
        *self.drained.borrow()
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.queue.close();
    }
}
