//! Named-topic publish/subscribe with dispatch on a dedicated task.
//!
//! Signalling enqueues; a single dispatcher thread invokes handlers
//! synchronously in registration order, so handlers must not perform
//! unbounded work. Topics are plain strings, no wildcards. When the queue
//! overflows the newest event is dropped; once the dispatcher catches up
//! it raises a `bus.overflow` event, rate-limited to once per second.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::thread_util;

/// Queue depth before the overflow policy kicks in.
const QUEUE_DEPTH: usize = 64;

/// Topic raised when events had to be dropped.
pub const TOPIC_OVERFLOW: &str = "bus.overflow";

/// One queued event: topic plus opaque payload.
pub struct Event {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Handler registration receipt; pass to [`EventBus::deregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u32);

type HandlerFn = Box<dyn Fn(&Event) + Send + Sync>;

struct HandlerEntry {
    id: HandlerId,
    topic: String,
    handler: HandlerFn,
}

struct Inner {
    handlers: Mutex<Vec<Arc<HandlerEntry>>>,
    dropped: AtomicU32,
    last_overflow_report: Mutex<Option<Instant>>,
}

impl Inner {
    fn dispatch(&self, event: &Event) {
        // snapshot so handlers can (de)register without deadlock
        let snapshot: Vec<Arc<HandlerEntry>> = self
            .handlers
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.topic == event.topic)
            .cloned()
            .collect();
        for entry in snapshot {
            (entry.handler)(event);
        }
    }

    /// Report queue drops, at most once per second.
    fn report_overflow(&self) {
        if self.dropped.load(Ordering::Relaxed) == 0 {
            return;
        }
        let mut last = self.last_overflow_report.lock().unwrap();
        let due = last.map_or(true, |t| t.elapsed() >= Duration::from_secs(1));
        if !due {
            return;
        }
        *last = Some(Instant::now());
        drop(last);
        let count = self.dropped.swap(0, Ordering::Relaxed);
        self.dispatch(&Event {
            topic: TOPIC_OVERFLOW.to_string(),
            payload: count.to_le_bytes().to_vec(),
        });
    }
}

/// The bus. Create once, share by `Arc`.
pub struct EventBus {
    tx: SyncSender<Event>,
    inner: Arc<Inner>,
    next_id: AtomicU32,
}

impl EventBus {
    /// Create the bus and start its dispatcher task.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (tx, rx) = sync_channel::<Event>(QUEUE_DEPTH);
        let inner = Arc::new(Inner {
            handlers: Mutex::new(Vec::new()),
            dropped: AtomicU32::new(0),
            last_overflow_report: Mutex::new(None),
        });

        let dispatch_inner = inner.clone();
        thread_util::spawn_named("events", move || {
            info!("Event dispatcher task started");
            while let Ok(event) = rx.recv() {
                dispatch_inner.dispatch(&event);
                dispatch_inner.report_overflow();
            }
            info!("Event dispatcher task stopped");
        });

        Arc::new(Self {
            tx,
            inner,
            next_id: AtomicU32::new(1),
        })
    }

    /// Register a handler for one topic. Handlers fire in registration
    /// order on the dispatcher task.
    pub fn register<F>(&self, topic: &str, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("Registering handler {id:?} for {topic}");
        self.inner.handlers.lock().unwrap().push(Arc::new(HandlerEntry {
            id,
            topic: topic.to_string(),
            handler: Box::new(handler),
        }));
        id
    }

    /// Remove a previously registered handler.
    pub fn deregister(&self, id: HandlerId) {
        self.inner.handlers.lock().unwrap().retain(|e| e.id != id);
    }

    /// Raise an event without payload.
    pub fn signal(&self, topic: &str) {
        self.signal_with(topic, Vec::new());
    }

    /// Raise an event with an opaque payload.
    pub fn signal_with(&self, topic: &str, payload: Vec<u8>) {
        let event = Event {
            topic: topic.to_string(),
            payload,
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event queue full, dropping {}", event.topic);
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("Event dispatcher gone, dropping {topic}");
            }
        }
    }
}

/// Start the 1 Hz clock task feeding `ticker.1` / `ticker.10` / `ticker.60`.
/// The slower topics fire on multiples of the 1 s tick.
pub fn start_ticker(bus: &Arc<EventBus>) {
    let bus = bus.clone();
    thread_util::spawn_named("ticker", move || {
        let mut tick: u64 = 0;
        loop {
            std::thread::sleep(Duration::from_secs(1));
            tick += 1;
            bus.signal("ticker.1");
            if tick % 10 == 0 {
                bus.signal("ticker.10");
            }
            if tick % 60 == 0 {
                bus.signal("ticker.60");
            }
        }
    });
}
