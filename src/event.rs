use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::warn;

/// What happened, machine-readable. The human-readable side lives in
/// [`Event::detail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IncomingCall,
    CallStateChanged,
    CallTerminated,
    TransactionTimeout,
    RegistrationChanged,
    RegistrationFailed,
    /// The peer's duration-report notification ended the call. This is a
    /// quirk of the deployed server and deliberately kept as its own kind.
    CallEndedByDurationReport,
    Notification,
    SpeakerChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// Call-ID of the session the event belongs to, if any.
    pub session_id: Option<String>,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, session_id: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            session_id,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

struct Inner {
    queue: VecDeque<Event>,
    dropped: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

/// Producer half. Enqueues and returns immediately; when the queue is full
/// the oldest event is dropped and counted, the signaling task never waits
/// on the consumer.
#[derive(Clone)]
pub struct EventSender {
    shared: Arc<Shared>,
}

/// Consumer half, held by the UI collaborator.
pub struct EventReceiver {
    shared: Arc<Shared>,
}

pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    assert!(capacity > 0, "event channel capacity must be non-zero");
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            queue: VecDeque::with_capacity(capacity),
            dropped: 0,
            last_timestamp: None,
        }),
        notify: Notify::new(),
        capacity,
    });
    (
        EventSender {
            shared: shared.clone(),
        },
        EventReceiver { shared },
    )
}

impl EventSender {
    pub fn send(&self, mut event: Event) {
        let mut inner = self.shared.inner.lock().unwrap();
        // Timestamps are promised non-decreasing to the consumer.
        if let Some(last) = inner.last_timestamp {
            if event.timestamp < last {
                event.timestamp = last;
            }
        }
        inner.last_timestamp = Some(event.timestamp);
        if inner.queue.len() == self.shared.capacity {
            inner.queue.pop_front();
            inner.dropped += 1;
            warn!(dropped = inner.dropped, "event queue full, dropping oldest");
        }
        inner.queue.push_back(event);
        drop(inner);
        self.shared.notify.notify_one();
    }

    /// Total events lost to overflow since startup.
    pub fn dropped(&self) -> u64 {
        self.shared.inner.lock().unwrap().dropped
    }
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Event {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.shared.inner.lock().unwrap().queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.shared.inner.lock().unwrap().dropped
    }
}
