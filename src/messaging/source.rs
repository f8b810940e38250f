use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::messaging::event::{TrackedEvent, TrackingToken};

/// Error raised while opening or reading an event stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("event stream is closed")]
    Closed,
    #[error("event stream failed: {reason}")]
    Read { reason: String },
}

/// Durable, totally ordered source of tracked events supporting positional opens.
pub trait StreamableMessageSource: Send + Sync {
    /// Opens a forward-only stream positioned after the given token.
    fn open_stream(&self, at: TrackingToken) -> Result<Box<dyn EventStream>, SourceError>;

    /// Token positioned before the oldest event, used for bootstrap.
    fn create_tail_token(&self) -> TrackingToken;
}

/// Single-consumer view over the source; tokens are non-decreasing across events.
pub trait EventStream: Send {
    /// Next event if one is available, `None` once the stream is drained.
    fn try_next(&mut self) -> Result<Option<TrackedEvent>, SourceError>;
}

/// In-memory source for tests and single-process deployments.
///
/// Published events are assigned dense sequence tokens starting at 1.
#[derive(Clone, Default)]
pub struct InMemoryMessageSource {
    events: Arc<Mutex<Vec<TrackedEvent>>>,
    sequence: Arc<AtomicU64>,
}

impl InMemoryMessageSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event, assigning the next sequence token; returns the stored event.
    pub fn publish(
        &self,
        event_id: impl Into<String>,
        routing_key: impl Into<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
    ) -> TrackedEvent {
        let mut events = self.events.lock().unwrap();
        let token = TrackingToken::new(self.sequence.fetch_add(1, Ordering::AcqRel) + 1);
        let event = TrackedEvent::new(token, event_id, routing_key, payload);
        events.push(event.clone());
        event
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StreamableMessageSource for InMemoryMessageSource {
    fn open_stream(&self, at: TrackingToken) -> Result<Box<dyn EventStream>, SourceError> {
        Ok(Box::new(InMemoryEventStream {
            events: Arc::clone(&self.events),
            last: at,
        }))
    }

    fn create_tail_token(&self) -> TrackingToken {
        TrackingToken::new(0)
    }
}

struct InMemoryEventStream {
    events: Arc<Mutex<Vec<TrackedEvent>>>,
    last: TrackingToken,
}

impl EventStream for InMemoryEventStream {
    fn try_next(&mut self) -> Result<Option<TrackedEvent>, SourceError> {
        let events = self.events.lock().unwrap();
        let next = events
            .iter()
            .find(|event| !self.last.covers(event.token()))
            .cloned();
        if let Some(event) = &next {
            self.last = event.token();
        }
        Ok(next)
    }
}
