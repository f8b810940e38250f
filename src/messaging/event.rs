use serde::{Deserialize, Serialize};

/// Opaque, totally ordered position in the event stream.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TrackingToken(u64);

impl TrackingToken {
    pub fn new(position: u64) -> Self {
        Self(position)
    }

    /// Global sequence position this token points at.
    pub fn position(self) -> u64 {
        self.0
    }

    /// Whether `other` sits at or before this token.
    pub fn covers(self, other: TrackingToken) -> bool {
        other.0 <= self.0
    }
}

/// Event pulled from the message source together with its stream position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEvent {
    token: TrackingToken,
    event_id: String,
    routing_key: Vec<u8>,
    payload: Vec<u8>,
}

impl TrackedEvent {
    pub fn new(
        token: TrackingToken,
        event_id: impl Into<String>,
        routing_key: impl Into<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            token,
            event_id: event_id.into(),
            routing_key: routing_key.into(),
            payload: payload.into(),
        }
    }

    pub fn token(&self) -> TrackingToken {
        self.token
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Key used to route this event to a segment.
    pub fn routing_key(&self) -> &[u8] {
        &self.routing_key
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
