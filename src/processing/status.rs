use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::errors::ProcessingError;
use crate::messaging::event::TrackingToken;
use crate::messaging::segment::Segment;

/// Observable processing state of one tracked segment.
#[derive(Debug, Clone)]
pub struct TrackerStatus {
    segment: Segment,
    current_token: TrackingToken,
    caught_up: bool,
    replaying: bool,
    error: Option<Arc<ProcessingError>>,
}

impl TrackerStatus {
    pub fn new(segment: Segment, current_token: TrackingToken) -> Self {
        Self {
            segment,
            current_token,
            caught_up: false,
            replaying: false,
            error: None,
        }
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }

    pub fn current_token(&self) -> TrackingToken {
        self.current_token
    }

    pub fn current_position(&self) -> u64 {
        self.current_token.position()
    }

    pub fn is_caught_up(&self) -> bool {
        self.caught_up
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn is_error_state(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&Arc<ProcessingError>> {
        self.error.as_ref()
    }

    /// Status after committing up to `token`; clears the caught-up marker.
    pub fn advanced_to(mut self, token: TrackingToken) -> Self {
        self.current_token = token;
        self.caught_up = false;
        self
    }

    /// Status once every delivered event has been processed.
    pub fn caught_up(mut self) -> Self {
        self.caught_up = true;
        self
    }

    pub fn replaying(mut self) -> Self {
        self.replaying = true;
        self
    }

    /// Status carrying the cause that is about to terminate the segment.
    pub fn with_error(mut self, error: Arc<ProcessingError>) -> Self {
        self.error = Some(error);
        self
    }

    /// Serializable snapshot row for monitors.
    pub fn record(&self) -> SegmentStatusRecord {
        SegmentStatusRecord {
            segment_id: self.segment.segment_id(),
            mask: self.segment.mask(),
            position: self.current_position(),
            caught_up: self.caught_up,
            replaying: self.replaying,
            error: self.error.as_ref().map(|error| error.to_string()),
        }
    }
}

/// One row of the exported processing status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentStatusRecord {
    pub segment_id: u32,
    pub mask: u32,
    pub position: u64,
    pub caught_up: bool,
    pub replaying: bool,
    pub error: Option<String>,
}

/// Update applied atomically to one segment's status entry; returning `None`
/// removes the entry.
pub type StatusUpdate = Box<dyn FnOnce(Option<TrackerStatus>) -> Option<TrackerStatus> + Send>;

/// Callback handed to a work package for publishing status updates.
pub type StatusUpdater = Arc<dyn Fn(StatusUpdate) + Send + Sync>;

/// Registry of per-segment tracker status.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    entries: Arc<Mutex<BTreeMap<u32, TrackerStatus>>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `update` to the entry for `segment_id`; `None` removes it.
    pub fn update(&self, segment_id: u32, update: StatusUpdate) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(status) = update(entries.remove(&segment_id)) {
            entries.insert(segment_id, status);
        }
    }

    pub fn insert_if_absent(&self, segment_id: u32, status: TrackerStatus) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(segment_id).or_insert(status);
    }

    pub fn get(&self, segment_id: u32) -> Option<TrackerStatus> {
        self.entries.lock().unwrap().get(&segment_id).cloned()
    }

    /// Immutable snapshot of every tracked segment.
    pub fn snapshot(&self) -> BTreeMap<u32, TrackerStatus> {
        self.entries.lock().unwrap().clone()
    }

    pub fn records(&self) -> Vec<SegmentStatusRecord> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(TrackerStatus::record)
            .collect()
    }

    /// JSON export of the current status rows.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.records())
    }

    /// Publisher bound to one segment, handed to its work package.
    pub fn updater_for(&self, segment_id: u32) -> StatusUpdater {
        let registry = self.clone();
        Arc::new(move |update| registry.update(segment_id, update))
    }
}
