use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::messaging::event::TrackingToken;

/// Default lease duration before an unrefreshed in-memory claim may be taken over.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(5);

/// Error raised by token store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenStoreError {
    #[error("claim on segment {segment_id} of processor {processor} is held elsewhere")]
    ClaimUnavailable { processor: String, segment_id: u32 },
    #[error("processor {processor} has no token for segment {segment_id}")]
    UnknownSegment { processor: String, segment_id: u32 },
    #[error("token store operation failed: {reason}")]
    Store { reason: String },
}

/// Durable per-segment token storage with exclusive claim semantics.
///
/// The claim obtained through [`fetch_token`](TokenStore::fetch_token) is the
/// only cross-process mutual exclusion mechanism: a processor may only advance
/// a segment while it holds the claim, and must refresh it through
/// [`store_token`](TokenStore::store_token) or
/// [`extend_claim`](TokenStore::extend_claim) to keep it.
pub trait TokenStore: Send + Sync {
    /// Atomically bootstraps `segment_count` token rows at positions `0..segment_count`.
    fn initialize_token_segments(
        &self,
        processor: &str,
        segment_count: u32,
        initial_token: TrackingToken,
    ) -> Result<(), TokenStoreError>;

    /// Segment ids known for this processor, in ascending order.
    fn fetch_segments(&self, processor: &str) -> Result<Vec<u32>, TokenStoreError>;

    /// Fetches a segment's token, asserting an exclusive claim on it.
    fn fetch_token(&self, processor: &str, segment_id: u32) -> Result<TrackingToken, TokenStoreError>;

    /// Persists an advanced token; implies claim renewal.
    fn store_token(
        &self,
        token: TrackingToken,
        processor: &str,
        segment_id: u32,
    ) -> Result<(), TokenStoreError>;

    /// Renews the claim without advancing the token.
    fn extend_claim(&self, processor: &str, segment_id: u32) -> Result<(), TokenStoreError>;

    /// Releases the claim so another instance may pick the segment up.
    fn release_claim(&self, processor: &str, segment_id: u32) -> Result<(), TokenStoreError>;

    /// Identifier of the backing storage, when one exists.
    fn retrieve_storage_identifier(&self) -> Result<Option<String>, TokenStoreError>;
}

struct TokenEntry {
    token: TrackingToken,
    claimed_at: Option<Instant>,
}

/// Token store keeping tokens and claims in process memory.
///
/// Claims behave as leases: a claim not refreshed within the configured
/// timeout may be taken over by the next `fetch_token` call.
pub struct InMemoryTokenStore {
    identifier: String,
    claim_timeout: Duration,
    entries: Mutex<HashMap<(String, u32), TokenEntry>>,
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::with_claim_timeout(DEFAULT_CLAIM_TIMEOUT)
    }

    pub fn with_claim_timeout(claim_timeout: Duration) -> Self {
        static INSTANCES: AtomicU64 = AtomicU64::new(0);
        let identifier = format!("in-memory-{}", INSTANCES.fetch_add(1, Ordering::Relaxed));
        Self {
            identifier,
            claim_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn claim_live(&self, entry: &TokenEntry) -> bool {
        entry
            .claimed_at
            .map(|at| at.elapsed() <= self.claim_timeout)
            .unwrap_or(false)
    }
}

impl TokenStore for InMemoryTokenStore {
    fn initialize_token_segments(
        &self,
        processor: &str,
        segment_count: u32,
        initial_token: TrackingToken,
    ) -> Result<(), TokenStoreError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.keys().any(|(name, _)| name == processor) {
            return Err(TokenStoreError::Store {
                reason: format!("segments for processor {processor} are already initialized"),
            });
        }
        for segment_id in 0..segment_count {
            entries.insert(
                (processor.to_string(), segment_id),
                TokenEntry {
                    token: initial_token,
                    claimed_at: None,
                },
            );
        }
        Ok(())
    }

    fn fetch_segments(&self, processor: &str) -> Result<Vec<u32>, TokenStoreError> {
        let entries = self.entries.lock().unwrap();
        let mut segments: Vec<u32> = entries
            .keys()
            .filter(|(name, _)| name == processor)
            .map(|(_, segment_id)| *segment_id)
            .collect();
        segments.sort_unstable();
        Ok(segments)
    }

    fn fetch_token(&self, processor: &str, segment_id: u32) -> Result<TrackingToken, TokenStoreError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&(processor.to_string(), segment_id))
            .ok_or_else(|| TokenStoreError::UnknownSegment {
                processor: processor.to_string(),
                segment_id,
            })?;
        if self.claim_live(entry) {
            return Err(TokenStoreError::ClaimUnavailable {
                processor: processor.to_string(),
                segment_id,
            });
        }
        entry.claimed_at = Some(Instant::now());
        Ok(entry.token)
    }

    fn store_token(
        &self,
        token: TrackingToken,
        processor: &str,
        segment_id: u32,
    ) -> Result<(), TokenStoreError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&(processor.to_string(), segment_id))
            .ok_or_else(|| TokenStoreError::UnknownSegment {
                processor: processor.to_string(),
                segment_id,
            })?;
        entry.token = token;
        entry.claimed_at = Some(Instant::now());
        Ok(())
    }

    fn extend_claim(&self, processor: &str, segment_id: u32) -> Result<(), TokenStoreError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&(processor.to_string(), segment_id))
            .ok_or_else(|| TokenStoreError::UnknownSegment {
                processor: processor.to_string(),
                segment_id,
            })?;
        if !self.claim_live(entry) {
            return Err(TokenStoreError::ClaimUnavailable {
                processor: processor.to_string(),
                segment_id,
            });
        }
        entry.claimed_at = Some(Instant::now());
        Ok(())
    }

    fn release_claim(&self, processor: &str, segment_id: u32) -> Result<(), TokenStoreError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&(processor.to_string(), segment_id))
            .ok_or_else(|| TokenStoreError::UnknownSegment {
                processor: processor.to_string(),
                segment_id,
            })?;
        entry.claimed_at = None;
        Ok(())
    }

    fn retrieve_storage_identifier(&self) -> Result<Option<String>, TokenStoreError> {
        Ok(Some(self.identifier.clone()))
    }
}
