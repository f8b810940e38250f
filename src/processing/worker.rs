use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use tracing::{debug, warn};

use crate::errors::{HandlerError, ProcessingError};
use crate::messaging::event::{TrackedEvent, TrackingToken};
use crate::messaging::segment::Segment;
use crate::processing::status::{StatusUpdater, TrackerStatus};
use crate::runtime::executor::TaskExecutor;
use crate::runtime::sync::Completion;
use crate::storage::store::{TokenStore, TokenStoreError};
use crate::storage::transaction::{in_transaction, TransactionManager, UnitOfWork};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;
pub const DEFAULT_CLAIM_EXTENSION_THRESHOLD: Duration = Duration::from_millis(5000);

/// Decides whether a segment should handle a given event.
pub trait EventValidator: Send + Sync {
    fn should_handle(&self, event: &TrackedEvent, segment: &Segment) -> Result<bool, HandlerError>;
}

/// Invokes the event handlers for a batch inside a unit of work.
///
/// The commit belongs inside the unit of work; a unit still active after a
/// successful return is committed by the calling work package.
pub trait BatchProcessor: Send + Sync {
    fn process_batch(
        &self,
        events: &[TrackedEvent],
        unit_of_work: &mut UnitOfWork,
        segments: &[Segment],
    ) -> Result<(), HandlerError>;
}

/// Tunables for a single work package.
#[derive(Debug, Clone)]
pub struct WorkPackageConfig {
    pub processor_name: String,
    pub segment: Segment,
    pub initial_token: TrackingToken,
    pub claim_extension_threshold: Duration,
    pub batch_size: usize,
    pub inbox_capacity: usize,
}

impl WorkPackageConfig {
    pub fn new(
        processor_name: impl Into<String>,
        segment: Segment,
        initial_token: TrackingToken,
    ) -> Self {
        Self {
            processor_name: processor_name.into(),
            segment,
            initial_token,
            claim_extension_threshold: DEFAULT_CLAIM_EXTENSION_THRESHOLD,
            batch_size: DEFAULT_BATCH_SIZE,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }

    pub fn with_claim_extension_threshold(mut self, threshold: Duration) -> Self {
        self.claim_extension_threshold = threshold;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_inbox_capacity(mut self, inbox_capacity: usize) -> Self {
        self.inbox_capacity = inbox_capacity;
        self
    }
}

struct AbortState {
    cause: Option<Arc<ProcessingError>>,
    completion: Completion<Option<Arc<ProcessingError>>>,
    stop_waiters: Vec<Completion<TrackingToken>>,
    terminated: bool,
}

/// Per-segment worker that ingests events, filters and batches them, commits
/// the batch inside a unit of work, and advances the segment's token.
///
/// The processing routine runs at most once concurrently per package: the
/// `scheduled` flag is claimed before submission to the worker executor and
/// released only when the inbox is drained, so all per-package state mutation
/// is single-threaded from the routine's perspective.
pub struct WorkPackage {
    processor_name: Arc<str>,
    segment: Segment,
    token_store: Arc<dyn TokenStore>,
    transaction_manager: Arc<dyn TransactionManager>,
    executor: TaskExecutor,
    validator: Arc<dyn EventValidator>,
    batch_processor: Arc<dyn BatchProcessor>,
    status_updater: StatusUpdater,
    claim_extension_threshold: Duration,
    batch_size: usize,
    inbox_capacity: usize,
    inbox: SegQueue<TrackedEvent>,
    last_delivered: AtomicU64,
    last_stored: AtomicU64,
    last_store_time: Mutex<Instant>,
    scheduled: AtomicBool,
    abort_flag: AtomicBool,
    abort_state: Mutex<AbortState>,
}

impl WorkPackage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkPackageConfig,
        token_store: Arc<dyn TokenStore>,
        transaction_manager: Arc<dyn TransactionManager>,
        executor: TaskExecutor,
        validator: Arc<dyn EventValidator>,
        batch_processor: Arc<dyn BatchProcessor>,
        status_updater: StatusUpdater,
    ) -> Arc<Self> {
        Arc::new(Self {
            processor_name: Arc::from(config.processor_name),
            segment: config.segment,
            token_store,
            transaction_manager,
            executor,
            validator,
            batch_processor,
            status_updater,
            claim_extension_threshold: config.claim_extension_threshold,
            batch_size: config.batch_size,
            inbox_capacity: config.inbox_capacity,
            inbox: SegQueue::new(),
            last_delivered: AtomicU64::new(config.initial_token.position()),
            last_stored: AtomicU64::new(config.initial_token.position()),
            last_store_time: Mutex::new(Instant::now()),
            scheduled: AtomicBool::new(false),
            abort_flag: AtomicBool::new(false),
            abort_state: Mutex::new(AbortState {
                cause: None,
                completion: Completion::new(),
                stop_waiters: Vec::new(),
                terminated: false,
            }),
        })
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }

    /// Monotonic cursor of the newest event accepted into the inbox.
    pub fn last_delivered_token(&self) -> TrackingToken {
        TrackingToken::new(self.last_delivered.load(Ordering::Acquire))
    }

    /// Newest token persisted to the token store; never ahead of delivery.
    pub fn last_stored_token(&self) -> TrackingToken {
        TrackingToken::new(self.last_stored.load(Ordering::Acquire))
    }

    /// Whether the inbox is below its advisory bound.
    pub fn has_remaining_capacity(&self) -> bool {
        self.inbox.len() < self.inbox_capacity
    }

    pub fn is_abort_triggered(&self) -> bool {
        self.abort_flag.load(Ordering::Acquire)
    }

    /// Enqueues an event for this segment.
    ///
    /// Events whose token is already covered by the delivery cursor are
    /// silently dropped, which makes coordinator replays idempotent. Events
    /// arriving after an abort was triggered are discarded.
    pub fn schedule_event(self: &Arc<Self>, event: TrackedEvent) {
        if self.last_delivered_token().covers(event.token()) {
            return;
        }
        if self.is_abort_triggered() {
            return;
        }
        self.last_delivered
            .store(event.token().position(), Ordering::Release);
        self.inbox.push(event);
        self.schedule_worker();
    }

    /// Ensures a processing pass is pending even without new events, letting
    /// the package consider claim extension or observe a requested abort.
    pub fn schedule_worker(self: &Arc<Self>) {
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.submit();
    }

    /// Requests termination; idempotent.
    ///
    /// Every returned handle resolves with the first recorded cause once the
    /// processing routine observes the abort.
    pub fn abort(
        self: &Arc<Self>,
        cause: Option<ProcessingError>,
    ) -> Completion<Option<Arc<ProcessingError>>> {
        let completion = self.record_abort(cause.map(Arc::new));
        self.schedule_worker();
        completion
    }

    /// Aborts with no cause and resolves with the last stored token after the
    /// final processing pass.
    pub fn stop_package(self: &Arc<Self>) -> Completion<TrackingToken> {
        let waiter = {
            let mut state = self.abort_state.lock().unwrap();
            if state.terminated {
                Completion::completed(self.last_stored_token())
            } else {
                let waiter = Completion::new();
                state.stop_waiters.push(waiter.clone());
                waiter
            }
        };
        self.abort(None);
        waiter
    }

    fn record_abort(
        &self,
        cause: Option<Arc<ProcessingError>>,
    ) -> Completion<Option<Arc<ProcessingError>>> {
        let mut state = self.abort_state.lock().unwrap();
        if !self.abort_flag.swap(true, Ordering::AcqRel) {
            state.cause = cause;
        }
        state.completion.clone()
    }

    fn submit(self: &Arc<Self>) {
        let package = Arc::clone(self);
        if let Err(err) = self.executor.execute(move || package.process_events()) {
            warn!(
                processor = %self.processor_name,
                segment = self.segment.segment_id(),
                error = %err,
                "worker executor rejected processing pass"
            );
            self.scheduled.store(false, Ordering::Release);
        }
    }

    /// One processing pass; runs on the worker executor.
    fn process_events(self: Arc<Self>) {
        if self.is_abort_triggered() {
            self.terminate();
            return;
        }

        let mut batch = Vec::with_capacity(self.batch_size);
        let mut last_consumed = None;
        while batch.len() < self.batch_size {
            let Some(event) = self.inbox.pop() else {
                break;
            };
            last_consumed = Some(event.token());
            match self.validator.should_handle(&event, &self.segment) {
                Ok(true) => batch.push(event),
                // Rejected events still advance the token below.
                Ok(false) => {}
                Err(err) => {
                    self.fail(ProcessingError::Handler(err));
                    return;
                }
            }
        }

        if !batch.is_empty() {
            let mut unit_of_work =
                UnitOfWork::begin(self.transaction_manager.start_transaction());
            match self
                .batch_processor
                .process_batch(&batch, &mut unit_of_work, &[self.segment])
            {
                Ok(()) => unit_of_work.commit(),
                Err(err) => {
                    unit_of_work.rollback();
                    self.fail(ProcessingError::Handler(err));
                    return;
                }
            }
        }

        if let Some(token) = last_consumed {
            if !self.advance_stored_token(token) {
                return;
            }
        } else {
            self.mark_caught_up();
            if !self.extend_claim_if_stale() {
                return;
            }
        }

        self.finish_pass();
    }

    /// Persists `token` when it moves the stored cursor forward.
    ///
    /// Returns false when the pass must not continue because the package
    /// aborted over a lost claim.
    fn advance_stored_token(self: &Arc<Self>, token: TrackingToken) -> bool {
        if self.last_stored_token().covers(token) {
            return true;
        }
        let stored = in_transaction(self.transaction_manager.as_ref(), || {
            self.token_store
                .store_token(token, &self.processor_name, self.segment.segment_id())
        });
        match stored {
            Ok(()) => {
                self.last_stored.store(token.position(), Ordering::Release);
                *self.last_store_time.lock().unwrap() = Instant::now();
                (self.status_updater)(Box::new(move |status| {
                    status.map(|current| current.advanced_to(token))
                }));
                debug!(
                    processor = %self.processor_name,
                    segment = self.segment.segment_id(),
                    position = token.position(),
                    "token stored"
                );
                true
            }
            Err(err @ TokenStoreError::ClaimUnavailable { .. }) => {
                self.fail(ProcessingError::TokenStore(err));
                false
            }
            Err(err) => {
                warn!(
                    processor = %self.processor_name,
                    segment = self.segment.segment_id(),
                    error = %err,
                    "token store rejected update, retrying on the next pass"
                );
                true
            }
        }
    }

    fn mark_caught_up(&self) {
        (self.status_updater)(Box::new(|status| status.map(TrackerStatus::caught_up)));
    }

    /// Renews the claim when no progress was persisted for the threshold.
    ///
    /// Returns false when the pass must not continue because the claim was
    /// already taken over elsewhere.
    fn extend_claim_if_stale(self: &Arc<Self>) -> bool {
        let stale = self.last_store_time.lock().unwrap().elapsed() >= self.claim_extension_threshold;
        if !stale {
            return true;
        }
        let extended = in_transaction(self.transaction_manager.as_ref(), || {
            self.token_store
                .extend_claim(&self.processor_name, self.segment.segment_id())
        });
        match extended {
            Ok(()) => {
                *self.last_store_time.lock().unwrap() = Instant::now();
                debug!(
                    processor = %self.processor_name,
                    segment = self.segment.segment_id(),
                    "claim extended"
                );
                true
            }
            Err(err @ TokenStoreError::ClaimUnavailable { .. }) => {
                self.fail(ProcessingError::TokenStore(err));
                false
            }
            Err(err) => {
                warn!(
                    processor = %self.processor_name,
                    segment = self.segment.segment_id(),
                    error = %err,
                    "claim extension failed, retrying on the next pass"
                );
                true
            }
        }
    }

    /// Records the cause, publishes the error status, and schedules the final
    /// pass that will publish absent and resolve the abort handles.
    fn fail(self: &Arc<Self>, cause: ProcessingError) {
        let cause = Arc::new(cause);
        warn!(
            processor = %self.processor_name,
            segment = self.segment.segment_id(),
            error = %cause,
            "work package failed, aborting"
        );
        let error = Arc::clone(&cause);
        (self.status_updater)(Box::new(move |status| {
            status.map(|current| current.with_error(error))
        }));
        self.record_abort(Some(cause));
        // The scheduled flag is still held by the current pass.
        self.submit();
    }

    fn finish_pass(self: &Arc<Self>) {
        if !self.inbox.is_empty() {
            // Keep the scheduled flag and hand the pass back to the executor.
            self.submit();
            return;
        }
        self.scheduled.store(false, Ordering::Release);
        let work_pending = !self.inbox.is_empty() || self.is_abort_triggered();
        if work_pending
            && self
                .scheduled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.submit();
        }
    }

    fn terminate(&self) {
        let (completion, cause, stop_waiters) = {
            let mut state = self.abort_state.lock().unwrap();
            if state.terminated {
                return;
            }
            state.terminated = true;
            (
                state.completion.clone(),
                state.cause.clone(),
                std::mem::take(&mut state.stop_waiters),
            )
        };
        debug!(
            processor = %self.processor_name,
            segment = self.segment.segment_id(),
            "work package terminated"
        );
        (self.status_updater)(Box::new(|_| None));
        completion.complete(cause);
        let stored = self.last_stored_token();
        for waiter in stop_waiters {
            waiter.complete(stored);
        }
    }
}
