use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::messaging::event::TrackingToken;
use crate::messaging::segment::Segment;
use crate::messaging::source::{EventStream, StreamableMessageSource};
use crate::processing::worker::WorkPackage;
use crate::runtime::executor::TaskExecutor;
use crate::runtime::sync::Completion;
use crate::storage::store::{TokenStore, TokenStoreError};
use crate::storage::transaction::{in_transaction, TransactionManager};

/// Spawns a work package for a newly claimed segment.
pub type WorkPackageFactory = Arc<dyn Fn(Segment, TrackingToken) -> Arc<WorkPackage> + Send + Sync>;

/// Produces the bootstrap token for segment initialization.
pub type InitialTokenFactory =
    Arc<dyn Fn(&dyn StreamableMessageSource) -> TrackingToken + Send + Sync>;

const STATE_INITIAL: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;
const STATE_STOPPED: u8 = 3;

/// Delay before the next pass when the source is drained.
const IDLE_POLL_DELAY: Duration = Duration::from_millis(100);
/// Delay before retrying after a source or claim failure.
const FAILURE_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Consecutive source failures before the coordinator reports an error state.
const SOURCE_FAILURE_THRESHOLD: u32 = 5;
/// Events consumed per pass before yielding the executor.
const READ_BATCH_LIMIT: usize = 1024;
/// Longest wait for a work package to acknowledge its abort.
const ABORT_WAIT: Duration = Duration::from_secs(5);

struct CoordinationState {
    work_packages: HashMap<u32, Arc<WorkPackage>>,
    stream: Option<Box<dyn EventStream>>,
    release_deadlines: HashMap<u32, Instant>,
    claims_changed: bool,
    consecutive_failures: u32,
}

enum ReadOutcome {
    Dispatched,
    Idle,
    NoPackages,
    SourceFailed,
}

/// Owns the event reader loop: claims segments, spawns and retires work
/// packages, and fans events out to them.
///
/// At most one coordination pass is in flight; each pass schedules its
/// successor. The coordinator executor is expected to be single-threaded.
pub struct Coordinator {
    processor_name: Arc<str>,
    message_source: Arc<dyn StreamableMessageSource>,
    token_store: Arc<dyn TokenStore>,
    transaction_manager: Arc<dyn TransactionManager>,
    factory: WorkPackageFactory,
    executor: TaskExecutor,
    initial_segment_count: u32,
    initial_token: InitialTokenFactory,
    run_state: AtomicU8,
    error_flag: AtomicBool,
    pass_gate: AtomicBool,
    state: Mutex<CoordinationState>,
    stop_completion: Completion<()>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        processor_name: impl Into<String>,
        message_source: Arc<dyn StreamableMessageSource>,
        token_store: Arc<dyn TokenStore>,
        transaction_manager: Arc<dyn TransactionManager>,
        factory: WorkPackageFactory,
        executor: TaskExecutor,
        initial_segment_count: u32,
        initial_token: InitialTokenFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            processor_name: Arc::from(processor_name.into()),
            message_source,
            token_store,
            transaction_manager,
            factory,
            executor,
            initial_segment_count,
            initial_token,
            run_state: AtomicU8::new(STATE_INITIAL),
            error_flag: AtomicBool::new(false),
            pass_gate: AtomicBool::new(false),
            state: Mutex::new(CoordinationState {
                work_packages: HashMap::new(),
                stream: None,
                release_deadlines: HashMap::new(),
                claims_changed: false,
                consecutive_failures: 0,
            }),
            stop_completion: Completion::new(),
        })
    }

    /// Starts the reader loop; only the first call has an effect.
    pub fn start(self: &Arc<Self>) {
        if self
            .run_state
            .compare_exchange(STATE_INITIAL, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!(processor = %self.processor_name, "coordinator starting");
        self.schedule_pass(Duration::ZERO);
    }

    pub fn is_running(&self) -> bool {
        self.run_state.load(Ordering::Acquire) == STATE_RUNNING
    }

    pub fn is_error(&self) -> bool {
        self.error_flag.load(Ordering::Acquire)
    }

    /// Initiates orderly shutdown; resolves once every work package aborted
    /// and all claims were released. Repeated calls share the same handle.
    pub fn stop(self: &Arc<Self>) -> Completion<()> {
        if self
            .run_state
            .compare_exchange(STATE_INITIAL, STATE_STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.stop_completion.complete(());
            return self.stop_completion.clone();
        }
        if self
            .run_state
            .compare_exchange(STATE_RUNNING, STATE_STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(processor = %self.processor_name, "coordinator stop requested");
            self.schedule_pass(Duration::ZERO);
        }
        self.stop_completion.clone()
    }

    /// Blocks reclaiming of a segment until the deadline passes; a live work
    /// package for it is aborted without a cause.
    pub fn release_until(self: &Arc<Self>, segment_id: u32, deadline: Instant) {
        {
            let mut state = self.state.lock().unwrap();
            state.release_deadlines.insert(segment_id, deadline);
            if let Some(package) = state.work_packages.get(&segment_id) {
                info!(
                    processor = %self.processor_name,
                    segment = segment_id,
                    "releasing claimed segment until deadline"
                );
                package.abort(None);
            }
        }
        self.schedule_pass(Duration::ZERO);
    }

    fn schedule_pass(self: &Arc<Self>, delay: Duration) {
        if self
            .pass_gate
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let coordinator = Arc::clone(self);
        if self
            .executor
            .schedule(delay, move || coordinator.coordination_pass())
            .is_err()
        {
            self.pass_gate.store(false, Ordering::Release);
        }
    }

    fn coordination_pass(self: &Arc<Self>) {
        self.pass_gate.store(false, Ordering::Release);
        match self.run_state.load(Ordering::Acquire) {
            STATE_RUNNING => {}
            STATE_STOPPING => {
                self.shutdown();
                return;
            }
            _ => return,
        }

        if let Err(err) = self.claim_segments() {
            warn!(
                processor = %self.processor_name,
                error = %err,
                "segment claim pass failed"
            );
            self.schedule_pass(FAILURE_RETRY_DELAY);
            return;
        }

        self.retire_finished();

        match self.read_and_dispatch() {
            ReadOutcome::Dispatched => {
                self.record_success();
                self.schedule_pass(Duration::ZERO);
            }
            ReadOutcome::Idle => {
                self.record_success();
                self.schedule_pass(IDLE_POLL_DELAY);
            }
            ReadOutcome::NoPackages => {
                self.schedule_pass(IDLE_POLL_DELAY);
            }
            ReadOutcome::SourceFailed => {
                self.record_failure();
                self.schedule_pass(FAILURE_RETRY_DELAY);
            }
        }
    }

    /// Claims every unowned segment that is not under a release deadline and
    /// spawns a work package at the claimed token.
    fn claim_segments(self: &Arc<Self>) -> Result<(), TokenStoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.release_deadlines.retain(|_, deadline| *deadline > now);

        let name = &*self.processor_name;
        let mut segment_ids = in_transaction(self.transaction_manager.as_ref(), || {
            self.token_store.fetch_segments(name)
        })?;
        if segment_ids.is_empty() {
            let initial = (self.initial_token)(self.message_source.as_ref());
            info!(
                processor = name,
                segments = self.initial_segment_count,
                "initializing token segments"
            );
            in_transaction(self.transaction_manager.as_ref(), || {
                self.token_store
                    .initialize_token_segments(name, self.initial_segment_count, initial)
            })?;
            segment_ids = in_transaction(self.transaction_manager.as_ref(), || {
                self.token_store.fetch_segments(name)
            })?;
        }

        for &segment_id in &segment_ids {
            if state.work_packages.contains_key(&segment_id)
                || state.release_deadlines.contains_key(&segment_id)
            {
                continue;
            }
            let fetched = in_transaction(self.transaction_manager.as_ref(), || {
                self.token_store.fetch_token(name, segment_id)
            });
            match fetched {
                Ok(token) => {
                    let segment = Segment::compute(segment_id, &segment_ids);
                    info!(
                        processor = name,
                        segment = segment_id,
                        position = token.position(),
                        "claimed segment"
                    );
                    let package = (self.factory)(segment, token);
                    state.work_packages.insert(segment_id, package);
                    state.claims_changed = true;
                }
                Err(TokenStoreError::ClaimUnavailable { .. }) => {
                    debug!(segment = segment_id, "segment claim held elsewhere");
                }
                Err(err) => {
                    warn!(
                        segment = segment_id,
                        error = %err,
                        "failed to fetch token for segment"
                    );
                }
            }
        }
        Ok(())
    }

    /// Removes aborted work packages and releases their claims best-effort.
    fn retire_finished(self: &Arc<Self>) {
        let finished: Vec<(u32, Arc<WorkPackage>)> = {
            let mut state = self.state.lock().unwrap();
            let aborted: Vec<u32> = state
                .work_packages
                .iter()
                .filter(|(_, package)| package.is_abort_triggered())
                .map(|(segment_id, _)| *segment_id)
                .collect();
            if !aborted.is_empty() {
                state.claims_changed = true;
            }
            aborted
                .into_iter()
                .filter_map(|segment_id| {
                    state
                        .work_packages
                        .remove(&segment_id)
                        .map(|package| (segment_id, package))
                })
                .collect()
        };
        for (segment_id, package) in finished {
            let _ = package.abort(None).wait_timeout(ABORT_WAIT);
            self.release_claim(segment_id);
        }
    }

    fn release_claim(&self, segment_id: u32) {
        let released = in_transaction(self.transaction_manager.as_ref(), || {
            self.token_store
                .release_claim(&self.processor_name, segment_id)
        });
        match released {
            Ok(()) => {
                info!(
                    processor = %self.processor_name,
                    segment = segment_id,
                    "released segment claim"
                );
            }
            Err(err) => {
                debug!(
                    segment = segment_id,
                    error = %err,
                    "claim release failed, claim may have expired already"
                );
            }
        }
    }

    /// Opens or reopens the stream when the claim set changed, pulls one
    /// batch, and offers each event to every matching work package.
    fn read_and_dispatch(&self) -> ReadOutcome {
        let mut state = self.state.lock().unwrap();
        if state.work_packages.is_empty() {
            state.stream = None;
            return ReadOutcome::NoPackages;
        }

        if state.stream.is_none() || state.claims_changed {
            let position = state
                .work_packages
                .values()
                .map(|package| package.last_delivered_token())
                .min()
                .unwrap_or_default();
            match self.message_source.open_stream(position) {
                Ok(stream) => {
                    state.stream = Some(stream);
                    state.claims_changed = false;
                    debug!(
                        processor = %self.processor_name,
                        position = position.position(),
                        "opened event stream"
                    );
                }
                Err(err) => {
                    warn!(
                        processor = %self.processor_name,
                        error = %err,
                        "failed to open event stream"
                    );
                    state.stream = None;
                    return ReadOutcome::SourceFailed;
                }
            }
        }

        let CoordinationState {
            work_packages,
            stream,
            ..
        } = &mut *state;
        let Some(open_stream) = stream.as_mut() else {
            return ReadOutcome::NoPackages;
        };

        let mut delivered_any = false;
        let mut received: HashSet<u32> = HashSet::new();
        let mut read = 0usize;
        while read < READ_BATCH_LIMIT {
            if work_packages
                .values()
                .all(|package| !package.has_remaining_capacity())
            {
                debug!(
                    processor = %self.processor_name,
                    "all work packages at capacity, pausing fan-out"
                );
                break;
            }
            match open_stream.try_next() {
                Ok(Some(event)) => {
                    read += 1;
                    for (segment_id, package) in work_packages.iter() {
                        if package.segment().matches(&event)
                            && !package.last_delivered_token().covers(event.token())
                        {
                            package.schedule_event(event.clone());
                            received.insert(*segment_id);
                            delivered_any = true;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        processor = %self.processor_name,
                        error = %err,
                        "event stream read failed"
                    );
                    *stream = None;
                    return ReadOutcome::SourceFailed;
                }
            }
        }

        // Idle packages still get a pass so they can extend their claim.
        for (segment_id, package) in work_packages.iter() {
            if !received.contains(segment_id) {
                package.schedule_worker();
            }
        }

        if delivered_any {
            ReadOutcome::Dispatched
        } else {
            ReadOutcome::Idle
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures = 0;
        self.error_flag.store(false, Ordering::Release);
    }

    fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= SOURCE_FAILURE_THRESHOLD {
            self.error_flag.store(true, Ordering::Release);
            warn!(
                processor = %self.processor_name,
                failures = state.consecutive_failures,
                "sustained source failures, coordinator entering error state"
            );
        }
    }

    /// Closes the stream, aborts every live work package, releases their
    /// claims, and resolves the stop handle.
    fn shutdown(self: &Arc<Self>) {
        info!(processor = %self.processor_name, "coordinator stopping");
        let packages: Vec<(u32, Arc<WorkPackage>)> = {
            let mut state = self.state.lock().unwrap();
            state.stream = None;
            state.work_packages.drain().collect()
        };
        let aborts: Vec<(u32, _)> = packages
            .iter()
            .map(|(segment_id, package)| (*segment_id, package.abort(None)))
            .collect();
        for (segment_id, abort) in aborts {
            let _ = abort.wait_timeout(ABORT_WAIT);
            self.release_claim(segment_id);
        }
        self.run_state.store(STATE_STOPPED, Ordering::Release);
        info!(processor = %self.processor_name, "coordinator stopped");
        self.stop_completion.complete(());
    }
}
