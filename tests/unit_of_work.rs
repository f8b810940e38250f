use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use eventpool::{
    BatchProcessor, EventValidator, HandlerError, InMemoryTokenStore, Segment, StatusUpdater,
    TaskExecutor, TokenStore, TrackedEvent, TrackerStatus, TrackingToken, Transaction,
    TransactionManager, UnitOfWork, UnitOfWorkState, WorkPackage, WorkPackageConfig,
};

fn wait_for<F>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not met within {:?}", timeout);
}

#[derive(Default)]
struct TransactionCounters {
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

struct CountingTransactionManager {
    counters: Arc<TransactionCounters>,
}

struct CountingTransaction {
    counters: Arc<TransactionCounters>,
    settled: bool,
}

impl TransactionManager for CountingTransactionManager {
    fn start_transaction(&self) -> Box<dyn Transaction> {
        Box::new(CountingTransaction {
            counters: Arc::clone(&self.counters),
            settled: false,
        })
    }
}

impl Transaction for CountingTransaction {
    fn commit(&mut self) {
        if !self.settled {
            self.settled = true;
            self.counters.commits.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn rollback(&mut self) {
        if !self.settled {
            self.settled = true;
            self.counters.rollbacks.fetch_add(1, Ordering::AcqRel);
        }
    }
}

struct CountingTransactionProbe;

impl Transaction for CountingTransactionProbe {
    fn commit(&mut self) {}

    fn rollback(&mut self) {}
}

#[test]
fn unit_of_work_commits_only_once() {
    let mut unit = UnitOfWork::begin(Box::new(CountingTransactionProbe));
    assert_eq!(unit.state(), UnitOfWorkState::Active);
    assert!(unit.is_active());

    unit.commit();
    assert_eq!(unit.state(), UnitOfWorkState::Committed);
    assert!(unit.is_committed());

    // Settled units ignore further transitions.
    unit.rollback();
    assert_eq!(unit.state(), UnitOfWorkState::Committed);
}

#[test]
fn unit_of_work_rollback_is_terminal() {
    let mut unit = UnitOfWork::begin(Box::new(CountingTransactionProbe));
    unit.rollback();
    assert_eq!(unit.state(), UnitOfWorkState::RolledBack);

    unit.commit();
    assert_eq!(unit.state(), UnitOfWorkState::RolledBack);
}

struct AcceptAll;

impl EventValidator for AcceptAll {
    fn should_handle(&self, _event: &TrackedEvent, _segment: &Segment) -> Result<bool, HandlerError> {
        Ok(true)
    }
}

struct SelectiveProcessor {
    fail_on: u64,
    processed: Arc<Mutex<Vec<TrackedEvent>>>,
    commits_inside: bool,
}

impl BatchProcessor for SelectiveProcessor {
    fn process_batch(
        &self,
        events: &[TrackedEvent],
        unit_of_work: &mut UnitOfWork,
        _segments: &[Segment],
    ) -> Result<(), HandlerError> {
        if events.iter().any(|event| event.token().position() == self.fail_on) {
            return Err(HandlerError::new("rejected batch"));
        }
        if self.commits_inside {
            unit_of_work.commit();
        }
        self.processed.lock().unwrap().extend(events.iter().cloned());
        Ok(())
    }
}

struct PackageHarness {
    package: Arc<WorkPackage>,
    executor: TaskExecutor,
    counters: Arc<TransactionCounters>,
    processed: Arc<Mutex<Vec<TrackedEvent>>>,
}

fn package_harness(fail_on: u64, commits_inside: bool) -> PackageHarness {
    let counters = Arc::new(TransactionCounters::default());
    let processed = Arc::new(Mutex::new(Vec::new()));
    let token_store = Arc::new(InMemoryTokenStore::new());
    token_store
        .initialize_token_segments("uow-test", 1, TrackingToken::new(0))
        .unwrap();
    token_store.fetch_token("uow-test", 0).unwrap();

    let updater: StatusUpdater = {
        let status = Arc::new(Mutex::new(Some(TrackerStatus::new(
            Segment::ROOT,
            TrackingToken::new(0),
        ))));
        Arc::new(move |update| {
            let mut current = status.lock().unwrap();
            let next = update(current.take());
            *current = next;
        })
    };

    let executor = TaskExecutor::new("uow_worker", 1);
    let package = WorkPackage::new(
        WorkPackageConfig::new("uow-test", Segment::ROOT, TrackingToken::new(0)),
        token_store,
        Arc::new(CountingTransactionManager {
            counters: Arc::clone(&counters),
        }),
        executor.clone(),
        Arc::new(AcceptAll),
        Arc::new(SelectiveProcessor {
            fail_on,
            processed: Arc::clone(&processed),
            commits_inside,
        }),
        updater,
    );

    PackageHarness {
        package,
        executor,
        counters,
        processed,
    }
}

fn event_at(position: u64) -> TrackedEvent {
    TrackedEvent::new(TrackingToken::new(position), format!("event-{position}"), "key", "payload")
}

#[test]
fn successful_batch_commits_its_unit_of_work() {
    let harness = package_harness(u64::MAX, true);

    harness.package.schedule_event(event_at(1));

    wait_for(Duration::from_millis(500), || {
        harness.processed.lock().unwrap().len() == 1
    });
    // One commit for the batch, one for the token store write.
    wait_for(Duration::from_millis(500), || {
        harness.counters.commits.load(Ordering::Acquire) == 2
    });
    assert_eq!(harness.counters.rollbacks.load(Ordering::Acquire), 0);
    harness.executor.shutdown();
}

#[test]
fn uncommitted_unit_of_work_is_committed_by_the_package() {
    let harness = package_harness(u64::MAX, false);

    harness.package.schedule_event(event_at(1));

    wait_for(Duration::from_millis(500), || {
        harness.counters.commits.load(Ordering::Acquire) == 2
    });
    assert_eq!(harness.counters.rollbacks.load(Ordering::Acquire), 0);
    harness.executor.shutdown();
}

#[test]
fn failed_batch_rolls_its_unit_of_work_back() {
    let harness = package_harness(1, true);

    harness.package.schedule_event(event_at(1));

    wait_for(Duration::from_millis(500), || {
        harness.counters.rollbacks.load(Ordering::Acquire) == 1
    });
    assert!(harness.processed.lock().unwrap().is_empty());
    assert!(harness.package.is_abort_triggered());
    harness.executor.shutdown();
}
