use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use eventpool::{Completion, ExecutorError, TaskExecutor};

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

#[test]
fn submitted_tasks_run() {
    let executor = TaskExecutor::new("immediate", 2);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let counter = Arc::clone(&counter);
        executor
            .execute(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            })
            .unwrap();
    }

    wait_for(Duration::from_secs(1), || {
        counter.load(Ordering::Acquire) == 10
    });
    executor.shutdown();
}

#[test]
fn delayed_tasks_run_in_due_order() {
    let executor = TaskExecutor::new("delayed", 1);
    let order = Arc::new(Mutex::new(Vec::new()));

    {
        let order = Arc::clone(&order);
        executor
            .schedule(Duration::from_millis(120), move || {
                order.lock().unwrap().push(2);
            })
            .unwrap();
    }
    {
        let order = Arc::clone(&order);
        executor
            .schedule(Duration::from_millis(20), move || {
                order.lock().unwrap().push(1);
            })
            .unwrap();
    }

    wait_for(Duration::from_secs(1), || order.lock().unwrap().len() == 2);
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    executor.shutdown();
}

#[test]
fn delayed_task_does_not_run_early() {
    let executor = TaskExecutor::new("not_early", 1);
    let ran = Arc::new(AtomicUsize::new(0));

    let task_ran = Arc::clone(&ran);
    executor
        .schedule(Duration::from_millis(150), move || {
            task_ran.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();

    thread::sleep(Duration::from_millis(50));
    assert_eq!(ran.load(Ordering::Acquire), 0);
    wait_for(Duration::from_secs(1), || ran.load(Ordering::Acquire) == 1);
    executor.shutdown();
}

#[test]
fn shutdown_discards_pending_tasks_and_rejects_new_ones() {
    let executor = TaskExecutor::new("draining", 1);
    let ran = Arc::new(AtomicUsize::new(0));

    let task_ran = Arc::clone(&ran);
    executor
        .schedule(Duration::from_millis(200), move || {
            task_ran.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();

    executor.shutdown();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(ran.load(Ordering::Acquire), 0);

    let rejected = executor.execute(|| {});
    assert_eq!(
        rejected,
        Err(ExecutorError::Shutdown {
            name: "draining".to_string()
        })
    );
}

#[test]
fn completion_resolves_once() {
    let completion: Completion<u32> = Completion::new();
    assert!(!completion.is_done());
    assert_eq!(completion.wait_timeout(Duration::from_millis(10)), None);

    assert!(completion.complete(7));
    assert!(!completion.complete(9));

    assert!(completion.is_done());
    assert_eq!(completion.peek(), Some(7));
    assert_eq!(completion.wait(), 7);
}

#[test]
fn completion_clones_share_the_result() {
    let completion: Completion<&'static str> = Completion::new();
    let observer = completion.clone();

    let waiter = thread::spawn(move || observer.wait_timeout(Duration::from_secs(1)));
    thread::sleep(Duration::from_millis(20));
    completion.complete("done");

    assert_eq!(waiter.join().unwrap(), Some("done"));
}
