use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;

use filament::sync::Semaphore;
use filament::thread::{self, Thread};
use filament::util;

// Every handle reports the tid its thread sees from the inside. The gate
// keeps all threads alive at once so the kernel cannot recycle ids.
#[test]
fn handshake_publishes_matching_tids() {
    const COUNT: usize = 100;

    let gate = Arc::new(Semaphore::new(0));
    let recorded = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..COUNT {
        let gate = gate.clone();
        let recorded = recorded.clone();
        let thread = Thread::new(
            move || {
                recorded.lock().unwrap().push(util::thread_id());
                gate.wait();
            },
            &format!("handshake_{}", i),
        )
        .unwrap();
        handles.push(thread);
    }

    let expected: HashSet<i32> = handles.iter().map(Thread::id).collect();
    assert_eq!(expected.len(), COUNT, "tids are not distinct");

    for _ in 0..COUNT {
        gate.notify();
    }
    for thread in &mut handles {
        thread.join();
    }

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.len(), COUNT);
    let recorded: HashSet<i32> = recorded.iter().copied().collect();
    assert_eq!(recorded, expected);
}

#[test]
fn threads_see_their_published_name() {
    let names = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..4 {
        let names = names.clone();
        let thread = Thread::new(
            move || {
                names.lock().unwrap().push(thread::current_name());
            },
            &format!("named_{}", i),
        )
        .unwrap();
        assert_eq!(thread.name(), &format!("named_{}", i));
        handles.push(thread);
    }
    for thread in &mut handles {
        thread.join();
    }

    let mut names = names.lock().unwrap().clone();
    names.sort();
    assert_eq!(names, vec!["named_0", "named_1", "named_2", "named_3"]);
}

#[test]
fn join_is_idempotent() {
    let mut thread = Thread::new(|| {}, "joiner").unwrap();
    thread.join();
    thread.join();
}

#[test]
fn concurrent_increments_under_a_mutex() {
    let count = Arc::new(Mutex::new(0u64));
    let mut handles = Vec::new();
    for i in 0..4 {
        let count = count.clone();
        let thread = Thread::new(
            move || {
                for _ in 0..25_000 {
                    *count.lock().unwrap() += 1;
                }
            },
            &format!("counter_{}", i),
        )
        .unwrap();
        handles.push(thread);
    }
    for thread in &mut handles {
        thread.join();
    }
    assert_eq!(*count.lock().unwrap(), 100_000);
}

#[test]
fn unjoined_threads_detach() {
    let done = Arc::new(Semaphore::new(0));
    let signal = done.clone();
    let thread = Thread::new(move || signal.notify(), "detached").unwrap();
    drop(thread);
    // the thread keeps running after its handle is gone
    done.wait();
}
