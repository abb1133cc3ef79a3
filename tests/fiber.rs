use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;

use filament::fiber::{Fiber, State};
use filament::thread::Thread;

type Events = Arc<Mutex<Vec<String>>>;

fn record(events: &Events, event: &str) {
    events.lock().unwrap().push(event.to_string());
}

// Drives one fiber by hand on the calling thread and returns the observed
// interleaving.
fn drive_one_fiber() -> Vec<String> {
    let events: Events = Arc::new(Mutex::new(Vec::new()));

    let fiber_events = events.clone();
    let fiber = Fiber::new(move || {
        record(&fiber_events, "fiber:begin");
        Fiber::yield_hold();
        record(&fiber_events, "fiber:mid");
        Fiber::yield_hold();
        record(&fiber_events, "fiber:end");
    });

    assert_eq!(fiber.state(), State::Init);
    record(&events, "main:created");

    fiber.swap_in();
    assert_eq!(fiber.state(), State::Hold);
    record(&events, "main:first-return");

    fiber.swap_in();
    assert_eq!(fiber.state(), State::Hold);
    record(&events, "main:second-return");

    fiber.swap_in();
    assert_eq!(fiber.state(), State::Term);
    record(&events, "main:done");

    let events = events.lock().unwrap().clone();
    events
}

#[test]
fn lifecycle_on_one_thread() {
    let events = drive_one_fiber();
    assert_eq!(
        events,
        vec![
            "main:created",
            "fiber:begin",
            "main:first-return",
            "fiber:mid",
            "main:second-return",
            "fiber:end",
            "main:done",
        ]
    );
}

#[test]
fn every_thread_gets_its_own_fiber_stack() {
    let results = Arc::new(Mutex::new(Vec::new()));
    let mut threads = Vec::new();
    for i in 0..3 {
        let results = results.clone();
        let thread = Thread::new(
            move || {
                let events = drive_one_fiber();
                results.lock().unwrap().push(events);
            },
            &format!("fiber_host_{}", i),
        )
        .unwrap();
        threads.push(thread);
    }
    for thread in &mut threads {
        thread.join();
    }

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 3);
    for events in results.iter() {
        assert_eq!(events.len(), 7);
        assert_eq!(events[1], "fiber:begin");
        assert_eq!(events[5], "fiber:end");
    }
}

#[test]
fn yield_ready_marks_the_fiber_runnable() {
    let passes = Arc::new(AtomicU64::new(0));
    let fiber_passes = passes.clone();
    let fiber = Fiber::new(move || {
        fiber_passes.fetch_add(1, Ordering::SeqCst);
        Fiber::yield_ready();
        fiber_passes.fetch_add(1, Ordering::SeqCst);
    });

    fiber.swap_in();
    assert_eq!(fiber.state(), State::Ready);
    assert_eq!(passes.load(Ordering::SeqCst), 1);

    fiber.swap_in();
    assert_eq!(fiber.state(), State::Term);
    assert_eq!(passes.load(Ordering::SeqCst), 2);
}

#[test]
fn fiber_ids_are_unique_and_increasing() {
    let a = Fiber::new(|| {});
    let b = Fiber::new(|| {});
    assert!(a.id() > 0);
    assert!(b.id() > a.id());

    // concurrent construction never reuses an id
    let ids = Arc::new(Mutex::new(Vec::new()));
    let mut threads = Vec::new();
    for _ in 0..2 {
        let ids = ids.clone();
        threads.push(std::thread::spawn(move || {
            let mut local = Vec::new();
            for _ in 0..100 {
                local.push(Fiber::new(|| {}).id());
            }
            ids.lock().unwrap().extend(local);
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }

    let mut ids = ids.lock().unwrap().clone();
    ids.sort_unstable();
    let before = ids.len();
    ids.dedup();
    assert_eq!(ids.len(), before);
}

#[test]
fn panic_is_captured_as_except() {
    let fiber = Fiber::new(|| panic!("deliberate fiber failure"));
    fiber.swap_in();
    assert_eq!(fiber.state(), State::Except);

    // an Except fiber can be re-armed like a Term one
    let recovered = Arc::new(AtomicU64::new(0));
    let fiber_recovered = recovered.clone();
    fiber.reset(move || {
        fiber_recovered.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(fiber.state(), State::Init);
    fiber.swap_in();
    assert_eq!(fiber.state(), State::Term);
    assert_eq!(recovered.load(Ordering::SeqCst), 1);
}

#[test]
fn current_reports_the_running_fiber() {
    assert_eq!(filament::fiber::id(), 0);

    let observed = Arc::new(AtomicU64::new(u64::MAX));
    let fiber_observed = observed.clone();
    let fiber = Fiber::new(move || {
        fiber_observed.store(filament::fiber::id(), Ordering::SeqCst);
    });
    fiber.swap_in();

    assert_eq!(observed.load(Ordering::SeqCst), fiber.id());
    // back on the bootstrap fiber
    assert_eq!(filament::fiber::id(), 0);
    assert_eq!(Fiber::current().id(), 0);
}
