// Runs alone in its own process so the global fiber counter is quiet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use filament::fiber::{self, Fiber, State};

#[test]
fn reset_reuses_the_stack_and_the_counter_balances() {
    // materialize this thread's bootstrap fiber up front so it does not
    // show up in the deltas below
    Fiber::current();
    let baseline = fiber::count();

    let first = Arc::new(AtomicU64::new(0));
    let second = Arc::new(AtomicU64::new(0));

    let fiber_first = first.clone();
    let fiber = Fiber::with_stack_size(
        move || {
            fiber_first.fetch_add(1, Ordering::SeqCst);
        },
        64 * 1024,
    );
    assert_eq!(fiber::count(), baseline + 1);
    let id = fiber.id();

    fiber.swap_in();
    assert_eq!(fiber.state(), State::Term);
    assert_eq!(first.load(Ordering::SeqCst), 1);

    // same fiber object, same id, new entry closure
    let fiber_second = second.clone();
    fiber.reset(move || {
        fiber_second.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(fiber.state(), State::Init);
    assert_eq!(fiber.id(), id);
    assert_eq!(fiber::count(), baseline + 1);

    fiber.swap_in();
    assert_eq!(fiber.state(), State::Term);
    assert_eq!(second.load(Ordering::SeqCst), 1);

    drop(fiber);
    assert_eq!(fiber::count(), baseline);
}
