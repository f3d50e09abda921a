use task_scheduler::{installed, yield_now_global};

mod _testutil;
use _testutil::{assert_pending, block_on};

/// `yield_now_global` cannot observe a caller's context at all, so there is nothing to pin or
/// inherit: it always posts at `user-blocking` through the thread-local installed scheduler,
/// installing a fresh one if this thread hadn't used one yet.
#[test]
fn global_yield_installs_and_runs_at_user_blocking() {
    let mut future = yield_now_global();
    assert_pending(&mut future);

    let scheduler = installed().expect("yield_now_global must install the global scheduler");
    scheduler.drain();

    block_on(future).unwrap();
}
