use task_scheduler::{install, installed, PostTaskOptions};

mod _testutil;
use _testutil::block_on;

/// `installed()` reports nothing until `install()` (or anything that calls it, like
/// `yield_now_global`) has run on this thread; afterward it returns a handle to the same
/// dispatcher `install()` returned, sharing state with it.
#[test]
fn install_populates_the_thread_local_singleton_once() {
    assert!(installed().is_none());

    let first = install();
    assert!(installed().is_some());

    let second = install();
    let future = first.post_task(|| 42, PostTaskOptions::new());
    second.drain();
    assert_eq!(block_on(future).unwrap(), 42);
}
