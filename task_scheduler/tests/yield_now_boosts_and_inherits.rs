#![cfg(feature = "testing")]

use task_scheduler::{ManualHost, PostTaskOptions, Priority, Scheduler, TaskController, YieldOptions};

mod _testutil;
use _testutil::{assert_pending, assert_ready, Recorder};

/// A default-priority `yield_now` is boosted to `user-blocking`, so it dispatches ahead of an
/// already-queued `background` task even though that task was posted first.
#[test]
fn default_yield_is_boosted_above_background() {
    let scheduler = Scheduler::new(ManualHost::new());
    let log = Recorder::new();

    let _bg = {
        let log = log.clone();
        scheduler.post_task(
            move || log.push("bg"),
            PostTaskOptions::new().priority(Priority::Background),
        )
    };

    let mut yielded = scheduler.yield_now(YieldOptions::new());
    assert_pending(&mut yielded);
    log.expect([] as [&str; 0]);

    // One dispatch tick must run the boosted yield continuation, not the background task.
    assert!(scheduler.run_one());
    assert_ready(&mut yielded).unwrap();
    log.expect([] as [&str; 0]);

    scheduler.drain();
    log.expect(["bg"]);
}

/// A caller-supplied signal that is already aborted short-circuits `yield_now` to an immediate
/// rejection.
#[test]
fn yield_with_already_aborted_signal_rejects_immediately() {
    let scheduler = Scheduler::new(ManualHost::new());
    let controller = TaskController::new(Priority::UserVisible);
    controller.abort(None);

    let mut future = scheduler.yield_now(YieldOptions::new().signal(controller.signal()));
    assert!(assert_ready(&mut future).is_err());
}

/// A `prioritychange` on the caller's `TaskSignal` re-maps the yield continuation's priority
/// through the same boost table, unless the caller pinned an explicit priority.
#[test]
fn yield_inherits_later_prioritychange_unless_pinned() {
    let scheduler = Scheduler::new(ManualHost::new());
    let controller = TaskController::new(Priority::UserVisible);

    let mut inheriting = scheduler.yield_now(YieldOptions::new().signal(controller.signal()));
    let mut pinned = scheduler.yield_now(
        YieldOptions::new()
            .priority(Priority::Background)
            .signal(controller.signal()),
    );

    // Demote the controller to background; the inheriting continuation should follow (boost(
    // Background) == Background), while the pinned one is unaffected (it already was Background).
    controller.set_priority(Priority::Background).unwrap();

    assert_pending(&mut inheriting);
    assert_pending(&mut pinned);

    // Both continuations are now queued at `background`: draining must resolve both.
    scheduler.drain();
    assert_ready(&mut inheriting).unwrap();
    assert_ready(&mut pinned).unwrap();
}
