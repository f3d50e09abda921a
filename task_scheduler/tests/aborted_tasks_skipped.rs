#![cfg(feature = "testing")]

use task_scheduler::{AbortController, ManualHost, PostTaskOptions, Scheduler, TaskError};

mod _testutil;
use _testutil::{block_on, Recorder};

/// Five tasks {1,2,3,4,5} are posted; 2 and 4 share one `AbortController`, which is aborted right
/// after all five are posted (while still queued, before anything has run). The dispatcher must
/// silently discard 2 and 4 when it pops them rather than running their callbacks, leaving
/// execution order `"135"`; their futures must independently reject with the abort reason.
#[test]
fn queued_aborted_tasks_are_skipped_not_run() {
    let scheduler = Scheduler::new(ManualHost::new());
    let log = Recorder::new();
    let controller = AbortController::new();

    let _1 = {
        let log = log.clone();
        scheduler.post_task(move || log.push("1"), PostTaskOptions::new())
    };
    let fut_2 = {
        let log = log.clone();
        scheduler.post_task(
            move || log.push("2"),
            PostTaskOptions::new().signal(controller.signal()),
        )
    };
    let _3 = {
        let log = log.clone();
        scheduler.post_task(move || log.push("3"), PostTaskOptions::new())
    };
    let fut_4 = {
        let log = log.clone();
        scheduler.post_task(
            move || log.push("4"),
            PostTaskOptions::new().signal(controller.signal()),
        )
    };
    let _5 = {
        let log = log.clone();
        scheduler.post_task(move || log.push("5"), PostTaskOptions::new())
    };

    controller.abort(None);

    scheduler.drain();
    log.expect(["1", "3", "5"]);

    assert!(matches!(
        block_on(fut_2),
        Err(TaskError::Aborted(_))
    ));
    assert!(matches!(
        block_on(fut_4),
        Err(TaskError::Aborted(_))
    ));
}
