#![cfg(feature = "testing")]

use task_scheduler::{ManualHost, PostTaskOptions, Priority, Scheduler};

mod _testutil;
use _testutil::Recorder;

/// A host with no idle-time primitive must still run `background` tasks, falling back to the
/// immediate-tick mode instead of silently dropping them.
#[test]
fn background_tasks_still_run_without_an_idle_primitive() {
    let scheduler = Scheduler::new(ManualHost::without_idle());
    let log = Recorder::new();

    let _bg = {
        let log = log.clone();
        scheduler.post_task(
            move || log.push("bg"),
            PostTaskOptions::new().priority(Priority::Background),
        )
    };

    // Only the immediate queue exists on this host; `run_ready` alone must be able to drain it.
    let ran = scheduler.host().run_ready();
    assert_eq!(ran, 1);
    log.expect(["bg"]);
}
