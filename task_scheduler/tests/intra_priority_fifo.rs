#![cfg(feature = "testing")]

use task_scheduler::{ManualHost, PostTaskOptions, Priority, Scheduler};

mod _testutil;
use _testutil::Recorder;

/// Nine tasks posted round-robin across the three priorities in the order
/// `ub1, ub2, ub3, uv1, uv2, uv3, bg1, bg2, bg3` (labelled `7,8,9,4,5,6,1,2,3` respectively) must
/// execute in ascending label order, i.e. strictly by priority dominance and then posting order
/// within a priority.
#[test]
fn fifo_within_each_priority() {
    let scheduler = Scheduler::new(ManualHost::new());
    let log = Recorder::new();

    let postings: [(&str, Priority); 9] = [
        ("7", Priority::UserBlocking),
        ("8", Priority::UserBlocking),
        ("9", Priority::UserBlocking),
        ("4", Priority::UserVisible),
        ("5", Priority::UserVisible),
        ("6", Priority::UserVisible),
        ("1", Priority::Background),
        ("2", Priority::Background),
        ("3", Priority::Background),
    ];

    for (label, priority) in postings {
        let log = log.clone();
        let _ = scheduler.post_task(
            move || log.push(label),
            PostTaskOptions::new().priority(priority),
        );
    }

    scheduler.drain();
    log.expect(["1", "2", "3", "4", "5", "6", "7", "8", "9"]);
}
