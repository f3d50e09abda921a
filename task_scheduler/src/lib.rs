//! A prioritized cooperative task scheduler for single-threaded event loops.
//!
//! [`Scheduler::post_task`] queues a callback at one of three [`Priority`] levels, optionally
//! gated by a [`PostTaskSignal`] (cancellation, and for a [`TaskSignal`] a live re-prioritization
//! channel) and an optional minimum delay, and returns a [`PostTaskFuture`] that settles with the
//! callback's return value, an abort reason, or a caught panic.
//!
//! [`Scheduler::yield_now`] (and the free function [`yield_now_global`]) gives a long-running task
//! a cooperative yield point: a future that resolves once the event loop has had a chance to run
//! other, possibly higher-priority, work.
//!
//! Nothing here is preemptive. The scheduler only ever decides *which* queued callback runs next;
//! running it, and returning control afterward, is entirely up to the callback itself and the
//! [`Host`] driving the event loop.

mod error;
mod host;
mod priority;
mod queue;
mod scheduler;
mod signal;
mod yield_now;

pub use error::{SetPriorityError, TaskError, ValidationError};
pub use host::{Host, WallClockHost};
#[cfg(feature = "testing")]
pub use host::ManualHost;
pub use priority::Priority;
pub use scheduler::{PostTaskFuture, PostTaskOptions, PostTaskSignal, Scheduler};
pub use signal::{
    AbortController, AbortError, AbortReason, AbortSignal, ListenerId, PriorityChangeEvent,
    TaskController, TaskSignal,
};
pub use yield_now::{YieldFuture, YieldOptions};

use std::cell::RefCell;

thread_local! {
    static GLOBAL: RefCell<Option<Scheduler<WallClockHost>>> = const { RefCell::new(None) };
}

/// Returns the thread-local installed [`Scheduler`], constructing and installing a fresh
/// [`WallClockHost`]-backed one the first time this is called on the current thread.
///
/// Mirrors a browser polyfill populating `globalThis.scheduler` if absent; a `thread_local!` slot
/// is the direct substitute here, since [`Scheduler`] is `Rc`-based and cannot live in a `static`.
pub fn install() -> Scheduler<WallClockHost> {
    GLOBAL.with(|slot| {
        let mut slot = slot.borrow_mut();
        slot.get_or_insert_with(|| Scheduler::new(WallClockHost::new())).clone()
    })
}

/// Peeks at the thread-local installed [`Scheduler`] without installing one if absent.
pub fn installed() -> Option<Scheduler<WallClockHost>> {
    GLOBAL.with(|slot| slot.borrow().clone())
}

/// "Mode B" of the yield continuation: posts an empty task at [`Priority::UserBlocking`] through
/// the thread-local installed scheduler (installing one if absent).
///
/// Unlike [`Scheduler::yield_now`], this free function cannot observe a caller's signal or
/// priority context, so inheritance is unsupported here by design: callers wanting that must hold
/// their own [`Scheduler`] handle and call [`Scheduler::yield_now`] directly.
pub fn yield_now_global() -> PostTaskFuture<()> {
    install().post_task(
        || (),
        PostTaskOptions::new().priority(Priority::UserBlocking),
    )
}
