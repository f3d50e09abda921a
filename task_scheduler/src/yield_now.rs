//! `yield_now`: give the host a chance to run other pending work before resuming.
//!
//! Mode A ([`Scheduler::yield_now`]) posts the continuation through a specific scheduler
//! instance and can inherit a caller's [`TaskSignal`]. Mode B ([`crate::yield_now_global`])
//! goes through the thread-local installed scheduler and is deliberately simpler: no signal,
//! no priority inheritance, always `user-blocking`.

use std::{cell::Cell, future::Future, pin::Pin, rc::Rc, task::{Context, Poll}};

use pin_project::{pin_project, pinned_drop};

use crate::{
    error::TaskError,
    host::Host,
    priority::Priority,
    scheduler::{PostTaskFuture, PostTaskOptions, Scheduler},
    signal::{ListenerId, PriorityChangeEvent, TaskController, TaskSignal},
};

/// Maps a caller's priority onto the priority its continuation should run at. Chosen so a
/// `user-visible` continuation is promoted (it already held the event loop's attention and
/// yielding shouldn't demote it below tasks that arrived while it ran), while `user-blocking`
/// and `background` continuations keep their caller's priority.
fn boost(priority: Priority) -> Priority {
    match priority {
        Priority::UserVisible => Priority::UserBlocking,
        other => other,
    }
}

/// Options for [`Scheduler::yield_now`]. Mirrors [`crate::scheduler::PostTaskOptions`]'s
/// signal/priority fields, minus `delay` (a yield always runs as soon as its turn comes).
#[derive(Default, Clone)]
pub struct YieldOptions {
    pub priority: Option<Priority>,
    pub signal: Option<TaskSignal>,
}

impl YieldOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn signal(mut self, signal: TaskSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Future returned by [`Scheduler::yield_now`]. While pending it keeps an internal
/// [`TaskController`] and, if a caller signal was supplied, a pair of listeners on it; both are
/// always detached on drop, whether the yield resolved, was aborted, or was simply dropped
/// early.
#[pin_project(PinnedDrop)]
pub struct YieldFuture {
    #[pin]
    inner: PostTaskFuture<()>,
    controller: Rc<TaskController>,
    caller_listeners: Option<CallerListeners>,
}

struct CallerListeners {
    signal: TaskSignal,
    abort_listener: Option<ListenerId>,
    priority_listener: Option<ListenerId>,
}

impl Future for YieldFuture {
    type Output = Result<(), TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.inner.poll(cx)
    }
}

#[pinned_drop]
impl PinnedDrop for YieldFuture {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if let Some(listeners) = this.caller_listeners.take() {
            if let Some(abort_listener) = listeners.abort_listener {
                listeners.signal.remove_abort_listener(abort_listener);
            }
            if let Some(priority_listener) = listeners.priority_listener {
                listeners.signal.remove_priority_change_listener(priority_listener);
            }
        }
    }
}

impl<H: Host> Scheduler<H> {
    /// Posts an empty, boosted-priority continuation of the caller's own work. If `options`
    /// carries a [`TaskSignal`], this inherits both its current abort state and any future
    /// `prioritychange`s (re-mapped through [`boost`]), unless `options.priority` pins an
    /// explicit value.
    pub fn yield_now(&self, options: YieldOptions) -> YieldFuture {
        let explicit_priority = options.priority;
        let caller_signal = options.signal.clone();

        let starting_priority = explicit_priority
            .or_else(|| caller_signal.as_ref().map(TaskSignal::priority))
            .unwrap_or_default();
        let controller = Rc::new(TaskController::new(boost(starting_priority)));

        let task_signal = controller.signal();
        let post_options = PostTaskOptions::new()
            .priority(task_signal.priority())
            .signal(task_signal);
        let inner = self.post_task(|| (), post_options);

        let caller_listeners = caller_signal.map(|signal| {
            // `on_abort` fires immediately (and returns `None`) if `signal` is already
            // aborted, which still reaches `controller.abort` below — no separate
            // already-aborted check needed.
            let abort_listener = {
                let controller = Rc::clone(&controller);
                signal.on_abort(Rc::new(move |reason| controller.abort(Some(reason.clone()))))
            };

            let priority_listener = if explicit_priority.is_none() {
                let controller = Rc::clone(&controller);
                let observed_signal = signal.clone();
                let pinned = Cell::new(false);
                Some(signal.on_priority_change(Rc::new(move |_event: &PriorityChangeEvent| {
                    if pinned.get() {
                        return;
                    }
                    let new_priority = boost(observed_signal.priority());
                    if controller.set_priority(new_priority).is_err() {
                        pinned.set(true);
                    }
                })))
            } else {
                None
            };

            CallerListeners {
                signal,
                abort_listener,
                priority_listener,
            }
        });

        YieldFuture {
            inner,
            controller,
            caller_listeners,
        }
    }
}
