//! The dispatcher: owns the three priority queues, the task arena, and the single outstanding
//! host wake-up. See [`Scheduler::post_task`] for the entry point most callers want.

use std::{
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
    time::Duration,
};

use futures_channel::oneshot;
use slab::Slab;

use crate::{
    error::TaskError,
    host::{Host, HostCallback, HostMode},
    priority::Priority,
    queue::{PendingDelayHandle, Queue, Settle, SettleImpl, Task, TaskId},
    signal::{AbortReason, ListenerId, SignalArg, TaskSignal},
};

/// Options accepted by [`Scheduler::post_task`]. Construct with [`PostTaskOptions::new`] and
/// adjust fields directly; there is no builder ceremony since every field is already a plain,
/// type-checked value (unlike a duck-typed options bag, Rust's type system does most of the
/// validation [`PostTaskOptions`] would otherwise need to do at a boundary).
#[derive(Default, Clone)]
pub struct PostTaskOptions {
    pub priority: Option<Priority>,
    pub signal: Option<PostTaskSignal>,
    pub delay: Duration,
}

/// The two kinds of cancellation/priority input a posted task can carry.
#[derive(Clone)]
pub enum PostTaskSignal {
    Abort(crate::signal::AbortSignal),
    Task(TaskSignal),
}

impl PostTaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn signal(mut self, signal: impl Into<PostTaskSignal>) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl From<crate::signal::AbortSignal> for PostTaskSignal {
    fn from(signal: crate::signal::AbortSignal) -> Self {
        PostTaskSignal::Abort(signal)
    }
}

impl From<TaskSignal> for PostTaskSignal {
    fn from(signal: TaskSignal) -> Self {
        PostTaskSignal::Task(signal)
    }
}

/// The future returned by [`Scheduler::post_task`], resolving to the callback's return value
/// or a [`TaskError`] if the task was aborted or panicked.
pub struct PostTaskFuture<V> {
    receiver: oneshot::Receiver<Result<V, TaskError>>,
}

impl<V> std::future::Future for PostTaskFuture<V> {
    type Output = Result<V, TaskError>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.get_mut();
        match std::pin::Pin::new(&mut this.receiver).poll(cx) {
            std::task::Poll::Ready(Ok(result)) => std::task::Poll::Ready(result),
            std::task::Poll::Ready(Err(_)) => {
                std::task::Poll::Ready(Err(TaskError::Panicked("task dropped without settling".into())))
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

/// The three priority queues, named rather than array-indexed so two distinct queues can be
/// borrowed mutably at once (needed by [`Queues::pair_mut`], used by priority-change merges).
#[derive(Default)]
pub(crate) struct Queues {
    user_blocking: Queue,
    user_visible: Queue,
    background: Queue,
}

impl Queues {
    pub(crate) fn get(&self, priority: Priority) -> &Queue {
        match priority {
            Priority::UserBlocking => &self.user_blocking,
            Priority::UserVisible => &self.user_visible,
            Priority::Background => &self.background,
        }
    }

    pub(crate) fn get_mut(&mut self, priority: Priority) -> &mut Queue {
        match priority {
            Priority::UserBlocking => &mut self.user_blocking,
            Priority::UserVisible => &mut self.user_visible,
            Priority::Background => &mut self.background,
        }
    }

    pub(crate) fn highest_nonempty(&self) -> Option<Priority> {
        Priority::ALL.into_iter().find(|p| !self.get(*p).is_empty())
    }

    /// Returns disjoint mutable borrows of the queues for `a` and `b`. Panics if `a == b`;
    /// callers only ever reach this for a priority-change merge between two different queues.
    pub(crate) fn pair_mut(&mut self, a: Priority, b: Priority) -> (&mut Queue, &mut Queue) {
        use Priority::*;
        match (a, b) {
            (UserBlocking, UserVisible) => (&mut self.user_blocking, &mut self.user_visible),
            (UserVisible, UserBlocking) => (&mut self.user_visible, &mut self.user_blocking),
            (UserBlocking, Background) => (&mut self.user_blocking, &mut self.background),
            (Background, UserBlocking) => (&mut self.background, &mut self.user_blocking),
            (UserVisible, Background) => (&mut self.user_visible, &mut self.background),
            (Background, UserVisible) => (&mut self.background, &mut self.user_visible),
            _ => panic!("pair_mut called with equal priorities"),
        }
    }
}

struct SignalRecord {
    /// Does not keep the signal's allocation alive; see [`Scheduler::observe_task_signal`].
    weak: crate::signal::WeakTaskSignal,
    recorded_priority: Priority,
    #[allow(dead_code)]
    listener: ListenerId,
}

pub(crate) struct Inner<H: Host> {
    host: Rc<H>,
    arena: Slab<Task>,
    queues: Queues,
    pending_host_callback: Option<HostCallback<H>>,
    sequence: u64,
    signals: HashMap<usize, SignalRecord>,
}

/// The shared, reference-counted state behind every clone of a [`Scheduler`] handle.
pub(crate) struct Shared<H: Host> {
    inner: RefCell<Inner<H>>,
}

/// A cheap-to-clone handle onto one dispatcher instance. Clones share the same queues, arena,
/// and host; dropping the last clone drops everything.
pub struct Scheduler<H: Host> {
    shared: Rc<Shared<H>>,
}

impl<H: Host> Clone for Scheduler<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<H: Host> Scheduler<H> {
    pub fn new(host: H) -> Self {
        Self {
            shared: Rc::new(Shared {
                inner: RefCell::new(Inner {
                    host: Rc::new(host),
                    arena: Slab::new(),
                    queues: Queues::default(),
                    pending_host_callback: None,
                    sequence: 0,
                    signals: HashMap::new(),
                }),
            }),
        }
    }

    /// Returns the host backing this scheduler, mainly so tests can drive a `ManualHost`
    /// directly after constructing the scheduler around it.
    pub fn host(&self) -> Rc<H> {
        Rc::clone(&self.shared.inner.borrow().host)
    }

    fn next_sequence(&self) -> u64 {
        let mut inner = self.shared.inner.borrow_mut();
        let sequence = inner.sequence;
        inner.sequence += 1;
        sequence
    }

    /// Resolves the effective priority for a posted task: an explicit `options.priority` wins;
    /// otherwise a [`TaskSignal`]'s current priority is used and future `prioritychange` events
    /// on it are tracked; otherwise [`Priority::default`].
    fn resolve_priority(&self, options: &PostTaskOptions) -> Priority {
        if let Some(priority) = options.priority {
            return priority;
        }
        if let Some(PostTaskSignal::Task(signal)) = &options.signal {
            return signal.priority();
        }
        Priority::default()
    }

    /// Posts `callback` to run once this priority's turn comes up, returning a future that
    /// resolves to its return value (or rejects on abort/panic).
    pub fn post_task<F, V>(&self, callback: F, options: PostTaskOptions) -> PostTaskFuture<V>
    where
        F: FnOnce() -> V + 'static,
        V: 'static,
    {
        let priority = self.resolve_priority(&options);
        let (sender, receiver) = oneshot::channel();
        let settle: Box<dyn Settle> = Box::new(SettleImpl { callback, sender });

        let signal = options.signal.as_ref().map(|s| match s {
            PostTaskSignal::Abort(signal) => SignalArg::Abort(signal.clone()),
            PostTaskSignal::Task(signal) => {
                self.observe_task_signal(signal);
                SignalArg::Task(signal.clone())
            }
        });

        let already_aborted = signal
            .as_ref()
            .map(|s| s.as_abort_signal().aborted())
            .unwrap_or(false);

        if already_aborted {
            let reason = signal.unwrap().as_abort_signal().reason();
            settle.reject(TaskError::Aborted(reason.unwrap_or_else(crate::signal::default_abort_reason)));
            return PostTaskFuture { receiver };
        }

        let task_id = {
            let mut inner = self.shared.inner.borrow_mut();
            TaskId(inner.arena.insert(Task {
                sequence: 0,
                priority,
                signal: signal.clone(),
                aborted: false,
                queued: false,
                abort_listener: None,
                host_callback: None,
                callback: Some(settle),
                prev: None,
                next: None,
            }))
        };

        if let Some(signal) = &signal {
            self.attach_abort_listener(task_id, signal.as_abort_signal());
        }

        if options.delay.is_zero() {
            self.push_task(task_id, priority);
        } else {
            self.schedule_delay(task_id, options.delay);
        }

        PostTaskFuture { receiver }
    }

    fn attach_abort_listener(&self, task_id: TaskId, abort_signal: crate::signal::AbortSignal) {
        let weak_scheduler = Rc::downgrade(&self.shared);
        let listener_signal = abort_signal.clone();
        let listener_id = abort_signal.on_abort(Rc::new(move |reason: &AbortReason| {
            if let Some(shared) = weak_scheduler.upgrade() {
                Scheduler { shared }.on_task_abort(task_id, reason.clone());
            }
        }));
        if let Some(listener_id) = listener_id {
            let mut inner = self.shared.inner.borrow_mut();
            if let Some(task) = inner.arena.get_mut(task_id.0) {
                task.abort_listener = Some((listener_signal, listener_id));
            }
        }
    }

    fn push_task(&self, task_id: TaskId, priority: Priority) {
        let sequence = self.next_sequence();
        let mut inner = self.shared.inner.borrow_mut();
        inner.arena[task_id.0].sequence = sequence;
        inner.arena[task_id.0].queued = true;
        inner.queues.get_mut(priority).push(&mut inner.arena, task_id);
        drop(inner);
        self.schedule_host_if_needed();
    }

    fn schedule_delay(&self, task_id: TaskId, delay: Duration) {
        let weak_scheduler = Rc::downgrade(&self.shared);
        let host = self.host();
        let wake = Box::new(move || {
            if let Some(shared) = weak_scheduler.upgrade() {
                Scheduler { shared }.on_delay_expired(task_id);
            }
        });
        let callback = HostCallback::timer(&host, delay, wake);
        let cancel_host = Rc::clone(&host);
        let mut inner = self.shared.inner.borrow_mut();
        let handle = PendingDelayHandle::new(move || callback.cancel(&cancel_host));
        inner.arena[task_id.0].host_callback = Some(handle);
    }

    fn on_delay_expired(&self, task_id: TaskId) {
        let priority = {
            let mut inner = self.shared.inner.borrow_mut();
            let Some(task) = inner.arena.get_mut(task_id.0) else {
                return;
            };
            task.host_callback = None;
            task.priority
        };
        self.push_task(task_id, priority);

        // Unconditionally drop and re-derive the pending host callback so a late delayed
        // background task never cuts in front of a higher-priority arrival that showed up
        // while the timer was still counting down.
        let stale = {
            let mut inner = self.shared.inner.borrow_mut();
            inner.pending_host_callback.take()
        };
        if let Some(callback) = stale {
            callback.cancel(&self.host());
        }
        self.schedule_host_if_needed();
    }

    fn on_task_abort(&self, task_id: TaskId, reason: AbortReason) {
        let (settle, abort_listener, was_queued, priority) = {
            let mut inner = self.shared.inner.borrow_mut();
            let Some(task) = inner.arena.get_mut(task_id.0) else {
                return;
            };
            if task.aborted {
                return;
            }
            task.aborted = true;
            task.host_callback = None;
            let abort_listener = task.abort_listener.take();
            let settle = task.callback.take();
            (settle, abort_listener, task.queued, task.priority)
        };

        if let Some((signal, listener_id)) = abort_listener {
            signal.remove_listener(listener_id);
        }

        if let Some(settle) = settle {
            settle.reject(TaskError::Aborted(reason));
        }

        if !was_queued {
            // Never made it onto a queue (still delayed, or was already rejected up front):
            // the arena slot can be reclaimed immediately.
            let mut inner = self.shared.inner.borrow_mut();
            inner.arena.remove(task_id.0);
        } else {
            // Already linked into `queues[priority]`: leave it linked. `run_next_task` will
            // pop it, notice `aborted`, and discard it in O(1) rather than unlinking it here
            // in O(n).
            let _ = priority;
        }
    }

    /// Subscribes to a [`TaskSignal`]'s `prioritychange` the first time it's seen by this
    /// scheduler, and records its current priority for later lookups.
    ///
    /// `signals` is keyed by address for fast lookup, but an address alone can't tell a live
    /// signal from a freed one whose allocation got reused: each entry also carries a
    /// [`WeakTaskSignal`](crate::signal::WeakTaskSignal), and a hit only counts as "already
    /// observed" if that weak handle still upgrades. A stale entry (upgrade failed — the
    /// original signal was dropped) is pruned here before treating this address as unseen, so a
    /// new signal that happens to reuse a freed allocation's address is always subscribed fresh
    /// rather than silently merged with the dead entry's stale `recorded_priority`.
    fn observe_task_signal(&self, signal: &TaskSignal) {
        let key = crate::signal::task_signal_identity(signal);

        {
            let mut inner = self.shared.inner.borrow_mut();
            match inner.signals.get(&key) {
                Some(record) if record.weak.upgrade().is_some() => return,
                Some(_) => {
                    inner.signals.remove(&key);
                }
                None => {}
            }
        }

        let weak_scheduler = Rc::downgrade(&self.shared);
        let target = signal.clone();
        let listener_id = signal.on_priority_change(Rc::new(move |_event| {
            if let Some(shared) = weak_scheduler.upgrade() {
                Scheduler { shared }.on_signal_priority_change(&target);
            }
        }));

        let mut inner = self.shared.inner.borrow_mut();
        inner.signals.insert(
            key,
            SignalRecord {
                weak: signal.downgrade(),
                recorded_priority: signal.priority(),
                listener: listener_id,
            },
        );
    }

    fn on_signal_priority_change(&self, signal: &TaskSignal) {
        let key = crate::signal::task_signal_identity(signal);
        let new_priority = signal.priority();

        let old_priority = {
            let mut inner = self.shared.inner.borrow_mut();
            let Some(record) = inner.signals.get_mut(&key) else {
                return;
            };
            // Guard against an address-reuse false positive: only trust this record if its
            // weak handle still resolves to a live signal (it does here — `signal` itself is a
            // live strong reference to it right now — but this keeps the check colocated with
            // the invariant rather than assumed silently).
            if record.weak.upgrade().is_none() {
                inner.signals.remove(&key);
                return;
            }
            let old = record.recorded_priority;
            if old == new_priority {
                // TaskController::set_priority already no-ops on an unchanged value; this is
                // a defensive re-check in case the event still fired some other way.
                return;
            }
            record.recorded_priority = new_priority;
            old
        };

        {
            // Only tasks already linked onto `queues[old_priority]` move; a task still waiting
            // out a delay keeps the priority it was originally resolved at; see
            // `on_delay_expired`.
            let mut inner = self.shared.inner.borrow_mut();
            let (from, to) = inner.queues.pair_mut(old_priority, new_priority);
            let arena = &mut inner.arena;
            to.merge(arena, from, new_priority, |task| {
                matches!(&task.signal, Some(SignalArg::Task(task_signal)) if task_signal == signal)
            });
        }

        self.schedule_host_if_needed();
    }

    /// Ensures exactly one host wake-up is pending for the currently highest non-empty queue,
    /// upgrading a pending idle-mode callback to immediate mode if a non-background task has
    /// since arrived.
    fn schedule_host_if_needed(&self) {
        let mut inner = self.shared.inner.borrow_mut();
        let Some(priority) = inner.queues.highest_nonempty() else {
            return;
        };

        if let Some(pending) = &inner.pending_host_callback {
            if pending.mode() == HostMode::Idle && priority != Priority::Background {
                let callback = inner.pending_host_callback.take().unwrap();
                let host = Rc::clone(&inner.host);
                drop(inner);
                callback.cancel(&host);
                inner = self.shared.inner.borrow_mut();
            } else {
                return;
            }
        }

        let host = Rc::clone(&inner.host);
        let weak_scheduler = Rc::downgrade(&self.shared);
        let wake = Box::new(move || {
            if let Some(shared) = weak_scheduler.upgrade() {
                Scheduler { shared }.on_scheduler_entry();
            }
        });

        let callback = if priority == Priority::Background {
            HostCallback::idle_or_immediate(&host, wake)
        } else {
            HostCallback::immediate(&host, wake)
        };
        inner.pending_host_callback = Some(callback);
    }

    /// The host wake-up entry point: clears the pending callback marker, runs exactly one
    /// non-aborted task (skipping and discarding any aborted ones popped along the way), then
    /// re-derives whether another host wake-up is still needed.
    fn on_scheduler_entry(&self) {
        self.shared.inner.borrow_mut().pending_host_callback = None;
        self.run_next_task();
        self.schedule_host_if_needed();
    }

    fn run_next_task(&self) {
        loop {
            let (task_id, priority) = {
                let mut inner = self.shared.inner.borrow_mut();
                let Some(priority) = inner.queues.highest_nonempty() else {
                    return;
                };
                let arena = &mut inner.arena;
                let queue = inner.queues.get_mut(priority);
                let Some(task_id) = queue.take_next(arena) else {
                    continue;
                };
                (task_id, priority)
            };
            let _ = priority;

            let (aborted, settle, abort_listener) = {
                let mut inner = self.shared.inner.borrow_mut();
                let task = &mut inner.arena[task_id.0];
                let aborted = task.aborted;
                let settle = task.callback.take();
                let abort_listener = task.abort_listener.take();
                inner.arena.remove(task_id.0);
                (aborted, settle, abort_listener)
            };

            if let Some((signal, listener_id)) = abort_listener {
                signal.remove_listener(listener_id);
            }

            if aborted {
                // Already rejected by `on_task_abort`; discard silently and keep looking.
                continue;
            }

            if let Some(settle) = settle {
                settle.run();
            }
            return;
        }
    }

    /// Runs host callbacks until at least one task has executed, or there is nothing left to
    /// wait for. Returns whether anything ran.
    pub fn run_one(&self) -> bool {
        let host = self.host();
        host.run_one()
    }

    /// Runs host callbacks until both queues are drained and no delayed task remains pending.
    pub fn drain(&self) {
        loop {
            let idle = {
                let inner = self.shared.inner.borrow();
                inner.queues.highest_nonempty().is_none() && inner.pending_host_callback.is_none()
            };
            if idle {
                return;
            }
            if !self.run_one() {
                return;
            }
        }
    }

    /// Blocks the calling thread, running host callbacks forever. Intended for an embedder whose
    /// entire purpose on this thread is driving the scheduler (e.g. a dedicated worker thread);
    /// returns only once [`Host::run_one`] reports nothing left to wait for.
    pub fn run_forever(&self) {
        while self.run_one() {}
    }
}
