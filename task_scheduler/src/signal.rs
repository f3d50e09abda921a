//! Cooperative cancellation ([`AbortController`]/[`AbortSignal`]) and the task-priority
//! extension on top of it ([`TaskController`]/[`TaskSignal`]).
//!
//! Rust has no ambient `AbortController`, so both are implemented here from scratch, in the
//! observer-list idiom the rest of this crate uses for `prioritychange`.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    rc::Rc,
    sync::Arc,
};

use scopeguard::guard;

use crate::{error::SetPriorityError, priority::Priority};

/// An opaque handle to a registered listener, returned by `on_abort`/`on_priority_change`, so
/// it can later be passed to the matching `remove_*` method.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ListenerId(usize);

/// A small observer list. `notify` snapshots its entries out of the `RefCell` before invoking
/// any of them, so a listener is free to add or remove entries on the same list (including
/// itself) without tripping a double-borrow.
pub(crate) struct Listeners<T> {
    next_id: Cell<usize>,
    entries: RefCell<Vec<(ListenerId, Rc<dyn Fn(&T)>)>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            next_id: Cell::new(0),
            entries: RefCell::new(Vec::new()),
        }
    }
}

impl<T> Listeners<T> {
    pub(crate) fn add(&self, listener: Rc<dyn Fn(&T)>) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.entries.borrow_mut().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) {
        self.entries.borrow_mut().retain(|(existing, _)| *existing != id);
    }

    pub(crate) fn notify(&self, value: &T) {
        let snapshot: Vec<_> = self.entries.borrow().iter().map(|(_, f)| Rc::clone(f)).collect();
        for listener in snapshot {
            listener(value);
        }
    }
}

/// The reason an [`AbortSignal`] was tripped. Mirrors `DOMException`'s free-form payload: any
/// value the caller supplied to [`AbortController::abort`], or a default "AbortError" marker.
pub type AbortReason = Arc<dyn Any + Send + Sync>;

pub(crate) fn default_abort_reason() -> AbortReason {
    Arc::new(AbortError)
}

/// The reason reported when [`AbortController::abort`] is called with no explicit payload.
#[derive(Debug, Clone, Copy)]
pub struct AbortError;

impl std::fmt::Display for AbortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("the operation was aborted")
    }
}

impl std::error::Error for AbortError {}

struct AbortInner {
    aborted: Cell<bool>,
    reason: RefCell<Option<AbortReason>>,
    listeners: Listeners<AbortReason>,
}

/// Signals cooperative cancellation to anything holding a cloned [`AbortSignal`].
#[derive(Clone)]
pub struct AbortSignal(Rc<AbortInner>);

impl AbortSignal {
    pub fn aborted(&self) -> bool {
        self.0.aborted.get()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.0.reason.borrow().clone()
    }

    /// Registers `listener` to run once, the moment this signal is aborted. If the signal is
    /// already aborted, runs it immediately instead of registering it, and returns `None` (there
    /// is nothing left to later remove).
    pub fn on_abort(&self, listener: Rc<dyn Fn(&AbortReason)>) -> Option<ListenerId> {
        if let Some(reason) = self.reason() {
            listener(&reason);
            return None;
        }
        Some(self.0.listeners.add(listener))
    }

    /// Deregisters a listener previously returned by [`AbortSignal::on_abort`].
    pub fn remove_listener(&self, id: ListenerId) {
        self.0.listeners.remove(id);
    }

    fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for AbortSignal {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

/// Owns an [`AbortSignal`] and can trip it.
pub struct AbortController {
    inner: Rc<AbortInner>,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(AbortInner {
                aborted: Cell::new(false),
                reason: RefCell::new(None),
                listeners: Listeners::default(),
            }),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal(Rc::clone(&self.inner))
    }

    pub fn abort(&self, reason: Option<AbortReason>) {
        if self.inner.aborted.get() {
            return;
        }
        let reason = reason.unwrap_or_else(default_abort_reason);
        self.inner.aborted.set(true);
        *self.inner.reason.borrow_mut() = Some(Arc::clone(&reason));
        self.inner.listeners.notify(&reason);
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

struct TaskSignalInner {
    abort: AbortSignal,
    priority: Cell<Priority>,
    is_priority_changing: Cell<bool>,
    prioritychange: Listeners<PriorityChangeEvent>,
}

/// An [`AbortSignal`] extended with a live, observable [`Priority`]. Derefs to the plain
/// [`AbortSignal`] it wraps, so `aborted()`/`reason()` and abort-listener registration are
/// inherited rather than re-implemented.
#[derive(Clone)]
pub struct TaskSignal(Rc<TaskSignalInner>);

impl std::ops::Deref for TaskSignal {
    type Target = AbortSignal;

    fn deref(&self) -> &Self::Target {
        &self.0.abort
    }
}

/// Fired on a [`TaskSignal`] after its priority has already changed; carries the value it held
/// just before.
#[derive(Clone, Copy, Debug)]
pub struct PriorityChangeEvent {
    pub previous_priority: Priority,
}

impl TaskSignal {
    pub fn priority(&self) -> Priority {
        self.0.priority.get()
    }

    pub(crate) fn as_abort_signal(&self) -> AbortSignal {
        self.0.abort.clone()
    }

    pub fn on_abort(&self, listener: Rc<dyn Fn(&AbortReason)>) -> Option<ListenerId> {
        self.0.abort.on_abort(listener)
    }

    pub fn remove_abort_listener(&self, id: ListenerId) {
        self.0.abort.remove_listener(id);
    }

    /// Registers `listener` to run on every future `prioritychange` notification.
    pub fn on_priority_change(&self, listener: Rc<dyn Fn(&PriorityChangeEvent)>) -> ListenerId {
        self.0.prioritychange.add(listener)
    }

    /// Deregisters a listener previously returned by [`TaskSignal::on_priority_change`].
    pub fn remove_priority_change_listener(&self, id: ListenerId) {
        self.0.prioritychange.remove(id);
    }

    fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// Downgrades to a weak handle, so the scheduler's signal table does not itself keep a
    /// `TaskSignal` (and everything it transitively reaches) alive.
    pub(crate) fn downgrade(&self) -> WeakTaskSignal {
        WeakTaskSignal(Rc::downgrade(&self.0))
    }
}

impl PartialEq for TaskSignal {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

/// A non-owning handle to a [`TaskSignal`]. `upgrade` returns `None` once every strong
/// [`TaskSignal`] clone has been dropped, which is how the scheduler's signal table notices a
/// stale entry and prunes it instead of pinning the signal's allocation alive forever.
#[derive(Clone)]
pub(crate) struct WeakTaskSignal(std::rc::Weak<TaskSignalInner>);

impl WeakTaskSignal {
    pub(crate) fn upgrade(&self) -> Option<TaskSignal> {
        self.0.upgrade().map(TaskSignal)
    }
}

/// Pointer-identity key for associating scheduler-side bookkeeping with a [`TaskSignal`]
/// without requiring it to be `Hash`/`Eq` (it only needs pointer equality here, not value
/// equality, and it must not pin the signal alive on its own).
pub(crate) fn task_signal_identity(signal: &TaskSignal) -> usize {
    signal.identity()
}

/// Owns a [`TaskSignal`], and can both abort it and retarget its priority.
pub struct TaskController {
    inner: Rc<TaskSignalInner>,
    abort: AbortController,
}

impl TaskController {
    pub fn new(priority: Priority) -> Self {
        let abort = AbortController::new();
        let signal = abort.signal();
        Self {
            inner: Rc::new(TaskSignalInner {
                abort: signal,
                priority: Cell::new(priority),
                is_priority_changing: Cell::new(false),
                prioritychange: Listeners::default(),
            }),
            abort,
        }
    }

    pub fn signal(&self) -> TaskSignal {
        TaskSignal(Rc::clone(&self.inner))
    }

    pub fn abort(&self, reason: Option<AbortReason>) {
        self.abort.abort(reason);
    }

    /// Retargets the signal's priority, firing `prioritychange` unless `priority` is already
    /// current. Rejects with [`SetPriorityError::Recursive`] if called again from inside a
    /// `prioritychange` listener it triggered; the reentrancy flag clears even if a listener
    /// panics, via a scope guard.
    pub fn set_priority(&self, priority: Priority) -> Result<(), SetPriorityError> {
        if self.inner.is_priority_changing.get() {
            return Err(SetPriorityError::Recursive);
        }
        if self.inner.priority.get() == priority {
            return Ok(());
        }

        let previous_priority = self.inner.priority.get();
        self.inner.is_priority_changing.set(true);
        let inner = &self.inner;
        let _guard = guard((), |()| inner.is_priority_changing.set(false));

        self.inner.priority.set(priority);
        self.inner
            .prioritychange
            .notify(&PriorityChangeEvent { previous_priority });

        Ok(())
    }
}

/// What a posted task's options actually carry through to the scheduler: either nothing, an
/// [`AbortSignal`] only, or a full [`TaskSignal`] (abort plus live priority).
#[derive(Clone)]
pub(crate) enum SignalArg {
    Abort(AbortSignal),
    Task(TaskSignal),
}

impl SignalArg {
    pub(crate) fn as_abort_signal(&self) -> AbortSignal {
        match self {
            SignalArg::Abort(signal) => signal.clone(),
            SignalArg::Task(signal) => signal.as_abort_signal(),
        }
    }
}
