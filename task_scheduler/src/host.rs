//! Host integration: how the scheduler gets woken up to run its next task.
//!
//! A [`Host`] owns the actual timing primitive (an event loop, a thread, a virtual clock in
//! tests) and exposes three ways to request a wake-up plus one way to cancel a pending one.

use std::{
    cell::RefCell,
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use event_listener::Event;
use parking_lot::Mutex;

/// A host-specific, `Copy`-able handle to a pending wake request. Only ever produced and
/// consumed by the same [`Host`] implementation.
pub trait HostHandle: Copy + 'static {}
impl<T: Copy + 'static> HostHandle for T {}

/// Delivers wake-ups to the scheduler. Implementations range from a production wall-clock
/// event loop to a deterministic virtual clock used in tests.
pub trait Host: 'static {
    type Handle: HostHandle;

    /// Schedules `wake` to run as soon as the host's event loop is next free. Lower latency
    /// than a zero-length timer where the host can offer it.
    fn schedule_immediate(&self, wake: Box<dyn FnOnce()>) -> Self::Handle;

    /// Schedules `wake` to run when the host is idle. Returns the unconsumed closure if this
    /// host has no idle notion, so the caller can fall back to [`Host::schedule_immediate`].
    fn schedule_idle(&self, wake: Box<dyn FnOnce()>) -> Result<Self::Handle, Box<dyn FnOnce()>>;

    /// Schedules `wake` to run no sooner than `delay` from now.
    fn schedule_timer(&self, delay: Duration, wake: Box<dyn FnOnce()>) -> Self::Handle;

    /// Cancels a previously scheduled wake-up. A no-op if it already ran or was already
    /// cancelled.
    fn cancel(&self, handle: Self::Handle);

    /// Blocks until at least one due wake-up has run, then returns whether anything did.
    /// Returns `false` only when there was nothing left to wait for.
    fn run_one(&self) -> bool;
}

/// Which kind of wake-up a pending [`Host`] callback represents. The dispatcher needs this to
/// decide whether an idle-mode callback must be upgraded to immediate mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum HostMode {
    Idle,
    Immediate,
    Timer,
}

/// A live wake-up request together with the mode it was made in, so it can be cancelled and
/// its mode introspected without the caller needing to remember which `schedule_*` it used.
pub(crate) struct HostCallback<H: Host> {
    mode: HostMode,
    handle: H::Handle,
}

impl<H: Host> HostCallback<H> {
    pub(crate) fn mode(&self) -> HostMode {
        self.mode
    }

    pub(crate) fn cancel(self, host: &H) {
        host.cancel(self.handle);
    }

    pub(crate) fn immediate(host: &H, wake: Box<dyn FnOnce()>) -> Self {
        Self {
            mode: HostMode::Immediate,
            handle: host.schedule_immediate(wake),
        }
    }

    pub(crate) fn idle_or_immediate(host: &H, wake: Box<dyn FnOnce()>) -> Self {
        match host.schedule_idle(wake) {
            Ok(handle) => Self {
                mode: HostMode::Idle,
                handle,
            },
            Err(wake) => Self::immediate(host, wake),
        }
    }

    pub(crate) fn timer(host: &H, delay: Duration, wake: Box<dyn FnOnce()>) -> Self {
        Self {
            mode: HostMode::Timer,
            handle: host.schedule_timer(delay, wake),
        }
    }
}

type Handle = u64;

/// The production host: immediate and idle wake-ups run on thread-local FIFOs drained by
/// [`Host::run_one`]; timers hand a bare, `Copy` handle off to a background thread, which only
/// ever touches a [`parking_lot`]-guarded ready queue and an [`event_listener::Event`]. The
/// actual wake closure stays on this thread in `timer_callbacks`, keyed by handle, so `cancel`
/// can delete the entry before the timer thread's handle is dispatched, turning a late fire
/// into a harmless lookup miss.
pub struct WallClockHost {
    next_handle: AtomicU64,
    immediate: RefCell<VecDeque<(Handle, Box<dyn FnOnce()>)>>,
    idle: RefCell<VecDeque<(Handle, Box<dyn FnOnce()>)>>,
    timer_callbacks: RefCell<std::collections::HashMap<Handle, Box<dyn FnOnce()>>>,
    pending_timers: Arc<AtomicU64>,
    ready: Arc<Mutex<VecDeque<Handle>>>,
    notify: Arc<Event>,
}

impl WallClockHost {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(0),
            immediate: RefCell::new(VecDeque::new()),
            idle: RefCell::new(VecDeque::new()),
            timer_callbacks: RefCell::new(std::collections::HashMap::new()),
            pending_timers: Arc::new(AtomicU64::new(0)),
            ready: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Event::new()),
        }
    }

    fn next_handle(&self) -> Handle {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for WallClockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for WallClockHost {
    type Handle = Handle;

    fn schedule_immediate(&self, wake: Box<dyn FnOnce()>) -> Self::Handle {
        let handle = self.next_handle();
        self.immediate.borrow_mut().push_back((handle, wake));
        self.notify.notify(1);
        handle
    }

    fn schedule_idle(&self, wake: Box<dyn FnOnce()>) -> Result<Self::Handle, Box<dyn FnOnce()>> {
        let handle = self.next_handle();
        self.idle.borrow_mut().push_back((handle, wake));
        self.notify.notify(1);
        Ok(handle)
    }

    fn schedule_timer(&self, delay: Duration, wake: Box<dyn FnOnce()>) -> Self::Handle {
        let handle = self.next_handle();
        self.timer_callbacks.borrow_mut().insert(handle, wake);
        self.pending_timers.fetch_add(1, Ordering::SeqCst);

        let ready = Arc::clone(&self.ready);
        let notify = Arc::clone(&self.notify);
        let pending_timers = Arc::clone(&self.pending_timers);
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            ready.lock().push_back(handle);
            pending_timers.fetch_sub(1, Ordering::SeqCst);
            notify.notify(1);
        });
        handle
    }

    fn cancel(&self, handle: Self::Handle) {
        self.immediate.borrow_mut().retain(|(h, _)| *h != handle);
        self.idle.borrow_mut().retain(|(h, _)| *h != handle);
        // If this was a timer, deleting the entry here is what makes its eventual arrival in
        // `ready` a no-op: the lookup in `run_one` simply misses.
        self.timer_callbacks.borrow_mut().remove(&handle);
    }

    fn run_one(&self) -> bool {
        loop {
            if let Some((_, wake)) = self.immediate.borrow_mut().pop_front() {
                wake();
                return true;
            }
            if let Some(handle) = self.ready.lock().pop_front() {
                if let Some(wake) = self.timer_callbacks.borrow_mut().remove(&handle) {
                    wake();
                    return true;
                }
                continue;
            }
            if let Some((_, wake)) = self.idle.borrow_mut().pop_front() {
                wake();
                return true;
            }
            if self.pending_timers.load(Ordering::SeqCst) == 0 {
                return false;
            }
            // Nothing ready locally, but a timer thread is still sleeping. Wait for its
            // notification before checking the queues again.
            let listener = self.notify.listen();
            if !self.ready.lock().is_empty() {
                continue;
            }
            listener.wait();
        }
    }
}

/// A deterministic test double: nothing runs until the test explicitly steps it, and idle
/// support can be toggled off to exercise the immediate-fallback path.
#[cfg(feature = "testing")]
pub struct ManualHost {
    supports_idle: bool,
    immediate: RefCell<VecDeque<(u64, Box<dyn FnOnce()>)>>,
    idle: RefCell<VecDeque<(u64, Box<dyn FnOnce()>)>>,
    timers: RefCell<Vec<(u64, Duration, Box<dyn FnOnce()>)>>,
    now: std::cell::Cell<Duration>,
    next_handle: std::cell::Cell<u64>,
}

#[cfg(feature = "testing")]
impl ManualHost {
    pub fn new() -> Self {
        Self {
            supports_idle: true,
            immediate: RefCell::new(VecDeque::new()),
            idle: RefCell::new(VecDeque::new()),
            timers: RefCell::new(Vec::new()),
            now: std::cell::Cell::new(Duration::ZERO),
            next_handle: std::cell::Cell::new(0),
        }
    }

    /// Builds a host that reports no idle support, forcing Background-priority dispatch to
    /// fall back to immediate mode.
    pub fn without_idle() -> Self {
        Self {
            supports_idle: false,
            ..Self::new()
        }
    }

    fn next_handle(&self) -> u64 {
        let h = self.next_handle.get();
        self.next_handle.set(h + 1);
        h
    }

    /// Advances the virtual clock, moving any now-due timers into the immediate queue.
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
        let now = self.now.get();
        let mut timers = self.timers.borrow_mut();
        let due: Vec<_> = timers
            .iter()
            .enumerate()
            .filter(|(_, (_, due, _))| *due <= now)
            .map(|(i, _)| i)
            .collect();
        for i in due.into_iter().rev() {
            let (handle, _, wake) = timers.remove(i);
            self.immediate.borrow_mut().push_back((handle, wake));
        }
    }

    /// Runs every immediate- and timer-fired callback currently ready, in FIFO order.
    pub fn run_ready(&self) -> usize {
        let mut count = 0;
        while let Some((_, wake)) = self.immediate.borrow_mut().pop_front() {
            wake();
            count += 1;
        }
        count
    }

    /// Runs every idle callback currently queued.
    pub fn run_idle(&self) -> usize {
        let mut count = 0;
        while let Some((_, wake)) = self.idle.borrow_mut().pop_front() {
            wake();
            count += 1;
        }
        count
    }
}

#[cfg(feature = "testing")]
impl Default for ManualHost {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "testing")]
impl Host for ManualHost {
    type Handle = u64;

    fn schedule_immediate(&self, wake: Box<dyn FnOnce()>) -> Self::Handle {
        let handle = self.next_handle();
        self.immediate.borrow_mut().push_back((handle, wake));
        handle
    }

    fn schedule_idle(&self, wake: Box<dyn FnOnce()>) -> Result<Self::Handle, Box<dyn FnOnce()>> {
        if !self.supports_idle {
            return Err(wake);
        }
        let handle = self.next_handle();
        self.idle.borrow_mut().push_back((handle, wake));
        Ok(handle)
    }

    fn schedule_timer(&self, delay: Duration, wake: Box<dyn FnOnce()>) -> Self::Handle {
        let handle = self.next_handle();
        let due = self.now.get() + delay;
        self.timers.borrow_mut().push((handle, due, wake));
        handle
    }

    fn cancel(&self, handle: Self::Handle) {
        self.immediate.borrow_mut().retain(|(h, _)| *h != handle);
        self.idle.borrow_mut().retain(|(h, _)| *h != handle);
        self.timers.borrow_mut().retain(|(h, _, _)| *h != handle);
    }

    fn run_one(&self) -> bool {
        if let Some((_, wake)) = self.immediate.borrow_mut().pop_front() {
            wake();
            return true;
        }
        if let Some((_, wake)) = self.idle.borrow_mut().pop_front() {
            wake();
            return true;
        }
        false
    }
}
