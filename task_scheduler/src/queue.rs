use std::panic::{self, AssertUnwindSafe};

use futures_channel::oneshot;
use slab::Slab;

use crate::{
    error::{panic_message, TaskError},
    priority::Priority,
    signal::{AbortSignal, ListenerId, SignalArg},
};

/// Index of a [`Task`] inside the scheduler's arena. Stable for as long as the task is alive;
/// never reused while a live reference to it could still exist.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub(crate) struct TaskId(pub(crate) usize);

/// Settles a task's returned future, erasing the user closure's return type.
pub(crate) trait Settle {
    fn run(self: Box<Self>);
    fn reject(self: Box<Self>, reason: TaskError);
}

pub(crate) struct SettleImpl<F, V> {
    pub(crate) callback: F,
    pub(crate) sender: oneshot::Sender<Result<V, TaskError>>,
}

impl<F, V> Settle for SettleImpl<F, V>
where
    F: FnOnce() -> V,
{
    fn run(self: Box<Self>) {
        let Self { callback, sender } = *self;
        let outcome = panic::catch_unwind(AssertUnwindSafe(callback));
        let _ = sender.send(outcome.map_err(|payload| TaskError::Panicked(panic_message(payload))));
    }

    fn reject(self: Box<Self>, reason: TaskError) {
        let _ = self.sender.send(Err(reason));
    }
}

/// A pending delay timer, type-erased so [`Task`] doesn't need to be generic over the host type.
/// Cancelling (explicitly or via drop) tears down the underlying host timer.
pub(crate) struct PendingDelayHandle(Option<Box<dyn FnOnce()>>);

impl PendingDelayHandle {
    pub(crate) fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self(Some(Box::new(cancel)))
    }
}

impl Drop for PendingDelayHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

/// An arena-resident task record. Intrusive `prev`/`next` links place it on at most one
/// [`Queue`] at a time; `host_callback` is `Some` exactly while it is waiting out a delay instead.
pub(crate) struct Task {
    pub(crate) sequence: u64,
    pub(crate) priority: Priority,
    pub(crate) signal: Option<SignalArg>,
    pub(crate) aborted: bool,
    pub(crate) queued: bool,
    pub(crate) abort_listener: Option<(AbortSignal, ListenerId)>,
    pub(crate) host_callback: Option<PendingDelayHandle>,
    pub(crate) callback: Option<Box<dyn Settle>>,
    pub(crate) prev: Option<TaskId>,
    pub(crate) next: Option<TaskId>,
}

/// A per-priority FIFO, implemented as an intrusive doubly-linked list over arena indices.
#[derive(Default)]
pub(crate) struct Queue {
    head: Option<TaskId>,
    tail: Option<TaskId>,
}

impl Queue {
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Appends `id` to the tail. The caller must have already assigned `arena[id].sequence`.
    pub(crate) fn push(&mut self, arena: &mut Slab<Task>, id: TaskId) {
        arena[id.0].prev = self.tail;
        arena[id.0].next = None;
        match self.tail {
            Some(tail) => arena[tail.0].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    pub(crate) fn take_next(&mut self, arena: &mut Slab<Task>) -> Option<TaskId> {
        let id = self.head?;
        self.unlink(arena, id);
        Some(id)
    }

    fn unlink(&mut self, arena: &mut Slab<Task>, id: TaskId) {
        let prev = arena[id.0].prev;
        let next = arena[id.0].next;
        match prev {
            Some(p) => arena[p.0].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => arena[n.0].prev = prev,
            None => self.tail = prev,
        }
        arena[id.0].prev = None;
        arena[id.0].next = None;
    }

    fn insert_before(&mut self, arena: &mut Slab<Task>, id: TaskId, before: Option<TaskId>) {
        match before {
            Some(b) => {
                let prev = arena[b.0].prev;
                arena[id.0].prev = prev;
                arena[id.0].next = Some(b);
                match prev {
                    Some(p) => arena[p.0].next = Some(id),
                    None => self.head = Some(id),
                }
                arena[b.0].prev = Some(id);
            }
            None => {
                arena[id.0].prev = self.tail;
                arena[id.0].next = None;
                match self.tail {
                    Some(t) => arena[t.0].next = Some(id),
                    None => self.head = Some(id),
                }
                self.tail = Some(id);
            }
        }
    }

    /// Moves every task in `source` matching `selector` into `self`, preserving strictly
    /// increasing `sequence` across the merged result. The insertion cursor only ever advances,
    /// so this is a single forward pass over both queues: O(|source| + |self|).
    pub(crate) fn merge(
        &mut self,
        arena: &mut Slab<Task>,
        source: &mut Queue,
        new_priority: Priority,
        selector: impl Fn(&Task) -> bool,
    ) {
        let mut cursor = self.head;
        let mut current = source.head;
        while let Some(id) = current {
            current = arena[id.0].next;
            if !selector(&arena[id.0]) {
                continue;
            }
            source.unlink(arena, id);
            let sequence = arena[id.0].sequence;
            while let Some(c) = cursor {
                if arena[c.0].sequence < sequence {
                    cursor = arena[c.0].next;
                } else {
                    break;
                }
            }
            self.insert_before(arena, id, cursor);
            arena[id.0].priority = new_priority;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(sequence: u64, priority: Priority) -> Task {
        Task {
            sequence,
            priority,
            signal: None,
            aborted: false,
            queued: true,
            abort_listener: None,
            host_callback: None,
            callback: None,
            prev: None,
            next: None,
        }
    }

    fn sequences(arena: &Slab<Task>, queue: &Queue) -> Vec<u64> {
        let mut out = Vec::new();
        let mut current = queue.head;
        while let Some(id) = current {
            out.push(arena[id.0].sequence);
            current = arena[id.0].next;
        }
        out
    }

    #[test]
    fn push_take_next_is_fifo() {
        let mut arena = Slab::new();
        let mut queue = Queue::default();
        let ids: Vec<_> = (0..5)
            .map(|i| TaskId(arena.insert(task(i, Priority::UserVisible))))
            .collect();
        for &id in &ids {
            queue.push(&mut arena, id);
        }
        assert_eq!(sequences(&arena, &queue), vec![0, 1, 2, 3, 4]);
        for i in 0..5 {
            let id = queue.take_next(&mut arena).unwrap();
            assert_eq!(arena[id.0].sequence, i);
        }
        assert!(queue.is_empty());
        assert!(queue.take_next(&mut arena).is_none());
    }

    #[test]
    fn merge_from_empty_source_is_noop() {
        let mut arena = Slab::new();
        let mut receiver = Queue::default();
        let mut source = Queue::default();
        let id = TaskId(arena.insert(task(0, Priority::Background)));
        receiver.push(&mut arena, id);
        receiver.merge(&mut arena, &mut source, Priority::UserVisible, |_| true);
        assert_eq!(sequences(&arena, &receiver), vec![0]);
        assert!(source.is_empty());
    }

    #[test]
    fn merge_interleaves_by_sequence() {
        let mut arena = Slab::new();
        let mut receiver = Queue::default();
        let mut source = Queue::default();

        for seq in [0u64, 2, 4] {
            let id = TaskId(arena.insert(task(seq, Priority::UserVisible)));
            receiver.push(&mut arena, id);
        }
        for seq in [1u64, 3, 5] {
            let id = TaskId(arena.insert(task(seq, Priority::Background)));
            source.push(&mut arena, id);
        }

        receiver.merge(&mut arena, &mut source, Priority::UserVisible, |_| true);

        assert_eq!(sequences(&arena, &receiver), vec![0, 1, 2, 3, 4, 5]);
        assert!(source.is_empty());
    }

    #[test]
    fn merge_leaves_non_matching_tasks_in_source_in_order() {
        let mut arena = Slab::new();
        let mut receiver = Queue::default();
        let mut source = Queue::default();

        let matching_id = TaskId(arena.insert(task(1, Priority::Background)));
        let other_id = TaskId(arena.insert(task(2, Priority::Background)));
        source.push(&mut arena, matching_id);
        source.push(&mut arena, other_id);

        receiver.merge(&mut arena, &mut source, Priority::UserVisible, |t| {
            t.sequence == 1
        });

        assert_eq!(sequences(&arena, &receiver), vec![1]);
        assert_eq!(sequences(&arena, &source), vec![2]);
    }

    /// Regression test: moving a middle element (more than once, via repeated merges) must
    /// leave both queues well-formed, with no stale links surviving a node's removal.
    #[test]
    fn moving_a_middle_element_multiple_times() {
        let mut arena = Slab::new();
        let mut a = Queue::default();
        let mut b = Queue::default();

        let ids: Vec<_> = (0..5)
            .map(|i| TaskId(arena.insert(task(i, Priority::UserVisible))))
            .collect();
        for &id in &ids {
            a.push(&mut arena, id);
        }

        let middle = ids[2];

        // Move the middle element (sequence 2) from a to b, then back, then to b again.
        b.merge(&mut arena, &mut a, Priority::Background, |t| t.sequence == 2);
        assert_eq!(sequences(&arena, &b), vec![2]);
        assert_eq!(sequences(&arena, &a), vec![0, 1, 3, 4]);

        a.merge(&mut arena, &mut b, Priority::UserVisible, |t| t.sequence == 2);
        assert_eq!(sequences(&arena, &a), vec![0, 1, 2, 3, 4]);
        assert!(b.is_empty());

        let mut c = Queue::default();
        c.merge(&mut arena, &mut a, Priority::Background, |t| t.sequence == 2);
        assert_eq!(sequences(&arena, &c), vec![2]);
        assert_eq!(sequences(&arena, &a), vec![0, 1, 3, 4]);
        assert_eq!(arena[middle.0].prev, None);
        assert_eq!(arena[middle.0].next, None);
    }
}
