#![allow(dead_code)]

use std::{
    cell::RefCell,
    fmt::Debug,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
};

pub use futures_lite::future::block_on;

/// Polls `f` exactly once, in place, and panics unless it was already ready. Paired with
/// [`assert_pending`] to pin down exactly when a future settles relative to scheduler dispatch,
/// without needing a real executor to drive it.
#[track_caller]
pub fn assert_ready<F: Future + Unpin>(f: &mut F) -> F::Output {
    match Pin::new(f).poll(&mut Context::from_waker(&noop_waker())) {
        Poll::Ready(value) => value,
        Poll::Pending => panic!("expected the future to be ready, but it was still pending"),
    }
}

#[track_caller]
pub fn assert_pending<F: Future + Unpin>(f: &mut F) {
    match Pin::new(f).poll(&mut Context::from_waker(&noop_waker())) {
        Poll::Ready(_) => panic!("expected the future to still be pending, but it was ready"),
        Poll::Pending => (),
    }
}

fn noop_waker() -> Waker {
    fn raw() -> RawWaker {
        RawWaker::new(std::ptr::null(), &RawWakerVTable::new(|_| raw(), |_| {}, |_| {}, |_| {}))
    }
    unsafe { Waker::from_raw(raw()) }
}

/// A push-and-assert execution-order log, the single-threaded counterpart of the teacher crate's
/// `Validator`. Cheap to `Clone`: every clone shares the same underlying buffer, so it can be
/// moved into as many task closures as a scenario needs.
#[derive(Clone, Default)]
pub struct Recorder(Rc<RefCell<Vec<String>>>);

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, value: impl Into<String>) {
        self.0.borrow_mut().push(value.into());
    }

    #[track_caller]
    pub fn expect<T: Into<String> + Debug>(&self, expected: impl IntoIterator<Item = T>) {
        let actual = self.0.borrow().clone();
        let expected: Vec<String> = expected.into_iter().map(Into::into).collect();
        assert_eq!(actual, expected);
    }
}
