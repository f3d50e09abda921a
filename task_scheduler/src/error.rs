use std::{
    any::Any,
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
};

/// The reason a [`PostTaskFuture`](crate::scheduler::PostTaskFuture) settled unsuccessfully.
#[derive(Clone)]
pub enum TaskError {
    /// The [`PostTaskOptions`](crate::scheduler::PostTaskOptions) failed a boundary check before
    /// the task was ever queued.
    Validation(ValidationError),
    /// The task's signal was aborted, carrying the signal's abort reason.
    Aborted(Arc<dyn Any + Send + Sync>),
    /// The task's callback panicked; this is its payload, downcast to a message where possible.
    Panicked(String),
}

impl Debug for TaskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "Validation({e:?})"),
            Self::Aborted(_) => write!(f, "Aborted(..)"),
            Self::Panicked(msg) => write!(f, "Panicked({msg:?})"),
        }
    }
}

impl Display for TaskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "task validation failed: {e}"),
            Self::Aborted(reason) => {
                if let Some(msg) = reason.downcast_ref::<String>() {
                    write!(f, "task aborted: {msg}")
                } else if let Some(msg) = reason.downcast_ref::<&str>() {
                    write!(f, "task aborted: {msg}")
                } else {
                    write!(f, "task aborted")
                }
            }
            Self::Panicked(msg) => write!(f, "task panicked: {msg}"),
        }
    }
}

impl std::error::Error for TaskError {}

/// A synchronous validation failure, surfaced at the one remaining boundary this crate exposes:
/// parsing a [`Priority`](crate::priority::Priority) from text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationError {
    /// The given string did not name a known priority.
    UnknownPriority(String),
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPriority(s) => write!(f, "unknown priority: {s:?}"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Returned by [`TaskController::set_priority`](crate::signal::TaskController::set_priority).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetPriorityError {
    /// `set_priority` was called reentrantly from within a `prioritychange` listener.
    Recursive,
}

impl Display for SetPriorityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recursive => write!(
                f,
                "set_priority called reentrantly from a prioritychange listener"
            ),
        }
    }
}

impl std::error::Error for SetPriorityError {}

/// Turns a caught panic payload into a human-readable message, the way `catch_unwind` callers
/// conventionally do when they can't propagate the original `Box<dyn Any>`.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}
