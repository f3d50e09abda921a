use std::fmt::{self, Display, Formatter};

use crate::error::ValidationError;

/// One of the three dispatch priorities a task can run at.
///
/// Ordering is derived from declaration order, so `Background < UserVisible < UserBlocking`
/// holds directly without a manual `Ord` impl.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Background,
    #[default]
    UserVisible,
    UserBlocking,
}

impl Priority {
    /// All priorities, highest first. Used by the dispatcher to scan queues in dominance order.
    pub(crate) const ALL: [Priority; 3] = [
        Priority::UserBlocking,
        Priority::UserVisible,
        Priority::Background,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::UserBlocking => "user-blocking",
            Priority::UserVisible => "user-visible",
            Priority::Background => "background",
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boundary conversion for embedders that receive a priority as text (config, FFI, CLI flags)
/// rather than as a typed value.
impl TryFrom<&str> for Priority {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user-blocking" => Ok(Priority::UserBlocking),
            "user-visible" => Ok(Priority::UserVisible),
            "background" => Ok(Priority::Background),
            other => Err(ValidationError::UnknownPriority(other.to_owned())),
        }
    }
}
