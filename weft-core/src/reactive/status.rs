//! Status of an asynchronous derivation.

use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;
use std::rc::Rc;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// Result of an async computed node, tagged by phase.
///
/// `Waiting` and `Error` carry the last successful value so a consumer can
/// keep showing it while a new run is in flight or after one failed.
#[derive(Clone)]
pub enum Status<T> {
    /// No run has started yet.
    Idle,
    /// A run is in flight.
    Waiting { last: Option<T> },
    Success(T),
    Error {
        error: Rc<dyn Error>,
        trace: Rc<Backtrace>,
        last: Option<T>,
    },
}

/// Payload-free discriminant of [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Idle,
    Waiting,
    Success,
    Error,
}

impl<T> Status<T> {
    pub fn kind(&self) -> StatusKind {
        match self {
            Status::Idle => StatusKind::Idle,
            Status::Waiting { .. } => StatusKind::Waiting,
            Status::Success(_) => StatusKind::Success,
            Status::Error { .. } => StatusKind::Error,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Status::Idle)
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, Status::Waiting { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Status::Error { .. })
    }

    /// The value of a `Success`.
    pub fn value(&self) -> Option<&T> {
        match self {
            Status::Success(value) => Some(value),
            Status::Idle | Status::Waiting { .. } | Status::Error { .. } => None,
        }
    }

    /// The current value if successful, otherwise the last good one.
    pub fn latest(&self) -> Option<&T> {
        match self {
            Status::Idle => None,
            Status::Success(value) => Some(value),
            Status::Waiting { last } | Status::Error { last, .. } => last.as_ref(),
        }
    }

    pub fn error(&self) -> Option<&Rc<dyn Error>> {
        match self {
            Status::Error { error, .. } => Some(error),
            Status::Idle | Status::Waiting { .. } | Status::Success(_) => None,
        }
    }

    /// Backtrace taken in the poll where the derivation's future resolved
    /// to the error, so it shows the executor's stack rather than the code
    /// that built the error. Empty unless `RUST_BACKTRACE` or
    /// `RUST_LIB_BACKTRACE` is set.
    pub fn trace(&self) -> Option<&Backtrace> {
        match self {
            Status::Error { trace, .. } => Some(trace),
            Status::Idle | Status::Waiting { .. } | Status::Success(_) => None,
        }
    }

    /// Whether a transition from `self` to `other` is unobservable.
    /// Errors always count as a change.
    pub(crate) fn same_as(&self, other: &Self, equals: &dyn Fn(&T, &T) -> bool) -> bool {
        match (self, other) {
            (Status::Idle, Status::Idle) => true,
            (Status::Waiting { .. }, Status::Waiting { .. }) => true,
            (Status::Success(a), Status::Success(b)) => equals(a, b),
            _ => false,
        }
    }
}

impl<T: Clone> Status<T> {
    pub(crate) fn last_value(&self) -> Option<T> {
        self.latest().cloned()
    }
}

impl<T> Default for Status<T> {
    fn default() -> Self {
        Status::Idle
    }
}

impl<T: fmt::Debug> fmt::Debug for Status<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Idle => f.write_str("Idle"),
            Status::Waiting { last } => f.debug_struct("Waiting").field("last", last).finish(),
            Status::Success(value) => f.debug_tuple("Success").field(value).finish(),
            Status::Error { error, last, .. } => f
                .debug_struct("Error")
                .field("error", &error.to_string())
                .field("last", last)
                .finish(),
        }
    }
}

impl<T: Serialize> Serialize for Status<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Status", 3)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("value", &self.latest())?;
        state.serialize_field("error", &self.error().map(|error| error.to_string()))?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(last: Option<i32>) -> Status<i32> {
        let error: Rc<dyn Error> = Rc::new("x".parse::<i32>().unwrap_err());
        Status::Error {
            error,
            trace: Rc::new(Backtrace::disabled()),
            last,
        }
    }

    #[test]
    fn latest_falls_back_to_last_good_value() {
        assert_eq!(Status::<i32>::Idle.latest(), None);
        assert_eq!(Status::Success(3).latest(), Some(&3));
        assert_eq!(Status::Waiting { last: Some(2) }.latest(), Some(&2));
        assert_eq!(failed(Some(1)).latest(), Some(&1));
        assert_eq!(failed(Some(1)).value(), None);
    }

    #[test]
    fn sameness_rules() {
        let eq = |a: &i32, b: &i32| a == b;
        assert!(Status::Success(1).same_as(&Status::Success(1), &eq));
        assert!(!Status::Success(1).same_as(&Status::Success(2), &eq));
        assert!(Status::Waiting { last: Some(1) }.same_as(&Status::Waiting { last: None }, &eq));
        assert!(!failed(None).same_as(&failed(None), &eq));
        assert!(!Status::Idle.same_as(&Status::Waiting { last: None }, &eq));
    }

    #[test]
    fn serializes_metadata() {
        let json = serde_json::to_value(failed(Some(4))).unwrap();
        assert_eq!(json["kind"], "error");
        assert_eq!(json["value"], 4);
        assert_eq!(json["error"], "invalid digit found in string");

        let json = serde_json::to_value(Status::Success("ok")).unwrap();
        assert_eq!(json["kind"], "success");
        assert!(json["error"].is_null());
    }
}
