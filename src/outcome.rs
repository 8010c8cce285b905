//! Request outcome classification.
//!
//! Every accepted request is resolved to exactly one [`Outcome`], delivered
//! through the request's callbacks. `Outcome::None` means the exchange
//! completed with an HTTP status; every other variant names the failure that
//! ended the exchange before a full response was received.

use std::fmt;

/// Terminal classification of a submitted request.
///
/// This is a closed set: callers can match exhaustively and the dispatcher
/// never invents new variants at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The exchange completed; the HTTP status carries the result.
    None,
    /// The per-request deadline expired before the response was complete.
    Timeout,
    /// The TCP connection could not be established or was refused.
    CouldNotConnect,
    /// Name resolution for the origin host failed.
    HostNotFound,
    /// Writing the request failed mid-send.
    SendError,
    /// Reading the response failed mid-receive, including an abrupt close
    /// before any status line arrived.
    RecvError,
    /// A failure that fits no other classification.
    Unknown,
}

impl Outcome {
    /// Returns true for every variant except [`Outcome::None`].
    #[must_use]
    pub fn is_error(self) -> bool {
        self != Self::None
    }

    /// Returns the outcome as a string slice.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Timeout => "timeout",
            Self::CouldNotConnect => "could not connect",
            Self::HostNotFound => "host not found",
            Self::SendError => "send error",
            Self::RecvError => "receive error",
            Self::Unknown => "unknown error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_not_an_error() {
        assert!(!Outcome::None.is_error());
    }

    #[test]
    fn failures_are_errors() {
        for outcome in [
            Outcome::Timeout,
            Outcome::CouldNotConnect,
            Outcome::HostNotFound,
            Outcome::SendError,
            Outcome::RecvError,
            Outcome::Unknown,
        ] {
            assert!(outcome.is_error(), "{outcome} should be an error");
        }
    }

    #[test]
    fn display_matches_as_str() {
        assert_eq!(format!("{}", Outcome::Timeout), "timeout");
        assert_eq!(format!("{}", Outcome::RecvError), "receive error");
    }
}
