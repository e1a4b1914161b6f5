//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for ordercast.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum OrdercastError {
    /// Generic error carrying a message string.
    Msg(String),

    /// A replicated write was not delivered before the caller's deadline.
    TimedOut(String),

    /// Local storage apply failed permanently. The node must stop taking part
    /// in the ordering protocol once this is returned.
    ApplyFailed(String),

    /// Operation type name not recognized.
    UnknownOps(String),
}

impl OrdercastError {
    pub fn msg(msg: impl ToString) -> Self {
        OrdercastError::Msg(msg.to_string())
    }

    /// Returns true if the node cannot keep running after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrdercastError::ApplyFailed(_))
    }
}

impl fmt::Display for OrdercastError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OrdercastError::Msg(msg) => write!(f, "{}", msg),
            OrdercastError::TimedOut(msg) => write!(f, "timed out: {}", msg),
            OrdercastError::ApplyFailed(msg) => {
                write!(f, "apply failed: {}", msg)
            }
            OrdercastError::UnknownOps(name) => {
                write!(f, "unknown ops type '{}'", name)
            }
        }
    }
}

impl error::Error for OrdercastError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `OrdercastError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for OrdercastError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                OrdercastError::Msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `OrdercastError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for OrdercastError {
            fn from(e: $error) -> OrdercastError {
                OrdercastError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(serde_json::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(ctrlc::Error);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = OrdercastError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
        let e = OrdercastError::UnknownOps("FlyAway".into());
        assert_eq!(format!("{}", e), String::from("unknown ops type 'FlyAway'"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = OrdercastError::from(io_error);
        assert!(matches!(e, OrdercastError::Msg(ref s) if s.contains("oh no!")));
    }

    #[test]
    fn only_apply_failure_is_fatal() {
        assert!(OrdercastError::ApplyFailed("disk".into()).is_fatal());
        assert!(!OrdercastError::TimedOut("req".into()).is_fatal());
        assert!(!OrdercastError::msg("meh").is_fatal());
    }
}
