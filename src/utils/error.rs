//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for Squall.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SquallError(pub String);

impl SquallError {
    /// Builds an error from anything printable.
    pub fn msg(what: impl fmt::Display) -> Self {
        SquallError(what.to_string())
    }
}

impl fmt::Display for SquallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for SquallError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `SquallError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for SquallError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                SquallError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(std::sync::mpsc::RecvError);
impl_from_error!(std::sync::mpsc::RecvTimeoutError);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(
    tokio::sync::watch::error::SendError<Option<tokio::time::Instant>>
);

impl<T> From<std::sync::PoisonError<T>> for SquallError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        SquallError(e.to_string())
    }
}

impl<T> From<std::sync::mpsc::SendError<T>> for SquallError {
    fn from(e: std::sync::mpsc::SendError<T>) -> Self {
        SquallError(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SquallError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SquallError(e.to_string())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = SquallError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = SquallError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}
