use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// jotdb errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// No value exists for the requested primary key.
    NotFound,
    /// Invalid user input: a missing or empty attribute name, a payload the
    /// configured attribute cannot be extracted from, or unparseable bounds.
    InvalidArgument(String),
    /// Invalid on-disk data: a checksum mismatch or a structurally broken
    /// block or checkpoint.
    Corruption(String),
    /// An IO error.
    Io(String),
    /// A write was attempted on a frozen write buffer or a finished table.
    ReadOnly,
    /// The caller's cancellation signal was observed at a source boundary.
    Cancelled,
    /// The interval tree was mutated while a top-K iterator was live. The
    /// query must be retried.
    QueryInterrupted,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::Cancelled => write!(f, "query cancelled"),
            Error::QueryInterrupted => {
                write!(f, "interval tree mutated during iteration, retry query")
            }
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidArgument for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)).into() };
}

/// A jotdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
