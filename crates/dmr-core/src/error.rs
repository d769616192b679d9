use std::fmt;

/// Errors raised while building or validating task model values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A parameter builder or task builder was given an invalid combination of
    /// values (duplicate keys, empty resource key components, and so on).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A task state transition was attempted that the state machine does not
    /// permit (e.g. starting a task that was never scheduled).
    #[error("illegal task state transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}

impl Error {
    pub fn invalid_argument(message: impl fmt::Display) -> Self {
        Error::InvalidArgument(message.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
