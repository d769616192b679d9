use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("scheduler misconfigured: {0}")]
    Config(String),

    #[error("scheduler is not in a state that permits this operation: {0}")]
    InvalidState(String),

    #[error("follow-up store error: {0}")]
    Store(String),

    #[error(transparent)]
    Task(#[from] dmr_core::Error),
}

impl Error {
    pub fn config(message: impl fmt::Display) -> Self {
        Error::Config(message.to_string())
    }

    pub fn invalid_state(message: impl fmt::Display) -> Self {
        Error::InvalidState(message.to_string())
    }

    pub fn store(message: impl fmt::Display) -> Self {
        Error::Store(message.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
