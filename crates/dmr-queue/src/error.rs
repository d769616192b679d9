use std::fmt;

/// Errors raised by a [`crate::MessageConsumer`] driver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid queue configuration: {0}")]
    Config(String),

    #[error("queue operation failed: {0}")]
    Transport(String),

    #[error("queue retries exhausted after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },
}

impl Error {
    pub fn config(message: impl fmt::Display) -> Self {
        Error::Config(message.to_string())
    }

    pub fn transport(message: impl fmt::Display) -> Self {
        Error::Transport(message.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
