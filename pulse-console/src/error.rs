//! Error types for the console.

use crate::config::ConfigError;
use pulse_core::PulseError;

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid request header: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
    #[error(transparent)]
    Pulse(#[from] PulseError),
    #[error("Failed to initialise logging: {0}")]
    Logging(String),
}

pub type ConsoleResult<T> = Result<T, ConsoleError>;
