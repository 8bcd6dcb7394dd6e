//! Error handling for the throttling engine.

use std::fmt;
use std::io;

/// Errors that can occur while configuring or running the engine
#[derive(Debug)]
pub enum ThrottlerError {
    /// Configuration validation error, fatal at startup
    Config(String),
    /// I/O error from the server socket
    Io(io::Error),
}

impl fmt::Display for ThrottlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottlerError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ThrottlerError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for ThrottlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ThrottlerError::Io(err) => Some(err),
            ThrottlerError::Config(_) => None,
        }
    }
}

impl From<io::Error> for ThrottlerError {
    fn from(error: io::Error) -> Self {
        ThrottlerError::Io(error)
    }
}
