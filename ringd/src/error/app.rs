//! Application-level error types shared across the daemon.
//!
//! Startup and configuration failures end up here. Fatal variants
//! (`Config`, `Fatal`) terminate the process from `main`; the rest are
//! logged at the point of origin and the offending setting is left
//! empty, per the config-error policy.

/// Result alias using the crate's `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug)]
pub enum AppError {
    /// A required configuration property is missing or malformed.
    Config(String),
    /// An I/O failure outside any per-query path (bind, join, install).
    Io(std::io::Error),
    /// A name failed DNS validation.
    BadName(String),
    /// An unrecoverable startup failure.
    Fatal(String),
}

impl AppError {
    pub fn config_error(msg: &str) -> Self {
        AppError::Config(msg.to_string())
    }

    pub fn bad_name(name: &str) -> Self {
        AppError::BadName(name.to_string())
    }

    pub fn fatal(msg: &str) -> Self {
        AppError::Fatal(msg.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "Config Error: {}", msg),
            AppError::Io(err) => write!(f, "I/O Error: {}", err),
            AppError::BadName(name) => write!(f, "Invalid DNS Name: {}", name),
            AppError::Fatal(msg) => write!(f, "Fatal Error: {}", msg),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err)
    }
}

impl From<std::net::AddrParseError> for AppError {
    fn from(err: std::net::AddrParseError) -> Self {
        AppError::Config(err.to_string())
    }
}
