//! Application error types

use crate::controller::ControllerError;

/// Result type for the duet binary
pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Settings error: {0}")]
    Settings(#[from] duet_core::Error),

    #[error("Network error: {0}")]
    Net(#[from] duet_net::Error),

    #[error("{0}")]
    Controller(#[from] ControllerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No token configured; pass --token or set DUET_TOKEN")]
    MissingToken,
}
