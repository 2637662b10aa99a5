// SPDX-License-Identifier: GPL-3.0-only
//! Error types for the application
//!
//! Creation and activation failures are surfaced to the caller. Stop and
//! teardown failures never appear here: they are logged where they happen so
//! teardown always runs to completion.

use thiserror::Error;

use crate::config::GlassId;

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// The platform refused to allocate a virtual display
    #[error("Failed to create virtual display for {id}: {source}")]
    DeviceCreation {
        id: GlassId,
        #[source]
        source: anyhow::Error,
    },

    /// The presentation window could not be opened
    #[error("Failed to open presentation window for {id}: {source}")]
    PresentationOpen {
        id: GlassId,
        #[source]
        source: anyhow::Error,
    },

    /// The capture stream could not be started
    #[error("Failed to start display stream for {id}: {source}")]
    StreamStart {
        id: GlassId,
        #[source]
        source: anyhow::Error,
    },

    /// `register` was called for a display that already owns a device
    #[error("Display {0} is already registered")]
    AlreadyRegistered(GlassId),

    /// The transition requires a registered display
    #[error("Display {0} is not registered")]
    NotRegistered(GlassId),

    /// No display configuration carries this id
    #[error("Display configuration {0} not found")]
    ConfigNotFound(GlassId),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted document could not be encoded or decoded
    #[error("Invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),

    /// The control loop has stopped and no longer accepts commands
    #[error("Display control loop is not running")]
    ControlLoopClosed,
}

/// Result type alias for AppError
pub type Result<T> = std::result::Result<T, AppError>;
