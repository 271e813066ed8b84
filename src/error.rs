//! Error types for the tape backend and controller configuration.
//!
//! Simulated tape conditions (command reject, data error, runaway, ...) are not
//! Rust errors, they are status bits the controller reports to the host, and are
//! modelled by [`crate::status`]. The types here cover things that are actually
//! exceptional from the implementor's point of view: a backend that can't read its
//! underlying file, or a configuration that requests an unsupported combination.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure reported by a [`crate::backend::TapeBackend`] implementation.
///
/// A `BackendError` is never returned from [`crate::controller::Controller::step`];
/// the controller catches it at the call site and translates it into the
/// appropriate status bits and `SCPE`/reject signalling, exactly as the hardware
/// would report a failed mechanical operation rather than crash.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The underlying image file could not be read or written.
    #[error("tape image I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record or gap marker did not parse as a valid length field.
    #[error("corrupt tape image: {0}")]
    Corrupt(String),

    /// The backend could not find the next record within the runaway window.
    #[error("tape runaway: no record found within bound")]
    Runaway,

    /// A record length field was out of the representable range.
    #[error("invalid record length: {0}")]
    InvalidRecordLength(u32),

    /// The unit has no image attached.
    #[error("unit is not attached to a tape image")]
    Unattached,

    /// The operation would write to a write-protected image.
    #[error("image is write-protected")]
    WriteProtected,
}

/// Failure constructing a [`crate::config::ControllerConfig`] or
/// [`crate::config::DriveConfig`].
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("density {density:?} is not supported by drive model {model:?}")]
    UnsupportedDensity {
        model: crate::config::DriveModel,
        density: crate::config::Density,
    },

    #[error("drive model {model:?} is not supported on controller type {controller:?}")]
    UnsupportedDriveModel {
        controller: crate::config::ControllerType,
        model: crate::config::DriveModel,
    },

    #[error("drive capacity must be nonzero")]
    ZeroCapacity,

    #[error("drive index {0} is out of range (0..4)")]
    DriveIndexOutOfRange(usize),
}

/// Failure attaching a tape image to a drive unit.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("failed to open tape image {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("drive index {0} is out of range (0..4)")]
    DriveIndexOutOfRange(usize),

    #[error("drive is currently rewinding and cannot be attached")]
    Rewinding,
}

/// The error kind carried by `ControllerFn::Scpe`: a message-only,
/// `Clone`/`PartialEq` projection of [`BackendError`] so the function bus
/// doesn't have to carry a non-`Clone` `io::Error` around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    Io(String),
    Corrupt(String),
    Runaway,
    InvalidRecordLength(u32),
    Unattached,
    WriteProtected,
}

impl From<&BackendError> for SimError {
    fn from(err: &BackendError) -> Self {
        match err {
            BackendError::Io(e) => SimError::Io(e.to_string()),
            BackendError::Corrupt(s) => SimError::Corrupt(s.clone()),
            BackendError::Runaway => SimError::Runaway,
            BackendError::InvalidRecordLength(l) => SimError::InvalidRecordLength(*l),
            BackendError::Unattached => SimError::Unattached,
            BackendError::WriteProtected => SimError::WriteProtected,
        }
    }
}
