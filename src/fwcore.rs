// SPDX-License-Identifier: LGPL-2.1-or-later

//! Core of the firmware update engine.
//!
//! The module tree mirrors the runtime layering: [`stream`] and [`chunks`]
//! are the leaf byte-level helpers, [`firmware`] holds the polymorphic
//! container parsers, [`transport`] abstracts the wire, [`device`] is the
//! stateful updatable object and [`daemon`] drives registration and the
//! composite write transaction.

pub mod backend;
pub mod chunks;
pub mod crc;
pub mod daemon;
pub mod device;
pub mod firmware;
pub mod formatters;
pub mod guid;
pub mod plugin;
pub mod progress;
pub mod quirks;
pub mod request;
pub mod stream;
pub mod transport;
pub mod version;

/// Error taxonomy shared by every layer of the engine.
///
/// The kinds are deliberately coarse: parsers surface structural problems as
/// [`FwError::InvalidData`], a well-formed file aimed at the wrong hardware is
/// [`FwError::InvalidFile`], and transports map straight onto
/// [`FwError::Read`], [`FwError::Write`] and [`FwError::Timeout`]. Callers may
/// wrap messages with more context but must not change the kind.
#[derive(thiserror::Error, Debug)]
pub enum FwError {
    /// The operation or sub-feature is not implemented for this device or firmware
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A looked-up entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A parsed structure failed a semantic check
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Well-formed but semantically wrong for this device
    #[error("invalid file: {0}")]
    InvalidFile(String),

    /// Transport-level read failure
    #[error("read failed: {0}")]
    Read(String),

    /// Transport-level write failure
    #[error("write failed: {0}")]
    Write(String),

    /// A bounded wait expired
    #[error("timed out: {0}")]
    Timeout(String),

    /// The device refused an operation
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Post-condition violation that indicates a bug
    #[error("internal error: {0}")]
    Internal(String),

    /// Retry-eligible transient failure
    #[error("device busy: {0}")]
    Busy(String),

    /// A non-owning reference outlived its target
    #[error("object gone: {0}")]
    Gone(String),

    /// The operation was aborted by a cancellation token
    #[error("operation was aborted")]
    Aborted,

    /// General I/O error during read/write operations
    #[error("error occurred while reading or writing")]
    IOError(#[from] std::io::Error),
}

impl FwError {
    /// Short stable name of the error kind, used for reporting.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            FwError::NotSupported(_) => "not-supported",
            FwError::NotFound(_) => "not-found",
            FwError::InvalidData(_) => "invalid-data",
            FwError::InvalidFile(_) => "invalid-file",
            FwError::Read(_) => "read",
            FwError::Write(_) => "write",
            FwError::Timeout(_) => "timeout",
            FwError::AuthFailed(_) => "auth-failed",
            FwError::Internal(_) => "internal",
            FwError::Busy(_) => "busy",
            FwError::Gone(_) => "gone",
            FwError::Aborted => "aborted",
            FwError::IOError(_) => "io",
        }
    }
}

/// Result type used throughout the engine
pub type ResultFw<T> = Result<T, FwError>;

#[cfg(test)]
mod tests {
    use super::FwError;

    #[test]
    fn test_error_kind_names() {
        assert_eq!(FwError::NotSupported("x".into()).kind(), "not-supported");
        assert_eq!(FwError::Busy("x".into()).kind(), "busy");
        assert_eq!(
            FwError::InvalidData("field magic: got 0x00, expected 0x55".into()).to_string(),
            "invalid data: field magic: got 0x00, expected 0x55"
        );
    }
}
