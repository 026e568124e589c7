// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Driver errors.

use super::spec;
use thiserror::Error;
use user_driver::HostMemError;

/// An error from the NVMe driver.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no free {0}")]
    ResourceExhausted(&'static str),
    #[error("timed out after {timeout_ms}ms waiting for {what}")]
    Timeout { what: &'static str, timeout_ms: u32 },
    #[error("nvme error")]
    Io(#[source] NvmeError),
    #[error("dma memory error")]
    Memory(#[source] HostMemError),
    #[error("controller reported a fatal status")]
    ControllerFatal,
    #[error("device is gone")]
    DeviceGone,
}

impl From<HostMemError> for Error {
    fn from(value: HostMemError) -> Self {
        Self::Memory(value)
    }
}

impl From<NvmeError> for Error {
    fn from(value: NvmeError) -> Self {
        Self::Io(value)
    }
}

/// A failed completion status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NvmeError(spec::Status);

impl NvmeError {
    /// The full status: code in the low 8 bits, code type above it.
    pub fn status(&self) -> spec::Status {
        self.0
    }

    pub fn status_code(&self) -> u8 {
        self.0.status_code()
    }

    pub fn status_code_type(&self) -> spec::StatusCodeType {
        self.0.status_code_type()
    }
}

impl From<spec::Status> for NvmeError {
    fn from(value: spec::Status) -> Self {
        Self(value)
    }
}

impl std::error::Error for NvmeError {}

impl std::fmt::Display for NvmeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.status_code_type() {
            spec::StatusCodeType::GENERIC => write!(f, "general error {:#x?}", self.0),
            spec::StatusCodeType::COMMAND_SPECIFIC => {
                write!(f, "command-specific error {:#x?}", self.0)
            }
            spec::StatusCodeType::MEDIA_ERROR => {
                write!(f, "media error {:#x?}", self.0)
            }
            _ => write!(f, "{:#x?}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn status_fields() {
        let err = NvmeError::from(spec::Status::LBA_OUT_OF_RANGE);
        assert_eq!(err.status_code(), 0x80);
        assert_eq!(err.status_code_type(), spec::StatusCodeType::GENERIC);

        let err = NvmeError::from(spec::Status::INVALID_QUEUE_IDENTIFIER);
        assert_eq!(err.status_code(), 0x01);
        assert_eq!(err.status_code_type(), spec::StatusCodeType::COMMAND_SPECIFIC);
        assert!(err.to_string().starts_with("command-specific error"));

        let err = NvmeError::from(spec::Status::MEDIA_UNRECOVERED_READ_ERROR);
        assert_eq!(err.status_code_type(), spec::StatusCodeType::MEDIA_ERROR);
        assert!(err.to_string().starts_with("media error"));
    }
}
