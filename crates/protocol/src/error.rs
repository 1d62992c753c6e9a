//! Protocol error types
//!
//! [`UsbError`] is the error taxonomy reported by the host controller / OS layer.
//! [`DescriptorError`] covers malformed or truncated descriptor byte images.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// USB error taxonomy
///
/// Numeric codes match the libusb error codes so values coming from a native
/// stack map one to one. Codes outside the table are kept as [`UsbError::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum UsbError {
    /// Input/output error
    #[error("input/output error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("access denied (insufficient permissions)")]
    Access,
    /// Device was disconnected
    #[error("no such device (it may have been disconnected)")]
    NoDevice,
    /// Entity not found
    #[error("entity not found")]
    NotFound,
    /// Resource busy
    #[error("resource busy")]
    Busy,
    /// Operation timed out
    #[error("operation timed out")]
    Timeout,
    /// Device sent more data than requested
    #[error("overflow")]
    Overflow,
    /// Endpoint stalled
    #[error("pipe error")]
    Pipe,
    /// System call interrupted
    #[error("system call interrupted (perhaps due to signal)")]
    Interrupted,
    /// Insufficient memory
    #[error("insufficient memory")]
    NoMem,
    /// Operation not supported on this platform
    #[error("operation not supported or unimplemented on this platform")]
    NotSupported,
    /// Other error
    #[error("other error")]
    Other,
    /// Code outside the known table
    #[error("unknown error ({0:#x})")]
    Unknown(i32),
}

impl UsbError {
    /// Numeric (libusb compatible) error code
    pub fn code(&self) -> i32 {
        match self {
            UsbError::Io => -1,
            UsbError::InvalidParam => -2,
            UsbError::Access => -3,
            UsbError::NoDevice => -4,
            UsbError::NotFound => -5,
            UsbError::Busy => -6,
            UsbError::Timeout => -7,
            UsbError::Overflow => -8,
            UsbError::Pipe => -9,
            UsbError::Interrupted => -10,
            UsbError::NoMem => -11,
            UsbError::NotSupported => -12,
            UsbError::Other => -99,
            UsbError::Unknown(code) => *code,
        }
    }

    /// Build an error from its numeric code
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => UsbError::Io,
            -2 => UsbError::InvalidParam,
            -3 => UsbError::Access,
            -4 => UsbError::NoDevice,
            -5 => UsbError::NotFound,
            -6 => UsbError::Busy,
            -7 => UsbError::Timeout,
            -8 => UsbError::Overflow,
            -9 => UsbError::Pipe,
            -10 => UsbError::Interrupted,
            -11 => UsbError::NoMem,
            -12 => UsbError::NotSupported,
            -99 => UsbError::Other,
            other => UsbError::Unknown(other),
        }
    }
}

/// Descriptor decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// Buffer shorter than the fixed layout requires
    #[error("Descriptor truncated: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// bLength is smaller than the descriptor header or the fixed layout
    #[error("Invalid descriptor length {length}")]
    InvalidLength { length: u8 },

    /// The type tag does not match the requested descriptor
    #[error("Unexpected descriptor type {found:#04x} (expected {expected:#04x})")]
    UnexpectedType { expected: u8, found: u8 },

    /// Payload does not fit into the fixed field widths
    #[error("Malformed descriptor: {0}")]
    Malformed(String),
}

/// Type alias for descriptor decoding results
pub type Result<T> = std::result::Result<T, DescriptorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_roundtrip() {
        let all = [
            UsbError::Io,
            UsbError::InvalidParam,
            UsbError::Access,
            UsbError::NoDevice,
            UsbError::NotFound,
            UsbError::Busy,
            UsbError::Timeout,
            UsbError::Overflow,
            UsbError::Pipe,
            UsbError::Interrupted,
            UsbError::NoMem,
            UsbError::NotSupported,
            UsbError::Other,
        ];
        for err in all {
            assert_eq!(UsbError::from_code(err.code()), err);
        }
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        let err = UsbError::from_code(-42);
        assert_eq!(err, UsbError::Unknown(-42));
        assert_eq!(err.code(), -42);
        assert!(err.to_string().contains("unknown error"));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(UsbError::Busy.to_string(), "resource busy");
        let err = DescriptorError::Truncated {
            needed: 18,
            available: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("18"));
        assert!(msg.contains("4"));
    }
}
