//! Host layer error types
//!
//! Failures reported by the OS or the device travel as [`Error::Usb`]. Every
//! other variant is a programmer error: the object was used after teardown or
//! in a state that does not allow the operation.

use protocol::{DescriptorError, UsbError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(#[from] UsbError),

    #[error("invalid context")]
    InvalidContext,

    #[error("invalid device")]
    InvalidDevice,

    #[error("closed device")]
    ClosedDevice,

    #[error("invalid transfer (already freed)")]
    InvalidTransfer,

    #[error("transfer is not submitted")]
    NotSubmitted,

    #[error("transfer is already submitted")]
    AlreadySubmitted,

    #[error("transfer buffer has not been created")]
    NoBuffer,

    #[error("invalid packet number {index} (transfer has {count} packets)")]
    InvalidPacket { index: usize, count: usize },

    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),
}

impl Error {
    /// Whether this is a use-after-teardown or wrong-state error rather than
    /// something the device or OS reported
    pub fn is_usage(&self) -> bool {
        !matches!(self, Error::Usb(_) | Error::Descriptor(_))
    }

    /// The OS/bus error, if this is one
    pub fn usb_error(&self) -> Option<UsbError> {
        match self {
            Error::Usb(e) => Some(*e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_errors_are_distinct() {
        assert!(Error::ClosedDevice.is_usage());
        assert!(Error::InvalidPacket { index: 3, count: 2 }.is_usage());
        assert!(!Error::Usb(UsbError::NoDevice).is_usage());
        assert_eq!(
            Error::from(UsbError::Busy).usb_error(),
            Some(UsbError::Busy)
        );
        assert_eq!(Error::InvalidDevice.usb_error(), None);
    }

    #[test]
    fn test_error_display() {
        let msg = Error::InvalidPacket { index: 5, count: 4 }.to_string();
        assert!(msg.contains('5'));
        assert_eq!(
            Error::Usb(UsbError::Pipe).to_string(),
            "USB error: pipe error"
        );
    }
}
