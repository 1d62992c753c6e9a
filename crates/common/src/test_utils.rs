//! Test utilities for lusb
//!
//! Raw descriptor images as real devices return them, plus small helpers
//! for async tests. Used by the host crate's in-memory backend and tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_device_descriptor;
//! use protocol::DeviceDescriptor;
//!
//! let desc = DeviceDescriptor::parse(&create_mock_device_descriptor()).unwrap();
//! assert_eq!(desc.vendor_id, 0x1234);
//! ```

use protocol::{LANGUAGE_ID_EN_US, encode_language_descriptor, encode_string_descriptor};
use std::future::Future;
use std::time::Duration;

/// Upper bound for any single async test step
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor id of [`create_mock_device_descriptor`]
pub const MOCK_VENDOR_ID: u16 = 0x1234;
/// Product id of [`create_mock_device_descriptor`]
pub const MOCK_PRODUCT_ID: u16 = 0x5678;

/// Bulk IN endpoint of [`create_mock_config_descriptor`]
pub const MOCK_BULK_IN: u8 = 0x81;
/// Bulk OUT endpoint of [`create_mock_config_descriptor`]
pub const MOCK_BULK_OUT: u8 = 0x02;
/// Interrupt IN endpoint of [`create_mock_config_descriptor`]
pub const MOCK_INTERRUPT_IN: u8 = 0x83;
/// Isochronous IN endpoint of [`create_mock_config_descriptor`]
pub const MOCK_ISO_IN: u8 = 0x84;

/// USB 2.0 full speed device `MOCK_VENDOR_ID:MOCK_PRODUCT_ID`
pub fn create_mock_device_descriptor() -> Vec<u8> {
    create_device_descriptor(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
}

/// Device descriptor with the given ids and one configuration
///
/// String indexes 1, 2 and 3 are set for manufacturer, product and serial.
pub fn create_device_descriptor(vendor_id: u16, product_id: u16) -> Vec<u8> {
    let [vid_lo, vid_hi] = vendor_id.to_le_bytes();
    let [pid_lo, pid_hi] = product_id.to_le_bytes();
    vec![
        18, 0x01, // length, DT_DEVICE
        0x00, 0x02, // USB 2.00
        0x00, 0x00, 0x00, // class defined per interface
        64,   // ep0 packet size
        vid_lo, vid_hi, pid_lo, pid_hi,
        0x00, 0x01, // device release 1.00
        1, 2, 3, // string indexes
        1,       // configurations
    ]
}

/// Configuration 1 with two interfaces
///
/// Interface 0 (vendor specific) has bulk IN 0x81, bulk OUT 0x02 and
/// interrupt IN 0x83. Interface 1 (audio streaming) has isochronous IN 0x84
/// with two transactions of 512 bytes per microframe.
pub fn create_mock_config_descriptor() -> Vec<u8> {
    vec![
        // header: 55 bytes total, 2 interfaces, bus powered, 100mA
        0x09, 0x02, 0x37, 0x00, 0x02, 0x01, 0x00, 0x80, 0x32,
        // Interface 0
        0x09, 0x04, 0x00, 0x00, 0x03, 0xff, 0x00, 0x00, 0x00,
        // Bulk IN, 512 bytes
        0x07, 0x05, MOCK_BULK_IN, 0x02, 0x00, 0x02, 0x00,
        // Bulk OUT, 512 bytes
        0x07, 0x05, MOCK_BULK_OUT, 0x02, 0x00, 0x02, 0x00,
        // Interrupt IN, 64 bytes, 10 frames
        0x07, 0x05, MOCK_INTERRUPT_IN, 0x03, 0x40, 0x00, 0x0a,
        // Interface 1
        0x09, 0x04, 0x01, 0x00, 0x01, 0x01, 0x02, 0x00, 0x00,
        // Isochronous IN, 512 bytes x 2 transactions
        0x07, 0x05, MOCK_ISO_IN, 0x05, 0x00, 0x0a, 0x01,
    ]
}

/// String descriptor for `text`
pub fn create_mock_string_descriptor(text: &str) -> Vec<u8> {
    encode_string_descriptor(text)
}

/// Language table for string index 0 (US English only)
pub fn create_mock_language_descriptor() -> Vec<u8> {
    encode_language_descriptor(&[LANGUAGE_ID_EN_US])
}

/// `size` bytes counting up from 0 and wrapping at 256
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| i as u8).collect()
}

/// Fail an async test step that does not finish within `limit`
///
/// ```ignore
/// let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, receiver.recv()).await?;
/// ```
pub async fn with_timeout<T, F>(limit: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| TimeoutError { duration: limit })
}

#[derive(Debug, thiserror::Error)]
#[error("step did not finish within {duration:?}")]
pub struct TimeoutError {
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{ConfigDescriptor, DeviceDescriptor, TransferType};

    #[test]
    fn test_device_descriptor_image() {
        let raw = create_device_descriptor(0xabcd, 0x0001);
        assert_eq!(raw.len(), 18);
        assert_eq!(&raw[8..12], &[0xcd, 0xab, 0x01, 0x00]);

        let parsed = DeviceDescriptor::parse(&create_mock_device_descriptor()).unwrap();
        assert_eq!(parsed.product_id, MOCK_PRODUCT_ID);
        assert_eq!(parsed.serial_number_index, 3);
    }

    #[test]
    fn test_config_descriptor_image() {
        let raw = create_mock_config_descriptor();
        assert_eq!(raw.len(), 55);

        let config = ConfigDescriptor::parse(&raw).unwrap();
        assert_eq!(config.interfaces.len(), 2);
        let iso = config.find_endpoint(MOCK_ISO_IN).unwrap();
        assert_eq!(iso.transfer_type(), TransferType::Isochronous);
        assert_eq!(iso.max_packet_size, 0x0a00);
        assert_eq!(
            config.find_endpoint(MOCK_INTERRUPT_IN).unwrap().transfer_type(),
            TransferType::Interrupt
        );
    }

    #[test]
    fn test_config_encodes_back_identically() {
        let raw = create_mock_config_descriptor();
        let config = ConfigDescriptor::parse(&raw).unwrap();
        assert_eq!(config.to_bytes(), raw);
    }

    #[test]
    fn test_bulk_data_wraps() {
        let data = create_mock_bulk_data(300);
        assert_eq!(data.len(), 300);
        assert_eq!((data[0], data[255], data[256]), (0, 255, 0));
    }

    #[test]
    fn test_language_descriptor() {
        assert_eq!(create_mock_language_descriptor(), vec![4, 3, 0x09, 0x04]);
    }

    #[tokio::test]
    async fn test_with_timeout_completes() {
        let value = with_timeout(DEFAULT_TEST_TIMEOUT, async { 7 }).await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let limit = Duration::from_millis(10);
        let err = with_timeout(limit, std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(err.duration, limit);
    }
}
