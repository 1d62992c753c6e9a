//! Control setup packet codec
//!
//! A control transfer buffer starts with the fixed 8-byte setup packet followed
//! by the data stage:
//!
//! ```text
//! [bmRequestType: u8][bRequest: u8][wValue: u16 LE][wIndex: u16 LE][wLength: u16 LE][data ...]
//! ```

use crate::consts::{DT_STRING, ENDPOINT_IN, REQUEST_GET_DESCRIPTOR};
use crate::error::{DescriptorError, Result};
use crate::types::Direction;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Size of the setup packet
pub const CONTROL_SETUP_SIZE: usize = 8;

/// Decoded control setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ControlSetup {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

/// Data stage of a control transfer being built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPayload<'a> {
    /// Literal bytes to send (or to pre-fill an IN buffer with)
    Data(&'a [u8]),
    /// Only a requested length; the data stage is zero-filled
    Length(u16),
}

impl ControlPayload<'_> {
    /// Length of the data stage
    pub fn len(&self) -> usize {
        match self {
            ControlPayload::Data(data) => data.len(),
            ControlPayload::Length(len) => *len as usize,
        }
    }

    /// Whether the data stage is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ControlSetup {
    /// Create a setup packet
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Standard GET_DESCRIPTOR request
    pub fn get_descriptor(descriptor_type: u8, index: u8, language_id: u16, length: u16) -> Self {
        Self::new(
            ENDPOINT_IN,
            REQUEST_GET_DESCRIPTOR,
            (u16::from(descriptor_type) << 8) | u16::from(index),
            language_id,
            length,
        )
    }

    /// GET_DESCRIPTOR(STRING) request
    pub fn get_string_descriptor(index: u8, language_id: u16, length: u16) -> Self {
        Self::get_descriptor(DT_STRING, index, language_id, length)
    }

    /// Direction of the data stage
    pub fn direction(&self) -> Direction {
        Direction::from_bits(self.request_type)
    }

    /// Whether the data stage flows device to host
    pub fn is_in(&self) -> bool {
        self.direction() == Direction::In
    }

    /// Encode into the 8-byte wire form
    pub fn encode(&self) -> [u8; CONTROL_SETUP_SIZE] {
        let mut out = [0u8; CONTROL_SETUP_SIZE];
        self.write_to(&mut out);
        out
    }

    /// Write the setup packet into the leading bytes of `buf`
    ///
    /// # Panics
    /// Panics if `buf` is shorter than [`CONTROL_SETUP_SIZE`].
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.request_type;
        buf[1] = self.request;
        LittleEndian::write_u16(&mut buf[2..4], self.value);
        LittleEndian::write_u16(&mut buf[4..6], self.index);
        LittleEndian::write_u16(&mut buf[6..8], self.length);
    }

    /// Decode from the leading bytes of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CONTROL_SETUP_SIZE {
            return Err(DescriptorError::Truncated {
                needed: CONTROL_SETUP_SIZE,
                available: bytes.len(),
            });
        }
        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        })
    }
}

/// Build a complete control transfer buffer
///
/// `wLength` is taken from the payload; a [`ControlPayload::Length`] payload is
/// zero-filled.
pub fn encode_control_transfer(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    payload: ControlPayload<'_>,
) -> Result<Vec<u8>> {
    let length = u16::try_from(payload.len()).map_err(|_| {
        DescriptorError::Malformed(format!(
            "control data stage of {} bytes exceeds wLength",
            payload.len()
        ))
    })?;

    let setup = ControlSetup::new(request_type, request, value, index, length);
    let mut buffer = vec![0u8; CONTROL_SETUP_SIZE + payload.len()];
    setup.write_to(&mut buffer);
    if let ControlPayload::Data(data) = payload {
        buffer[CONTROL_SETUP_SIZE..].copy_from_slice(data);
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_wire_layout() {
        let setup = ControlSetup::new(0x80, 0x06, 0x0100, 0x0409, 0x0012);
        assert_eq!(
            setup.encode(),
            [0x80, 0x06, 0x00, 0x01, 0x09, 0x04, 0x12, 0x00]
        );
    }

    #[test]
    fn test_setup_roundtrip() {
        let setup = ControlSetup::new(0xc0, 0x51, 0xbeef, 0x1234, 64);
        let decoded = ControlSetup::decode(&setup.encode()).unwrap();
        assert_eq!(decoded, setup);
    }

    #[test]
    fn test_decode_short_buffer() {
        let err = ControlSetup::decode(&[0x80, 0x06, 0x00]).unwrap_err();
        assert_eq!(
            err,
            DescriptorError::Truncated {
                needed: 8,
                available: 3
            }
        );
    }

    #[test]
    fn test_encode_with_length_zero_fills() {
        let buf =
            encode_control_transfer(0x80, 0x06, 0x0100, 0, ControlPayload::Length(4)).unwrap();
        assert_eq!(buf.len(), 12);
        assert_eq!(&buf[6..8], &[4, 0]);
        assert_eq!(&buf[8..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_with_data_copies_payload() {
        let buf =
            encode_control_transfer(0x40, 0x01, 0, 0, ControlPayload::Data(b"abc")).unwrap();
        assert_eq!(buf.len(), 11);
        assert_eq!(&buf[6..8], &[3, 0]);
        assert_eq!(&buf[8..], b"abc");
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let data = vec![0u8; 70_000];
        assert!(encode_control_transfer(0x40, 0x01, 0, 0, ControlPayload::Data(&data)).is_err());
    }

    #[test]
    fn test_get_string_descriptor_request() {
        let setup = ControlSetup::get_string_descriptor(2, 0x0409, 255);
        assert!(setup.is_in());
        assert_eq!(setup.value, 0x0302);
        assert_eq!(setup.index, 0x0409);
    }
}
