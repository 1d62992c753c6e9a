//! USB wire formats for lusb
//!
//! This crate holds everything that is pure data: the error taxonomy shared by
//! all layers, chapter 9 constants, the control setup packet codec and the
//! descriptor codec. It performs no I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{ControlPayload, ControlSetup, encode_control_transfer};
//! use protocol::consts::{DT_DEVICE, ENDPOINT_IN, REQUEST_GET_DESCRIPTOR};
//!
//! let buffer = encode_control_transfer(
//!     ENDPOINT_IN,
//!     REQUEST_GET_DESCRIPTOR,
//!     u16::from(DT_DEVICE) << 8,
//!     0,
//!     ControlPayload::Length(18),
//! )
//! .unwrap();
//!
//! let setup = ControlSetup::decode(&buffer).unwrap();
//! assert_eq!(setup.length, 18);
//! assert_eq!(buffer.len(), 8 + 18);
//! ```
//!
//! # Descriptors
//!
//! ```
//! use protocol::{Descriptor, parse_descriptor};
//!
//! let raw = [0x07, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00];
//! match parse_descriptor(&raw).unwrap() {
//!     Descriptor::Endpoint(ep) => assert_eq!(ep.max_packet_size, 512),
//!     _ => unreachable!(),
//! }
//! ```

pub mod consts;
pub mod descriptor;
pub mod error;
pub mod setup;
pub mod strings;
pub mod types;

pub use descriptor::{
    ConfigDescriptor, Descriptor, DeviceDescriptor, EndpointDescriptor, Interface,
    InterfaceDescriptor, parse_descriptor,
};
pub use error::{DescriptorError, Result, UsbError};
pub use setup::{CONTROL_SETUP_SIZE, ControlPayload, ControlSetup, encode_control_transfer};
pub use strings::{
    LANGUAGE_ID_EN_US, decode_ascii_units, decode_utf16_units, encode_language_descriptor,
    encode_string_descriptor, string_descriptor_units,
};
pub use types::{
    Direction, IsoPacketDescriptor, Recipient, RequestType, TransferStatus, TransferType,
    request_type,
};
