//! USB 2.0 constants
//!
//! Numeric values of class codes, descriptor types, request codes and bit masks
//! as laid down in chapter 9 of the USB 2.0 specification.

// Device and interface classes
pub const CLASS_PER_INTERFACE: u8 = 0x00;
pub const CLASS_AUDIO: u8 = 0x01;
pub const CLASS_COMM: u8 = 0x02;
pub const CLASS_HID: u8 = 0x03;
pub const CLASS_PHYSICAL: u8 = 0x05;
pub const CLASS_PTP: u8 = 0x06;
pub const CLASS_PRINTER: u8 = 0x07;
pub const CLASS_MASS_STORAGE: u8 = 0x08;
pub const CLASS_HUB: u8 = 0x09;
pub const CLASS_DATA: u8 = 0x0a;
pub const CLASS_WIRELESS: u8 = 0xe0;
pub const CLASS_APPLICATION: u8 = 0xfe;
pub const CLASS_VENDOR_SPEC: u8 = 0xff;

// Descriptor types
pub const DT_DEVICE: u8 = 0x01;
pub const DT_CONFIG: u8 = 0x02;
pub const DT_STRING: u8 = 0x03;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;
pub const DT_HID: u8 = 0x21;
pub const DT_REPORT: u8 = 0x22;
pub const DT_PHYSICAL: u8 = 0x23;
pub const DT_HUB: u8 = 0x29;

// Descriptor sizes
pub const DT_DEVICE_SIZE: usize = 18;
pub const DT_CONFIG_SIZE: usize = 9;
pub const DT_INTERFACE_SIZE: usize = 9;
pub const DT_ENDPOINT_SIZE: usize = 7;
pub const DT_ENDPOINT_AUDIO_SIZE: usize = 9;
pub const DT_HUB_NONVAR_SIZE: usize = 7;

/// Largest descriptor a single `bLength` byte can describe
pub const MAX_DESCRIPTOR_SIZE: usize = 255;

// Endpoint address layout
pub const ENDPOINT_ADDRESS_MASK: u8 = 0x0f;
pub const ENDPOINT_DIR_MASK: u8 = 0x80;
pub const ENDPOINT_IN: u8 = 0x80;
pub const ENDPOINT_OUT: u8 = 0x00;

// bmAttributes transfer type bits
pub const TRANSFER_TYPE_MASK: u8 = 0x03;
pub const TRANSFER_TYPE_CONTROL: u8 = 0;
pub const TRANSFER_TYPE_ISOCHRONOUS: u8 = 1;
pub const TRANSFER_TYPE_BULK: u8 = 2;
pub const TRANSFER_TYPE_INTERRUPT: u8 = 3;

// Standard requests
pub const REQUEST_GET_STATUS: u8 = 0x00;
pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const REQUEST_SET_FEATURE: u8 = 0x03;
pub const REQUEST_SET_ADDRESS: u8 = 0x05;
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const REQUEST_SET_DESCRIPTOR: u8 = 0x07;
pub const REQUEST_GET_CONFIGURATION: u8 = 0x08;
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_GET_INTERFACE: u8 = 0x0a;
pub const REQUEST_SET_INTERFACE: u8 = 0x0b;
pub const REQUEST_SYNCH_FRAME: u8 = 0x0c;

// bmRequestType type bits
pub const REQUEST_TYPE_STANDARD: u8 = 0x00 << 5;
pub const REQUEST_TYPE_CLASS: u8 = 0x01 << 5;
pub const REQUEST_TYPE_VENDOR: u8 = 0x02 << 5;
pub const REQUEST_TYPE_RESERVED: u8 = 0x03 << 5;

// bmRequestType recipient bits
pub const RECIPIENT_DEVICE: u8 = 0x00;
pub const RECIPIENT_INTERFACE: u8 = 0x01;
pub const RECIPIENT_ENDPOINT: u8 = 0x02;
pub const RECIPIENT_OTHER: u8 = 0x03;

// Isochronous endpoint attributes
pub const ISO_SYNC_TYPE_MASK: u8 = 0x0c;
pub const ISO_SYNC_TYPE_NONE: u8 = 0;
pub const ISO_SYNC_TYPE_ASYNC: u8 = 1;
pub const ISO_SYNC_TYPE_ADAPTIVE: u8 = 2;
pub const ISO_SYNC_TYPE_SYNC: u8 = 3;
pub const ISO_USAGE_TYPE_MASK: u8 = 0x30;
pub const ISO_USAGE_TYPE_DATA: u8 = 0;
pub const ISO_USAGE_TYPE_FEEDBACK: u8 = 1;
pub const ISO_USAGE_TYPE_IMPLICIT: u8 = 2;

/// Feature selector for CLEAR_FEATURE(ENDPOINT_HALT)
pub const FEATURE_ENDPOINT_HALT: u16 = 0x00;
