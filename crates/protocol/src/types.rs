//! USB transfer type definitions
//!
//! Transfer kinds, completion statuses, isochronous packet descriptors and
//! helpers for the direction / request-type bit fields.

use crate::consts::{
    ENDPOINT_DIR_MASK, ENDPOINT_IN, REQUEST_TYPE_CLASS, REQUEST_TYPE_RESERVED,
    REQUEST_TYPE_STANDARD, REQUEST_TYPE_VENDOR,
};
use crate::error::UsbError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// USB transfer types
///
/// Discriminants match the `bmAttributes` transfer type bits of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    /// Control transfer (setup packet + optional data stage)
    Control = 0,
    /// Isochronous transfer (audio/video streaming)
    Isochronous = 1,
    /// Bulk transfer (storage, network)
    Bulk = 2,
    /// Interrupt transfer (HID and other low latency devices)
    Interrupt = 3,
}

impl TransferType {
    /// Decode from endpoint `bmAttributes`
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// Final status of an asynchronous transfer
///
/// Discriminants match libusb's `libusb_transfer_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Transfer completed without error (may still be short)
    #[default]
    Completed = 0,
    /// Transfer failed
    Error = 1,
    /// Transfer timed out
    TimedOut = 2,
    /// Transfer was cancelled
    Cancelled = 3,
    /// Endpoint stalled (control: request not supported)
    Stall = 4,
    /// Device was disconnected
    NoDevice = 5,
    /// Device sent more data than requested
    Overflow = 6,
}

impl TransferStatus {
    /// Numeric status code
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decode a numeric status code
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => TransferStatus::Completed,
            1 => TransferStatus::Error,
            2 => TransferStatus::TimedOut,
            3 => TransferStatus::Cancelled,
            4 => TransferStatus::Stall,
            5 => TransferStatus::NoDevice,
            6 => TransferStatus::Overflow,
            _ => return None,
        })
    }

    /// Error a synchronous caller should see for this status
    ///
    /// `Completed` maps to `None`. Generic failures and cancellations collapse
    /// into [`UsbError::Io`].
    pub fn as_error(self) -> Option<UsbError> {
        match self {
            TransferStatus::Completed => None,
            TransferStatus::TimedOut => Some(UsbError::Timeout),
            TransferStatus::Stall => Some(UsbError::Pipe),
            TransferStatus::NoDevice => Some(UsbError::NoDevice),
            TransferStatus::Overflow => Some(UsbError::Overflow),
            TransferStatus::Error | TransferStatus::Cancelled => Some(UsbError::Io),
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransferStatus::Completed => "completed",
            TransferStatus::Error => "error",
            TransferStatus::TimedOut => "timed out",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Stall => "stall",
            TransferStatus::NoDevice => "no device",
            TransferStatus::Overflow => "overflow",
        };
        f.write_str(text)
    }
}

/// Isochronous packet descriptor
///
/// `length` is requested by the caller; `actual_length` and `status` are
/// filled in on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IsoPacketDescriptor {
    /// Requested packet length
    pub length: u32,
    /// Bytes actually transferred
    pub actual_length: u32,
    /// Per-packet completion status
    pub status: TransferStatus,
}

/// Data direction, seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address or bmRequestType
    pub fn from_bits(bits: u8) -> Self {
        if bits & ENDPOINT_DIR_MASK == ENDPOINT_IN {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Request type bits of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Recipient bits of bmRequestType
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Compose a bmRequestType byte
pub fn request_type(direction: Direction, request_type: RequestType, recipient: Recipient) -> u8 {
    let dir = match direction {
        Direction::In => ENDPOINT_IN,
        Direction::Out => 0,
    };
    let ty = match request_type {
        RequestType::Standard => REQUEST_TYPE_STANDARD,
        RequestType::Class => REQUEST_TYPE_CLASS,
        RequestType::Vendor => REQUEST_TYPE_VENDOR,
        RequestType::Reserved => REQUEST_TYPE_RESERVED,
    };
    let rec = match recipient {
        Recipient::Device => 0,
        Recipient::Interface => 1,
        Recipient::Endpoint => 2,
        Recipient::Other => 3,
    };
    dir | ty | rec
}
