//! OS capability seam
//!
//! A [`Backend`] is everything the host layer needs from the operating
//! system's USB stack: enumeration, descriptors, open/close, per-handle
//! control operations and asynchronous submit/cancel. Each accepted
//! submission is answered by exactly one [`Completion`] pushed into the
//! [`CompletionSink`] that came with it, possibly from another thread.

pub mod mock;
pub mod pool;
pub mod rusb_backend;

pub use mock::{EndpointBehaviour, MockBackend, MockDevice};
pub use rusb_backend::RusbBackend;

pub use crate::events::CompletionSink;

use crate::context::LogLevel;
use protocol::{
    ConfigDescriptor, DeviceDescriptor, IsoPacketDescriptor, TransferStatus, TransferType,
    UsbError,
};
use std::fmt;
use std::time::Duration;

/// Physical identity of an attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub bus: u8,
    pub address: u8,
}

impl DeviceKey {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Backend-side token of an open device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub u64);

/// Identity of one transfer across submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A transfer handed to the backend
///
/// The buffer is owned by the request while it is on the bus and comes back
/// unchanged (same allocation) in the [`Completion`].
#[derive(Debug)]
pub struct SubmitRequest {
    pub id: TransferId,
    pub handle: RawHandle,
    pub kind: TransferType,
    pub endpoint: u8,
    /// For control transfers the first 8 bytes are the setup packet
    pub buffer: Vec<u8>,
    /// Bytes of `buffer` taking part in the transfer
    pub length: usize,
    /// Requested length of each isochronous packet
    pub iso_packet_lengths: Vec<u32>,
    /// Zero means no timeout
    pub timeout: Duration,
}

impl SubmitRequest {
    /// Complete this request without touching the bus
    pub fn into_completion(self, status: TransferStatus) -> Completion {
        let iso_packets = self
            .iso_packet_lengths
            .iter()
            .map(|&length| IsoPacketDescriptor {
                length,
                actual_length: 0,
                status,
            })
            .collect();
        Completion {
            id: self.id,
            status,
            actual_length: 0,
            buffer: self.buffer,
            iso_packets,
        }
    }
}

/// Outcome of one submitted transfer
#[derive(Debug)]
pub struct Completion {
    pub id: TransferId,
    pub status: TransferStatus,
    /// For control transfers this excludes the setup packet
    pub actual_length: usize,
    pub buffer: Vec<u8>,
    pub iso_packets: Vec<IsoPacketDescriptor>,
}

/// A submission the backend refused; the buffer goes back to the transfer
#[derive(Debug)]
pub struct Rejected {
    pub error: UsbError,
    pub buffer: Vec<u8>,
}

impl Rejected {
    pub fn new(error: UsbError, request: SubmitRequest) -> Self {
        Self {
            error,
            buffer: request.buffer,
        }
    }
}

/// The operating system's USB stack as seen by a [`crate::Context`]
pub trait Backend: Send + Sync {
    /// Short name for diagnostics
    fn name(&self) -> &'static str;

    /// Currently attached devices
    fn enumerate(&self) -> Result<Vec<DeviceKey>, UsbError>;

    /// A logical device object for `key` came into existence
    fn ref_device(&self, key: DeviceKey);

    /// A logical device object for `key` was released
    fn unref_device(&self, key: DeviceKey);

    fn device_descriptor(&self, key: DeviceKey) -> Result<DeviceDescriptor, UsbError>;

    fn config_descriptor(&self, key: DeviceKey, index: u8) -> Result<ConfigDescriptor, UsbError>;

    /// bConfigurationValue of the active configuration, 0 if unconfigured
    fn active_config_value(&self, key: DeviceKey) -> Result<u8, UsbError>;

    fn open(&self, key: DeviceKey) -> Result<RawHandle, UsbError>;

    /// Release a handle; claimed interfaces are released with it
    fn close(&self, handle: RawHandle);

    fn get_configuration(&self, handle: RawHandle) -> Result<u8, UsbError>;

    fn set_configuration(&self, handle: RawHandle, value: u8) -> Result<(), UsbError>;

    fn claim_interface(&self, handle: RawHandle, interface: u8) -> Result<(), UsbError>;

    fn release_interface(&self, handle: RawHandle, interface: u8) -> Result<(), UsbError>;

    fn set_interface_alt_setting(
        &self,
        handle: RawHandle,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), UsbError>;

    fn clear_halt(&self, handle: RawHandle, endpoint: u8) -> Result<(), UsbError>;

    fn reset_device(&self, handle: RawHandle) -> Result<(), UsbError>;

    fn kernel_driver_active(&self, handle: RawHandle, interface: u8) -> Result<bool, UsbError>;

    fn detach_kernel_driver(&self, handle: RawHandle, interface: u8) -> Result<(), UsbError>;

    fn attach_kernel_driver(&self, handle: RawHandle, interface: u8) -> Result<(), UsbError>;

    /// Start an asynchronous transfer
    fn submit(&self, request: SubmitRequest, sink: CompletionSink) -> Result<(), Rejected>;

    /// Ask for an outstanding transfer to be cancelled
    ///
    /// The `Cancelled` completion still arrives through the sink. Returns
    /// `NotFound` if the transfer is not outstanding.
    fn cancel(&self, id: TransferId) -> Result<(), UsbError>;

    fn set_debug(&self, _level: LogLevel) {}

    /// Stop background machinery; called once when the owning context exits
    fn shutdown(&self) {}
}
