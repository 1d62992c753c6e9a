//! Open device sessions
//!
//! A [`DeviceHandle`] wraps the backend's raw handle. Configuration and
//! interface management go straight to the backend; the synchronous
//! transfers are built on the asynchronous engine and drive the owning
//! context's event loop until their transfer completes.

use crate::backend::RawHandle;
use crate::context::ContextInner;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::lock;
use crate::transfer::{ControlRequest, Payload, Transfer};
use byteorder::{ByteOrder, LittleEndian};
use protocol::consts::{DT_STRING, ENDPOINT_IN, MAX_DESCRIPTOR_SIZE, REQUEST_GET_DESCRIPTOR};
use protocol::{
    Descriptor, Direction, TransferStatus, UsbError, decode_ascii_units, decode_utf16_units,
    parse_descriptor, string_descriptor_units,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout of the standard requests issued by the descriptor helpers
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_millis(1000);

/// Result of a synchronous transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transferred {
    /// Bytes read from an IN endpoint, possibly fewer than requested
    Received(Vec<u8>),
    /// Number of bytes written to an OUT endpoint
    Sent(usize),
}

impl Transferred {
    pub fn len(&self) -> usize {
        match self {
            Transferred::Received(data) => data.len(),
            Transferred::Sent(count) => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            Transferred::Received(data) => Some(data),
            Transferred::Sent(_) => None,
        }
    }
}

/// Outcome of a bulk or interrupt transfer
///
/// A timeout is not an error here: whatever moved before it is reported with
/// `timed_out` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialTransfer {
    pub transferred: Transferred,
    pub timed_out: bool,
}

/// Result of [`DeviceHandle::get_string_descriptor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringDescriptor {
    /// Index 0: the supported language ids
    Languages(Vec<u16>),
    /// Raw UTF-16 code units
    Text(Vec<u16>),
}

pub(crate) struct HandleInner {
    device: Device,
    raw: Mutex<Option<RawHandle>>,
}

impl HandleInner {
    /// Close once; `context` is `None` during context teardown
    pub(crate) fn close(&self, context: Option<&ContextInner>) {
        let Some(raw) = lock(&self.raw).take() else {
            return;
        };
        debug!("Closing handle to {}", self.device.key());

        match context {
            Some(context) => {
                context.events.begin_close();
                self.device.backend().close(raw);
                context.forget_handle(raw);
                context.events.end_close();
            }
            None => self.device.backend().close(raw),
        }
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let context = self.device.owning_context().ok();
        self.close(context.as_deref());
    }
}

/// An open session to a [`Device`]
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<HandleInner>,
}

impl DeviceHandle {
    pub(crate) fn open(device: Device, context: &Arc<ContextInner>) -> Result<Self> {
        let raw = context.backend.open(device.key()).map_err(|e| {
            warn!("Failed to open device {}: {}", device.key(), e);
            e
        })?;
        debug!("Opened device {}", device.key());

        let inner = Arc::new(HandleInner {
            device,
            raw: Mutex::new(Some(raw)),
        });
        context.track_handle(raw, &inner);
        Ok(Self { inner })
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn is_open(&self) -> bool {
        lock(&self.inner.raw).is_some()
    }

    pub fn ptr_eq(&self, other: &DeviceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Close the handle; closing again does nothing
    ///
    /// Claimed interfaces are released by the backend.
    pub fn close(&self) {
        let context = self.inner.device.owning_context().ok();
        self.inner.close(context.as_deref());
    }

    pub(crate) fn context_inner(&self) -> Result<Arc<ContextInner>> {
        self.inner.device.owning_context()
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        self.context_inner()?;
        lock(&self.inner.raw).ok_or(Error::ClosedDevice)
    }

    pub fn get_configuration(&self) -> Result<u8> {
        let raw = self.raw()?;
        Ok(self.inner.device.backend().get_configuration(raw)?)
    }

    pub fn set_configuration(&self, value: u8) -> Result<()> {
        let raw = self.raw()?;
        debug!("Setting configuration {} on {}", value, self.device().key());
        Ok(self.inner.device.backend().set_configuration(raw, value)?)
    }

    pub fn claim_interface(&self, interface: u8) -> Result<()> {
        let raw = self.raw()?;
        self.inner
            .device
            .backend()
            .claim_interface(raw, interface)
            .map_err(|e| {
                debug!("Claiming interface {} failed: {}", interface, e);
                e
            })?;
        debug!("Claimed interface {} on {}", interface, self.device().key());
        Ok(())
    }

    pub fn release_interface(&self, interface: u8) -> Result<()> {
        let raw = self.raw()?;
        self.inner.device.backend().release_interface(raw, interface)?;
        debug!("Released interface {} on {}", interface, self.device().key());
        Ok(())
    }

    pub fn set_interface_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<()> {
        let raw = self.raw()?;
        Ok(self
            .inner
            .device
            .backend()
            .set_interface_alt_setting(raw, interface, alt_setting)?)
    }

    pub fn clear_halt(&self, endpoint: u8) -> Result<()> {
        let raw = self.raw()?;
        Ok(self.inner.device.backend().clear_halt(raw, endpoint)?)
    }

    pub fn reset_device(&self) -> Result<()> {
        let raw = self.raw()?;
        debug!("Resetting {}", self.device().key());
        Ok(self.inner.device.backend().reset_device(raw)?)
    }

    pub fn kernel_driver_active(&self, interface: u8) -> Result<bool> {
        let raw = self.raw()?;
        Ok(self
            .inner
            .device
            .backend()
            .kernel_driver_active(raw, interface)?)
    }

    pub fn detach_kernel_driver(&self, interface: u8) -> Result<()> {
        let raw = self.raw()?;
        Ok(self
            .inner
            .device
            .backend()
            .detach_kernel_driver(raw, interface)?)
    }

    pub fn attach_kernel_driver(&self, interface: u8) -> Result<()> {
        let raw = self.raw()?;
        Ok(self
            .inner
            .device
            .backend()
            .attach_kernel_driver(raw, interface)?)
    }

    /// Submit `transfer` and drive events until it completes
    fn run_sync(&self, transfer: &Transfer, timeout: Duration) -> Result<TransferStatus> {
        let context = self.context_inner()?;
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        transfer.submit(
            move |_, _, _| flag.store(true, Ordering::Release),
            timeout,
        )?;

        while !done.load(Ordering::Acquire) {
            if let Err(e) = context.handle_events_timeout_completed(context.event_timeout(), Some(&done)) {
                warn!("Event handling failed during synchronous transfer: {}", e);
                return Err(e);
            }
        }
        Ok(transfer.status())
    }

    /// Synchronous control transfer
    ///
    /// The direction comes from bit 7 of `request_type`. For IN requests the
    /// payload length is the number of bytes requested. A timeout is reported
    /// as [`UsbError::Timeout`].
    pub fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        payload: Payload<'_>,
        timeout: Duration,
    ) -> Result<Transferred> {
        let transfer = Transfer::new(0);
        transfer.fill_control_transfer(
            self,
            Some(ControlRequest::new(request_type, request, value, index)),
            Some(payload),
        )?;

        let status = self.run_sync(&transfer, timeout)?;
        if let Some(error) = status.as_error() {
            return Err(Error::Usb(error));
        }

        if Direction::from_bits(request_type) == Direction::In {
            let data = transfer.control_transfer_get_data()?.unwrap_or_default();
            Ok(Transferred::Received(data))
        } else {
            Ok(Transferred::Sent(transfer.actual_length()))
        }
    }

    /// Synchronous bulk transfer on `endpoint`
    pub fn bulk_transfer(
        &self,
        endpoint: u8,
        payload: Payload<'_>,
        timeout: Duration,
    ) -> Result<PartialTransfer> {
        let transfer = Transfer::new(0);
        transfer.fill_bulk_transfer(self, endpoint, payload)?;
        self.finish_data_transfer(&transfer, endpoint, timeout)
    }

    /// Synchronous interrupt transfer on `endpoint`
    pub fn interrupt_transfer(
        &self,
        endpoint: u8,
        payload: Payload<'_>,
        timeout: Duration,
    ) -> Result<PartialTransfer> {
        let transfer = Transfer::new(0);
        transfer.fill_interrupt_transfer(self, endpoint, payload)?;
        self.finish_data_transfer(&transfer, endpoint, timeout)
    }

    fn finish_data_transfer(
        &self,
        transfer: &Transfer,
        endpoint: u8,
        timeout: Duration,
    ) -> Result<PartialTransfer> {
        let status = self.run_sync(transfer, timeout)?;
        let timed_out = status == TransferStatus::TimedOut;
        if !timed_out && let Some(error) = status.as_error() {
            return Err(Error::Usb(error));
        }

        let transferred = if Direction::from_bits(endpoint) == Direction::In {
            Transferred::Received(transfer.get_data()?.unwrap_or_default())
        } else {
            Transferred::Sent(transfer.actual_length())
        };
        Ok(PartialTransfer {
            transferred,
            timed_out,
        })
    }

    /// GET_DESCRIPTOR into a maximum size buffer
    fn read_descriptor(&self, descriptor_type: u8, index: u8, language_id: u16) -> Result<Vec<u8>> {
        let transferred = self.control_transfer(
            ENDPOINT_IN,
            REQUEST_GET_DESCRIPTOR,
            (u16::from(descriptor_type) << 8) | u16::from(index),
            language_id,
            Payload::Length(MAX_DESCRIPTOR_SIZE),
            DESCRIPTOR_TIMEOUT,
        )?;
        Ok(transferred.into_data().unwrap_or_default())
    }

    /// Read and decode a descriptor by type tag
    pub fn get_descriptor(&self, descriptor_type: u8, index: u8) -> Result<Descriptor> {
        let data = self.read_descriptor(descriptor_type, index, 0)?;
        Ok(parse_descriptor(&data)?)
    }

    /// Read string descriptor `index` in language `language_id`
    ///
    /// Index 0 yields the device's language table.
    pub fn get_string_descriptor(&self, index: u8, language_id: u16) -> Result<StringDescriptor> {
        let data = self.read_descriptor(DT_STRING, index, language_id)?;
        let units = string_descriptor_units(&data)?;
        if index == 0 {
            Ok(StringDescriptor::Languages(units))
        } else {
            Ok(StringDescriptor::Text(units))
        }
    }

    /// String `index` in the device's first language, ASCII only
    pub fn get_string_descriptor_ascii(&self, index: u8) -> Result<String> {
        Ok(decode_ascii_units(&self.read_string_units(index)?))
    }

    /// String `index` in the device's first language
    pub fn get_string_descriptor_utf8(&self, index: u8) -> Result<String> {
        Ok(decode_utf16_units(&self.read_string_units(index)?))
    }

    fn read_string_units(&self, index: u8) -> Result<Vec<u16>> {
        if index == 0 {
            return Err(Error::Usb(UsbError::InvalidParam));
        }

        let languages = self.read_descriptor(DT_STRING, 0, 0)?;
        if languages.len() < 4 {
            return Err(Error::Usb(UsbError::Io));
        }
        let language_id = LittleEndian::read_u16(&languages[2..4]);

        let data = self.read_descriptor(DT_STRING, index, language_id)?;
        if data.len() < 2 || data[1] != DT_STRING {
            return Err(Error::Usb(UsbError::Io));
        }
        Ok(string_descriptor_units(&data)?)
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device", &self.inner.device.key())
            .field("open", &self.is_open())
            .finish()
    }
}
