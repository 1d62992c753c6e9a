//! Enumerated devices
//!
//! A [`Device`] stands for one physical device on one bus address. It is
//! handed out by [`crate::Context::get_device_list`] through the context's
//! registry, so every enumeration returns the same object for as long as any
//! clone of it is alive.

use crate::backend::{Backend, DeviceKey};
use crate::context::ContextInner;
use crate::error::{Error, Result};
use crate::handle::DeviceHandle;
use protocol::{ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, TransferType, UsbError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

pub(crate) struct DeviceInner {
    key: DeviceKey,
    context: Weak<ContextInner>,
    backend: Arc<dyn Backend>,
    released: AtomicBool,
    descriptor: OnceLock<DeviceDescriptor>,
}

impl DeviceInner {
    /// Create the logical device and take a backend reference for it
    pub(crate) fn new(key: DeviceKey, context: &Arc<ContextInner>) -> Arc<Self> {
        context.backend.ref_device(key);
        Arc::new(Self {
            key,
            context: Arc::downgrade(context),
            backend: context.backend.clone(),
            released: AtomicBool::new(false),
            descriptor: OnceLock::new(),
        })
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.released.load(Ordering::Acquire)
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Releasing device {}", self.key);
        self.backend.unref_device(self.key);
        if let Some(context) = self.context.upgrade() {
            context.registry.remove(self.key, self as *const DeviceInner);
        }
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// A USB device attached to the system
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub(crate) fn from_inner(inner: Arc<DeviceInner>) -> Self {
        Self { inner }
    }

    pub fn bus_number(&self) -> u8 {
        self.inner.key.bus
    }

    pub fn device_address(&self) -> u8 {
        self.inner.key.address
    }

    pub fn key(&self) -> DeviceKey {
        self.inner.key
    }

    /// Whether both values are the same logical device object
    pub fn ptr_eq(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// False once released or once the owning context has exited
    pub fn is_valid(&self) -> bool {
        self.inner.is_live() && self.context_inner().is_ok()
    }

    pub(crate) fn context_inner(&self) -> Result<Arc<ContextInner>> {
        if !self.inner.is_live() {
            return Err(Error::InvalidDevice);
        }
        self.owning_context()
    }

    /// The context, even after this device object was released
    pub(crate) fn owning_context(&self) -> Result<Arc<ContextInner>> {
        match self.inner.context.upgrade() {
            Some(context) if context.is_valid() => Ok(context),
            _ => Err(Error::InvalidContext),
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// The owning context
    pub fn context(&self) -> Result<crate::Context> {
        self.context_inner().map(crate::Context::from_inner)
    }

    /// Device descriptor, read once and then cached
    pub fn device_descriptor(&self) -> Result<DeviceDescriptor> {
        self.context_inner()?;
        if let Some(descriptor) = self.inner.descriptor.get() {
            return Ok(descriptor.clone());
        }
        let descriptor = self.inner.backend.device_descriptor(self.inner.key)?;
        Ok(self.inner.descriptor.get_or_init(|| descriptor).clone())
    }

    /// Descriptor of the active configuration
    ///
    /// `NotFound` if the device is unconfigured.
    pub fn active_config_descriptor(&self) -> Result<ConfigDescriptor> {
        self.context_inner()?;
        let value = self.inner.backend.active_config_value(self.inner.key)?;
        if value == 0 {
            return Err(Error::Usb(UsbError::NotFound));
        }
        self.config_descriptor_by_value(value)
    }

    pub fn config_descriptor(&self, index: u8) -> Result<ConfigDescriptor> {
        self.context_inner()?;
        Ok(self.inner.backend.config_descriptor(self.inner.key, index)?)
    }

    pub fn config_descriptor_by_value(&self, value: u8) -> Result<ConfigDescriptor> {
        let count = self.device_descriptor()?.num_configurations;
        for index in 0..count {
            let config = self.config_descriptor(index)?;
            if config.configuration_value == value {
                return Ok(config);
            }
        }
        Err(Error::Usb(UsbError::NotFound))
    }

    fn active_endpoint(&self, endpoint: u8) -> Result<EndpointDescriptor> {
        self.active_config_descriptor()?
            .find_endpoint(endpoint)
            .cloned()
            .ok_or(Error::Usb(UsbError::NotFound))
    }

    /// wMaxPacketSize of `endpoint` in the active configuration
    pub fn max_packet_size(&self, endpoint: u8) -> Result<u16> {
        Ok(self.active_endpoint(endpoint)?.max_packet_size)
    }

    /// Bytes per service interval of `endpoint`
    ///
    /// For isochronous and interrupt endpoints this includes the additional
    /// transactions per microframe encoded in bits 11..13.
    pub fn max_iso_packet_size(&self, endpoint: u8) -> Result<u32> {
        let descriptor = self.active_endpoint(endpoint)?;
        let raw = u32::from(descriptor.max_packet_size);
        let size = raw & 0x07ff;
        match descriptor.transfer_type() {
            TransferType::Isochronous | TransferType::Interrupt => {
                Ok(size * (1 + ((raw >> 11) & 0x03)))
            }
            _ => Ok(raw),
        }
    }

    /// Open a handle to this device
    pub fn open(&self) -> Result<DeviceHandle> {
        let context = self.context_inner()?;
        DeviceHandle::open(self.clone(), &context)
    }

    /// Drop this logical device now
    ///
    /// Every clone becomes invalid and the next enumeration creates a fresh
    /// object. Open handles keep working.
    pub fn release(&self) {
        self.inner.release();
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Device {}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("key", &self.inner.key)
            .field("live", &self.inner.is_live())
            .finish()
    }
}
