//! Backend on top of rusb
//!
//! Enumeration, descriptors and per-handle operations call rusb directly.
//! rusb only offers blocking transfers, so submitted requests go to a
//! [`WorkerPool`] whose threads perform the blocking call and push the result
//! into the completion sink. The pool starts with the configured number of
//! workers and grows while all of them are busy, up to [`MAX_WORKERS`].
//!
//! Cancelling a request that is still queued completes it immediately. A
//! request already on the bus runs until its own timeout. Isochronous
//! transfers are not available through rusb and are rejected.

use super::pool::WorkerPool;
use super::{Backend, CompletionSink, DeviceKey, RawHandle, Rejected, SubmitRequest, TransferId};
use crate::context::LogLevel;
use crate::lock;
use protocol::consts::{
    DT_CONFIG, DT_CONFIG_SIZE, DT_DEVICE, DT_DEVICE_SIZE, DT_ENDPOINT, DT_ENDPOINT_SIZE,
    DT_INTERFACE, DT_INTERFACE_SIZE,
};
use protocol::{
    CONTROL_SETUP_SIZE, ConfigDescriptor, ControlSetup, DeviceDescriptor, Direction,
    EndpointDescriptor, Interface, InterfaceDescriptor, TransferStatus, TransferType, UsbError,
};
use rusb::UsbContext;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Upper bound on transfer worker threads, and so on transfers on the bus at once
pub const MAX_WORKERS: usize = 32;

/// rusb handles are `Sync` and every operation takes `&self`
type SharedHandle = Arc<rusb::DeviceHandle<rusb::Context>>;

struct CachedDevice {
    device: rusb::Device<rusb::Context>,
    refs: usize,
}

pub struct RusbBackend {
    context: rusb::Context,
    devices: Mutex<HashMap<DeviceKey, CachedDevice>>,
    handles: Mutex<HashMap<RawHandle, SharedHandle>>,
    next_handle: AtomicU64,
    pool: WorkerPool<rusb::DeviceHandle<rusb::Context>>,
}

impl RusbBackend {
    /// Open a libusb context and start `worker_threads` transfer workers
    pub fn new(worker_threads: usize) -> Result<Self, UsbError> {
        let context = rusb::Context::new().map_err(|e| {
            warn!("Failed to create USB context: {}", e);
            map_rusb_error(e)
        })?;

        let pool: WorkerPool<rusb::DeviceHandle<rusb::Context>> = WorkerPool::new(
            "usb-worker",
            worker_threads,
            MAX_WORKERS,
            Arc::new(execute_transfer),
        )?;
        info!(
            "rusb backend started with {} workers (up to {})",
            pool.worker_count(),
            pool.max_workers()
        );

        Ok(Self {
            context,
            devices: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            pool,
        })
    }

    fn device(&self, key: DeviceKey) -> Result<rusb::Device<rusb::Context>, UsbError> {
        lock(&self.devices)
            .get(&key)
            .map(|cached| cached.device.clone())
            .ok_or(UsbError::NoDevice)
    }

    fn handle(&self, handle: RawHandle) -> Result<SharedHandle, UsbError> {
        lock(&self.handles)
            .get(&handle)
            .cloned()
            .ok_or(UsbError::NotFound)
    }

    fn with_handle<T>(
        &self,
        handle: RawHandle,
        f: impl FnOnce(&rusb::DeviceHandle<rusb::Context>) -> rusb::Result<T>,
    ) -> Result<T, UsbError> {
        let shared = self.handle(handle)?;
        f(&shared).map_err(map_rusb_error)
    }
}

/// Perform one blocking transfer
fn execute_transfer(
    handle: &rusb::DeviceHandle<rusb::Context>,
    request: &mut SubmitRequest,
) -> (TransferStatus, usize) {
    let endpoint = request.endpoint;
    let timeout = request.timeout;
    let length = request.length.min(request.buffer.len());

    let result = match request.kind {
        TransferType::Control => {
            let Ok(setup) = ControlSetup::decode(&request.buffer) else {
                return (TransferStatus::Error, 0);
            };
            let data = &mut request.buffer[CONTROL_SETUP_SIZE..length];
            if setup.is_in() {
                handle.read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    data,
                    timeout,
                )
            } else {
                handle.write_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    data,
                    timeout,
                )
            }
        }
        TransferType::Bulk => {
            let data = &mut request.buffer[..length];
            match Direction::from_bits(endpoint) {
                Direction::In => handle.read_bulk(endpoint, data, timeout),
                Direction::Out => handle.write_bulk(endpoint, data, timeout),
            }
        }
        TransferType::Interrupt => {
            let data = &mut request.buffer[..length];
            match Direction::from_bits(endpoint) {
                Direction::In => handle.read_interrupt(endpoint, data, timeout),
                Direction::Out => handle.write_interrupt(endpoint, data, timeout),
            }
        }
        TransferType::Isochronous => Err(rusb::Error::NotSupported),
    };

    match result {
        Ok(count) => (TransferStatus::Completed, count),
        Err(e) => {
            debug!("Transfer on endpoint {:#04x} failed: {}", endpoint, e);
            (map_rusb_status(e), 0)
        }
    }
}

/// Map a rusb error to the USB error taxonomy
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::Interrupted => UsbError::Interrupted,
        rusb::Error::NoMem => UsbError::NoMem,
        rusb::Error::NotSupported => UsbError::NotSupported,
        _ => UsbError::Other,
    }
}

/// Transfer status for a failed blocking call
fn map_rusb_status(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Overflow => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

/// Binary-coded decimal form of a rusb version
fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor() & 0x0f) << 4)
        | u16::from(version.sub_minor() & 0x0f)
}

fn convert_device_descriptor(desc: &rusb::DeviceDescriptor) -> DeviceDescriptor {
    DeviceDescriptor {
        length: DT_DEVICE_SIZE as u8,
        descriptor_type: DT_DEVICE,
        usb_version: version_to_bcd(desc.usb_version()),
        device_class: desc.class_code(),
        device_sub_class: desc.sub_class_code(),
        device_protocol: desc.protocol_code(),
        max_packet_size_0: desc.max_packet_size(),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        device_version: version_to_bcd(desc.device_version()),
        manufacturer_index: desc.manufacturer_string_index().unwrap_or(0),
        product_index: desc.product_string_index().unwrap_or(0),
        serial_number_index: desc.serial_number_string_index().unwrap_or(0),
        num_configurations: desc.num_configurations(),
    }
}

fn endpoint_attributes(endpoint: &rusb::EndpointDescriptor<'_>) -> u8 {
    let transfer = match endpoint.transfer_type() {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
    };
    let sync = match endpoint.sync_type() {
        rusb::SyncType::NoSync => 0,
        rusb::SyncType::Asynchronous => 1,
        rusb::SyncType::Adaptive => 2,
        rusb::SyncType::Synchronous => 3,
    };
    let usage = match endpoint.usage_type() {
        rusb::UsageType::Data => 0,
        rusb::UsageType::Feedback => 1,
        rusb::UsageType::FeedbackData => 2,
        rusb::UsageType::Reserved => 3,
    };
    transfer | (sync << 2) | (usage << 4)
}

fn convert_config_descriptor(config: &rusb::ConfigDescriptor) -> ConfigDescriptor {
    let interfaces: Vec<Interface> = config
        .interfaces()
        .map(|interface| Interface {
            alt_settings: interface
                .descriptors()
                .map(|alt| {
                    let endpoints: Vec<EndpointDescriptor> = alt
                        .endpoint_descriptors()
                        .map(|ep| EndpointDescriptor {
                            length: DT_ENDPOINT_SIZE as u8,
                            descriptor_type: DT_ENDPOINT,
                            endpoint_address: ep.address(),
                            attributes: endpoint_attributes(&ep),
                            max_packet_size: ep.max_packet_size(),
                            interval: ep.interval(),
                            refresh: None,
                            synch_address: None,
                            extra: Vec::new(),
                        })
                        .collect();
                    InterfaceDescriptor {
                        length: DT_INTERFACE_SIZE as u8,
                        descriptor_type: DT_INTERFACE,
                        interface_number: alt.interface_number(),
                        alternate_setting: alt.setting_number(),
                        num_endpoints: endpoints.len() as u8,
                        interface_class: alt.class_code(),
                        interface_sub_class: alt.sub_class_code(),
                        interface_protocol: alt.protocol_code(),
                        interface_index: alt.description_string_index().unwrap_or(0),
                        endpoints,
                        extra: Vec::new(),
                    }
                })
                .collect(),
        })
        .collect();

    let mut descriptor = ConfigDescriptor {
        length: DT_CONFIG_SIZE as u8,
        descriptor_type: DT_CONFIG,
        total_length: 0,
        num_interfaces: config.num_interfaces(),
        configuration_value: config.number(),
        configuration_index: config.description_string_index().unwrap_or(0),
        attributes: 0x80
            | (u8::from(config.self_powered()) << 6)
            | (u8::from(config.remote_wakeup()) << 5),
        max_power: (config.max_power() / 2).min(u16::from(u8::MAX)) as u8,
        interfaces,
        extra: Vec::new(),
    };
    descriptor.total_length = descriptor.to_bytes().len() as u16;
    descriptor
}

fn to_rusb_log_level(level: LogLevel) -> rusb::LogLevel {
    match level {
        LogLevel::None => rusb::LogLevel::None,
        LogLevel::Error => rusb::LogLevel::Error,
        LogLevel::Warning => rusb::LogLevel::Warning,
        LogLevel::Info => rusb::LogLevel::Info,
        LogLevel::Debug => rusb::LogLevel::Debug,
    }
}

impl Backend for RusbBackend {
    fn name(&self) -> &'static str {
        "rusb"
    }

    fn enumerate(&self) -> Result<Vec<DeviceKey>, UsbError> {
        let list = self.context.devices().map_err(map_rusb_error)?;
        let mut devices = lock(&self.devices);

        let mut keys = Vec::with_capacity(list.len());
        for device in list.iter() {
            let key = DeviceKey::new(device.bus_number(), device.address());
            devices
                .entry(key)
                .and_modify(|cached| cached.device = device.clone())
                .or_insert(CachedDevice { device, refs: 0 });
            keys.push(key);
        }
        // Forget devices that are gone and no longer referenced
        devices.retain(|key, cached| cached.refs > 0 || keys.contains(key));

        debug!("Enumerated {} USB devices", keys.len());
        Ok(keys)
    }

    fn ref_device(&self, key: DeviceKey) {
        if let Some(cached) = lock(&self.devices).get_mut(&key) {
            cached.refs += 1;
        }
    }

    fn unref_device(&self, key: DeviceKey) {
        let mut devices = lock(&self.devices);
        if let Some(cached) = devices.get_mut(&key) {
            cached.refs = cached.refs.saturating_sub(1);
            if cached.refs == 0 {
                devices.remove(&key);
            }
        }
    }

    fn device_descriptor(&self, key: DeviceKey) -> Result<DeviceDescriptor, UsbError> {
        let device = self.device(key)?;
        let descriptor = device.device_descriptor().map_err(map_rusb_error)?;
        Ok(convert_device_descriptor(&descriptor))
    }

    fn config_descriptor(&self, key: DeviceKey, index: u8) -> Result<ConfigDescriptor, UsbError> {
        let device = self.device(key)?;
        let config = device.config_descriptor(index).map_err(map_rusb_error)?;
        Ok(convert_config_descriptor(&config))
    }

    fn active_config_value(&self, key: DeviceKey) -> Result<u8, UsbError> {
        let device = self.device(key)?;
        match device.active_config_descriptor() {
            Ok(config) => Ok(config.number()),
            Err(rusb::Error::NotFound) => Ok(0),
            Err(e) => Err(map_rusb_error(e)),
        }
    }

    fn open(&self, key: DeviceKey) -> Result<RawHandle, UsbError> {
        let device = self.device(key)?;
        let handle = device.open().map_err(map_rusb_error)?;
        let raw = RawHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        lock(&self.handles).insert(raw, Arc::new(handle));
        debug!("Opened {} as {:?}", key, raw);
        Ok(raw)
    }

    fn close(&self, handle: RawHandle) {
        lock(&self.handles).remove(&handle);
        let cancelled = self.pool.cancel_queued(|request| request.handle == handle);
        if cancelled > 0 {
            debug!("Cancelled {} queued transfers of {:?}", cancelled, handle);
        }
    }

    fn get_configuration(&self, handle: RawHandle) -> Result<u8, UsbError> {
        self.with_handle(handle, |h| h.active_configuration())
    }

    fn set_configuration(&self, handle: RawHandle, value: u8) -> Result<(), UsbError> {
        self.with_handle(handle, |h| h.set_active_configuration(value))
    }

    fn claim_interface(&self, handle: RawHandle, interface: u8) -> Result<(), UsbError> {
        self.with_handle(handle, |h| h.claim_interface(interface))
    }

    fn release_interface(&self, handle: RawHandle, interface: u8) -> Result<(), UsbError> {
        self.with_handle(handle, |h| h.release_interface(interface))
    }

    fn set_interface_alt_setting(
        &self,
        handle: RawHandle,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), UsbError> {
        self.with_handle(handle, |h| h.set_alternate_setting(interface, alt_setting))
    }

    fn clear_halt(&self, handle: RawHandle, endpoint: u8) -> Result<(), UsbError> {
        self.with_handle(handle, |h| h.clear_halt(endpoint))
    }

    fn reset_device(&self, handle: RawHandle) -> Result<(), UsbError> {
        self.with_handle(handle, |h| h.reset())
    }

    fn kernel_driver_active(&self, handle: RawHandle, interface: u8) -> Result<bool, UsbError> {
        self.with_handle(handle, |h| h.kernel_driver_active(interface))
    }

    fn detach_kernel_driver(&self, handle: RawHandle, interface: u8) -> Result<(), UsbError> {
        self.with_handle(handle, |h| h.detach_kernel_driver(interface))
    }

    fn attach_kernel_driver(&self, handle: RawHandle, interface: u8) -> Result<(), UsbError> {
        self.with_handle(handle, |h| h.attach_kernel_driver(interface))
    }

    fn submit(&self, request: SubmitRequest, sink: CompletionSink) -> Result<(), Rejected> {
        if request.kind == TransferType::Isochronous {
            return Err(Rejected::new(UsbError::NotSupported, request));
        }
        match self.handle(request.handle) {
            Ok(shared) => self.pool.submit(request, sink, shared),
            Err(error) => Err(Rejected::new(error, request)),
        }
    }

    fn cancel(&self, id: TransferId) -> Result<(), UsbError> {
        self.pool.cancel(id)
    }

    fn set_debug(&self, level: LogLevel) {
        let mut context = self.context.clone();
        context.set_log_level(to_rusb_log_level(level));
    }

    fn shutdown(&self) {
        if self.pool.shutdown() > 0 {
            info!("rusb backend stopped");
        }
    }
}

impl Drop for RusbBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}
