//! In-memory backend
//!
//! Devices are built from raw descriptor images and behave like simple
//! hardware: endpoint 0 answers the standard GET_DESCRIPTOR and
//! GET_CONFIGURATION requests, other endpoints follow scripted
//! [`EndpointBehaviour`]s. Requests that get no response stay pending until
//! cancelled, closed or unplugged, which makes timeouts and cancellation
//! observable without hardware.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_config_descriptor, create_mock_device_descriptor};
//! use host::{Context, DeviceKey, EndpointBehaviour, MockBackend, MockDevice, Payload};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let backend = Arc::new(MockBackend::new());
//! let key = DeviceKey::new(1, 4);
//! backend.add_device(
//!     key,
//!     MockDevice::from_descriptors(
//!         &create_mock_device_descriptor(),
//!         &[create_mock_config_descriptor().as_slice()],
//!     )
//!     .unwrap(),
//! );
//! backend.queue(key, 0x81, EndpointBehaviour::Respond(vec![1, 2, 3]));
//!
//! let context = Context::with_backend(backend);
//! let handle = context.open_device_with_vid_pid(0x1234, 0x5678).unwrap();
//! let result = handle
//!     .bulk_transfer(0x81, Payload::Length(64), Duration::from_millis(100))
//!     .unwrap();
//! assert_eq!(result.transferred.into_data().unwrap(), vec![1, 2, 3]);
//! ```

use super::{
    Backend, Completion, CompletionSink, DeviceKey, RawHandle, Rejected, SubmitRequest, TransferId,
};
use crate::context::LogLevel;
use crate::lock;
use protocol::consts::{
    DT_CONFIG, DT_DEVICE, DT_STRING, ENDPOINT_IN, REQUEST_GET_CONFIGURATION,
    REQUEST_GET_DESCRIPTOR,
};
use protocol::{
    CONTROL_SETUP_SIZE, ConfigDescriptor, ControlSetup, DescriptorError, DeviceDescriptor,
    Direction, IsoPacketDescriptor, LANGUAGE_ID_EN_US, TransferStatus, TransferType, UsbError,
    encode_language_descriptor, encode_string_descriptor,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tracing::{debug, trace};

/// How an endpoint answers a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointBehaviour {
    /// IN: return these bytes (overflow if the request is shorter)
    Respond(Vec<u8>),
    /// OUT: accept and record everything; IN: zero-length packet
    Sink,
    /// Stall the endpoint
    Stall,
    /// Never complete; the request waits for cancel, close or unplug
    NoResponse,
    /// Complete with this status and no data
    Fail(TransferStatus),
}

/// A simulated device
#[derive(Debug, Clone)]
pub struct MockDevice {
    device_bytes: Vec<u8>,
    config_bytes: Vec<Vec<u8>>,
    descriptor: DeviceDescriptor,
    configs: Vec<ConfigDescriptor>,
    languages: Vec<u16>,
    strings: HashMap<u8, String>,
    kernel_drivers: HashSet<u8>,
}

impl MockDevice {
    /// Build from raw device and configuration descriptor images
    pub fn from_descriptors(
        device: &[u8],
        configs: &[&[u8]],
    ) -> Result<Self, DescriptorError> {
        let descriptor = DeviceDescriptor::parse(device)?;
        let parsed = configs
            .iter()
            .map(|bytes| ConfigDescriptor::parse(bytes))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            device_bytes: device.to_vec(),
            config_bytes: configs.iter().map(|bytes| bytes.to_vec()).collect(),
            descriptor,
            configs: parsed,
            languages: vec![LANGUAGE_ID_EN_US],
            strings: HashMap::new(),
            kernel_drivers: HashSet::new(),
        })
    }

    pub fn with_string(mut self, index: u8, text: &str) -> Self {
        self.strings.insert(index, text.to_string());
        self
    }

    /// Replace the language table; an empty table stalls string index 0
    pub fn with_languages(mut self, languages: &[u16]) -> Self {
        self.languages = languages.to_vec();
        self
    }

    pub fn with_kernel_driver(mut self, interface: u8) -> Self {
        self.kernel_drivers.insert(interface);
        self
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Answer to a standard GET_DESCRIPTOR, `None` stalls
    fn descriptor_bytes(&self, descriptor_type: u8, index: u8) -> Option<Vec<u8>> {
        match descriptor_type {
            DT_DEVICE => Some(self.device_bytes.clone()),
            DT_CONFIG => self.config_bytes.get(index as usize).cloned(),
            DT_STRING if index == 0 => {
                (!self.languages.is_empty()).then(|| encode_language_descriptor(&self.languages))
            }
            DT_STRING => self.strings.get(&index).map(|s| encode_string_descriptor(s)),
            _ => None,
        }
    }
}

struct DeviceState {
    device: MockDevice,
    connected: bool,
    refs: usize,
    active_config: u8,
    claims: HashMap<u8, RawHandle>,
    alt_settings: HashMap<u8, u8>,
    kernel_drivers: HashSet<u8>,
    reset_count: usize,
    scripted: HashMap<u8, VecDeque<EndpointBehaviour>>,
    persistent: HashMap<u8, EndpointBehaviour>,
    written: HashMap<u8, Vec<u8>>,
}

impl DeviceState {
    fn active_config(&self) -> Option<&ConfigDescriptor> {
        self.device
            .configs
            .iter()
            .find(|c| c.configuration_value == self.active_config)
    }

    fn has_interface(&self, interface: u8) -> bool {
        self.active_config().is_some_and(|config| {
            config
                .interfaces
                .iter()
                .flat_map(|i| &i.alt_settings)
                .any(|alt| alt.interface_number == interface)
        })
    }

    fn has_alt_setting(&self, interface: u8, alt_setting: u8) -> bool {
        self.active_config().is_some_and(|config| {
            config
                .interfaces
                .iter()
                .flat_map(|i| &i.alt_settings)
                .any(|alt| alt.interface_number == interface && alt.alternate_setting == alt_setting)
        })
    }

    /// Next behaviour for `endpoint`: one-shot scripts first, then the
    /// persistent setting
    fn behaviour(&mut self, endpoint: u8) -> Option<EndpointBehaviour> {
        if let Some(next) = self.scripted.get_mut(&endpoint).and_then(VecDeque::pop_front) {
            return Some(next);
        }
        self.persistent.get(&endpoint).cloned()
    }
}

struct Pending {
    request: SubmitRequest,
    sink: CompletionSink,
}

#[derive(Default)]
struct State {
    devices: BTreeMap<DeviceKey, DeviceState>,
    handles: HashMap<RawHandle, DeviceKey>,
    next_handle: u64,
    pending: Vec<Pending>,
    enumerate_error: Option<UsbError>,
    debug: LogLevel,
}

impl State {
    fn device(&self, key: DeviceKey) -> Result<&DeviceState, UsbError> {
        match self.devices.get(&key) {
            Some(device) if device.connected => Ok(device),
            _ => Err(UsbError::NoDevice),
        }
    }

    fn handle_device(&mut self, handle: RawHandle) -> Result<(DeviceKey, &mut DeviceState), UsbError> {
        let key = *self.handles.get(&handle).ok_or(UsbError::NotFound)?;
        match self.devices.get_mut(&key) {
            Some(device) if device.connected => Ok((key, device)),
            _ => Err(UsbError::NoDevice),
        }
    }

    /// Remove pending requests matching `filter`
    fn take_pending(&mut self, filter: impl Fn(&SubmitRequest) -> bool) -> Vec<Pending> {
        let (taken, kept) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| filter(&p.request));
        self.pending = kept;
        taken
    }
}

/// Backend simulating devices in memory
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<State>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a device at `key`
    pub fn add_device(&self, key: DeviceKey, device: MockDevice) {
        let active_config = device
            .configs
            .first()
            .map_or(0, |config| config.configuration_value);
        let kernel_drivers = device.kernel_drivers.clone();
        lock(&self.state).devices.insert(
            key,
            DeviceState {
                device,
                connected: true,
                refs: 0,
                active_config,
                claims: HashMap::new(),
                alt_settings: HashMap::new(),
                kernel_drivers,
                reset_count: 0,
                scripted: HashMap::new(),
                persistent: HashMap::new(),
                written: HashMap::new(),
            },
        );
    }

    /// Disconnect a device; its outstanding requests complete with `NoDevice`
    pub fn unplug(&self, key: DeviceKey) {
        let completed = {
            let mut state = lock(&self.state);
            let Some(device) = state.devices.get_mut(&key) else {
                return;
            };
            device.connected = false;
            let handles: HashSet<RawHandle> = state
                .handles
                .iter()
                .filter(|(_, k)| **k == key)
                .map(|(h, _)| *h)
                .collect();
            state.take_pending(|r| handles.contains(&r.handle))
        };
        debug!("Unplugged mock device {}", key);
        for pending in completed {
            pending
                .sink
                .complete(pending.request.into_completion(TransferStatus::NoDevice));
        }
    }

    /// Queue a one-shot behaviour for the next request on `endpoint`
    pub fn queue(&self, key: DeviceKey, endpoint: u8, behaviour: EndpointBehaviour) {
        if let Some(device) = lock(&self.state).devices.get_mut(&key) {
            device
                .scripted
                .entry(endpoint)
                .or_default()
                .push_back(behaviour);
        }
    }

    /// Set how `endpoint` answers once its queued scripts are used up
    pub fn set_endpoint(&self, key: DeviceKey, endpoint: u8, behaviour: EndpointBehaviour) {
        if let Some(device) = lock(&self.state).devices.get_mut(&key) {
            device.persistent.insert(endpoint, behaviour);
        }
    }

    /// Everything written to `endpoint` so far
    pub fn written(&self, key: DeviceKey, endpoint: u8) -> Vec<u8> {
        lock(&self.state)
            .devices
            .get(&key)
            .and_then(|d| d.written.get(&endpoint).cloned())
            .unwrap_or_default()
    }

    /// Logical device references currently held for `key`
    pub fn ref_count(&self, key: DeviceKey) -> usize {
        lock(&self.state).devices.get(&key).map_or(0, |d| d.refs)
    }

    /// Requests waiting for a response
    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn open_handle_count(&self) -> usize {
        lock(&self.state).handles.len()
    }

    /// Make enumeration fail with `error`
    pub fn set_enumerate_error(&self, error: Option<UsbError>) {
        lock(&self.state).enumerate_error = error;
    }

    pub fn is_claimed(&self, key: DeviceKey, interface: u8) -> bool {
        lock(&self.state)
            .devices
            .get(&key)
            .is_some_and(|d| d.claims.contains_key(&interface))
    }

    pub fn alt_setting(&self, key: DeviceKey, interface: u8) -> u8 {
        lock(&self.state)
            .devices
            .get(&key)
            .and_then(|d| d.alt_settings.get(&interface).copied())
            .unwrap_or(0)
    }

    pub fn reset_count(&self, key: DeviceKey) -> usize {
        lock(&self.state).devices.get(&key).map_or(0, |d| d.reset_count)
    }

    pub fn debug_level(&self) -> LogLevel {
        lock(&self.state).debug
    }
}

/// What the simulated device does with a request
enum Outcome {
    Complete(Completion),
    Park(SubmitRequest),
}

fn complete_with(request: SubmitRequest, status: TransferStatus, actual_length: usize) -> Outcome {
    let mut completion = request.into_completion(status);
    completion.actual_length = actual_length;
    Outcome::Complete(completion)
}

/// Copy `data` after the setup packet, bounded by wLength
fn respond_control(mut request: SubmitRequest, data: &[u8]) -> Outcome {
    let capacity = request.length.saturating_sub(CONTROL_SETUP_SIZE);
    let count = data.len().min(capacity);
    request.buffer[CONTROL_SETUP_SIZE..CONTROL_SETUP_SIZE + count].copy_from_slice(&data[..count]);
    complete_with(request, TransferStatus::Completed, count)
}

fn run_control(device: &mut DeviceState, request: SubmitRequest) -> Outcome {
    let Ok(setup) = ControlSetup::decode(&request.buffer) else {
        return complete_with(request, TransferStatus::Error, 0);
    };

    if setup.request_type == ENDPOINT_IN && setup.request == REQUEST_GET_DESCRIPTOR {
        let descriptor_type = (setup.value >> 8) as u8;
        let index = (setup.value & 0xff) as u8;
        return match device.device.descriptor_bytes(descriptor_type, index) {
            Some(bytes) => respond_control(request, &bytes),
            None => complete_with(request, TransferStatus::Stall, 0),
        };
    }
    if setup.request_type == ENDPOINT_IN && setup.request == REQUEST_GET_CONFIGURATION {
        let value = [device.active_config];
        return respond_control(request, &value);
    }

    match device.behaviour(0).unwrap_or(EndpointBehaviour::Stall) {
        EndpointBehaviour::Respond(data) if setup.is_in() => respond_control(request, &data),
        EndpointBehaviour::Respond(_) | EndpointBehaviour::Sink => {
            let stage = request.length.saturating_sub(CONTROL_SETUP_SIZE);
            if !setup.is_in() {
                device
                    .written
                    .entry(0)
                    .or_default()
                    .extend_from_slice(&request.buffer[CONTROL_SETUP_SIZE..CONTROL_SETUP_SIZE + stage]);
                complete_with(request, TransferStatus::Completed, stage)
            } else {
                complete_with(request, TransferStatus::Completed, 0)
            }
        }
        EndpointBehaviour::Stall => complete_with(request, TransferStatus::Stall, 0),
        EndpointBehaviour::NoResponse => Outcome::Park(request),
        EndpointBehaviour::Fail(status) => complete_with(request, status, 0),
    }
}

fn run_data(device: &mut DeviceState, mut request: SubmitRequest) -> Outcome {
    let direction = Direction::from_bits(request.endpoint);
    let behaviour = device.behaviour(request.endpoint).unwrap_or(match direction {
        Direction::In => EndpointBehaviour::NoResponse,
        Direction::Out => EndpointBehaviour::Sink,
    });

    match behaviour {
        EndpointBehaviour::Respond(data) if direction == Direction::In => {
            if request.kind == TransferType::Isochronous {
                return respond_iso(request, &data);
            }
            let count = data.len().min(request.length);
            request.buffer[..count].copy_from_slice(&data[..count]);
            let status = if data.len() > request.length {
                TransferStatus::Overflow
            } else {
                TransferStatus::Completed
            };
            complete_with(request, status, count)
        }
        EndpointBehaviour::Respond(_) | EndpointBehaviour::Sink => {
            if direction == Direction::In {
                return complete_with(request, TransferStatus::Completed, 0);
            }
            device
                .written
                .entry(request.endpoint)
                .or_default()
                .extend_from_slice(&request.buffer[..request.length]);
            if request.kind == TransferType::Isochronous {
                let mut completion = request.into_completion(TransferStatus::Completed);
                for packet in &mut completion.iso_packets {
                    packet.actual_length = packet.length;
                }
                completion.actual_length = completion
                    .iso_packets
                    .iter()
                    .map(|p| p.actual_length as usize)
                    .sum();
                return Outcome::Complete(completion);
            }
            let length = request.length;
            complete_with(request, TransferStatus::Completed, length)
        }
        EndpointBehaviour::Stall => complete_with(request, TransferStatus::Stall, 0),
        EndpointBehaviour::NoResponse => Outcome::Park(request),
        EndpointBehaviour::Fail(status) => complete_with(request, status, 0),
    }
}

/// Spread `data` over the requested packets in order
fn respond_iso(mut request: SubmitRequest, data: &[u8]) -> Outcome {
    let mut packets = Vec::with_capacity(request.iso_packet_lengths.len());
    let mut offset = 0usize;
    let mut consumed = 0usize;

    for &length in &request.iso_packet_lengths {
        let length = length as usize;
        let available = request.buffer.len().saturating_sub(offset);
        let count = length.min(data.len() - consumed).min(available);
        if count > 0 {
            request.buffer[offset..offset + count]
                .copy_from_slice(&data[consumed..consumed + count]);
        }
        packets.push(IsoPacketDescriptor {
            length: length as u32,
            actual_length: count as u32,
            status: TransferStatus::Completed,
        });
        offset += length;
        consumed += count;
    }

    Outcome::Complete(Completion {
        id: request.id,
        status: TransferStatus::Completed,
        actual_length: consumed,
        buffer: request.buffer,
        iso_packets: packets,
    })
}

impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn enumerate(&self) -> Result<Vec<DeviceKey>, UsbError> {
        let state = lock(&self.state);
        if let Some(error) = state.enumerate_error {
            return Err(error);
        }
        Ok(state
            .devices
            .iter()
            .filter(|(_, d)| d.connected)
            .map(|(key, _)| *key)
            .collect())
    }

    fn ref_device(&self, key: DeviceKey) {
        if let Some(device) = lock(&self.state).devices.get_mut(&key) {
            device.refs += 1;
        }
    }

    fn unref_device(&self, key: DeviceKey) {
        if let Some(device) = lock(&self.state).devices.get_mut(&key) {
            device.refs = device.refs.saturating_sub(1);
        }
    }

    fn device_descriptor(&self, key: DeviceKey) -> Result<DeviceDescriptor, UsbError> {
        Ok(lock(&self.state).device(key)?.device.descriptor.clone())
    }

    fn config_descriptor(&self, key: DeviceKey, index: u8) -> Result<ConfigDescriptor, UsbError> {
        lock(&self.state)
            .device(key)?
            .device
            .configs
            .get(index as usize)
            .cloned()
            .ok_or(UsbError::NotFound)
    }

    fn active_config_value(&self, key: DeviceKey) -> Result<u8, UsbError> {
        Ok(lock(&self.state).device(key)?.active_config)
    }

    fn open(&self, key: DeviceKey) -> Result<RawHandle, UsbError> {
        let mut state = lock(&self.state);
        state.device(key)?;
        state.next_handle += 1;
        let handle = RawHandle(state.next_handle);
        state.handles.insert(handle, key);
        debug!("Mock device {} opened as {:?}", key, handle);
        Ok(handle)
    }

    fn close(&self, handle: RawHandle) {
        let cancelled = {
            let mut state = lock(&self.state);
            if let Some(key) = state.handles.remove(&handle)
                && let Some(device) = state.devices.get_mut(&key)
            {
                device.claims.retain(|_, owner| *owner != handle);
            }
            state.take_pending(|r| r.handle == handle)
        };
        for pending in cancelled {
            pending
                .sink
                .complete(pending.request.into_completion(TransferStatus::Cancelled));
        }
    }

    fn get_configuration(&self, handle: RawHandle) -> Result<u8, UsbError> {
        let mut state = lock(&self.state);
        Ok(state.handle_device(handle)?.1.active_config)
    }

    fn set_configuration(&self, handle: RawHandle, value: u8) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        let (_, device) = state.handle_device(handle)?;
        if !device.claims.is_empty() {
            return Err(UsbError::Busy);
        }
        if value != 0 && !device.device.configs.iter().any(|c| c.configuration_value == value) {
            return Err(UsbError::NotFound);
        }
        device.active_config = value;
        device.alt_settings.clear();
        Ok(())
    }

    fn claim_interface(&self, handle: RawHandle, interface: u8) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        let (_, device) = state.handle_device(handle)?;
        if !device.has_interface(interface) {
            return Err(UsbError::NotFound);
        }
        if device.kernel_drivers.contains(&interface) {
            return Err(UsbError::Busy);
        }
        match device.claims.get(&interface) {
            Some(owner) if *owner != handle => Err(UsbError::Busy),
            _ => {
                device.claims.insert(interface, handle);
                Ok(())
            }
        }
    }

    fn release_interface(&self, handle: RawHandle, interface: u8) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        let (_, device) = state.handle_device(handle)?;
        match device.claims.get(&interface) {
            Some(owner) if *owner == handle => {
                device.claims.remove(&interface);
                device.alt_settings.remove(&interface);
                Ok(())
            }
            _ => Err(UsbError::NotFound),
        }
    }

    fn set_interface_alt_setting(
        &self,
        handle: RawHandle,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        let (_, device) = state.handle_device(handle)?;
        if device.claims.get(&interface) != Some(&handle) {
            return Err(UsbError::NotFound);
        }
        if !device.has_alt_setting(interface, alt_setting) {
            return Err(UsbError::NotFound);
        }
        device.alt_settings.insert(interface, alt_setting);
        Ok(())
    }

    fn clear_halt(&self, handle: RawHandle, endpoint: u8) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        let (_, device) = state.handle_device(handle)?;
        if device
            .active_config()
            .and_then(|c| c.find_endpoint(endpoint))
            .is_none()
        {
            return Err(UsbError::NotFound);
        }
        if device.persistent.get(&endpoint) == Some(&EndpointBehaviour::Stall) {
            device.persistent.remove(&endpoint);
        }
        Ok(())
    }

    fn reset_device(&self, handle: RawHandle) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        let (_, device) = state.handle_device(handle)?;
        device.reset_count += 1;
        Ok(())
    }

    fn kernel_driver_active(&self, handle: RawHandle, interface: u8) -> Result<bool, UsbError> {
        let mut state = lock(&self.state);
        let (_, device) = state.handle_device(handle)?;
        Ok(device.kernel_drivers.contains(&interface))
    }

    fn detach_kernel_driver(&self, handle: RawHandle, interface: u8) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        let (_, device) = state.handle_device(handle)?;
        if device.kernel_drivers.remove(&interface) {
            Ok(())
        } else {
            Err(UsbError::NotFound)
        }
    }

    fn attach_kernel_driver(&self, handle: RawHandle, interface: u8) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        let (_, device) = state.handle_device(handle)?;
        if !device.has_interface(interface) {
            return Err(UsbError::NotFound);
        }
        if device.claims.contains_key(&interface) || !device.kernel_drivers.insert(interface) {
            return Err(UsbError::Busy);
        }
        Ok(())
    }

    fn submit(&self, request: SubmitRequest, sink: CompletionSink) -> Result<(), Rejected> {
        let outcome = {
            let mut state = lock(&self.state);
            let device = match state.handle_device(request.handle) {
                Ok((_, device)) => device,
                Err(error) => return Err(Rejected::new(error, request)),
            };
            trace!(
                "Mock submit {} on endpoint {:#04x}",
                request.id, request.endpoint
            );
            let outcome = match request.kind {
                TransferType::Control => run_control(device, request),
                _ => run_data(device, request),
            };
            match outcome {
                Outcome::Park(request) => {
                    state.pending.push(Pending { request, sink });
                    return Ok(());
                }
                Outcome::Complete(completion) => completion,
            }
        };
        sink.complete(outcome);
        Ok(())
    }

    fn cancel(&self, id: TransferId) -> Result<(), UsbError> {
        let cancelled = lock(&self.state).take_pending(|r| r.id == id);
        if cancelled.is_empty() {
            return Err(UsbError::NotFound);
        }
        for pending in cancelled {
            pending
                .sink
                .complete(pending.request.into_completion(TransferStatus::Cancelled));
        }
        Ok(())
    }

    fn set_debug(&self, level: LogLevel) {
        lock(&self.state).debug = level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        create_mock_config_descriptor, create_mock_device_descriptor, MOCK_BULK_IN,
    };

    fn device() -> MockDevice {
        MockDevice::from_descriptors(
            &create_mock_device_descriptor(),
            &[create_mock_config_descriptor().as_slice()],
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_bad_descriptor() {
        assert!(MockDevice::from_descriptors(&[0x12, 0x01], &[]).is_err());
    }

    #[test]
    fn test_enumerate_skips_unplugged() {
        let backend = MockBackend::new();
        backend.add_device(DeviceKey::new(1, 2), device());
        backend.add_device(DeviceKey::new(1, 3), device());
        backend.unplug(DeviceKey::new(1, 2));
        assert_eq!(backend.enumerate().unwrap(), vec![DeviceKey::new(1, 3)]);
    }

    #[test]
    fn test_enumerate_error() {
        let backend = MockBackend::new();
        backend.set_enumerate_error(Some(UsbError::Access));
        assert_eq!(backend.enumerate().unwrap_err(), UsbError::Access);
    }

    #[test]
    fn test_claims_are_per_device() {
        let backend = MockBackend::new();
        let key = DeviceKey::new(1, 2);
        backend.add_device(key, device());
        let first = backend.open(key).unwrap();
        let second = backend.open(key).unwrap();

        backend.claim_interface(first, 0).unwrap();
        assert_eq!(backend.claim_interface(second, 0), Err(UsbError::Busy));
        assert_eq!(backend.claim_interface(first, 7), Err(UsbError::NotFound));
        assert_eq!(backend.release_interface(second, 0), Err(UsbError::NotFound));

        backend.close(first);
        assert!(!backend.is_claimed(key, 0));
        backend.claim_interface(second, 0).unwrap();
    }

    #[test]
    fn test_kernel_driver_flags() {
        let backend = MockBackend::new();
        let key = DeviceKey::new(2, 1);
        backend.add_device(key, device().with_kernel_driver(0));
        let handle = backend.open(key).unwrap();

        assert!(backend.kernel_driver_active(handle, 0).unwrap());
        assert_eq!(backend.claim_interface(handle, 0), Err(UsbError::Busy));
        backend.detach_kernel_driver(handle, 0).unwrap();
        assert_eq!(backend.detach_kernel_driver(handle, 0), Err(UsbError::NotFound));
        backend.attach_kernel_driver(handle, 0).unwrap();
        assert_eq!(backend.attach_kernel_driver(handle, 0), Err(UsbError::Busy));
    }

    #[test]
    fn test_set_configuration_while_claimed() {
        let backend = MockBackend::new();
        let key = DeviceKey::new(1, 2);
        backend.add_device(key, device());
        let handle = backend.open(key).unwrap();
        backend.claim_interface(handle, 1).unwrap();
        assert_eq!(backend.set_configuration(handle, 1), Err(UsbError::Busy));
        backend.release_interface(handle, 1).unwrap();
        backend.set_configuration(handle, 0).unwrap();
        assert_eq!(backend.get_configuration(handle).unwrap(), 0);
        assert_eq!(backend.set_configuration(handle, 9), Err(UsbError::NotFound));
    }

    #[test]
    fn test_clear_halt_unknown_endpoint() {
        let backend = MockBackend::new();
        let key = DeviceKey::new(1, 2);
        backend.add_device(key, device());
        let handle = backend.open(key).unwrap();
        backend.clear_halt(handle, MOCK_BULK_IN).unwrap();
        assert_eq!(backend.clear_halt(handle, 0x8f), Err(UsbError::NotFound));
    }

    #[test]
    fn test_cancel_unknown_request() {
        assert_eq!(
            MockBackend::new().cancel(TransferId(99)),
            Err(UsbError::NotFound)
        );
    }

    #[test]
    fn test_operations_after_unplug() {
        let backend = MockBackend::new();
        let key = DeviceKey::new(1, 2);
        backend.add_device(key, device());
        let handle = backend.open(key).unwrap();
        backend.unplug(key);
        assert_eq!(backend.claim_interface(handle, 0), Err(UsbError::NoDevice));
        assert_eq!(backend.open(key), Err(UsbError::NoDevice));
    }
}
