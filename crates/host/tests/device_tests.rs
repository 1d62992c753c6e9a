//! Context, Device and DeviceHandle Tests
//!
//! Exercises the synchronous half of the library against the in-memory
//! backend.
//!
//! # Test Scenarios
//! - Enumeration and device identity
//! - Descriptor access and endpoint sizes
//! - Interface claiming and configuration
//! - Synchronous control, bulk and interrupt transfers
//! - String descriptors
//! - Close, unplug and context exit
//!
//! Run with: `cargo test -p host --test device_tests`

use common::test_utils::{
    MOCK_BULK_IN, MOCK_BULK_OUT, MOCK_INTERRUPT_IN, MOCK_ISO_IN, MOCK_PRODUCT_ID, MOCK_VENDOR_ID,
    create_device_descriptor, create_mock_config_descriptor, create_mock_device_descriptor,
};
use host::{
    Context, Descriptor, DeviceKey, EndpointBehaviour, Error, LogLevel, MockBackend, MockDevice,
    Payload, StringDescriptor, Transferred, UsbError,
};
use protocol::consts::DT_DEVICE;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const KEY: DeviceKey = DeviceKey { bus: 1, address: 4 };
const TIMEOUT: Duration = Duration::from_millis(500);

fn mock_device() -> MockDevice {
    MockDevice::from_descriptors(
        &create_mock_device_descriptor(),
        &[create_mock_config_descriptor().as_slice()],
    )
    .unwrap()
    .with_string(1, "Acme")
    .with_string(2, "Widget")
    .with_string(3, "Grüße")
}

fn setup() -> (Arc<MockBackend>, Context) {
    let backend = Arc::new(MockBackend::new());
    backend.add_device(KEY, mock_device());
    let context = Context::with_backend(backend.clone());
    (backend, context)
}

// ============================================================================
// Enumeration Tests
// ============================================================================

#[test]
fn test_device_identity_is_stable() {
    let (backend, context) = setup();

    let first = context.get_device_list().unwrap();
    let second = context.get_device_list().unwrap();
    assert_eq!(first.len(), 1);
    assert!(first[0].ptr_eq(&second[0]));
    assert_eq!(first[0].bus_number(), 1);
    assert_eq!(first[0].device_address(), 4);

    // One backend reference per logical device, not per list
    assert_eq!(backend.ref_count(KEY), 1);

    drop(first);
    drop(second);
    assert_eq!(backend.ref_count(KEY), 0);
}

#[test]
fn test_concurrent_enumeration_shares_devices() {
    const THREADS: usize = 8;
    let (backend, context) = setup();
    let start = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let context = context.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                context.get_device_list().unwrap()
            })
        })
        .collect();
    let lists: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    let first = &lists[0][0];
    assert_eq!(first.bus_number(), KEY.bus);
    for list in &lists {
        assert_eq!(list.len(), 1);
        assert!(list[0].ptr_eq(first));
    }
    assert_eq!(backend.ref_count(KEY), 1);

    drop(lists);
    assert_eq!(backend.ref_count(KEY), 0);
}

#[test]
fn test_released_device_is_replaced() {
    let (backend, context) = setup();

    let device = context.get_device_list().unwrap().remove(0);
    device.release();
    assert!(!device.is_valid());
    assert_eq!(device.device_descriptor(), Err(Error::InvalidDevice));
    assert_eq!(backend.ref_count(KEY), 0);

    let fresh = context.get_device_list().unwrap().remove(0);
    assert!(!fresh.ptr_eq(&device));
    assert!(fresh.is_valid());
    assert_eq!(backend.ref_count(KEY), 1);
}

#[test]
fn test_multiple_devices() {
    let (backend, context) = setup();
    let other = DeviceKey::new(2, 7);
    backend.add_device(
        other,
        MockDevice::from_descriptors(
            &create_device_descriptor(0xaaaa, 0xbbbb),
            &[create_mock_config_descriptor().as_slice()],
        )
        .unwrap(),
    );

    let devices = context.get_device_list().unwrap();
    assert_eq!(devices.len(), 2);

    let handle = context.open_device_with_vid_pid(0xaaaa, 0xbbbb).unwrap();
    assert_eq!(handle.device().key(), other);
}

#[test]
fn test_open_device_with_vid_pid_no_match() {
    let (_backend, context) = setup();
    assert_eq!(
        context.open_device_with_vid_pid(0xdead, 0xbeef).unwrap_err(),
        Error::Usb(UsbError::NoDevice)
    );
}

#[test]
fn test_enumeration_error_propagates() {
    let (backend, context) = setup();
    backend.set_enumerate_error(Some(UsbError::Access));

    assert_eq!(
        context.get_device_list().unwrap_err(),
        Error::Usb(UsbError::Access)
    );
    assert_eq!(
        context
            .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
            .unwrap_err(),
        Error::Usb(UsbError::Access)
    );
}

// ============================================================================
// Descriptor Tests
// ============================================================================

#[test]
fn test_device_and_config_descriptors() {
    let (_backend, context) = setup();
    let device = context.get_device_list().unwrap().remove(0);

    let descriptor = device.device_descriptor().unwrap();
    assert_eq!(descriptor.vendor_id, MOCK_VENDOR_ID);
    assert_eq!(descriptor.product_id, MOCK_PRODUCT_ID);
    assert_eq!(descriptor.num_configurations, 1);

    let config = device.active_config_descriptor().unwrap();
    assert_eq!(config.configuration_value, 1);
    assert_eq!(config.interfaces.len(), 2);
    assert_eq!(device.config_descriptor(0).unwrap(), config);
    assert_eq!(device.config_descriptor_by_value(1).unwrap(), config);
    assert_eq!(
        device.config_descriptor(1).unwrap_err(),
        Error::Usb(UsbError::NotFound)
    );
}

#[test]
fn test_endpoint_packet_sizes() {
    let (_backend, context) = setup();
    let device = context.get_device_list().unwrap().remove(0);

    assert_eq!(device.max_packet_size(MOCK_BULK_IN).unwrap(), 512);
    assert_eq!(device.max_packet_size(MOCK_INTERRUPT_IN).unwrap(), 64);
    assert_eq!(device.max_iso_packet_size(MOCK_BULK_IN).unwrap(), 512);
    // 512 bytes, two transactions per microframe
    assert_eq!(device.max_iso_packet_size(MOCK_ISO_IN).unwrap(), 1024);
    assert_eq!(
        device.max_packet_size(0x8f).unwrap_err(),
        Error::Usb(UsbError::NotFound)
    );
}

#[test]
fn test_unconfigured_device_has_no_active_config() {
    let (_backend, context) = setup();
    let device = context.get_device_list().unwrap().remove(0);
    let handle = device.open().unwrap();

    handle.set_configuration(0).unwrap();
    assert_eq!(handle.get_configuration().unwrap(), 0);
    assert_eq!(
        device.active_config_descriptor().unwrap_err(),
        Error::Usb(UsbError::NotFound)
    );
}

#[test]
fn test_get_descriptor_over_control() {
    let (_backend, context) = setup();
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();

    match handle.get_descriptor(DT_DEVICE, 0).unwrap() {
        Descriptor::Device(descriptor) => assert_eq!(descriptor.product_id, MOCK_PRODUCT_ID),
        other => panic!("unexpected descriptor {:?}", other),
    }
}

// ============================================================================
// Interface Tests
// ============================================================================

#[test]
fn test_claim_interface_twice_is_busy() {
    let (backend, context) = setup();
    let device = context.get_device_list().unwrap().remove(0);
    let first = device.open().unwrap();
    let second = device.open().unwrap();

    first.claim_interface(0).unwrap();
    assert!(backend.is_claimed(KEY, 0));
    assert_eq!(
        second.claim_interface(0).unwrap_err(),
        Error::Usb(UsbError::Busy)
    );

    // Closing releases the claim
    first.close();
    second.claim_interface(0).unwrap();
}

#[test]
fn test_alternate_settings() {
    let (backend, context) = setup();
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();

    assert_eq!(
        handle.set_interface_alt_setting(1, 0).unwrap_err(),
        Error::Usb(UsbError::NotFound)
    );
    handle.claim_interface(1).unwrap();
    handle.set_interface_alt_setting(1, 0).unwrap();
    assert_eq!(backend.alt_setting(KEY, 1), 0);
    assert_eq!(
        handle.set_interface_alt_setting(1, 5).unwrap_err(),
        Error::Usb(UsbError::NotFound)
    );
    handle.release_interface(1).unwrap();
}

#[test]
fn test_kernel_driver_detach() {
    let backend = Arc::new(MockBackend::new());
    backend.add_device(KEY, mock_device().with_kernel_driver(0));
    let context = Context::with_backend(backend.clone());
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();

    assert!(handle.kernel_driver_active(0).unwrap());
    assert_eq!(
        handle.claim_interface(0).unwrap_err(),
        Error::Usb(UsbError::Busy)
    );
    handle.detach_kernel_driver(0).unwrap();
    assert!(!handle.kernel_driver_active(0).unwrap());
    handle.claim_interface(0).unwrap();
    handle.release_interface(0).unwrap();
    handle.attach_kernel_driver(0).unwrap();
}

#[test]
fn test_reset_and_clear_halt() {
    let (backend, context) = setup();
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();

    handle.reset_device().unwrap();
    assert_eq!(backend.reset_count(KEY), 1);

    backend.set_endpoint(KEY, MOCK_BULK_IN, EndpointBehaviour::Stall);
    assert_eq!(
        handle
            .bulk_transfer(MOCK_BULK_IN, Payload::Length(8), TIMEOUT)
            .unwrap_err(),
        Error::Usb(UsbError::Pipe)
    );
    handle.clear_halt(MOCK_BULK_IN).unwrap();

    backend.queue(KEY, MOCK_BULK_IN, EndpointBehaviour::Respond(vec![7]));
    let result = handle
        .bulk_transfer(MOCK_BULK_IN, Payload::Length(8), TIMEOUT)
        .unwrap();
    assert_eq!(result.transferred, Transferred::Received(vec![7]));
}

// ============================================================================
// Synchronous Transfer Tests
// ============================================================================

#[test]
fn test_bulk_in_and_out() {
    let (backend, context) = setup();
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();
    handle.claim_interface(0).unwrap();

    let sent = handle
        .bulk_transfer(MOCK_BULK_OUT, Payload::Bytes(b"hello"), TIMEOUT)
        .unwrap();
    assert_eq!(sent.transferred, Transferred::Sent(5));
    assert!(!sent.timed_out);
    assert_eq!(backend.written(KEY, MOCK_BULK_OUT), b"hello");

    backend.queue(KEY, MOCK_BULK_IN, EndpointBehaviour::Respond(vec![1, 2, 3]));
    let received = handle
        .bulk_transfer(MOCK_BULK_IN, Payload::Length(64), TIMEOUT)
        .unwrap();
    assert_eq!(received.transferred, Transferred::Received(vec![1, 2, 3]));
    assert!(!received.timed_out);
}

#[test]
fn test_bulk_timeout_reports_partial_result() {
    let (backend, context) = setup();
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();

    // No script: the IN endpoint never answers
    let result = handle
        .bulk_transfer(MOCK_BULK_IN, Payload::Length(64), Duration::from_millis(20))
        .unwrap();
    assert!(result.timed_out);
    assert!(result.transferred.is_empty());
    assert_eq!(backend.pending_count(), 0);
    assert_eq!(context.pending_transfers(), 0);
}

#[test]
fn test_bulk_overflow_is_error() {
    let (backend, context) = setup();
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();

    backend.queue(KEY, MOCK_BULK_IN, EndpointBehaviour::Respond(vec![0; 10]));
    assert_eq!(
        handle
            .bulk_transfer(MOCK_BULK_IN, Payload::Length(4), TIMEOUT)
            .unwrap_err(),
        Error::Usb(UsbError::Overflow)
    );
}

#[test]
fn test_interrupt_transfer() {
    let (backend, context) = setup();
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();

    backend.queue(
        KEY,
        MOCK_INTERRUPT_IN,
        EndpointBehaviour::Respond(vec![0xaa, 0x55]),
    );
    let result = handle
        .interrupt_transfer(MOCK_INTERRUPT_IN, Payload::Length(64), TIMEOUT)
        .unwrap();
    assert_eq!(result.transferred.into_data(), Some(vec![0xaa, 0x55]));
}

#[test]
fn test_control_transfers() {
    let (backend, context) = setup();
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();

    backend.queue(KEY, 0, EndpointBehaviour::Respond(vec![9, 8, 7]));
    let received = handle
        .control_transfer(0xc0, 0x01, 0, 0, Payload::Length(16), TIMEOUT)
        .unwrap();
    assert_eq!(received, Transferred::Received(vec![9, 8, 7]));

    backend.queue(KEY, 0, EndpointBehaviour::Sink);
    let sent = handle
        .control_transfer(0x40, 0x02, 0x1234, 0, Payload::Bytes(&[1, 2]), TIMEOUT)
        .unwrap();
    assert_eq!(sent, Transferred::Sent(2));
    assert_eq!(backend.written(KEY, 0), vec![1, 2]);

    // Unscripted vendor requests are not supported by the device
    assert_eq!(
        handle
            .control_transfer(0xc0, 0x03, 0, 0, Payload::Length(4), TIMEOUT)
            .unwrap_err(),
        Error::Usb(UsbError::Pipe)
    );
}

#[test]
fn test_control_transfer_timeout_is_error() {
    let (backend, context) = setup();
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();

    backend.queue(KEY, 0, EndpointBehaviour::NoResponse);
    assert_eq!(
        handle
            .control_transfer(0xc0, 0x01, 0, 0, Payload::Length(4), Duration::from_millis(20))
            .unwrap_err(),
        Error::Usb(UsbError::Timeout)
    );
}

// ============================================================================
// String Descriptor Tests
// ============================================================================

#[test]
fn test_string_descriptors() {
    let (_backend, context) = setup();
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();

    assert_eq!(handle.get_string_descriptor_ascii(1).unwrap(), "Acme");
    assert_eq!(handle.get_string_descriptor_utf8(2).unwrap(), "Widget");
    assert_eq!(handle.get_string_descriptor_utf8(3).unwrap(), "Grüße");
    assert_eq!(handle.get_string_descriptor_ascii(3).unwrap(), "Gr??e");

    assert_eq!(
        handle.get_string_descriptor(0, 0).unwrap(),
        StringDescriptor::Languages(vec![0x0409])
    );
    match handle.get_string_descriptor(2, 0x0409).unwrap() {
        StringDescriptor::Text(units) => assert_eq!(String::from_utf16(&units).unwrap(), "Widget"),
        other => panic!("unexpected string descriptor {:?}", other),
    }
}

#[test]
fn test_string_descriptor_errors() {
    let (_backend, context) = setup();
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();

    assert_eq!(
        handle.get_string_descriptor_ascii(0).unwrap_err(),
        Error::Usb(UsbError::InvalidParam)
    );
    // Index without a string stalls
    assert_eq!(
        handle.get_string_descriptor_ascii(9).unwrap_err(),
        Error::Usb(UsbError::Pipe)
    );
}

#[test]
fn test_device_without_languages() {
    let backend = Arc::new(MockBackend::new());
    backend.add_device(KEY, mock_device().with_languages(&[]));
    let context = Context::with_backend(backend);
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();

    assert_eq!(
        handle.get_string_descriptor_utf8(2).unwrap_err(),
        Error::Usb(UsbError::Pipe)
    );
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[test]
fn test_close_twice_is_noop() {
    let (backend, context) = setup();
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();
    assert_eq!(backend.open_handle_count(), 1);

    handle.close();
    handle.close();
    assert!(!handle.is_open());
    assert_eq!(backend.open_handle_count(), 0);
    assert_eq!(handle.claim_interface(0).unwrap_err(), Error::ClosedDevice);
}

#[test]
fn test_dropping_handle_closes_it() {
    let (backend, context) = setup();
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();
    let clone = handle.clone();
    drop(handle);
    assert_eq!(backend.open_handle_count(), 1);
    drop(clone);
    assert_eq!(backend.open_handle_count(), 0);
}

#[test]
fn test_handle_survives_device_release() {
    let (_backend, context) = setup();
    let device = context.get_device_list().unwrap().remove(0);
    let handle = device.open().unwrap();
    device.release();

    assert!(handle.is_open());
    handle.claim_interface(0).unwrap();
}

#[test]
fn test_unplugged_device() {
    let (backend, context) = setup();
    let handle = context
        .open_device_with_vid_pid(MOCK_VENDOR_ID, MOCK_PRODUCT_ID)
        .unwrap();

    backend.unplug(KEY);
    assert_eq!(
        handle.claim_interface(0).unwrap_err(),
        Error::Usb(UsbError::NoDevice)
    );
    assert_eq!(
        handle
            .bulk_transfer(MOCK_BULK_IN, Payload::Length(8), TIMEOUT)
            .unwrap_err(),
        Error::Usb(UsbError::NoDevice)
    );
    assert!(context.get_device_list().unwrap().is_empty());
}

#[test]
fn test_exit_closes_handles() {
    let (backend, context) = setup();
    let device = context.get_device_list().unwrap().remove(0);
    let handle = device.open().unwrap();
    handle.claim_interface(0).unwrap();

    context.exit();
    assert!(!context.is_valid());
    assert!(!handle.is_open());
    assert!(!device.is_valid());
    assert_eq!(backend.open_handle_count(), 0);
    assert!(!backend.is_claimed(KEY, 0));

    assert_eq!(context.get_device_list().unwrap_err(), Error::InvalidContext);
    assert_eq!(handle.claim_interface(0).unwrap_err(), Error::InvalidContext);
    assert_eq!(device.open().unwrap_err(), Error::InvalidContext);

    // Second exit does nothing
    context.exit();
}

#[test]
fn test_set_debug_clamps() {
    let (backend, context) = setup();
    assert_eq!(context.debug_level(), LogLevel::None);

    context.set_debug(2).unwrap();
    assert_eq!(context.debug_level(), LogLevel::Warning);
    assert_eq!(backend.debug_level(), LogLevel::Warning);

    context.set_debug(9).unwrap();
    assert_eq!(context.debug_level(), LogLevel::Debug);

    context.exit();
    assert_eq!(context.set_debug(1).unwrap_err(), Error::InvalidContext);
}
