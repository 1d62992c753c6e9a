//! Subcommand implementations

use crate::output;
use crate::selector::Selector;
use anyhow::{Context as _, Result};
use host::{Context, Device, DeviceHandle, Payload, Transferred};
use protocol::{ConfigDescriptor, DeviceDescriptor};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
struct DeviceSummary {
    bus: u8,
    address: u8,
    vendor_id: u16,
    product_id: u16,
    class: u8,
    num_configurations: u8,
}

#[derive(Debug, Serialize)]
struct DescriptorReport {
    device: DeviceDescriptor,
    configurations: Vec<ConfigDescriptor>,
}

#[derive(Debug, Default, Serialize)]
struct StringReport {
    manufacturer: Option<String>,
    product: Option<String>,
    serial_number: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransferReport {
    length: usize,
    timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Vec<u8>>,
}

/// Where and how a data transfer happens
#[derive(Debug, Clone, Copy)]
pub struct EndpointTarget {
    pub endpoint: u8,
    pub interface: Option<u8>,
    pub interrupt: bool,
    pub detach: bool,
    pub timeout: Duration,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to encode JSON")?
    );
    Ok(())
}

pub fn list(context: &Context, json: bool) -> Result<()> {
    let mut summaries = Vec::new();
    for device in context.get_device_list()? {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("Skipping {}: {}", device.key(), e);
                continue;
            }
        };
        summaries.push(DeviceSummary {
            bus: device.bus_number(),
            address: device.device_address(),
            vendor_id: descriptor.vendor_id,
            product_id: descriptor.product_id,
            class: descriptor.device_class,
            num_configurations: descriptor.num_configurations,
        });
    }

    if json {
        return print_json(&summaries);
    }
    for summary in &summaries {
        println!(
            "Bus {:03} Device {:03}: ID {:04x}:{:04x} class 0x{:02x}",
            summary.bus, summary.address, summary.vendor_id, summary.product_id, summary.class
        );
    }
    if summaries.is_empty() {
        info!("No USB devices found");
    }
    Ok(())
}

pub fn describe(context: &Context, selector: Selector, json: bool) -> Result<()> {
    let device = selector.find(context)?;
    let descriptor = device
        .device_descriptor()
        .context("Failed to read device descriptor")?;

    let mut configurations = Vec::with_capacity(descriptor.num_configurations as usize);
    for index in 0..descriptor.num_configurations {
        configurations.push(
            device
                .config_descriptor(index)
                .with_context(|| format!("Failed to read configuration {}", index))?,
        );
    }

    if json {
        return print_json(&DescriptorReport {
            device: descriptor,
            configurations,
        });
    }
    print!("{}", output::device_descriptor(&descriptor));
    for config in &configurations {
        print!("{}", output::config_descriptor(config));
    }
    Ok(())
}

fn open(device: &Device) -> Result<DeviceHandle> {
    device
        .open()
        .with_context(|| format!("Failed to open device {}", device.key()))
}

fn read_string(handle: &DeviceHandle, index: u8) -> Option<String> {
    if index == 0 {
        return None;
    }
    match handle.get_string_descriptor_utf8(index) {
        Ok(text) => Some(text),
        Err(e) => {
            debug!("String {} unavailable: {}", index, e);
            None
        }
    }
}

pub fn strings(context: &Context, selector: Selector, json: bool) -> Result<()> {
    let device = selector.find(context)?;
    let descriptor = device.device_descriptor()?;
    let handle = open(&device)?;

    let report = StringReport {
        manufacturer: read_string(&handle, descriptor.manufacturer_index),
        product: read_string(&handle, descriptor.product_index),
        serial_number: read_string(&handle, descriptor.serial_number_index),
    };
    handle.close();

    if json {
        return print_json(&report);
    }
    let show = |label: &str, value: &Option<String>| {
        println!("{:<14}{}", label, value.as_deref().unwrap_or("-"));
    };
    show("Manufacturer:", &report.manufacturer);
    show("Product:", &report.product);
    show("Serial:", &report.serial_number);
    Ok(())
}

/// Setup fields of a control request
#[derive(Debug, Clone, Copy)]
pub struct ControlArgs {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

pub fn control(
    context: &Context,
    selector: Selector,
    args: ControlArgs,
    payload: Payload<'_>,
    timeout: Duration,
    json: bool,
) -> Result<()> {
    let device = selector.find(context)?;
    let handle = open(&device)?;
    let transferred = handle
        .control_transfer(
            args.request_type,
            args.request,
            args.value,
            args.index,
            payload,
            timeout,
        )
        .context("Control transfer failed")?;
    handle.close();

    report(transferred, false, json)
}

fn report(transferred: Transferred, timed_out: bool, json: bool) -> Result<()> {
    let length = transferred.len();
    let data = transferred.into_data();
    if json {
        return print_json(&TransferReport {
            length,
            timed_out,
            data,
        });
    }

    match data {
        Some(bytes) => {
            println!("Received {} bytes{}", length, if timed_out { " (timed out)" } else { "" });
            if !bytes.is_empty() {
                println!("{}", output::hex_dump(&bytes));
            }
        }
        None => println!("Sent {} bytes{}", length, if timed_out { " (timed out)" } else { "" }),
    }
    Ok(())
}

/// Claim the target interface, run `f`, then give the interface back
fn with_interface<T>(
    handle: &DeviceHandle,
    target: &EndpointTarget,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let Some(interface) = target.interface else {
        return f();
    };

    let mut detached = false;
    if target.detach && handle.kernel_driver_active(interface).unwrap_or(false) {
        handle
            .detach_kernel_driver(interface)
            .with_context(|| format!("Failed to detach kernel driver from interface {}", interface))?;
        detached = true;
    }
    handle
        .claim_interface(interface)
        .with_context(|| format!("Failed to claim interface {}", interface))?;

    let result = f();

    if let Err(e) = handle.release_interface(interface) {
        warn!("Failed to release interface {}: {}", interface, e);
    }
    if detached && let Err(e) = handle.attach_kernel_driver(interface) {
        warn!("Failed to reattach kernel driver to interface {}: {}", interface, e);
    }
    result
}

fn data_transfer(
    context: &Context,
    selector: Selector,
    target: EndpointTarget,
    payload: Payload<'_>,
    json: bool,
) -> Result<()> {
    let device = selector.find(context)?;
    let handle = open(&device)?;

    let result = with_interface(&handle, &target, || {
        let result = if target.interrupt {
            handle.interrupt_transfer(target.endpoint, payload, target.timeout)
        } else {
            handle.bulk_transfer(target.endpoint, payload, target.timeout)
        };
        result.with_context(|| format!("Transfer on endpoint 0x{:02x} failed", target.endpoint))
    });
    handle.close();

    let partial = result?;
    report(partial.transferred, partial.timed_out, json)
}

pub fn read(
    context: &Context,
    selector: Selector,
    target: EndpointTarget,
    length: usize,
    json: bool,
) -> Result<()> {
    anyhow::ensure!(
        target.endpoint & 0x80 != 0,
        "Endpoint 0x{:02x} is not an IN endpoint",
        target.endpoint
    );
    data_transfer(context, selector, target, Payload::Length(length), json)
}

pub fn write(
    context: &Context,
    selector: Selector,
    target: EndpointTarget,
    data: &[u8],
    json: bool,
) -> Result<()> {
    anyhow::ensure!(
        target.endpoint & 0x80 == 0,
        "Endpoint 0x{:02x} is not an OUT endpoint",
        target.endpoint
    );
    data_transfer(context, selector, target, Payload::Bytes(data), json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        MOCK_BULK_IN, MOCK_BULK_OUT, create_mock_config_descriptor, create_mock_device_descriptor,
    };
    use host::{DeviceKey, EndpointBehaviour, MockBackend, MockDevice};
    use std::sync::Arc;

    const KEY: DeviceKey = DeviceKey { bus: 1, address: 2 };

    fn setup() -> (Arc<MockBackend>, Context) {
        let backend = Arc::new(MockBackend::new());
        backend.add_device(
            KEY,
            MockDevice::from_descriptors(
                &create_mock_device_descriptor(),
                &[create_mock_config_descriptor().as_slice()],
            )
            .unwrap()
            .with_string(1, "Acme"),
        );
        let context = Context::with_backend(backend.clone());
        (backend, context)
    }

    fn target(endpoint: u8) -> EndpointTarget {
        EndpointTarget {
            endpoint,
            interface: Some(0),
            interrupt: false,
            detach: false,
            timeout: Duration::from_millis(200),
        }
    }

    const SELECTOR: Selector = Selector::Slot { bus: 1, address: 2 };

    #[test]
    fn test_list_and_describe() {
        let (_backend, context) = setup();
        list(&context, true).unwrap();
        describe(&context, SELECTOR, false).unwrap();
        assert!(describe(&context, Selector::Slot { bus: 5, address: 5 }, false).is_err());
    }

    #[test]
    fn test_strings() {
        let (_backend, context) = setup();
        strings(&context, SELECTOR, true).unwrap();
    }

    #[test]
    fn test_write_releases_interface() {
        let (backend, context) = setup();
        write(&context, SELECTOR, target(MOCK_BULK_OUT), b"abc", false).unwrap();
        assert_eq!(backend.written(KEY, MOCK_BULK_OUT), b"abc");
        assert!(!backend.is_claimed(KEY, 0));
    }

    #[test]
    fn test_read() {
        let (backend, context) = setup();
        backend.queue(KEY, MOCK_BULK_IN, EndpointBehaviour::Respond(vec![1, 2]));
        read(&context, SELECTOR, target(MOCK_BULK_IN), 64, true).unwrap();
    }

    #[test]
    fn test_direction_is_checked() {
        let (_backend, context) = setup();
        assert!(read(&context, SELECTOR, target(MOCK_BULK_OUT), 8, false).is_err());
        assert!(write(&context, SELECTOR, target(MOCK_BULK_IN), b"x", false).is_err());
    }

    #[test]
    fn test_stalled_control_request_fails() {
        let (_backend, context) = setup();
        let args = ControlArgs {
            request_type: 0xc0,
            request: 0x01,
            value: 0,
            index: 0,
        };
        let err = control(
            &context,
            SELECTOR,
            args,
            Payload::Length(8),
            Duration::from_millis(100),
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Control transfer failed"));
    }
}
