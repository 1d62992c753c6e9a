//! Human readable rendering of descriptors and data

use protocol::{ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, TransferType};
use std::fmt::Write;

/// `0x0200` as `2.00`
pub fn bcd(value: u16) -> String {
    let major = ((value >> 12) & 0x0f) * 10 + ((value >> 8) & 0x0f);
    format!("{}.{}{}", major, (value >> 4) & 0x0f, value & 0x0f)
}

/// Space separated hex bytes, 16 per line
pub fn hex_dump(data: &[u8]) -> String {
    data.chunks(16)
        .map(|line| {
            line.iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn device_descriptor(descriptor: &DeviceDescriptor) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Device Descriptor:");
    let _ = writeln!(out, "  bcdUSB              {:>6}", bcd(descriptor.usb_version));
    let _ = writeln!(out, "  bDeviceClass        {:>6}", descriptor.device_class);
    let _ = writeln!(out, "  bDeviceSubClass     {:>6}", descriptor.device_sub_class);
    let _ = writeln!(out, "  bDeviceProtocol     {:>6}", descriptor.device_protocol);
    let _ = writeln!(out, "  bMaxPacketSize0     {:>6}", descriptor.max_packet_size_0);
    let _ = writeln!(out, "  idVendor            0x{:04x}", descriptor.vendor_id);
    let _ = writeln!(out, "  idProduct           0x{:04x}", descriptor.product_id);
    let _ = writeln!(out, "  bcdDevice           {:>6}", bcd(descriptor.device_version));
    let _ = writeln!(out, "  iManufacturer       {:>6}", descriptor.manufacturer_index);
    let _ = writeln!(out, "  iProduct            {:>6}", descriptor.product_index);
    let _ = writeln!(out, "  iSerial             {:>6}", descriptor.serial_number_index);
    let _ = writeln!(out, "  bNumConfigurations  {:>6}", descriptor.num_configurations);
    out
}

fn endpoint(out: &mut String, endpoint: &EndpointDescriptor) {
    let kind = match endpoint.transfer_type() {
        TransferType::Control => "Control",
        TransferType::Isochronous => "Isochronous",
        TransferType::Bulk => "Bulk",
        TransferType::Interrupt => "Interrupt",
    };
    let direction = if endpoint.endpoint_address & 0x80 != 0 {
        "IN"
    } else {
        "OUT"
    };
    let _ = writeln!(
        out,
        "      Endpoint 0x{:02x} {} {}: wMaxPacketSize 0x{:04x}, bInterval {}",
        endpoint.endpoint_address, direction, kind, endpoint.max_packet_size, endpoint.interval
    );
}

pub fn config_descriptor(config: &ConfigDescriptor) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Configuration {}:", config.configuration_value);
    let _ = writeln!(out, "  wTotalLength        {:>6}", config.total_length);
    let _ = writeln!(out, "  bNumInterfaces      {:>6}", config.num_interfaces);
    let _ = writeln!(out, "  bmAttributes          0x{:02x}", config.attributes);
    let _ = writeln!(out, "  MaxPower           {:>5}mA", u32::from(config.max_power) * 2);

    for interface in &config.interfaces {
        for alt in &interface.alt_settings {
            let _ = writeln!(
                out,
                "    Interface {} alt {}: class 0x{:02x}/0x{:02x}/0x{:02x}, {} endpoints",
                alt.interface_number,
                alt.alternate_setting,
                alt.interface_class,
                alt.interface_sub_class,
                alt.interface_protocol,
                alt.num_endpoints
            );
            for ep in &alt.endpoints {
                endpoint(&mut out, ep);
            }
        }
    }
    out
}
