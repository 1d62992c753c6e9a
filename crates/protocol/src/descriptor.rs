//! USB descriptor codec
//!
//! Decodes the fixed-layout descriptors of chapter 9 of the USB 2.0
//! specification from raw byte images, and encodes them back for tests and
//! in-memory devices.
//!
//! Decoding never trusts a length field beyond the received byte count: the
//! walk over a configuration is bounded by `min(wTotalLength, buffer length)`
//! and stops at the first nested descriptor whose `bLength` overruns it.

use crate::consts::{
    DT_CONFIG, DT_CONFIG_SIZE, DT_DEVICE, DT_DEVICE_SIZE, DT_ENDPOINT, DT_ENDPOINT_AUDIO_SIZE,
    DT_ENDPOINT_SIZE, DT_INTERFACE, DT_INTERFACE_SIZE, DT_STRING, ENDPOINT_ADDRESS_MASK,
};
use crate::error::{DescriptorError, Result};
use crate::strings::string_descriptor_units;
use crate::types::{Direction, TransferType};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Standard device descriptor (18 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// bcdUSB
    pub usb_version: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    /// bMaxPacketSize0
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

/// Configuration descriptor with its nested interfaces
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// wTotalLength as reported by the device
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration_index: u8,
    pub attributes: u8,
    /// bMaxPower in 2 mA units
    pub max_power: u8,
    /// Interfaces in the order they appear, each with its alternate settings
    pub interfaces: Vec<Interface>,
    /// Class or vendor specific descriptors preceding the first interface
    pub extra: Vec<u8>,
}

/// All alternate settings sharing one bInterfaceNumber
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interface {
    pub alt_settings: Vec<InterfaceDescriptor>,
}

/// Interface descriptor (one alternate setting)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
    pub interface_index: u8,
    pub endpoints: Vec<EndpointDescriptor>,
    /// Class specific descriptors between this interface and its first endpoint
    pub extra: Vec<u8>,
}

/// Endpoint descriptor (7 bytes, or 9 with the audio extension)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    /// Audio extension: bRefresh
    pub refresh: Option<u8>,
    /// Audio extension: bSynchAddress
    pub synch_address: Option<u8>,
    /// Class specific descriptors following this endpoint
    pub extra: Vec<u8>,
}

/// Any descriptor returned by a GET_DESCRIPTOR request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Descriptor {
    Device(DeviceDescriptor),
    Configuration(ConfigDescriptor),
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    /// UTF-16 code units (or language ids for string index 0)
    String(Vec<u16>),
    /// Unknown type, raw bytes bounded by bLength
    Other { descriptor_type: u8, data: Vec<u8> },
}

/// Validate the two-byte header and the fixed layout size
fn check_header(bytes: &[u8], expected_type: u8, fixed_size: usize) -> Result<()> {
    if bytes.len() < fixed_size {
        return Err(DescriptorError::Truncated {
            needed: fixed_size,
            available: bytes.len(),
        });
    }
    if bytes[1] != expected_type {
        return Err(DescriptorError::UnexpectedType {
            expected: expected_type,
            found: bytes[1],
        });
    }
    if (bytes[0] as usize) < fixed_size {
        return Err(DescriptorError::InvalidLength { length: bytes[0] });
    }
    Ok(())
}

impl DeviceDescriptor {
    /// Decode a device descriptor
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, DT_DEVICE, DT_DEVICE_SIZE)?;
        Ok(Self {
            length: bytes[0],
            descriptor_type: bytes[1],
            usb_version: LittleEndian::read_u16(&bytes[2..4]),
            device_class: bytes[4],
            device_sub_class: bytes[5],
            device_protocol: bytes[6],
            max_packet_size_0: bytes[7],
            vendor_id: LittleEndian::read_u16(&bytes[8..10]),
            product_id: LittleEndian::read_u16(&bytes[10..12]),
            device_version: LittleEndian::read_u16(&bytes[12..14]),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_number_index: bytes[16],
            num_configurations: bytes[17],
        })
    }

    /// Encode into the 18-byte wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; DT_DEVICE_SIZE];
        out[0] = DT_DEVICE_SIZE as u8;
        out[1] = DT_DEVICE;
        LittleEndian::write_u16(&mut out[2..4], self.usb_version);
        out[4] = self.device_class;
        out[5] = self.device_sub_class;
        out[6] = self.device_protocol;
        out[7] = self.max_packet_size_0;
        LittleEndian::write_u16(&mut out[8..10], self.vendor_id);
        LittleEndian::write_u16(&mut out[10..12], self.product_id);
        LittleEndian::write_u16(&mut out[12..14], self.device_version);
        out[14] = self.manufacturer_index;
        out[15] = self.product_index;
        out[16] = self.serial_number_index;
        out[17] = self.num_configurations;
        out
    }

    /// Manufacturer string index, if the device has one
    pub fn manufacturer_string_index(&self) -> Option<u8> {
        (self.manufacturer_index != 0).then_some(self.manufacturer_index)
    }

    /// Product string index, if the device has one
    pub fn product_string_index(&self) -> Option<u8> {
        (self.product_index != 0).then_some(self.product_index)
    }

    /// Serial number string index, if the device has one
    pub fn serial_number_string_index(&self) -> Option<u8> {
        (self.serial_number_index != 0).then_some(self.serial_number_index)
    }
}

impl InterfaceDescriptor {
    /// Decode a single interface descriptor (without endpoints)
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, DT_INTERFACE, DT_INTERFACE_SIZE)?;
        Ok(Self {
            length: bytes[0],
            descriptor_type: bytes[1],
            interface_number: bytes[2],
            alternate_setting: bytes[3],
            num_endpoints: bytes[4],
            interface_class: bytes[5],
            interface_sub_class: bytes[6],
            interface_protocol: bytes[7],
            interface_index: bytes[8],
            endpoints: Vec::new(),
            extra: Vec::new(),
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[
            DT_INTERFACE_SIZE as u8,
            DT_INTERFACE,
            self.interface_number,
            self.alternate_setting,
            self.endpoints.len() as u8,
            self.interface_class,
            self.interface_sub_class,
            self.interface_protocol,
            self.interface_index,
        ]);
        out.extend_from_slice(&self.extra);
        for endpoint in &self.endpoints {
            endpoint.write_to(out);
        }
    }
}

impl EndpointDescriptor {
    /// Decode a single endpoint descriptor
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, DT_ENDPOINT, DT_ENDPOINT_SIZE)?;
        let audio = bytes[0] as usize >= DT_ENDPOINT_AUDIO_SIZE
            && bytes.len() >= DT_ENDPOINT_AUDIO_SIZE;
        Ok(Self {
            length: bytes[0],
            descriptor_type: bytes[1],
            endpoint_address: bytes[2],
            attributes: bytes[3],
            max_packet_size: LittleEndian::read_u16(&bytes[4..6]),
            interval: bytes[6],
            refresh: audio.then(|| bytes[7]),
            synch_address: audio.then(|| bytes[8]),
            extra: Vec::new(),
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        let audio = self.refresh.is_some() || self.synch_address.is_some();
        let size = if audio {
            DT_ENDPOINT_AUDIO_SIZE
        } else {
            DT_ENDPOINT_SIZE
        };
        out.extend_from_slice(&[
            size as u8,
            DT_ENDPOINT,
            self.endpoint_address,
            self.attributes,
        ]);
        out.extend_from_slice(&self.max_packet_size.to_le_bytes());
        out.push(self.interval);
        if audio {
            out.push(self.refresh.unwrap_or(0));
            out.push(self.synch_address.unwrap_or(0));
        }
        out.extend_from_slice(&self.extra);
    }

    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.endpoint_address & ENDPOINT_ADDRESS_MASK
    }

    /// Endpoint direction
    pub fn direction(&self) -> Direction {
        Direction::from_bits(self.endpoint_address)
    }

    /// Endpoint transfer type
    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.attributes)
    }
}

/// Where class specific bytes encountered during the walk belong
enum ExtraOwner {
    Config,
    Interface,
    Endpoint,
}

impl ConfigDescriptor {
    /// Decode a configuration descriptor and everything nested in it
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, DT_CONFIG, DT_CONFIG_SIZE)?;

        let total_length = LittleEndian::read_u16(&bytes[2..4]);
        let mut config = Self {
            length: bytes[0],
            descriptor_type: bytes[1],
            total_length,
            num_interfaces: bytes[4],
            configuration_value: bytes[5],
            configuration_index: bytes[6],
            attributes: bytes[7],
            max_power: bytes[8],
            interfaces: Vec::new(),
            extra: Vec::new(),
        };

        let end = (total_length as usize).min(bytes.len());
        let mut offset = config.length as usize;
        let mut owner = ExtraOwner::Config;

        while offset + 2 <= end {
            let length = bytes[offset] as usize;
            if length < 2 {
                return Err(DescriptorError::InvalidLength {
                    length: bytes[offset],
                });
            }
            if offset + length > end {
                // Device claims more than it delivered; keep what was decoded.
                break;
            }
            let raw = &bytes[offset..offset + length];

            match raw[1] {
                DT_INTERFACE if length >= DT_INTERFACE_SIZE => {
                    let alt = InterfaceDescriptor::parse(raw)?;
                    match config.interfaces.last_mut() {
                        Some(last)
                            if last.alt_settings.first().map(|a| a.interface_number)
                                == Some(alt.interface_number) =>
                        {
                            last.alt_settings.push(alt);
                        }
                        _ => config.interfaces.push(Interface {
                            alt_settings: vec![alt],
                        }),
                    }
                    owner = ExtraOwner::Interface;
                }
                DT_ENDPOINT if length >= DT_ENDPOINT_SIZE => {
                    let endpoint = EndpointDescriptor::parse(raw)?;
                    match current_alt_setting(&mut config) {
                        Some(alt) => {
                            alt.endpoints.push(endpoint);
                            owner = ExtraOwner::Endpoint;
                        }
                        None => config.extra.extend_from_slice(raw),
                    }
                }
                DT_CONFIG | DT_DEVICE => {
                    return Err(DescriptorError::Malformed(format!(
                        "unexpected descriptor type {:#04x} inside configuration",
                        raw[1]
                    )));
                }
                _ => match owner {
                    ExtraOwner::Config => config.extra.extend_from_slice(raw),
                    ExtraOwner::Interface => {
                        if let Some(alt) = current_alt_setting(&mut config) {
                            alt.extra.extend_from_slice(raw);
                        }
                    }
                    ExtraOwner::Endpoint => {
                        if let Some(endpoint) = current_alt_setting(&mut config)
                            .and_then(|alt| alt.endpoints.last_mut())
                        {
                            endpoint.extra.extend_from_slice(raw);
                        }
                    }
                },
            }

            offset += length;
        }

        Ok(config)
    }

    /// Encode back into a wire image; wTotalLength and counts are recomputed
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![
            DT_CONFIG_SIZE as u8,
            DT_CONFIG,
            0,
            0,
            self.interfaces.len() as u8,
            self.configuration_value,
            self.configuration_index,
            self.attributes,
            self.max_power,
        ];
        out.extend_from_slice(&self.extra);
        for interface in &self.interfaces {
            for alt in &interface.alt_settings {
                alt.write_to(&mut out);
            }
        }
        let total = out.len() as u16;
        LittleEndian::write_u16(&mut out[2..4], total);
        out
    }

    /// Find an endpoint anywhere in this configuration
    pub fn find_endpoint(&self, endpoint_address: u8) -> Option<&EndpointDescriptor> {
        self.interfaces
            .iter()
            .flat_map(|interface| interface.alt_settings.iter())
            .flat_map(|alt| alt.endpoints.iter())
            .find(|endpoint| endpoint.endpoint_address == endpoint_address)
    }
}

fn current_alt_setting(config: &mut ConfigDescriptor) -> Option<&mut InterfaceDescriptor> {
    config
        .interfaces
        .last_mut()
        .and_then(|interface| interface.alt_settings.last_mut())
}

/// Decode any descriptor by its type tag
///
/// The result is bounded by both `bLength` and the number of bytes received.
pub fn parse_descriptor(bytes: &[u8]) -> Result<Descriptor> {
    if bytes.len() < 2 {
        return Err(DescriptorError::Truncated {
            needed: 2,
            available: bytes.len(),
        });
    }
    let length = bytes[0] as usize;
    if length < 2 {
        return Err(DescriptorError::InvalidLength { length: bytes[0] });
    }
    let bounded = &bytes[..length.min(bytes.len())];

    Ok(match bytes[1] {
        DT_DEVICE => Descriptor::Device(DeviceDescriptor::parse(bounded)?),
        // A configuration's bLength only covers its header; the nested
        // descriptors follow within wTotalLength.
        DT_CONFIG => Descriptor::Configuration(ConfigDescriptor::parse(bytes)?),
        DT_INTERFACE => Descriptor::Interface(InterfaceDescriptor::parse(bounded)?),
        DT_ENDPOINT => Descriptor::Endpoint(EndpointDescriptor::parse(bounded)?),
        DT_STRING => Descriptor::String(string_descriptor_units(bounded)?),
        other => Descriptor::Other {
            descriptor_type: other,
            data: bounded.to_vec(),
        },
    })
}
