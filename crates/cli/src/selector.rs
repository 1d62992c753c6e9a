//! Device selection and argument parsing

use anyhow::{Result, bail};
use host::{Context, Device};
use std::fmt;

/// Which device a command talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// First device with these ids
    Ids { vendor_id: u16, product_id: u16 },
    /// The device at this bus address
    Slot { bus: u8, address: u8 },
}

impl Selector {
    /// Find the selected device in the current enumeration
    pub fn find(&self, context: &Context) -> Result<Device> {
        for device in context.get_device_list()? {
            let matches = match *self {
                Selector::Ids {
                    vendor_id,
                    product_id,
                } => {
                    let descriptor = device.device_descriptor()?;
                    descriptor.vendor_id == vendor_id && descriptor.product_id == product_id
                }
                Selector::Slot { bus, address } => {
                    device.bus_number() == bus && device.device_address() == address
                }
            };
            if matches {
                return Ok(device);
            }
        }
        bail!("No device with {}", self)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Ids {
                vendor_id,
                product_id,
            } => write!(f, "ID {:04x}:{:04x}", vendor_id, product_id),
            Selector::Slot { bus, address } => write!(f, "bus {:03} address {:03}", bus, address),
        }
    }
}

/// Parse `VID:PID` in hexadecimal
pub fn parse_ids(s: &str) -> Result<(u16, u16), String> {
    let (vendor, product) = s
        .split_once(':')
        .ok_or_else(|| format!("expected VID:PID, got '{}'", s))?;
    let vendor_id = u16::from_str_radix(vendor, 16)
        .map_err(|e| format!("invalid vendor id '{}': {}", vendor, e))?;
    let product_id = u16::from_str_radix(product, 16)
        .map_err(|e| format!("invalid product id '{}': {}", product, e))?;
    Ok((vendor_id, product_id))
}

/// Parse `BUS:ADDRESS` in decimal
pub fn parse_slot(s: &str) -> Result<(u8, u8), String> {
    let (bus, address) = s
        .split_once(':')
        .ok_or_else(|| format!("expected BUS:ADDRESS, got '{}'", s))?;
    let bus = bus
        .parse()
        .map_err(|e| format!("invalid bus '{}': {}", bus, e))?;
    let address = address
        .parse()
        .map_err(|e| format!("invalid address '{}': {}", address, e))?;
    Ok((bus, address))
}

fn parse_int(s: &str) -> Result<u32, String> {
    let result = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    result.map_err(|e| format!("invalid number '{}': {}", s, e))
}

/// Decimal or `0x`-prefixed byte
pub fn parse_u8(s: &str) -> Result<u8, String> {
    let value = parse_int(s)?;
    u8::try_from(value).map_err(|_| format!("{} does not fit in a byte", s))
}

/// Decimal or `0x`-prefixed 16 bit value
pub fn parse_u16(s: &str) -> Result<u16, String> {
    let value = parse_int(s)?;
    u16::try_from(value).map_err(|_| format!("{} does not fit in 16 bits", s))
}

/// Hex string such as `"01ff"` or `"01 ff"` into bytes
pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);
    if !digits.is_ascii() {
        return Err(format!("invalid hex '{}'", s));
    }
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{}'", s));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| format!("invalid hex '{}': {}", &digits[i..i + 2], e))
        })
        .collect()
}
