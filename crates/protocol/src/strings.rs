//! String descriptor helpers
//!
//! A string descriptor carries UTF-16LE code units after its two-byte header.
//! Index 0 is special: its payload is the list of supported language ids.

use crate::consts::{DT_STRING, MAX_DESCRIPTOR_SIZE};
use crate::error::{DescriptorError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// US English, the language id most devices list first
pub const LANGUAGE_ID_EN_US: u16 = 0x0409;

/// Extract the UTF-16 code units of a string descriptor
///
/// The payload is bounded by both `bLength` and the received byte count; a
/// trailing odd byte is ignored.
pub fn string_descriptor_units(bytes: &[u8]) -> Result<Vec<u16>> {
    if bytes.len() < 2 {
        return Err(DescriptorError::Truncated {
            needed: 2,
            available: bytes.len(),
        });
    }
    if bytes[1] != DT_STRING {
        return Err(DescriptorError::UnexpectedType {
            expected: DT_STRING,
            found: bytes[1],
        });
    }
    if bytes[0] < 2 {
        return Err(DescriptorError::InvalidLength { length: bytes[0] });
    }

    let end = (bytes[0] as usize).min(bytes.len());
    Ok(bytes[2..end]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect())
}

/// Decode code units lossily, replacing unpaired surrogates with U+FFFD
pub fn decode_utf16_units(units: &[u16]) -> String {
    char::decode_utf16(units.iter().copied())
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Decode code units as ASCII, replacing anything else with `?`
pub fn decode_ascii_units(units: &[u16]) -> String {
    units
        .iter()
        .map(|&unit| {
            if unit < 0x80 {
                char::from(unit as u8)
            } else {
                '?'
            }
        })
        .collect()
}

/// Encode text as a string descriptor
///
/// Text that does not fit into a single descriptor is truncated at a code unit
/// boundary.
pub fn encode_string_descriptor(text: &str) -> Vec<u8> {
    let max_units = (MAX_DESCRIPTOR_SIZE - 2) / 2;
    let mut units: Vec<u16> = Vec::with_capacity(max_units.min(text.len()));
    let mut pair = [0u16; 2];
    for c in text.chars() {
        let encoded = c.encode_utf16(&mut pair);
        // Never split a surrogate pair at the size limit
        if units.len() + encoded.len() > max_units {
            break;
        }
        units.extend_from_slice(encoded);
    }
    encode_units(&units)
}

/// Encode the language table returned for string index 0
pub fn encode_language_descriptor(language_ids: &[u16]) -> Vec<u8> {
    let max_units = (MAX_DESCRIPTOR_SIZE - 2) / 2;
    let take = language_ids.len().min(max_units);
    encode_units(&language_ids[..take])
}

fn encode_units(units: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + units.len() * 2);
    out.push((2 + units.len() * 2) as u8);
    out.push(DT_STRING);
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}
