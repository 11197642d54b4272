//! Offline acceleration structure payload
//!
//! The streamed byte range holds a bulk-serialized byte array: a little
//! endian `u32` element size (always 1), a `u32` element count and then the
//! bytes themselves. An empty array means there is no offline data and the
//! structure is built at runtime.

use crate::core::error::Error;
use crate::core::types::Result;

const HEADER_SIZE: usize = 8;

/// Serialize offline build data into the streamed layout
pub fn encode_offline_payload(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + data.len());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Extract the offline build data from a streamed range
pub fn decode_offline_payload(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::Payload(format!(
            "{} bytes is shorter than the {} byte header",
            bytes.len(),
            HEADER_SIZE
        )));
    }

    let element_size = read_u32(&bytes[0..4]);
    let count = read_u32(&bytes[4..8]) as usize;

    if element_size != 1 {
        return Err(Error::Payload(format!("unexpected element size {}", element_size)));
    }

    let body = &bytes[HEADER_SIZE..];
    if body.len() < count {
        return Err(Error::Payload(format!(
            "header claims {} bytes but only {} follow",
            count,
            body.len()
        )));
    }

    Ok(body[..count].to_vec())
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
