//! Block image codec for the boot configuration.
//!
//! The guest sees the configuration as a raw block device, so the image is
//! padded to whole sectors:
//!
//! ```text
//! [u32 LE magic][u32 LE payload length][postcard payload][zero padding to 512]
//! ```

use std::io::{self, Read};

use crate::config::Config;

/// Constant first word of every image.
pub const MAGIC: u32 = 0xdead_beef;

/// Size of the fixed header (magic + payload length).
pub const HEADER_LEN: usize = 8;

/// Sector size of the guest block device.
pub const BLOCK_SIZE: usize = 512;

/// Maximum accepted payload (16 MiB).
pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Failure to produce an image.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EncodeError {
    /// The configuration could not be serialized.
    #[error("serialize configuration: {0}")]
    Serialize(#[from] postcard::Error),
    /// The serialized configuration is larger than [`MAX_PAYLOAD`].
    #[error("configuration payload of {0} bytes exceeds the 16 MiB limit")]
    TooLarge(usize),
}

/// Failure to read an image back.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The header does not start with [`MAGIC`].
    #[error("unexpected header: {found:#010x} != {MAGIC:#010x}")]
    BadMagic {
        /// The word actually found.
        found: u32,
    },
    /// The payload is truncated, oversized, or not a well-formed configuration.
    #[error("bad configuration: {reason}")]
    BadPayload {
        /// Human-readable cause.
        reason: String,
    },
    /// The underlying device could not be read.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DecodeError {
    /// Shorthand for [`DecodeError::BadPayload`].
    fn payload(reason: impl std::fmt::Display) -> Self {
        Self::BadPayload {
            reason: reason.to_string(),
        }
    }
}

/// Serializes `cfg` into a sector-padded image.
pub fn encode(cfg: &Config) -> Result<Vec<u8>, EncodeError> {
    let payload = postcard::to_allocvec(cfg)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&n| n <= MAX_PAYLOAD)
        .ok_or(EncodeError::TooLarge(payload.len()))?;

    let total = (HEADER_LEN + payload.len()).next_multiple_of(BLOCK_SIZE);
    let mut image = Vec::with_capacity(total);
    image.extend_from_slice(&MAGIC.to_le_bytes());
    image.extend_from_slice(&len.to_le_bytes());
    image.extend_from_slice(&payload);
    image.resize(total, 0);
    Ok(image)
}

/// Decodes an in-memory image. Trailing padding is ignored.
pub fn decode(mut image: &[u8]) -> Result<Config, DecodeError> {
    read_from(&mut image).map(|(cfg, _)| cfg)
}

/// Reads an image from a stream, consuming only the header and declared payload.
///
/// Returns the configuration and the payload length.
pub fn read_from(r: &mut impl Read) -> Result<(Config, u32), DecodeError> {
    let mut word = [0u8; 4];
    read_exact(r, &mut word)?;
    let magic = u32::from_le_bytes(word);
    if magic != MAGIC {
        return Err(DecodeError::BadMagic { found: magic });
    }

    read_exact(r, &mut word)?;
    let len = u32::from_le_bytes(word);
    if len > MAX_PAYLOAD {
        return Err(DecodeError::payload(format_args!(
            "declared length {len} exceeds the 16 MiB limit"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    read_exact(r, &mut payload)?;
    let cfg = postcard::from_bytes(&payload).map_err(DecodeError::payload)?;
    Ok((cfg, len))
}

/// `read_exact` that reports a short read as a truncated payload.
fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), DecodeError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            DecodeError::payload("truncated image")
        } else {
            DecodeError::Io(e)
        }
    })
}
