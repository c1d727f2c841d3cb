//! Frame codec.
//!
//! Wire format, symmetric for requests and replies:
//!
//! ```text
//! byte[4]   ASCII decimal body length, zero-padded (0000-9999)
//! byte[len] message payload
//! ```

use crate::error::FrameError;
use bytes::{BufMut, Bytes, BytesMut};

/// Length of the ASCII length header.
pub const HEADER_LEN: usize = 4;

/// Largest body length a 4-digit header can describe.
pub const MAX_BODY_LEN: usize = 9999;

/// Parse a frame header into the body length it announces.
///
/// Surrounding whitespace is ignored. A header that is not a non-negative
/// decimal number is reported as [`FrameError::HeaderNotNumeric`]; choosing a
/// fallback length is left to the caller.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<usize, FrameError> {
    let text = std::str::from_utf8(header)
        .map_err(|_| FrameError::HeaderNotNumeric(String::from_utf8_lossy(header).into_owned()))?;

    text.trim()
        .parse::<usize>()
        .map_err(|_| FrameError::HeaderNotNumeric(text.to_string()))
}

/// Prefix `body` with its zero-padded length header.
///
/// The length is not checked against [`MAX_BODY_LEN`]; a longer body produces
/// a header wider than four digits.
pub fn encode_frame(body: &[u8]) -> Bytes {
    let header = format!("{:04}", body.len());
    let mut frame = BytesMut::with_capacity(header.len() + body.len());
    frame.put_slice(header.as_bytes());
    frame.put_slice(body);
    frame.freeze()
}
