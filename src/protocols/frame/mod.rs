//! Length-prefixed ISO-8583 framing.
//!
//! - `parser`: 4-digit ASCII header codec
//! - `handler`: per-frame task that unpacks a body and injects it downstream

pub mod handler;
pub mod parser;

pub use handler::RequestHandler;
pub use parser::{decode_header, encode_frame, HEADER_LEN, MAX_BODY_LEN};
