//! Protocol implementations.
//!
//! - `frame`: 4-byte length header framing used for ISO-8583 traffic

pub mod frame;
