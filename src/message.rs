//! Collaborator interfaces around the transport.
//!
//! The listener only moves frames. Turning a frame into fields is the job of
//! a [`Packer`], and deciding what to do with a message is the job of an
//! [`InjectionSink`]. Both are shared across worker threads.

use crate::error::{DecodeError, EncodeError};
use crate::runtime::ReplySender;
use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// A decoded ISO-8583 message.
///
/// Carries the raw wire payload alongside any fields a packer extracted,
/// keyed by ISO field number.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StructuredMessage {
    raw: Bytes,
    fields: BTreeMap<u16, String>,
}

impl StructuredMessage {
    /// Message with a raw payload and no decoded fields.
    pub fn from_raw(raw: impl Into<Bytes>) -> Self {
        Self {
            raw: raw.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, id: u16, value: impl Into<String>) -> Self {
        self.fields.insert(id, value.into());
        self
    }

    pub fn set_field(&mut self, id: u16, value: impl Into<String>) {
        self.fields.insert(id, value.into());
    }

    pub fn field(&self, id: u16) -> Option<&str> {
        self.fields.get(&id).map(String::as_str)
    }

    /// Fields in ascending field-number order.
    pub fn fields(&self) -> impl Iterator<Item = (u16, &str)> {
        self.fields.iter().map(|(id, v)| (*id, v.as_str()))
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}

/// Converts between frame bodies and structured messages.
pub trait Packer: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<StructuredMessage, DecodeError>;

    fn encode(&self, message: &StructuredMessage) -> Result<Bytes, EncodeError>;
}

/// Receives decoded messages for downstream processing.
///
/// `reply` is bound to the originating connection. Calling it is optional
/// and may happen later from any thread.
pub trait InjectionSink: Send + Sync {
    fn inject(&self, message: StructuredMessage, reply: ReplySender);
}

/// Passthrough packer: the payload is kept as-is with no field extraction.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawPacker;

impl Packer for RawPacker {
    fn decode(&self, payload: &[u8]) -> Result<StructuredMessage, DecodeError> {
        Ok(StructuredMessage::from_raw(Bytes::copy_from_slice(payload)))
    }

    fn encode(&self, message: &StructuredMessage) -> Result<Bytes, EncodeError> {
        Ok(message.raw().clone())
    }
}

/// Sends every message straight back to its sender.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoSink;

impl InjectionSink for EchoSink {
    fn inject(&self, message: StructuredMessage, reply: ReplySender) {
        if let Err(e) = reply.send_back(&message) {
            warn!(peer = %reply.peer_addr(), error = %e, "Echo reply not sent");
        }
    }
}

/// Logs every message and never replies.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl InjectionSink for LogSink {
    fn inject(&self, message: StructuredMessage, reply: ReplySender) {
        info!(
            peer = %reply.peer_addr(),
            len = message.raw().len(),
            fields = message.fields().count(),
            "Message received"
        );
        for (id, value) in message.fields() {
            debug!(field = id, value, "Message field");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_message_fields() {
        let mut msg = StructuredMessage::from_raw(&b"0200"[..])
            .with_field(3, "000000")
            .with_field(0, "0200");
        msg.set_field(11, "123456");

        assert_eq!(msg.field(3), Some("000000"));
        assert_eq!(msg.field(4), None);
        let ids: Vec<u16> = msg.fields().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![0, 3, 11]);
    }

    #[test]
    fn test_raw_packer_passthrough() {
        let packer = RawPacker;
        let msg = packer.decode(b"HELLO").unwrap();
        assert_eq!(&msg.raw()[..], b"HELLO");
        assert_eq!(msg.fields().count(), 0);
        assert_eq!(&packer.encode(&msg).unwrap()[..], b"HELLO");
    }
}
