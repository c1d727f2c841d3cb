//! Request handler run on the worker pool for each complete frame.

use crate::error::HandlerError;
use crate::message::{InjectionSink, Packer};
use crate::runtime::ReplySender;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace};

/// Unpacks one frame body and forwards it to the injection sink.
pub struct RequestHandler {
    frame: Bytes,
    reply: ReplySender,
    packer: Arc<dyn Packer>,
    sink: Arc<dyn InjectionSink>,
}

impl RequestHandler {
    pub fn new(
        frame: Bytes,
        reply: ReplySender,
        packer: Arc<dyn Packer>,
        sink: Arc<dyn InjectionSink>,
    ) -> Self {
        Self {
            frame,
            reply,
            packer,
            sink,
        }
    }

    /// Decode the frame and inject it.
    ///
    /// A body the packer rejects fails the task and is logged by the caller.
    /// No error reply is sent; reply policy belongs to the sink.
    pub fn run(self) -> Result<(), HandlerError> {
        trace!(peer = %self.reply.peer_addr(), frame = %hex(&self.frame), "Frame bytes");

        let message = self.packer.decode(&self.frame)?;

        debug!(peer = %self.reply.peer_addr(), fields = message.fields().count(), "Injecting message");
        self.sink.inject(message, self.reply);
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
