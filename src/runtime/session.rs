//! Per-connection session state.
//!
//! A session owns its socket. Only the reactor thread reads from or writes
//! to it. Inbound bytes are cut into frames; outbound payloads come from the
//! shared [`Outbound`] queue and are framed as they are written.
//!
//! Writes loop until the socket reports `WouldBlock`, since the reactor is
//! edge-triggered. Reads stop at `WouldBlock` or after [`MAX_READS_PER_EVENT`]
//! calls; in the latter case the reactor comes back to the session on its
//! next turn.

use crate::protocols::frame::{decode_header, encode_frame, HEADER_LEN};
use crate::runtime::reply::{Outbound, ReplyHandle};
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Bytes requested from the socket per read call.
const READ_CHUNK: usize = 4096;

/// Read calls made for one readable event before yielding to other sessions.
const MAX_READS_PER_EVENT: usize = 16;

/// Inbound framing progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundState {
    /// Waiting for the 4-byte length header.
    AwaitingHeader,
    /// Header parsed, waiting for this many body bytes.
    AwaitingBody(usize),
}

/// How a body that has not fully arrived by the end of a readiness event is
/// treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingPolicy {
    /// Body length assumed when a header is not numeric.
    pub fallback_body_len: usize,
    /// Keep short bodies across events instead of dropping them.
    pub reassemble_partial: bool,
}

impl Default for FramingPolicy {
    fn default() -> Self {
        Self {
            fallback_body_len: 100,
            reassemble_partial: false,
        }
    }
}

/// Result of servicing a readable event.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Complete frame bodies in arrival order.
    pub frames: Vec<Bytes>,
    /// Peer closed its side of the connection.
    pub eof: bool,
    /// Read budget ran out before the socket would block.
    pub more: bool,
}

/// Result of servicing a writable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Queue is empty and nothing is left half-written.
    Drained,
    /// The socket stopped accepting bytes; more remain.
    Blocked,
}

/// Framed reply partially written to the socket.
struct PendingWrite {
    frame: Bytes,
    written: usize,
}

/// State of one accepted connection.
pub struct Session<S> {
    stream: S,
    peer: SocketAddr,
    inbound: InboundState,
    read_buf: BytesMut,
    policy: FramingPolicy,
    writing: Option<PendingWrite>,
    outbound: Arc<Outbound>,
    /// WRITABLE is currently part of the registered interest.
    pub(crate) write_interest: bool,
}

impl<S: Read + Write> Session<S> {
    pub(crate) fn new(
        stream: S,
        peer: SocketAddr,
        policy: FramingPolicy,
        outbound: Arc<Outbound>,
    ) -> Self {
        Self {
            stream,
            peer,
            inbound: InboundState::AwaitingHeader,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            policy,
            writing: None,
            outbound,
            write_interest: false,
        }
    }

    /// Read from the socket and cut the bytes into frames.
    ///
    /// Read errors other than `WouldBlock` are returned and should close the
    /// session. End of stream is reported through [`ReadOutcome::eof`]; frames
    /// that completed before it are still returned. When the read budget runs
    /// out, [`ReadOutcome::more`] is set and partial bodies are kept.
    pub fn on_readable(&mut self) -> io::Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        let mut reads = 0;

        loop {
            if reads == MAX_READS_PER_EVENT {
                outcome.more = true;
                return Ok(outcome);
            }
            reads += 1;

            let start = self.read_buf.len();
            self.read_buf.resize(start + READ_CHUNK, 0);
            let result = self.stream.read(&mut self.read_buf[start..]);

            match result {
                Ok(0) => {
                    self.read_buf.truncate(start);
                    debug!(peer = %self.peer, "Connection closed by client");
                    outcome.eof = true;
                    break;
                }
                Ok(n) => {
                    self.read_buf.truncate(start + n);
                    trace!(peer = %self.peer, n, "Read bytes");
                    self.extract_frames(&mut outcome.frames);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.read_buf.truncate(start);
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.read_buf.truncate(start);
                }
                Err(e) => {
                    self.read_buf.truncate(start);
                    return Err(e);
                }
            }
        }

        self.finish_event();
        Ok(outcome)
    }

    fn extract_frames(&mut self, frames: &mut Vec<Bytes>) {
        loop {
            match self.inbound {
                InboundState::AwaitingHeader => {
                    if self.read_buf.len() < HEADER_LEN {
                        return;
                    }
                    let mut header = [0u8; HEADER_LEN];
                    header.copy_from_slice(&self.read_buf[..HEADER_LEN]);
                    self.read_buf.advance(HEADER_LEN);

                    let len = match decode_header(&header) {
                        Ok(len) => len,
                        Err(e) => {
                            error!(
                                peer = %self.peer,
                                error = %e,
                                fallback = self.policy.fallback_body_len,
                                "The length of the message was not a number"
                            );
                            self.policy.fallback_body_len
                        }
                    };
                    self.inbound = InboundState::AwaitingBody(len);
                }
                InboundState::AwaitingBody(len) => {
                    if self.read_buf.len() < len {
                        return;
                    }
                    let body = self.read_buf.split_to(len).freeze();
                    trace!(peer = %self.peer, len, "Frame complete");
                    frames.push(body);
                    self.inbound = InboundState::AwaitingHeader;
                }
            }
        }
    }

    /// Apply the partial-body policy once the socket has no more bytes.
    fn finish_event(&mut self) {
        if self.policy.reassemble_partial {
            return;
        }
        // A short header is kept; only an announced body that fell short is dropped.
        if let InboundState::AwaitingBody(expected) = self.inbound {
            error!(
                peer = %self.peer,
                expected,
                got = self.read_buf.len(),
                "Data did not match header, dropping frame"
            );
            self.read_buf.clear();
            self.inbound = InboundState::AwaitingHeader;
        } else if !self.read_buf.is_empty() {
            debug!(
                peer = %self.peer,
                got = self.read_buf.len(),
                "Short header read, waiting for more bytes"
            );
        }
    }

    /// Write queued replies, oldest first, until the queue is empty or the
    /// socket would block.
    pub fn on_writable(&mut self) -> io::Result<WriteOutcome> {
        loop {
            if self.writing.is_none() {
                match self.outbound.pop() {
                    Some(payload) => {
                        debug!(peer = %self.peer, len = payload.len(), "Sending reply");
                        self.writing = Some(PendingWrite {
                            frame: encode_frame(&payload),
                            written: 0,
                        });
                    }
                    None => return Ok(WriteOutcome::Drained),
                }
            }

            let Some(pending) = self.writing.as_mut() else {
                continue;
            };

            match self.stream.write(&pending.frame[pending.written..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    pending.written += n;
                    if pending.written >= pending.frame.len() {
                        self.writing = None;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteOutcome::Blocked);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Error while sending response");
                    return Err(e);
                }
            }
        }
    }

    /// Bytes are waiting to go out.
    pub fn wants_write(&self) -> bool {
        self.writing.is_some() || !self.outbound.is_empty()
    }

    pub fn inbound_state(&self) -> InboundState {
        self.inbound
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Reply route bound to this session.
    pub fn reply_handle(&self) -> ReplyHandle {
        ReplyHandle::new(Arc::clone(&self.outbound))
    }

    pub(crate) fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S> Drop for Session<S> {
    fn drop(&mut self) {
        // Late replies from in-flight tasks become no-ops.
        self.outbound.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplyError;
    use std::collections::VecDeque;

    /// In-memory socket: each queued chunk is returned by one read call,
    /// then reads would block (or hit EOF once `eof` is set).
    #[derive(Default)]
    struct MockStream {
        incoming: VecDeque<Vec<u8>>,
        eof: bool,
        written: Vec<u8>,
        /// Bytes accepted before writes start blocking.
        write_budget: Option<usize>,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.incoming.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None if self.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = match self.write_budget {
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(budget) => buf.len().min(budget),
                None => buf.len(),
            };
            if let Some(budget) = self.write_budget.as_mut() {
                *budget -= n;
            }
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn session(policy: FramingPolicy) -> Session<MockStream> {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let outbound = Arc::new(Outbound::new(0, peer, None));
        Session::new(MockStream::default(), peer, policy, outbound)
    }

    fn feed(session: &mut Session<MockStream>, chunk: &[u8]) {
        session.stream_mut().incoming.push_back(chunk.to_vec());
    }

    #[test]
    fn test_complete_frame() {
        let mut s = session(FramingPolicy::default());
        feed(&mut s, b"0005HELLO");

        let outcome = s.on_readable().unwrap();
        assert_eq!(outcome.frames, vec![Bytes::from_static(b"HELLO")]);
        assert!(!outcome.eof);
        assert_eq!(s.inbound_state(), InboundState::AwaitingHeader);
    }

    #[test]
    fn test_several_frames_in_one_read() {
        let mut s = session(FramingPolicy::default());
        feed(&mut s, b"0002AB0003CDE0000");

        let outcome = s.on_readable().unwrap();
        assert_eq!(
            outcome.frames,
            vec![
                Bytes::from_static(b"AB"),
                Bytes::from_static(b"CDE"),
                Bytes::new()
            ]
        );
    }

    #[test]
    fn test_frame_split_across_reads_of_one_event() {
        let mut s = session(FramingPolicy::default());
        feed(&mut s, b"00");
        feed(&mut s, b"05HE");
        feed(&mut s, b"LLO");

        let outcome = s.on_readable().unwrap();
        assert_eq!(outcome.frames, vec![Bytes::from_static(b"HELLO")]);
    }

    #[test]
    fn test_malformed_header_uses_fallback_and_drops_short_body() {
        let mut s = session(FramingPolicy::default());
        feed(&mut s, b"ABCDxyz");

        let outcome = s.on_readable().unwrap();
        assert!(outcome.frames.is_empty());
        assert!(!outcome.eof);
        assert_eq!(s.inbound_state(), InboundState::AwaitingHeader);

        // Next frame on the same connection is read normally.
        feed(&mut s, b"0005HELLO");
        let outcome = s.on_readable().unwrap();
        assert_eq!(outcome.frames, vec![Bytes::from_static(b"HELLO")]);
    }

    #[test]
    fn test_malformed_header_with_full_fallback_body() {
        let mut s = session(FramingPolicy {
            fallback_body_len: 3,
            reassemble_partial: false,
        });
        feed(&mut s, b"ABCDxyz");

        let outcome = s.on_readable().unwrap();
        assert_eq!(outcome.frames, vec![Bytes::from_static(b"xyz")]);
    }

    #[test]
    fn test_short_body_dropped_between_events() {
        let mut s = session(FramingPolicy::default());
        feed(&mut s, b"0005HE");
        assert!(s.on_readable().unwrap().frames.is_empty());

        // Tail of the dropped frame is now read as a header.
        feed(&mut s, b"LLO");
        assert!(s.on_readable().unwrap().frames.is_empty());
        assert_eq!(s.inbound_state(), InboundState::AwaitingHeader);
    }

    #[test]
    fn test_short_body_reassembled_when_enabled() {
        let mut s = session(FramingPolicy {
            fallback_body_len: 100,
            reassemble_partial: true,
        });
        feed(&mut s, b"0005HE");
        assert!(s.on_readable().unwrap().frames.is_empty());
        assert_eq!(s.inbound_state(), InboundState::AwaitingBody(5));

        feed(&mut s, b"LLO");
        let outcome = s.on_readable().unwrap();
        assert_eq!(outcome.frames, vec![Bytes::from_static(b"HELLO")]);
    }

    #[test]
    fn test_short_header_kept_across_events() {
        let mut s = session(FramingPolicy::default());
        feed(&mut s, b"00");
        assert!(s.on_readable().unwrap().frames.is_empty());
        assert_eq!(s.inbound_state(), InboundState::AwaitingHeader);

        feed(&mut s, b"03abc");
        let outcome = s.on_readable().unwrap();
        assert_eq!(outcome.frames, vec![Bytes::from_static(b"abc")]);
    }

    #[test]
    fn test_reads_capped_per_event() {
        let mut s = session(FramingPolicy::default());
        for _ in 0..MAX_READS_PER_EVENT {
            feed(&mut s, b"0001x");
        }
        feed(&mut s, b"0003a");
        feed(&mut s, b"bc");

        let outcome = s.on_readable().unwrap();
        assert_eq!(outcome.frames.len(), MAX_READS_PER_EVENT);
        assert!(outcome.more);

        // A body cut by the budget is not dropped.
        let outcome = s.on_readable().unwrap();
        assert_eq!(outcome.frames, vec![Bytes::from_static(b"abc")]);
        assert!(!outcome.more);
    }

    #[test]
    fn test_eof_reported_after_frames() {
        let mut s = session(FramingPolicy::default());
        feed(&mut s, b"0001Z");
        s.stream_mut().eof = true;

        let outcome = s.on_readable().unwrap();
        assert_eq!(outcome.frames, vec![Bytes::from_static(b"Z")]);
        assert!(outcome.eof);
    }

    #[test]
    fn test_replies_written_in_enqueue_order() {
        let mut s = session(FramingPolicy::default());
        let reply = s.reply_handle();
        reply.enqueue_reply(&b"A"[..]).unwrap();
        reply.enqueue_reply(&b"BB"[..]).unwrap();
        assert!(s.wants_write());

        assert_eq!(s.on_writable().unwrap(), WriteOutcome::Drained);
        assert_eq!(s.stream_mut().written, b"0001A0002BB");
        assert!(!s.wants_write());
    }

    #[test]
    fn test_blocked_write_resumes_where_it_stopped() {
        let mut s = session(FramingPolicy::default());
        s.stream_mut().write_budget = Some(3);
        s.reply_handle().enqueue_reply(&b"HELLO"[..]).unwrap();

        assert_eq!(s.on_writable().unwrap(), WriteOutcome::Blocked);
        assert_eq!(s.stream_mut().written, b"000");
        assert!(s.wants_write());

        s.stream_mut().write_budget = None;
        assert_eq!(s.on_writable().unwrap(), WriteOutcome::Drained);
        assert_eq!(s.stream_mut().written, b"0005HELLO");
    }

    #[test]
    fn test_writable_with_empty_queue() {
        let mut s = session(FramingPolicy::default());
        assert_eq!(s.on_writable().unwrap(), WriteOutcome::Drained);
        assert!(s.stream_mut().written.is_empty());
    }

    #[test]
    fn test_reply_after_drop_is_noop() {
        let s = session(FramingPolicy::default());
        let reply = s.reply_handle();
        drop(s);

        assert!(reply.is_closed());
        assert!(matches!(
            reply.enqueue_reply(&b"late"[..]),
            Err(ReplyError::SessionClosed)
        ));
    }
}
