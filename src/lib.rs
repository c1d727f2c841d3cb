//! iso8583-listener: a reactor-based TCP listener for ISO-8583 traffic.
//!
//! Messages travel as length-prefixed frames: a 4-digit ASCII body length
//! followed by the body. One reactor thread multiplexes every connection;
//! complete frames are decoded and handed downstream on a bounded worker
//! pool, and replies are queued back onto the connection they belong to.
//!
//! ```no_run
//! use iso8583_listener::{Config, EchoSink, Listener, RawPacker};
//! use std::sync::Arc;
//!
//! let listener = Listener::new(Config::default(), Arc::new(RawPacker), Arc::new(EchoSink));
//! listener.start()?;
//! listener.join();
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod protocols;
pub mod runtime;

pub use config::Config;
pub use error::{
    ConfigError, DecodeError, EncodeError, FrameError, HandlerError, PoolError, ReplyError,
};
pub use message::{EchoSink, InjectionSink, LogSink, Packer, RawPacker, StructuredMessage};
pub use protocols::frame::{decode_header, encode_frame};
pub use runtime::{AllowList, LifecycleState, Listener, ReplyHandle, ReplySender};
