//! Tick-instrumented TCP channel for request/response latency measurement
//!
//! This crate measures, with hardware-clock precision, the elapsed ticks
//! between transmitting a request on a TCP connection and receiving the
//! first byte of the peer's response:
//! - Logical writes are decoupled from physical transmission: a producer
//!   enqueues bytes into a bounded pending buffer and the whole request
//!   is flushed in one send
//! - A mutex-guarded session state machine samples a low-overhead tick
//!   counter immediately around the flush and the first response byte
//! - A bounded-retry read variant yields the lock between short receive
//!   attempts so a producer is never starved during a long round-trip
//!
//! Statistical aggregation and protocol semantics are left to the caller;
//! each measurement cycle produces one elapsed-tick value and raw bytes.

use tracing::info;

mod buffer;
mod channel;
mod clock;
mod config;
mod session;
mod socket;

pub use buffer::{PendingBuffer, DEFAULT_CAPACITY};
pub use channel::Channel;
pub use clock::{TickClock, TickValue};
pub use config::{ChannelConfig, RetryPolicy};
pub use session::{MeasurementSession, SessionState};
pub use socket::{MeasuredSocket, RecvStatus, SocketKind, SocketOption};

/// Result type for the measurement channel.
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Error types for the measurement channel.
#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    #[error("socket creation failed: {0}")]
    Create(#[source] std::io::Error),

    #[error("datagram sockets are not supported")]
    DatagramUnsupported,

    #[error("hostname resolution failed for {host}")]
    Resolution { host: String },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported socket option id {0:#06x}")]
    UnsupportedOption(i32),

    #[error("socket option {name} could not be applied: {source}")]
    OptionFailed {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("enqueue of {requested} bytes exceeds capacity ({pending} pending of {capacity})")]
    Capacity {
        requested: usize,
        pending: usize,
        capacity: usize,
    },

    #[error("short send: {sent} of {len} bytes")]
    ShortSend { sent: usize, len: usize },

    #[error("timed out waiting for response data")]
    TimeoutNoData,

    #[error("channel is not connected")]
    NotConnected,

    #[error("channel is already connected")]
    AlreadyConnected,

    #[error("channel is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Initialize logging for the library with an env-filter subscriber.
///
/// Intended for binaries and tests that do not install their own
/// subscriber.
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();

    info!("logging initialized");
}

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
