//! Channel configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::DEFAULT_CAPACITY;
use crate::socket::SocketKind;

/// Configuration for one measurement channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Socket kind; only `Stream` is supported.
    pub kind: SocketKind,

    /// Pending-buffer capacity in bytes.
    pub capacity: usize,

    /// Receive timeout applied after connect; `None` blocks indefinitely.
    pub recv_timeout: Option<Duration>,

    /// Linger duration applied after connect.
    pub linger: Option<Duration>,

    /// Retry policy for the bounded measured read.
    pub retry: RetryPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: SocketKind::Stream,
            capacity: DEFAULT_CAPACITY,
            recv_timeout: Some(Duration::from_secs(30)),
            linger: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Policy for the bounded measured read.
///
/// The worst-case latency bound is roughly
/// `attempts * (attempt_timeout + backoff)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of receive attempts before giving up.
    pub attempts: u32,

    /// Receive timeout for each individual attempt.
    pub attempt_timeout: Duration,

    /// How long the lock is yielded between attempts, giving a producer
    /// a window to enqueue fresh data.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            attempt_timeout: Duration::from_millis(100),
            backoff: Duration::from_millis(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.kind, SocketKind::Stream);
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.recv_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.linger, None);
        assert_eq!(config.retry.attempts, 20);
        assert_eq!(config.retry.attempt_timeout, Duration::from_millis(100));
        assert_eq!(config.retry.backoff, Duration::from_millis(5));
    }

    #[test]
    fn json_round_trip() {
        let config = ChannelConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: ChannelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.capacity, config.capacity);
        assert_eq!(parsed.recv_timeout, config.recv_timeout);
        assert_eq!(parsed.retry.attempts, config.retry.attempts);
    }
}
