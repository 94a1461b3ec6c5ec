//! Measurement channel composition root
//!
//! One `Channel` owns one socket, one pending buffer, one measurement
//! session and one mutex. A producer enqueues request bytes while a
//! consumer drives the measured read; the single mutex makes the flush,
//! the tick samples and the first receive one atomic step relative to any
//! concurrent enqueue. Channels are independently instantiable and share
//! no static state.

use std::net::{Shutdown, TcpStream};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::buffer::PendingBuffer;
use crate::clock::{TickClock, TickValue};
use crate::config::ChannelConfig;
use crate::session::{MeasurementSession, SessionState};
use crate::socket::{MeasuredSocket, RecvStatus, SocketOption};
use crate::{ChannelError, ChannelResult};

struct ChannelState {
    socket: MeasuredSocket,
    buffer: PendingBuffer,
    session: MeasurementSession,
}

/// A TCP channel instrumented to measure the elapsed ticks between the
/// flush of a request and the arrival of the first response byte.
///
/// All operations take `&self`; producer and consumer threads share the
/// channel through an `Arc`.
pub struct Channel {
    state: Mutex<ChannelState>,
    // Clone of the connected stream, set at connect time. close() shuts
    // it down before taking the state mutex, so a measured read blocked
    // in a receive under that mutex is woken instead of waited out.
    shutdown: Mutex<Option<TcpStream>>,
    enqueue_signal: Condvar,
    config: ChannelConfig,
}

impl Channel {
    /// Create an unconnected channel.
    ///
    /// Allocates the socket (send coalescing disabled) and the pending
    /// buffer at the configured capacity.
    pub fn create(config: ChannelConfig) -> ChannelResult<Self> {
        let socket = MeasuredSocket::create(config.kind)?;
        let buffer = PendingBuffer::new(config.capacity);
        Ok(Self {
            state: Mutex::new(ChannelState {
                socket,
                buffer,
                session: MeasurementSession::new(),
            }),
            shutdown: Mutex::new(None),
            enqueue_signal: Condvar::new(),
            config,
        })
    }

    /// Resolve `host` and connect, then apply the configured receive
    /// timeout and linger options.
    pub fn connect(&self, host: &str, port: u16) -> ChannelResult<()> {
        let mut st = self.state.lock();
        st.socket.connect(host, port)?;
        if let Some(timeout) = self.config.recv_timeout {
            st.socket.set_option(SocketOption::RecvTimeout(timeout))?;
        }
        if let Some(linger) = self.config.linger {
            st.socket.set_option(SocketOption::Linger(linger))?;
        }
        *self.shutdown.lock() = Some(st.socket.shutdown_handle()?);
        Ok(())
    }

    /// Apply one of the two supported socket options.
    pub fn set_option(&self, option: SocketOption) -> ChannelResult<()> {
        self.state.lock().socket.set_option(option)
    }

    /// Queue request bytes for the next flush.
    ///
    /// Appends under the gate; an over-capacity enqueue fails atomically
    /// and leaves the pending data untouched. Wakes a bounded reader
    /// waiting between attempts so fresh data is flushed promptly.
    pub fn enqueue(&self, bytes: &[u8]) -> ChannelResult<usize> {
        let mut st = self.state.lock();
        let queued = st.buffer.append(bytes)?;
        trace!(queued, pending = st.buffer.len(), "enqueued request bytes");
        drop(st);
        self.enqueue_signal.notify_all();
        Ok(queued)
    }

    /// Arm the session for the next exchange, clearing prior results.
    pub fn start_measurement(&self) {
        self.state.lock().session.arm();
        debug!("measurement session armed");
    }

    /// Drive the measured exchange, holding the gate across the whole of
    /// flush + start sample + first receive + end sample.
    ///
    /// Behavior by session state:
    /// - `Armed`: drain and transmit the pending buffer in one send (a
    ///   no-op when nothing is pending), sample the start tick right
    ///   after the send returns, then block for the first response byte
    ///   and sample the end tick right after it arrives. Returns the
    ///   received bytes.
    /// - `Measuring`: receive again without re-flushing or re-sampling
    ///   the start tick (a previous attempt timed out).
    /// - `Ready`: returns end-of-data (0) until the next
    ///   `start_measurement`; remaining payload is for the passthrough
    ///   reads.
    /// - `Idle`: plain unmeasured receive.
    ///
    /// An expired receive timeout surfaces as `TimeoutNoData` and leaves
    /// the session in `Measuring` so the caller can retry or re-arm.
    pub fn measured_read(&self, buf: &mut [u8]) -> ChannelResult<usize> {
        let mut st = self.state.lock();
        match st.session.state() {
            SessionState::Ready => return Ok(0),
            SessionState::Idle => return Self::recv_plain(&mut st, buf),
            SessionState::Armed => {
                Self::flush(&mut st)?;
                st.session.begin(TickClock::now());
            }
            SessionState::Measuring => {}
        }

        let status = st.socket.recv(buf)?;
        let end = TickClock::now();
        match status {
            RecvStatus::Data(n) => {
                st.session.complete(end);
                debug!(
                    received = n,
                    elapsed_ticks = st.session.elapsed().get(),
                    "first response byte captured"
                );
                Ok(n)
            }
            // Peer shut down before responding; the session stays in
            // Measuring and the caller sees end-of-stream.
            RecvStatus::Shutdown => Ok(0),
            RecvStatus::TimedOut => Err(ChannelError::TimeoutNoData),
        }
    }

    /// Bounded-retry variant of [`measured_read`](Self::measured_read).
    ///
    /// Instead of holding the gate across a potentially full round-trip,
    /// this makes up to `retry.attempts` short attempts. Each attempt
    /// flushes anything pending, tries one receive bounded by
    /// `retry.attempt_timeout`, then yields the gate on the condition
    /// variable for `retry.backoff` so a producer can enqueue fresh
    /// data (an enqueue wakes the wait early). Once the session is
    /// `Ready` this returns end-of-data immediately. Exhausting all
    /// attempts yields `TimeoutNoData`; hard I/O errors propagate
    /// without retry.
    pub fn measured_read_bounded(&self, buf: &mut [u8]) -> ChannelResult<usize> {
        let retry = self.config.retry;
        let mut st = self.state.lock();
        st.socket.set_recv_timeout(Some(retry.attempt_timeout))?;

        let mut outcome = Err(ChannelError::TimeoutNoData);
        for attempt in 0..retry.attempts {
            if st.session.state() == SessionState::Ready {
                outcome = Ok(0);
                break;
            }
            if !st.buffer.is_empty() {
                if let Err(e) = Self::flush(&mut st) {
                    outcome = Err(e);
                    break;
                }
            }
            if st.session.state() == SessionState::Armed {
                st.session.begin(TickClock::now());
            }

            let status = st.socket.recv(buf);
            let end = TickClock::now();
            match status {
                Ok(RecvStatus::Data(n)) => {
                    if st.session.state() == SessionState::Measuring {
                        st.session.complete(end);
                        debug!(
                            received = n,
                            attempt,
                            elapsed_ticks = st.session.elapsed().get(),
                            "first response byte captured"
                        );
                    }
                    outcome = Ok(n);
                    break;
                }
                Ok(RecvStatus::Shutdown) => {
                    outcome = Ok(0);
                    break;
                }
                Ok(RecvStatus::TimedOut) => {
                    trace!(attempt, "no data yet, yielding the gate to the producer");
                    let _ = self.enqueue_signal.wait_for(&mut st, retry.backoff);
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if let Err(e) = st.socket.set_recv_timeout(self.config.recv_timeout) {
            trace!(error = %e, "could not restore the configured receive timeout");
        }
        outcome
    }

    /// Unmeasured read for payload beyond the first measured byte.
    pub fn read_passthrough(&self, buf: &mut [u8]) -> ChannelResult<usize> {
        let mut st = self.state.lock();
        Self::recv_plain(&mut st, buf)
    }

    /// Unmeasured single-byte read; `None` signals peer shutdown.
    pub fn read_single_byte(&self) -> ChannelResult<Option<u8>> {
        let mut byte = [0u8; 1];
        let n = self.read_passthrough(&mut byte)?;
        Ok((n > 0).then_some(byte[0]))
    }

    /// Non-blocking readiness poll: is at least one byte readable?
    pub fn poll_readiness(&self) -> ChannelResult<bool> {
        self.state.lock().socket.poll_readiness()
    }

    /// The measured delta of the last completed exchange, or zero when no
    /// exchange has reached `Ready` since the last arm.
    pub fn elapsed_ticks(&self) -> TickValue {
        self.state.lock().session.elapsed()
    }

    /// Current session state, for diagnostics.
    pub fn session_state(&self) -> SessionState {
        self.state.lock().session.state()
    }

    /// The configuration this channel was created with.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Shut the connection down and release the socket.
    ///
    /// Unblocks an in-flight receive on another thread and wakes any
    /// bounded reader waiting between attempts. Later operations fail
    /// with `Closed`.
    pub fn close(&self) {
        // Shut the connection down through the cloned handle first: the
        // state mutex may be held by a read blocked in a receive, and
        // that read only returns once the shutdown reaches the socket.
        let handle = self.shutdown.lock().take();
        if let Some(stream) = handle {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.state.lock().socket.close();
        self.enqueue_signal.notify_all();
        debug!("channel closed");
    }

    /// The single flush: transmit everything pending in one send.
    ///
    /// Nothing pending means nothing is sent. The buffer is cleared only
    /// once the send has gone through; a failed flush leaves the request
    /// queued so it is not silently lost.
    fn flush(st: &mut ChannelState) -> ChannelResult<()> {
        if st.buffer.is_empty() {
            return Ok(());
        }
        trace!(len = st.buffer.len(), "flushing pending request");
        st.socket.send(st.buffer.as_slice())?;
        st.buffer.clear();
        Ok(())
    }

    fn recv_plain(st: &mut ChannelState, buf: &mut [u8]) -> ChannelResult<usize> {
        match st.socket.recv(buf)? {
            RecvStatus::Data(n) => Ok(n),
            RecvStatus::Shutdown => Ok(0),
            RecvStatus::TimedOut => Err(ChannelError::TimeoutNoData),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelError;

    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn test_config() -> ChannelConfig {
        ChannelConfig {
            recv_timeout: Some(Duration::from_secs(2)),
            ..ChannelConfig::default()
        }
    }

    /// Echo responder on an ephemeral loopback port. Serves one
    /// connection and echoes until the peer disconnects.
    fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        addr
    }

    /// Accepts one connection and keeps it open without ever responding,
    /// until the returned sender is dropped.
    fn spawn_silent() -> (SocketAddr, mpsc::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                let _ = rx.recv();
                drop(stream);
            }
        });
        (addr, tx)
    }

    fn connect(config: ChannelConfig, addr: SocketAddr) -> Channel {
        let channel = Channel::create(config).unwrap();
        channel.connect("127.0.0.1", addr.port()).unwrap();
        channel
    }

    #[test]
    fn ping_scenario_measures_first_echoed_byte() {
        let addr = spawn_echo();
        let channel = connect(test_config(), addr);

        assert!(channel.elapsed_ticks().is_zero());
        let wall = Instant::now();

        channel.start_measurement();
        assert_eq!(channel.enqueue(b"PING").unwrap(), 4);
        assert!(channel.elapsed_ticks().is_zero());

        let mut first = [0u8; 1];
        assert_eq!(channel.measured_read(&mut first).unwrap(), 1);
        assert_eq!(first[0], b'P');
        let wall_elapsed = wall.elapsed();

        let elapsed = channel.elapsed_ticks();
        assert!(elapsed.get() > 0);
        assert_eq!(channel.session_state(), SessionState::Ready);
        // Repeated reads of the result are stable.
        assert_eq!(channel.elapsed_ticks(), elapsed);
        assert_eq!(channel.elapsed_ticks(), elapsed);
        // Sanity bound: the loopback exchange finished well inside the
        // receive timeout.
        assert!(wall_elapsed < Duration::from_secs(2));

        // Once Ready, the measured read signals end-of-data; the rest of
        // the payload comes through the passthrough reads.
        let mut buf = [0u8; 8];
        assert_eq!(channel.measured_read(&mut buf).unwrap(), 0);
        let mut rest = Vec::new();
        while rest.len() < 3 {
            let n = channel.read_passthrough(&mut buf).unwrap();
            assert!(n > 0);
            rest.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&rest, b"ING");

        channel.close();
    }

    #[test]
    fn rearming_measures_a_fresh_exchange() {
        let addr = spawn_echo();
        let channel = connect(test_config(), addr);

        let mut byte = [0u8; 1];
        channel.start_measurement();
        channel.enqueue(b"a").unwrap();
        channel.measured_read(&mut byte).unwrap();
        let first = channel.elapsed_ticks();
        assert!(first.get() > 0);

        channel.start_measurement();
        assert!(channel.elapsed_ticks().is_zero());
        channel.enqueue(b"b").unwrap();
        channel.measured_read(&mut byte).unwrap();
        assert_eq!(byte[0], b'b');
        assert!(channel.elapsed_ticks().get() > 0);

        channel.close();
    }

    #[test]
    fn empty_flush_times_out_and_stays_measuring() {
        let (addr, hold) = spawn_silent();
        let config = ChannelConfig {
            recv_timeout: Some(Duration::from_millis(300)),
            ..ChannelConfig::default()
        };
        let channel = connect(config, addr);

        channel.start_measurement();
        let mut buf = [0u8; 4];
        let err = channel.measured_read(&mut buf).unwrap_err();
        assert!(matches!(err, ChannelError::TimeoutNoData));
        assert_eq!(channel.session_state(), SessionState::Measuring);
        assert!(channel.elapsed_ticks().is_zero());

        // A retry without new data times out again, still Measuring.
        let err = channel.measured_read(&mut buf).unwrap_err();
        assert!(matches!(err, ChannelError::TimeoutNoData));
        assert_eq!(channel.session_state(), SessionState::Measuring);

        channel.close();
        drop(hold);
    }

    #[test]
    fn capacity_error_leaves_pending_data_usable() {
        let addr = spawn_echo();
        let config = ChannelConfig {
            capacity: 8,
            recv_timeout: Some(Duration::from_secs(2)),
            ..ChannelConfig::default()
        };
        let channel = connect(config, addr);

        channel.start_measurement();
        let err = channel.enqueue(b"123456789").unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Capacity {
                requested: 9,
                pending: 0,
                capacity: 8
            }
        ));

        channel.enqueue(b"OK").unwrap();
        let mut buf = [0u8; 8];
        let mut echoed = Vec::new();
        let n = channel.measured_read(&mut buf).unwrap();
        echoed.extend_from_slice(&buf[..n]);
        while echoed.len() < 2 {
            let n = channel.read_passthrough(&mut buf).unwrap();
            echoed.extend_from_slice(&buf[..n]);
        }
        // The flush sent exactly "OK": the echo returns it and nothing
        // else is readable.
        assert_eq!(&echoed, b"OK");
        assert!(!channel.poll_readiness().unwrap());

        channel.close();
    }

    #[test]
    fn idle_reads_pass_through_and_signal_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let _ = stream.write_all(b"A");
            }
            // Stream drops here: the peer sees EOF after the byte.
        });

        let channel = connect(test_config(), addr);
        assert_eq!(channel.read_single_byte().unwrap(), Some(b'A'));
        assert_eq!(channel.read_single_byte().unwrap(), None);
        channel.close();
    }

    #[test]
    fn poll_readiness_sees_buffered_response() {
        let addr = spawn_echo();
        let channel = connect(test_config(), addr);

        assert!(!channel.poll_readiness().unwrap());

        channel.start_measurement();
        channel.enqueue(b"PING").unwrap();
        let mut byte = [0u8; 1];
        channel.measured_read(&mut byte).unwrap();

        // The remaining three echoed bytes arrive asynchronously.
        let deadline = Instant::now() + Duration::from_secs(2);
        while !channel.poll_readiness().unwrap() {
            assert!(Instant::now() < deadline, "echoed payload never became readable");
            thread::sleep(Duration::from_millis(5));
        }

        channel.close();
    }

    #[test]
    fn bounded_read_waits_for_a_late_producer() {
        let addr = spawn_echo();
        let channel = Arc::new(connect(test_config(), addr));

        channel.start_measurement();

        let producer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                channel.enqueue(b"PING").unwrap();
            })
        };

        let mut buf = [0u8; 4];
        let n = channel.measured_read_bounded(&mut buf).unwrap();
        assert!(n > 0);
        assert_eq!(buf[0], b'P');
        assert_eq!(channel.session_state(), SessionState::Ready);
        assert!(channel.elapsed_ticks().get() > 0);

        // Completion is signaled as end-of-data on further bounded reads.
        assert_eq!(channel.measured_read_bounded(&mut buf).unwrap(), 0);

        producer.join().unwrap();
        channel.close();
    }

    #[test]
    fn close_unblocks_a_blocked_measured_read() {
        let (addr, hold) = spawn_silent();
        let config = ChannelConfig {
            recv_timeout: Some(Duration::from_secs(5)),
            ..ChannelConfig::default()
        };
        let channel = Arc::new(connect(config, addr));

        channel.start_measurement();
        channel.enqueue(b"PING").unwrap();

        let reader = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                let mut buf = [0u8; 4];
                channel.measured_read(&mut buf)
            })
        };

        // Give the reader time to flush and block in the receive.
        thread::sleep(Duration::from_millis(200));
        let wall = Instant::now();
        channel.close();
        let close_elapsed = wall.elapsed();
        assert!(
            close_elapsed < Duration::from_secs(1),
            "close() blocked for {close_elapsed:?} behind the in-flight receive"
        );

        // The blocked read observes the shutdown as end-of-stream.
        assert_eq!(reader.join().unwrap().unwrap(), 0);
        drop(hold);
    }

    #[test]
    fn failed_flush_keeps_the_request_queued() {
        let addr = spawn_echo();
        let channel = Channel::create(test_config()).unwrap();

        channel.start_measurement();
        channel.enqueue(b"PING").unwrap();

        // Not connected yet: the flush fails and must not discard the
        // queued request or disturb the armed session.
        let mut buf = [0u8; 4];
        let err = channel.measured_read(&mut buf).unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected));
        assert_eq!(channel.session_state(), SessionState::Armed);

        // Once connected, the retained request goes out unchanged.
        channel.connect("127.0.0.1", addr.port()).unwrap();
        let n = channel.measured_read(&mut buf).unwrap();
        assert!(n > 0);
        assert_eq!(buf[0], b'P');
        assert!(channel.elapsed_ticks().get() > 0);

        channel.close();
    }

    #[test]
    fn bounded_read_exhausts_attempts_without_data() {
        let (addr, hold) = spawn_silent();
        let config = ChannelConfig {
            recv_timeout: Some(Duration::from_secs(1)),
            retry: crate::RetryPolicy {
                attempts: 3,
                attempt_timeout: Duration::from_millis(50),
                backoff: Duration::from_millis(2),
            },
            ..ChannelConfig::default()
        };
        let channel = connect(config, addr);

        channel.start_measurement();
        let mut buf = [0u8; 4];
        let err = channel.measured_read_bounded(&mut buf).unwrap_err();
        assert!(matches!(err, ChannelError::TimeoutNoData));
        assert_eq!(channel.session_state(), SessionState::Measuring);

        channel.close();
        drop(hold);
    }

    /// Concurrent producers append whole chunks while the consumer
    /// flushes and reads; the echoed stream must be a concatenation of
    /// whole chunks, never a torn one.
    #[test]
    fn concurrent_enqueues_never_interleave_within_a_chunk() {
        const CHUNK: usize = 8;
        const CHUNKS_PER_PRODUCER: usize = 25;
        const PRODUCERS: usize = 4;
        const TOTAL: usize = CHUNK * CHUNKS_PER_PRODUCER * PRODUCERS;

        let addr = spawn_echo();
        let channel = Arc::new(connect(test_config(), addr));

        channel.start_measurement();

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|i| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    let chunk = [b'A' + i as u8; CHUNK];
                    for k in 0..CHUNKS_PER_PRODUCER {
                        channel.enqueue(&chunk).unwrap();
                        if k % 10 == 0 {
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                })
            })
            .collect();

        let mut received = Vec::with_capacity(TOTAL);
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(10);

        // First measured exchange overlaps the producers; afterwards,
        // re-arm to flush whatever was enqueued since the last drain.
        while received.len() < TOTAL {
            assert!(Instant::now() < deadline, "did not receive all chunks in time");
            match channel.measured_read_bounded(&mut buf) {
                Ok(0) => {}
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(ChannelError::TimeoutNoData) => {}
                Err(e) => panic!("unexpected error: {e:?}"),
            }
            while received.len() < TOTAL && channel.poll_readiness().unwrap() {
                let n = channel.read_passthrough(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            if received.len() < TOTAL {
                channel.start_measurement();
            }
        }

        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(received.len(), TOTAL);
        // Every aligned chunk is uniform: appends were atomic under the
        // gate, so no flush observed a partially appended chunk.
        for chunk in received.chunks(CHUNK) {
            assert!(chunk.iter().all(|&b| b == chunk[0]), "torn chunk: {chunk:?}");
        }

        channel.close();
    }
}
