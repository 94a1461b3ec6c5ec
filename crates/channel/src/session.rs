//! Measurement session state machine
//!
//! Tracks one request/response timing exchange through the lifecycle
//! Idle -> Armed -> Measuring -> Ready. The channel samples the tick
//! clock around the flush and the first response byte and feeds the
//! values in here; the session only records them and guards the
//! transitions.

use crate::clock::TickValue;

/// Lifecycle state of a measurement session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No measurement in progress.
    Idle,
    /// Armed for the next exchange; ticks are zeroed.
    Armed,
    /// The request was flushed and the start tick recorded; waiting for
    /// the first response byte.
    Measuring,
    /// Both ticks recorded; the delta is available.
    Ready,
}

/// One measurement exchange: start/end ticks and the computed delta.
#[derive(Debug)]
pub struct MeasurementSession {
    state: SessionState,
    start: TickValue,
    end: TickValue,
    delta: TickValue,
}

impl MeasurementSession {
    /// Create a session in the `Idle` state with zeroed ticks.
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            start: TickValue::ZERO,
            end: TickValue::ZERO,
            delta: TickValue::ZERO,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Arm the session for the next exchange, clearing prior results.
    ///
    /// Valid from any state; re-arming discards a previous delta.
    pub fn arm(&mut self) {
        self.state = SessionState::Armed;
        self.start = TickValue::ZERO;
        self.end = TickValue::ZERO;
        self.delta = TickValue::ZERO;
    }

    /// Record the start tick sampled right after the flush send returned.
    ///
    /// Transitions Armed -> Measuring. Exactly one flush happens per this
    /// transition.
    pub fn begin(&mut self, start: TickValue) {
        debug_assert_eq!(self.state, SessionState::Armed);
        self.start = start;
        self.state = SessionState::Measuring;
    }

    /// Record the end tick sampled right after the first response byte.
    ///
    /// Transitions Measuring -> Ready and computes the delta. The
    /// subtraction saturates, so a counter anomaly can never surface as
    /// an absurd elapsed value.
    pub fn complete(&mut self, end: TickValue) {
        debug_assert_eq!(self.state, SessionState::Measuring);
        self.end = end;
        self.delta = end.saturating_delta(self.start);
        self.state = SessionState::Ready;
    }

    /// The measured delta when `Ready`, zero in every other state.
    pub fn elapsed(&self) -> TickValue {
        match self.state {
            SessionState::Ready => self.delta,
            _ => TickValue::ZERO,
        }
    }

    /// Start tick of the exchange (zero unless measuring or ready).
    pub fn start_tick(&self) -> TickValue {
        self.start
    }

    /// End tick of the exchange (zero unless ready).
    pub fn end_tick(&self) -> TickValue {
        self.end
    }
}

impl Default for MeasurementSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle() {
        let mut session = MeasurementSession::new();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.elapsed().is_zero());

        session.arm();
        assert_eq!(session.state(), SessionState::Armed);
        assert!(session.elapsed().is_zero());

        session.begin(TickValue::new(1_000));
        assert_eq!(session.state(), SessionState::Measuring);
        assert!(session.elapsed().is_zero());

        session.complete(TickValue::new(4_500));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.elapsed(), TickValue::new(3_500));
        assert!(session.end_tick() >= session.start_tick());
    }

    #[test]
    fn elapsed_is_stable_until_rearm() {
        let mut session = MeasurementSession::new();
        session.arm();
        session.begin(TickValue::new(10));
        session.complete(TickValue::new(25));

        for _ in 0..5 {
            assert_eq!(session.elapsed(), TickValue::new(15));
        }

        session.arm();
        assert!(session.elapsed().is_zero());
        assert!(session.start_tick().is_zero());
        assert!(session.end_tick().is_zero());
    }

    #[test]
    fn rearm_from_ready_clears_results() {
        let mut session = MeasurementSession::new();
        session.arm();
        session.begin(TickValue::new(5));
        session.complete(TickValue::new(9));
        assert_eq!(session.elapsed(), TickValue::new(4));

        session.arm();
        assert_eq!(session.state(), SessionState::Armed);
        assert!(session.elapsed().is_zero());
    }

    #[test]
    fn delta_saturates_on_counter_anomaly() {
        let mut session = MeasurementSession::new();
        session.arm();
        session.begin(TickValue::new(100));
        session.complete(TickValue::new(40));
        assert_eq!(session.elapsed(), TickValue::ZERO);
    }
}
