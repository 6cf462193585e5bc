//! Logical state of one physical pump connection.
//!
//! ```text
//! Disconnected --begin_connect--> Connecting --mark_ready--> Connected --mark_subscribed--> Subscribed
//!       ^                                                                                      |
//!       +------------------------------ link_lost (from any state) ----------------------------+
//! ```
//!
//! The session is plain synchronous state. It is owned by the
//! [`Dispatcher`](crate::dispatcher::Dispatcher), which is the only thing
//! that mutates it.

use log::{debug, info, warn};

use crate::errors::{DispatchError, DriverError, Result};
use crate::experiment::StagePlan;
use crate::protocol::MeasurementRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
}

impl ConnectionState {
    /// Command characteristics may only be written in these states.
    pub fn is_writable(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Subscribed)
    }
}

#[derive(Debug, Clone)]
pub struct DeviceSession {
    state: ConnectionState,
    last_measurement: Option<MeasurementRecord>,
    last_commanded_rate: Option<u16>,
    /// Survives link loss so the caller can choose to resume or abort.
    last_plan: Option<StagePlan>,
    clock_resyncs: u64,
}

impl Default for DeviceSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSession {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_measurement: None,
            last_commanded_rate: None,
            last_plan: None,
            clock_resyncs: 0,
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    pub fn begin_connect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Disconnected => {
                self.transition(ConnectionState::Connecting);
                Ok(())
            }
            other => Err(DriverError::Validation(format!(
                "cannot connect while {other:?}"
            ))),
        }
    }

    /// The transport reports the link is usable.
    pub fn mark_ready(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Connecting => {
                self.transition(ConnectionState::Connected);
                Ok(())
            }
            _ => Err(DriverError::NotConnected),
        }
    }

    pub fn mark_subscribed(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Connected => {
                self.transition(ConnectionState::Subscribed);
                Ok(())
            }
            ConnectionState::Subscribed => Ok(()),
            _ => Err(DriverError::NotConnected),
        }
    }

    /// Link loss from any state. Telemetry is dropped; the plan is kept.
    pub fn link_lost(&mut self) {
        if self.state != ConnectionState::Disconnected {
            warn!("link lost while {:?}", self.state);
        }
        self.transition(ConnectionState::Disconnected);
        self.last_measurement = None;
    }

    /// Explicit teardown: forget everything about this connection.
    pub fn reset(&mut self) {
        self.transition(ConnectionState::Disconnected);
        self.last_measurement = None;
        self.last_commanded_rate = None;
        self.last_plan = None;
        self.clock_resyncs = 0;
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            info!("session {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    // ------------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------------

    /// Fails immediately (no queuing) unless a write is allowed.
    pub fn ensure_writable(&self) -> std::result::Result<(), DispatchError> {
        if self.state.is_writable() {
            Ok(())
        } else {
            Err(DispatchError::NotConnected)
        }
    }

    pub fn record_measurement(&mut self, record: MeasurementRecord) {
        if let Some(prev) = self.last_measurement {
            if record.timestamp_ms < prev.timestamp_ms {
                self.clock_resyncs += 1;
                info!(
                    "device clock resynchronized: {} ms -> {} ms",
                    prev.timestamp_ms, record.timestamp_ms
                );
            }
        }
        debug!("measurement: {:?}", record);
        self.last_measurement = Some(record);
    }

    pub fn record_commanded_rate(&mut self, rate_ul_min: u16) {
        self.last_commanded_rate = Some(rate_ul_min);
    }

    pub fn remember_plan(&mut self, plan: StagePlan) {
        self.last_plan = Some(plan);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_measurement(&self) -> Option<MeasurementRecord> {
        self.last_measurement
    }

    pub fn last_commanded_rate(&self) -> Option<u16> {
        self.last_commanded_rate
    }

    pub fn last_plan(&self) -> Option<&StagePlan> {
        self.last_plan.as_ref()
    }

    /// Number of times the device timestamp went backwards.
    pub fn clock_resyncs(&self) -> u64 {
        self.clock_resyncs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ExperimentStage;

    fn record(ts: u32) -> MeasurementRecord {
        MeasurementRecord {
            timestamp_ms: ts,
            psi_raw: 1,
            motor_current_raw: 2,
            pump_rate_ul_min: 3,
        }
    }

    fn subscribed() -> DeviceSession {
        let mut s = DeviceSession::new();
        s.begin_connect().unwrap();
        s.mark_ready().unwrap();
        s.mark_subscribed().unwrap();
        s
    }

    #[test]
    fn happy_path_transitions() {
        let mut s = DeviceSession::new();
        assert_eq!(s.state(), ConnectionState::Disconnected);
        s.begin_connect().unwrap();
        assert_eq!(s.state(), ConnectionState::Connecting);
        s.mark_ready().unwrap();
        assert_eq!(s.state(), ConnectionState::Connected);
        s.mark_subscribed().unwrap();
        assert_eq!(s.state(), ConnectionState::Subscribed);
    }

    #[test]
    fn out_of_order_transitions_fail() {
        let mut s = DeviceSession::new();
        assert!(s.mark_ready().is_err());
        assert!(s.mark_subscribed().is_err());
        s.begin_connect().unwrap();
        assert!(s.begin_connect().is_err());
        assert!(s.mark_subscribed().is_err());
    }

    #[test]
    fn writes_only_when_connected_or_subscribed() {
        let mut s = DeviceSession::new();
        assert_eq!(s.ensure_writable(), Err(DispatchError::NotConnected));
        s.begin_connect().unwrap();
        assert_eq!(s.ensure_writable(), Err(DispatchError::NotConnected));
        s.mark_ready().unwrap();
        assert_eq!(s.ensure_writable(), Ok(()));
        s.mark_subscribed().unwrap();
        assert_eq!(s.ensure_writable(), Ok(()));
    }

    #[test]
    fn link_loss_clears_measurement_but_keeps_plan() {
        let mut s = subscribed();
        let plan = StagePlan::new(vec![ExperimentStage::hold(500, 60)]).unwrap();
        s.remember_plan(plan.clone());
        s.record_measurement(record(10));
        s.record_commanded_rate(500);

        s.link_lost();
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert_eq!(s.last_measurement(), None);
        assert_eq!(s.last_plan(), Some(&plan));
        assert_eq!(s.last_commanded_rate(), Some(500));

        s.reset();
        assert_eq!(s.last_plan(), None);
        assert_eq!(s.last_commanded_rate(), None);
    }

    #[test]
    fn link_loss_from_connecting() {
        let mut s = DeviceSession::new();
        s.begin_connect().unwrap();
        s.link_lost();
        assert_eq!(s.state(), ConnectionState::Disconnected);
        s.begin_connect().unwrap();
    }

    #[test]
    fn counts_clock_resyncs() {
        let mut s = subscribed();
        s.record_measurement(record(5000));
        s.record_measurement(record(5000));
        s.record_measurement(record(6000));
        assert_eq!(s.clock_resyncs(), 0);
        s.record_measurement(record(12));
        assert_eq!(s.clock_resyncs(), 1);
        assert_eq!(s.last_measurement(), Some(record(12)));
    }
}
