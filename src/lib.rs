//! Host-side driver for a BLE-retrofitted HPLC pump.
//!
//! The pump controller exposes a handful of GATT characteristics: a
//! measurement notification stream plus write-only characteristics for the
//! notification interval, clock sync, front-panel button presses and the
//! flow rate. This crate layers three pieces on top of a [`GattTransport`]:
//!
//! - [`protocol`]: byte-exact encode/decode of every payload.
//! - [`Dispatcher`]: owns the [`DeviceSession`], serializes writes per
//!   characteristic and fans out decoded measurements.
//! - [`ExperimentScheduler`]: turns a [`StagePlan`] of ramps and holds into
//!   paced rate commands, with pause, resume and abort.
//!
//! # Timing
//!
//! Measurement timestamps are device milliseconds since boot or the last
//! sync; a backwards step means the clock was reset, not that data was lost.
//! Run timing is host-side and excludes paused time.
//!
//! The BlueZ backend lives behind the `bluez` feature.

#[cfg(feature = "bluez")]
pub mod bluetooth;
pub mod config;
pub mod dispatcher;
mod errors;
pub mod experiment;
pub mod logging;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod transport;

#[cfg(feature = "bluez")]
pub use bluetooth::{BlePumpConnector, BluerTransport};
pub use config::{ConnectorConfig, DispatcherConfig, DriverConfig, SchedulerConfig};
pub use dispatcher::Dispatcher;
pub use errors::*;
pub use experiment::{ExperimentStage, PlanPosition, ProfileStage, StagePlan};
pub use logging::init_logging;
pub use protocol::{
    ButtonCommand, Characteristic, MeasurementInterval, MeasurementRecord, PumpRateCommand,
    RateUnit,
};
pub use scheduler::{ExperimentScheduler, RunSnapshot, RunStatus};
pub use session::{ConnectionState, DeviceSession};
pub use transport::{GattTransport, NotificationStream};
