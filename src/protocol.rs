//! Wire codec for the pump's GATT characteristics.
//!
//! Every payload is a fixed layout of little-endian integers, except the
//! sync command which is the ASCII literal `SYNC`. Decoding fails closed:
//! a buffer of the wrong length is a framing error, never a partial parse.
//!
//! Range policy lives in the value constructors ([`PumpRateCommand`],
//! [`MeasurementInterval`]); the encoders assume validated input.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Size of a measurement notification in bytes (last two are reserved).
pub const MEASUREMENT_LEN: usize = 12;

/// Lowest accepted pump rate in µL/min.
pub const MIN_RATE_UL_MIN: u16 = 1;

/// Highest accepted pump rate in µL/min.
pub const MAX_RATE_UL_MIN: u16 = 10_000;

/// Shortest notification interval; faster would collide with command traffic.
pub const MIN_INTERVAL_MS: u16 = 400;

/// Longest notification interval.
pub const MAX_INTERVAL_MS: u16 = 65_500;

const SYNC_COMMAND: &[u8] = b"SYNC";

/// Bluetooth base UUID; 16-bit assigned numbers live in bits 96..112.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

// ============================================================================
// Characteristics
// ============================================================================

/// The characteristic set exposed by the pump controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// Notify: 12-byte measurement record.
    Measurement,
    /// Write: u16 notification interval in ms.
    MeasurementInterval,
    /// Write: ASCII `SYNC`, resets the device clock.
    Sync,
    /// Write: 2-byte multiplexer code pair simulating a front-panel button.
    ButtonPress,
    /// Write: u16 pump rate in µL/min.
    PumpRate,
}

impl Characteristic {
    pub const COUNT: usize = 5;

    pub const ALL: [Characteristic; Self::COUNT] = [
        Characteristic::Measurement,
        Characteristic::MeasurementInterval,
        Characteristic::Sync,
        Characteristic::ButtonPress,
        Characteristic::PumpRate,
    ];

    pub const fn uuid(self) -> Uuid {
        match self {
            Characteristic::Measurement => short_uuid(0x55A5),
            Characteristic::MeasurementInterval => short_uuid(0x55A6),
            Characteristic::Sync => short_uuid(0x55A7),
            Characteristic::ButtonPress => short_uuid(0x55A8),
            Characteristic::PumpRate => short_uuid(0x55A9),
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }

    /// Index into per-characteristic tables.
    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Characteristic::Measurement => "measurement",
            Characteristic::MeasurementInterval => "measurement-interval",
            Characteristic::Sync => "sync",
            Characteristic::ButtonPress => "button-press",
            Characteristic::PumpRate => "pump-rate",
        };
        write!(f, "{name} ({})", self.uuid())
    }
}

// ============================================================================
// Data Types
// ============================================================================

/// One telemetry sample from the pump.
///
/// A record whose timestamp is smaller than its predecessor's means the
/// device clock was reset by a sync command; that is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeasurementRecord {
    /// Milliseconds since device start (or last sync).
    pub timestamp_ms: u32,
    /// Raw pressure transducer reading.
    pub psi_raw: u16,
    /// Raw motor current reading.
    pub motor_current_raw: u16,
    /// Pump rate reported by the firmware, µL/min.
    pub pump_rate_ul_min: u16,
}

impl MeasurementRecord {
    /// Device clock at the time of the sample.
    pub fn device_time(&self) -> Duration {
        Duration::from_millis(u64::from(self.timestamp_ms))
    }
}

/// Front-panel buttons the controller can press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ButtonCommand {
    RunStop,
    Up,
    Down,
    Edit,
    Menu,
}

impl ButtonCommand {
    pub const ALL: [ButtonCommand; 5] = [
        ButtonCommand::RunStop,
        ButtonCommand::Up,
        ButtonCommand::Down,
        ButtonCommand::Edit,
        ButtonCommand::Menu,
    ];

    /// Multiplexer channel pair (mux1, mux2) wired to the button.
    pub const fn code(self) -> [u8; 2] {
        match self {
            ButtonCommand::RunStop => [0x00, 0x00],
            ButtonCommand::Up => [0x01, 0x00],
            ButtonCommand::Down => [0x01, 0x01],
            ButtonCommand::Edit => [0x02, 0x01],
            ButtonCommand::Menu => [0x02, 0x00],
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            ButtonCommand::RunStop => "RunStop",
            ButtonCommand::Up => "UP",
            ButtonCommand::Down => "DOWN",
            ButtonCommand::Edit => "EDIT",
            ButtonCommand::Menu => "MENU",
        }
    }
}

impl fmt::Display for ButtonCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ButtonCommand {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|b| b.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                DriverError::Validation(format!(
                    "unknown button '{wanted}'; valid buttons: RunStop, UP, DOWN, EDIT, MENU"
                ))
            })
    }
}

/// Unit of a caller-supplied flow rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateUnit {
    #[default]
    MicrolitersPerMinute,
    MillilitersPerMinute,
}

impl RateUnit {
    /// Convert `value` in this unit to µL/min, rounded to the nearest integer.
    pub fn to_ul_min(self, value: f64) -> f64 {
        let ul = match self {
            RateUnit::MicrolitersPerMinute => value,
            RateUnit::MillilitersPerMinute => value * 1000.0,
        };
        ul.round()
    }
}

impl FromStr for RateUnit {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ul/min" | "µl/min" | "ul" | "µl" => Ok(RateUnit::MicrolitersPerMinute),
            "ml/min" | "ml" => Ok(RateUnit::MillilitersPerMinute),
            other => Err(DriverError::Validation(format!(
                "invalid unit '{other}'; expected 'uL/min' or 'mL/min'"
            ))),
        }
    }
}

/// A validated pump rate, always in `[1, 10000]` µL/min.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PumpRateCommand(u16);

impl PumpRateCommand {
    pub fn new(rate_ul_min: u16) -> Result<Self> {
        if !(MIN_RATE_UL_MIN..=MAX_RATE_UL_MIN).contains(&rate_ul_min) {
            return Err(DriverError::Validation(format!(
                "pump rate {rate_ul_min} µL/min outside [{MIN_RATE_UL_MIN}, {MAX_RATE_UL_MIN}]"
            )));
        }
        Ok(Self(rate_ul_min))
    }

    /// Validate a rate given in any supported unit.
    pub fn from_unit(value: f64, unit: RateUnit) -> Result<Self> {
        let ul = unit.to_ul_min(value);
        if !ul.is_finite() || ul < f64::from(MIN_RATE_UL_MIN) || ul > f64::from(MAX_RATE_UL_MIN)
        {
            return Err(DriverError::Validation(format!(
                "pump rate {value} ({unit:?}) outside [{MIN_RATE_UL_MIN}, {MAX_RATE_UL_MIN}] µL/min"
            )));
        }
        Self::new(ul as u16)
    }

    pub fn ul_min(self) -> u16 {
        self.0
    }
}

/// A validated notification interval, always in `[400, 65500]` ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeasurementInterval(u16);

impl MeasurementInterval {
    pub fn new(interval_ms: u16) -> Result<Self> {
        if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
            return Err(DriverError::Validation(format!(
                "measurement interval {interval_ms} ms outside [{MIN_INTERVAL_MS}, {MAX_INTERVAL_MS}]"
            )));
        }
        Ok(Self(interval_ms))
    }

    pub fn ms(self) -> u16 {
        self.0
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Decode a measurement notification.
///
/// Layout: u32 timestamp @0, u16 psi @4, u16 motor current @6,
/// u16 pump rate @8, two reserved bytes @10.
pub fn decode_measurement(bytes: &[u8]) -> Result<MeasurementRecord> {
    let data: &[u8; MEASUREMENT_LEN] = bytes.try_into().map_err(|_| DriverError::Framing {
        expected: MEASUREMENT_LEN,
        actual: bytes.len(),
    })?;

    Ok(MeasurementRecord {
        timestamp_ms: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        psi_raw: u16::from_le_bytes([data[4], data[5]]),
        motor_current_raw: u16::from_le_bytes([data[6], data[7]]),
        pump_rate_ul_min: u16::from_le_bytes([data[8], data[9]]),
    })
}

/// Inverse of [`decode_measurement`]; reserved bytes are zero.
pub fn encode_measurement(record: &MeasurementRecord) -> [u8; MEASUREMENT_LEN] {
    let mut out = [0u8; MEASUREMENT_LEN];
    out[0..4].copy_from_slice(&record.timestamp_ms.to_le_bytes());
    out[4..6].copy_from_slice(&record.psi_raw.to_le_bytes());
    out[6..8].copy_from_slice(&record.motor_current_raw.to_le_bytes());
    out[8..10].copy_from_slice(&record.pump_rate_ul_min.to_le_bytes());
    out
}

pub fn encode_interval(interval_ms: u16) -> [u8; 2] {
    interval_ms.to_le_bytes()
}

pub fn encode_rate(rate_ul_min: u16) -> [u8; 2] {
    rate_ul_min.to_le_bytes()
}

/// Decode a pump-rate payload, as read back from the characteristic.
pub fn decode_rate(bytes: &[u8]) -> Result<u16> {
    let data: [u8; 2] = bytes.try_into().map_err(|_| DriverError::Framing {
        expected: 2,
        actual: bytes.len(),
    })?;
    Ok(u16::from_le_bytes(data))
}

pub fn encode_sync() -> &'static [u8] {
    SYNC_COMMAND
}

pub fn encode_button(cmd: ButtonCommand) -> [u8; 2] {
    cmd.code()
}
