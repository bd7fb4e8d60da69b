use bytes::{BufMut, Bytes, BytesMut};
use std::ops::RangeInclusive;
use time::OffsetDateTime;

use crate::types::MeasurementKind;

/// Family sentinel of activity frames on the steps channel
pub const ACTIVITY_FAMILY: u8 = 0x07;
/// Shortest activity frame (older firmware layout)
pub const ACTIVITY_MIN_LEN: usize = 9;
/// Length of the full activity frame
pub const ACTIVITY_FULL_LEN: usize = 10;

/// Shortest frame accepted on the status channel
pub const STATUS_CHANNEL_MIN_LEN: usize = 9;

/// Status family
pub const STATUS_FAMILY: u8 = 0x0F;
/// Status subtype carrying battery, stress and heart rate
pub const STATUS_SUBTYPE: u8 = 0x06;
/// Status subtype seen only with a constant payload; meaning unconfirmed
pub const STATUS_UNCONFIRMED_SUBTYPE: u8 = 0x0A;
/// Battery offset in status and extended frames
pub const BATTERY_OFFSET: usize = 8;
/// Optional stress offset in status frames
pub const STATUS_STRESS_OFFSET: usize = 11;
/// Optional heart rate offset in status frames
pub const STATUS_HEART_RATE_OFFSET: usize = 12;

/// Legacy battery family (single selector byte, no subtype)
pub const LEGACY_FAMILY: u8 = 0x03;
/// Battery offset in legacy frames: same payload position, one header byte less
pub const LEGACY_BATTERY_OFFSET: usize = BATTERY_OFFSET - 1;

/// Extended status family
pub const EXTENDED_FAMILY: u8 = 0x10;
/// Extended subtype whose battery byte is unreliable
pub const EXTENDED_UNRELIABLE_SUBTYPE: u8 = 0x02;

/// Health result family; the subtype is the measurement code
pub const HEALTH_FAMILY: u8 = 0x0E;
/// Health subtype carrying a sleep summary
pub const HEALTH_SLEEP_SUBTYPE: u8 = 0x05;

/// Acknowledgement family; carries no fields
pub const ACK_FAMILY: u8 = 0xA0;

/// Shortest real-time heart rate frame
pub const HEART_RATE_MIN_LEN: usize = 2;
/// Offsets searched for the heart rate value on the real-time channel
pub const HEART_RATE_WINDOW: [usize; 3] = [1, 2, 3];

/// Valid battery percentage
pub const BATTERY_RANGE: RangeInclusive<u8> = 1..=100;
/// Valid heart rate in bpm
pub const HEART_RATE_RANGE: RangeInclusive<u8> = 40..=200;
/// Valid SpO2 percentage
pub const SPO2_RANGE: RangeInclusive<f32> = 80.0..=100.0;
/// Valid systolic pressure in mmHg
pub const SYSTOLIC_RANGE: RangeInclusive<u8> = 70..=200;
/// Valid diastolic pressure in mmHg
pub const DIASTOLIC_RANGE: RangeInclusive<u8> = 40..=130;
/// Valid stress score
pub const STRESS_RANGE: RangeInclusive<u8> = 1..=100;
/// Valid step count
pub const STEPS_RANGE: RangeInclusive<u32> = 0..=99_999;
/// Valid distance in meters
pub const DISTANCE_RANGE: RangeInclusive<u32> = 0..=65_535;
/// Valid calories in kcal
pub const CALORIES_RANGE: RangeInclusive<u32> = 0..=9_999;
/// Valid minutes per sleep stage
pub const SLEEP_MINUTES_RANGE: RangeInclusive<u16> = 0..=1_440;

/// Assemble a two-byte little-endian field.
///
/// A zero high byte means the firmware wrote an 8-bit value and only `low` is
/// used. Several families reuse the same offsets across firmware variants, so
/// this must stay asymmetric.
#[must_use]
pub fn assemble_le(low: u8, high: u8) -> u16 {
    if high == 0 {
        u16::from(low)
    } else {
        u16::from_le_bytes([low, high])
    }
}

/// Command opcodes written to the command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Set the ring clock
    TimeSync = 0x01,
    /// Open the command session
    Handshake = 0x02,
    /// Ask for a battery report
    BatteryQuery = 0x03,
    /// Harmless link-quality check used as keep-alive
    LinkCheck = 0x04,
    /// Start an on-demand measurement
    MeasurementStart = 0x10,
    /// Stop an on-demand measurement
    MeasurementStop = 0x11,
    /// Ask the ring to emit a fresh measurement sample
    MeasurementSample = 0x12,
}

impl Opcode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::TimeSync),
            0x02 => Some(Self::Handshake),
            0x03 => Some(Self::BatteryQuery),
            0x04 => Some(Self::LinkCheck),
            0x10 => Some(Self::MeasurementStart),
            0x11 => Some(Self::MeasurementStop),
            0x12 => Some(Self::MeasurementSample),
            _ => None,
        }
    }
}

/// A command for the ring: one opcode byte followed by a short payload.
///
/// Replies are not synchronous; they arrive later on the notification channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: Opcode,
    payload: Vec<u8>,
}

impl Command {
    /// Create a new command
    #[must_use]
    pub const fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    /// Handshake that opens the command session
    #[must_use]
    pub const fn handshake() -> Self {
        Self::new(Opcode::Handshake, Vec::new())
    }

    /// Set the ring clock to `at`.
    ///
    /// Layout matches the clock bytes in status frames: `yy mm dd hh mi ss`.
    #[must_use]
    pub fn time_sync(at: OffsetDateTime) -> Self {
        let year = u8::try_from(at.year().rem_euclid(100)).unwrap_or(0);
        Self::new(
            Opcode::TimeSync,
            vec![
                year,
                u8::from(at.month()),
                at.day(),
                at.hour(),
                at.minute(),
                at.second(),
            ],
        )
    }

    /// Ask for a battery report
    #[must_use]
    pub const fn battery_query() -> Self {
        Self::new(Opcode::BatteryQuery, Vec::new())
    }

    /// Keep-alive link check
    #[must_use]
    pub const fn link_check() -> Self {
        Self::new(Opcode::LinkCheck, Vec::new())
    }

    /// Start a measurement
    #[must_use]
    pub fn measurement_start(kind: MeasurementKind) -> Self {
        Self::new(Opcode::MeasurementStart, vec![kind.code()])
    }

    /// Stop a measurement
    #[must_use]
    pub fn measurement_stop(kind: MeasurementKind) -> Self {
        Self::new(Opcode::MeasurementStop, vec![kind.code()])
    }

    /// Request a fresh sample for a running measurement
    #[must_use]
    pub fn measurement_sample(kind: MeasurementKind) -> Self {
        Self::new(Opcode::MeasurementSample, vec![kind.code()])
    }

    /// Command opcode
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Command payload
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize command to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.opcode as u8);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Local wall-clock time for time sync, falling back to UTC when the local
/// offset cannot be determined
#[must_use]
pub fn device_clock_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}
