use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use uuid::Uuid;

use crate::{
    COMMAND_CHAR_UUID, HEART_RATE_CHAR_UUID, HEART_RATE_SERVICE_UUID, RING_SERVICE_UUID,
    STATUS_CHAR_UUID, STEPS_CHAR_UUID, STEPS_SERVICE_UUID,
};

/// A device seen during a scan.
///
/// Handles are immutable; a later advertisement from the same address produces
/// a new handle that supersedes the old one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    name: Option<String>,
    address: String,
    rssi: Option<i16>,
}

impl DeviceHandle {
    /// Create a new device handle
    #[must_use]
    pub fn new(name: Option<String>, address: impl Into<String>, rssi: Option<i16>) -> Self {
        Self {
            name,
            address: address.into(),
            rssi,
        }
    }

    /// Advertised name, if any
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Stable transport address
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Signal strength at the time of the scan
    #[must_use]
    pub const fn rssi(&self) -> Option<i16> {
        self.rssi
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Logical notification or command endpoint on the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    /// Activity totals (steps, distance, calories)
    Steps,
    /// Multiplexed status, battery and health results
    Status,
    /// Real-time heart rate
    HeartRate,
    /// Command writes
    Command,
}

impl Channel {
    /// Channels that deliver notifications
    pub const NOTIFY: [Self; 3] = [Self::Steps, Self::Status, Self::HeartRate];

    /// Every channel the engine knows
    pub const ALL: [Self; 4] = [Self::Steps, Self::Status, Self::HeartRate, Self::Command];
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steps => write!(f, "steps"),
            Self::Status => write!(f, "status"),
            Self::HeartRate => write!(f, "heart-rate"),
            Self::Command => write!(f, "command"),
        }
    }
}

/// Transport address of a channel: service plus characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    /// GATT service UUID
    pub service: Uuid,
    /// GATT characteristic UUID
    pub characteristic: Uuid,
}

impl ChannelKey {
    /// Create a new channel key
    #[must_use]
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Mapping between logical channels and transport addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelMap {
    /// Activity notifications
    pub steps: ChannelKey,
    /// Status notifications
    pub status: ChannelKey,
    /// Real-time heart rate notifications
    pub heart_rate: ChannelKey,
    /// Command writes
    pub command: ChannelKey,
    /// Channels that must be present for the device to be accepted
    pub required: Vec<Channel>,
}

impl ChannelMap {
    /// Transport address of `channel`
    #[must_use]
    pub const fn key(&self, channel: Channel) -> ChannelKey {
        match channel {
            Channel::Steps => self.steps,
            Channel::Status => self.status,
            Channel::HeartRate => self.heart_rate,
            Channel::Command => self.command,
        }
    }

    /// Logical channel at a transport address
    #[must_use]
    pub fn channel_for(&self, key: &ChannelKey) -> Option<Channel> {
        Channel::ALL.into_iter().find(|channel| self.key(*channel) == *key)
    }
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            steps: ChannelKey::new(STEPS_SERVICE_UUID, STEPS_CHAR_UUID),
            status: ChannelKey::new(RING_SERVICE_UUID, STATUS_CHAR_UUID),
            heart_rate: ChannelKey::new(HEART_RATE_SERVICE_UUID, HEART_RATE_CHAR_UUID),
            command: ChannelKey::new(RING_SERVICE_UUID, COMMAND_CHAR_UUID),
            required: Channel::ALL.to_vec(),
        }
    }
}

/// One notification as received. Consumed by the decoder, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// Channel the notification arrived on
    pub channel: Channel,
    /// Notification payload
    pub bytes: Bytes,
}

impl RawPacket {
    /// Create a new raw packet
    pub fn new(channel: Channel, bytes: impl Into<Bytes>) -> Self {
        Self {
            channel,
            bytes: bytes.into(),
        }
    }
}

/// Logical field of the ring snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    /// Battery percentage
    Battery,
    /// Step count
    Steps,
    /// Distance in meters
    Distance,
    /// Calories in kcal
    Calories,
    /// Heart rate in bpm
    HeartRate,
    /// Blood pressure
    BloodPressure,
    /// Blood oxygen saturation
    SpO2,
    /// Stress score
    Stress,
    /// Sleep summary
    Sleep,
}

/// Blood pressure result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloodPressure {
    /// Systolic pressure in mmHg
    pub systolic: u8,
    /// Diastolic pressure in mmHg
    pub diastolic: u8,
    /// Heart rate measured alongside, when reported
    pub heart_rate: Option<u8>,
}

/// Sleep totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepSummary {
    /// Minutes of deep sleep
    pub deep_minutes: u16,
    /// Minutes of light sleep
    pub light_minutes: u16,
}

/// A validated fact decoded from a packet
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Reading {
    /// Battery percentage, 1 to 100
    Battery(u8),
    /// Step count
    Steps(u32),
    /// Distance in meters
    Distance(u32),
    /// Calories in kcal
    Calories(u32),
    /// Heart rate in bpm
    HeartRate(u8),
    /// Blood pressure
    BloodPressure(BloodPressure),
    /// Blood oxygen saturation in percent
    SpO2(f32),
    /// Stress score
    Stress(u8),
    /// Sleep summary
    Sleep(SleepSummary),
}

impl Reading {
    /// Snapshot field this reading updates
    #[must_use]
    pub const fn field(&self) -> Field {
        match self {
            Self::Battery(_) => Field::Battery,
            Self::Steps(_) => Field::Steps,
            Self::Distance(_) => Field::Distance,
            Self::Calories(_) => Field::Calories,
            Self::HeartRate(_) => Field::HeartRate,
            Self::BloodPressure(_) => Field::BloodPressure,
            Self::SpO2(_) => Field::SpO2,
            Self::Stress(_) => Field::Stress,
            Self::Sleep(_) => Field::Sleep,
        }
    }
}

/// On-demand measurement the ring can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MeasurementKind {
    /// Heart rate
    HeartRate,
    /// Blood pressure
    BloodPressure,
    /// Blood oxygen saturation
    SpO2,
    /// Stress
    Stress,
}

impl MeasurementKind {
    /// Every measurement kind
    pub const ALL: [Self; 4] = [Self::HeartRate, Self::BloodPressure, Self::SpO2, Self::Stress];

    /// Wire code used in measurement commands and health result subtypes
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::HeartRate => 0x01,
            Self::BloodPressure => 0x02,
            Self::SpO2 => 0x03,
            Self::Stress => 0x04,
        }
    }

    /// Convert from a wire code
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::HeartRate),
            0x02 => Some(Self::BloodPressure),
            0x03 => Some(Self::SpO2),
            0x04 => Some(Self::Stress),
            _ => None,
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartRate => write!(f, "heart rate"),
            Self::BloodPressure => write!(f, "blood pressure"),
            Self::SpO2 => write!(f, "SpO2"),
            Self::Stress => write!(f, "stress"),
        }
    }
}

/// Progress record of one measurement kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementSession {
    /// Measurement being run
    pub kind: MeasurementKind,
    /// Full length of the measurement
    pub total: Duration,
    /// Time left before auto-stop
    pub remaining: Duration,
    /// Whether the session is still running
    pub active: bool,
}

impl MeasurementSession {
    /// Create a fresh, active session
    #[must_use]
    pub const fn new(kind: MeasurementKind, total: Duration) -> Self {
        Self {
            kind,
            total,
            remaining: total,
            active: true,
        }
    }
}

/// Scan parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanParams {
    /// Scan duration in milliseconds
    pub scan_timeout_ms: u64,
    /// Advertised name prefixes that identify a ring (case-insensitive)
    pub name_prefixes: Vec<String>,
    /// Keep devices that advertise no name
    pub include_unnamed: bool,
}

impl ScanParams {
    /// Scan duration
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            name_prefixes: vec!["R0".to_string(), "R1".to_string(), "RING".to_string()],
            include_unnamed: false,
        }
    }
}

/// Timeout configuration for session establishment and commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Wall-clock budget from `Connecting` to `Ready` in milliseconds
    pub connect_timeout_ms: u64,
    /// Bonding completion timeout in milliseconds
    pub bond_timeout_ms: u64,
    /// Per-command acknowledgment timeout in milliseconds
    pub command_timeout_ms: u64,
    /// A link loss this soon after the link opened means the peer is busy
    pub peer_busy_window_ms: u64,
    /// Keep-alive interval in milliseconds
    pub keep_alive_interval_ms: u64,
    /// Attempts per channel subscription
    pub subscribe_attempts: u32,
    /// Delay before retrying a rejected establishment command
    pub command_retry_delay_ms: u64,
}

impl TimeoutConfig {
    /// Connection attempt budget
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Bonding timeout
    #[must_use]
    pub const fn bond_timeout(&self) -> Duration {
        Duration::from_millis(self.bond_timeout_ms)
    }

    /// Per-command timeout
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Peer-busy detection window
    #[must_use]
    pub const fn peer_busy_window(&self) -> Duration {
        Duration::from_millis(self.peer_busy_window_ms)
    }

    /// Keep-alive interval
    #[must_use]
    pub const fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Establishment command retry delay
    #[must_use]
    pub const fn command_retry_delay(&self) -> Duration {
        Duration::from_millis(self.command_retry_delay_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 20_000,
            bond_timeout_ms: 15_000,
            command_timeout_ms: 3_000,
            peer_busy_window_ms: 2_000,
            keep_alive_interval_ms: 15_000,
            subscribe_attempts: 3,
            command_retry_delay_ms: 500,
        }
    }
}

/// Exponential backoff for automatic reconnection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on a single delay in milliseconds
    pub max_delay_ms: u64,
    /// Reconnect attempts before giving up
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay_ms.saturating_mul(1_u64 << doublings);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 16_000,
            max_attempts: 5,
        }
    }
}

/// Length and sampling cadence of one measurement kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementWindow {
    /// Total measurement time in seconds
    pub total_secs: u32,
    /// Seconds between sample commands
    pub sample_every_secs: u32,
}

impl MeasurementWindow {
    /// Create a new window
    #[must_use]
    pub const fn new(total_secs: u32, sample_every_secs: u32) -> Self {
        Self {
            total_secs,
            sample_every_secs,
        }
    }

    /// Total measurement time
    #[must_use]
    pub const fn total(&self) -> Duration {
        Duration::from_secs(self.total_secs as u64)
    }
}

/// Per-kind measurement timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementTiming {
    /// Heart rate window
    pub heart_rate: MeasurementWindow,
    /// Blood pressure window
    pub blood_pressure: MeasurementWindow,
    /// SpO2 window
    pub spo2: MeasurementWindow,
    /// Stress window
    pub stress: MeasurementWindow,
}

impl MeasurementTiming {
    /// Window for `kind`
    #[must_use]
    pub const fn window(&self, kind: MeasurementKind) -> MeasurementWindow {
        match kind {
            MeasurementKind::HeartRate => self.heart_rate,
            MeasurementKind::BloodPressure => self.blood_pressure,
            MeasurementKind::SpO2 => self.spo2,
            MeasurementKind::Stress => self.stress,
        }
    }
}

impl Default for MeasurementTiming {
    fn default() -> Self {
        Self {
            heart_rate: MeasurementWindow::new(30, 10),
            blood_pressure: MeasurementWindow::new(45, 15),
            spo2: MeasurementWindow::new(30, 10),
            stress: MeasurementWindow::new(30, 10),
        }
    }
}

/// Everything a session needs to know
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Timeouts
    pub timeouts: TimeoutConfig,
    /// Reconnection backoff
    pub reconnect: ReconnectPolicy,
    /// Measurement timing
    pub measurements: MeasurementTiming,
    /// Channel addressing
    pub channels: ChannelMap,
}
