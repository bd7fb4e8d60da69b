use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};
use tracing::{debug, trace};

use crate::protocol::{
    assemble_le, ACK_FAMILY, ACTIVITY_FAMILY, ACTIVITY_FULL_LEN, ACTIVITY_MIN_LEN, BATTERY_OFFSET,
    BATTERY_RANGE, CALORIES_RANGE, DIASTOLIC_RANGE, DISTANCE_RANGE, EXTENDED_FAMILY,
    EXTENDED_UNRELIABLE_SUBTYPE, HEALTH_FAMILY, HEALTH_SLEEP_SUBTYPE, HEART_RATE_MIN_LEN,
    HEART_RATE_RANGE, HEART_RATE_WINDOW, LEGACY_BATTERY_OFFSET, LEGACY_FAMILY,
    SLEEP_MINUTES_RANGE, SPO2_RANGE, STATUS_CHANNEL_MIN_LEN, STATUS_FAMILY,
    STATUS_HEART_RATE_OFFSET, STATUS_STRESS_OFFSET, STATUS_SUBTYPE, STATUS_UNCONFIRMED_SUBTYPE,
    STEPS_RANGE, STRESS_RANGE, SYSTOLIC_RANGE,
};
use crate::types::{
    BloodPressure, Channel, Field, MeasurementKind, RawPacket, Reading, SleepSummary,
};

/// Packet family a candidate value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    /// Activity frame on the steps channel
    Activity,
    /// `0x0F/0x06` status frame
    Status,
    /// `0x10` extended status frame
    ExtendedStatus,
    /// `0x03` legacy battery frame
    LegacyStatus,
    /// `0x0E` health result frame
    HealthResult,
    /// Real-time heart rate channel
    RealTime,
}

impl Source {
    /// Trust rank of this source for `field`; higher wins.
    ///
    /// `None` means the source never carries the field.
    #[must_use]
    pub const fn priority(self, field: Field) -> Option<u8> {
        match (field, self) {
            (Field::Battery, Self::Status) => Some(3),
            (Field::Battery, Self::ExtendedStatus) | (Field::HeartRate, Self::RealTime) => Some(2),
            (Field::Battery, Self::LegacyStatus)
            | (Field::HeartRate | Field::Stress, Self::Status) => Some(1),
            (Field::Stress, Self::HealthResult) => Some(2),
            (Field::Steps | Field::Distance | Field::Calories, Self::Activity)
            | (Field::BloodPressure | Field::SpO2 | Field::Sleep, Self::HealthResult) => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activity => write!(f, "activity"),
            Self::Status => write!(f, "status"),
            Self::ExtendedStatus => write!(f, "extended status"),
            Self::LegacyStatus => write!(f, "legacy status"),
            Self::HealthResult => write!(f, "health result"),
            Self::RealTime => write!(f, "real-time"),
        }
    }
}

/// Why a packet, or one value in it, produced no reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// Shorter than the family minimum
    TooShort,
    /// Family or subtype not recognised
    UnknownFamily,
    /// Subtype observed but with no confirmed meaning
    Unconfirmed,
    /// Family/subtype known to carry unreliable data
    Excluded,
    /// Value outside its valid range
    OutOfRange,
    /// A higher-priority source owns the field
    Superseded,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "too short"),
            Self::UnknownFamily => write!(f, "unknown family"),
            Self::Unconfirmed => write!(f, "unconfirmed subtype"),
            Self::Excluded => write!(f, "excluded subtype"),
            Self::OutOfRange => write!(f, "out of range"),
            Self::Superseded => write!(f, "superseded"),
        }
    }
}

/// Diagnostic counters kept by [`PacketDecoder`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeStats {
    /// Packets seen
    pub packets: u64,
    /// Readings emitted
    pub decoded: u64,
    /// Packets dropped for being too short
    pub too_short: u64,
    /// Packets with an unknown family or subtype
    pub unknown_family: u64,
    /// Packets with an unconfirmed subtype
    pub unconfirmed: u64,
    /// Packets from an excluded subtype
    pub excluded: u64,
    /// Values outside their valid range
    pub out_of_range: u64,
    /// Values rejected by source priority
    pub superseded: u64,
}

impl DecodeStats {
    /// Total drops across all reasons
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.too_short
            + self.unknown_family
            + self.unconfirmed
            + self.excluded
            + self.out_of_range
            + self.superseded
    }

    fn record(&mut self, reason: DropReason) {
        match reason {
            DropReason::TooShort => self.too_short += 1,
            DropReason::UnknownFamily => self.unknown_family += 1,
            DropReason::Unconfirmed => self.unconfirmed += 1,
            DropReason::Excluded => self.excluded += 1,
            DropReason::OutOfRange => self.out_of_range += 1,
            DropReason::Superseded => self.superseded += 1,
        }
    }
}

/// A value claimed by a packet before priority is applied.
///
/// `reading` is `None` when the source reported the field but the value was
/// outside its valid range.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    source: Source,
    field: Field,
    reading: Option<Reading>,
}

impl Candidate {
    const fn valid(source: Source, reading: Reading) -> Self {
        Self {
            source,
            field: reading.field(),
            reading: Some(reading),
        }
    }

    const fn rejected(source: Source, field: Field) -> Self {
        Self {
            source,
            field,
            reading: None,
        }
    }

    fn checked<T: PartialOrd>(
        source: Source,
        field: Field,
        value: T,
        range: &std::ops::RangeInclusive<T>,
        reading: impl FnOnce(T) -> Reading,
    ) -> Self {
        if range.contains(&value) {
            Self::valid(source, reading(value))
        } else {
            Self::rejected(source, field)
        }
    }
}

type Extracted = std::result::Result<Vec<Candidate>, DropReason>;

fn extract(packet: &RawPacket) -> Extracted {
    let bytes = &packet.bytes[..];
    match packet.channel {
        Channel::Steps => extract_activity(bytes),
        Channel::Status => extract_status(bytes),
        Channel::HeartRate => extract_real_time(bytes),
        Channel::Command => Err(DropReason::UnknownFamily),
    }
}

fn extract_activity(bytes: &[u8]) -> Extracted {
    if bytes.len() < ACTIVITY_MIN_LEN {
        return Err(DropReason::TooShort);
    }
    if bytes[0] != ACTIVITY_FAMILY {
        return Err(DropReason::UnknownFamily);
    }

    // Older firmware packs distance and calories one byte earlier
    let (distance_at, calories_at) = if bytes.len() >= ACTIVITY_FULL_LEN {
        (4, 7)
    } else {
        (3, 5)
    };
    let steps = u32::from(assemble_le(bytes[1], bytes[2]));
    let distance = u32::from(assemble_le(bytes[distance_at], bytes[distance_at + 1]));
    let calories = u32::from(assemble_le(bytes[calories_at], bytes[calories_at + 1]));

    Ok(vec![
        Candidate::checked(Source::Activity, Field::Steps, steps, &STEPS_RANGE, Reading::Steps),
        Candidate::checked(
            Source::Activity,
            Field::Distance,
            distance,
            &DISTANCE_RANGE,
            Reading::Distance,
        ),
        Candidate::checked(
            Source::Activity,
            Field::Calories,
            calories,
            &CALORIES_RANGE,
            Reading::Calories,
        ),
    ])
}

fn extract_status(bytes: &[u8]) -> Extracted {
    if bytes.len() < STATUS_CHANNEL_MIN_LEN {
        return Err(DropReason::TooShort);
    }

    match (bytes[0], bytes[1]) {
        (STATUS_FAMILY, STATUS_SUBTYPE) => {
            let mut candidates = vec![battery(Source::Status, bytes[BATTERY_OFFSET])];
            // Zero means the ring did not fill the slot
            if let Some(&stress) = bytes.get(STATUS_STRESS_OFFSET).filter(|v| **v != 0) {
                candidates.push(Candidate::checked(
                    Source::Status,
                    Field::Stress,
                    stress,
                    &STRESS_RANGE,
                    Reading::Stress,
                ));
            }
            if let Some(&bpm) = bytes.get(STATUS_HEART_RATE_OFFSET).filter(|v| **v != 0) {
                candidates.push(Candidate::checked(
                    Source::Status,
                    Field::HeartRate,
                    bpm,
                    &HEART_RATE_RANGE,
                    Reading::HeartRate,
                ));
            }
            Ok(candidates)
        }
        (STATUS_FAMILY, STATUS_UNCONFIRMED_SUBTYPE) => Err(DropReason::Unconfirmed),
        (LEGACY_FAMILY, _) => Ok(vec![battery(
            Source::LegacyStatus,
            bytes[LEGACY_BATTERY_OFFSET],
        )]),
        (EXTENDED_FAMILY, EXTENDED_UNRELIABLE_SUBTYPE) => Err(DropReason::Excluded),
        (EXTENDED_FAMILY, _) => Ok(vec![battery(
            Source::ExtendedStatus,
            bytes[BATTERY_OFFSET],
        )]),
        (HEALTH_FAMILY, subtype) => extract_health(subtype, bytes),
        (ACK_FAMILY, _) => Ok(Vec::new()),
        _ => Err(DropReason::UnknownFamily),
    }
}

fn battery(source: Source, value: u8) -> Candidate {
    Candidate::checked(source, Field::Battery, value, &BATTERY_RANGE, Reading::Battery)
}

fn extract_health(subtype: u8, bytes: &[u8]) -> Extracted {
    let source = Source::HealthResult;

    if subtype == HEALTH_SLEEP_SUBTYPE {
        let deep = assemble_le(bytes[2], bytes[3]);
        let light = assemble_le(bytes[4], bytes[5]);
        let candidate =
            if SLEEP_MINUTES_RANGE.contains(&deep) && SLEEP_MINUTES_RANGE.contains(&light) {
                Candidate::valid(
                    source,
                    Reading::Sleep(SleepSummary {
                        deep_minutes: deep,
                        light_minutes: light,
                    }),
                )
            } else {
                Candidate::rejected(source, Field::Sleep)
            };
        return Ok(vec![candidate]);
    }

    match MeasurementKind::from_code(subtype) {
        Some(MeasurementKind::BloodPressure) => {
            let (systolic, diastolic) = (bytes[2], bytes[3]);
            let valid = SYSTOLIC_RANGE.contains(&systolic)
                && DIASTOLIC_RANGE.contains(&diastolic)
                && systolic > diastolic;
            if !valid {
                return Ok(vec![Candidate::rejected(source, Field::BloodPressure)]);
            }
            let heart_rate = Some(bytes[4]).filter(|bpm| HEART_RATE_RANGE.contains(bpm));
            Ok(vec![Candidate::valid(
                source,
                Reading::BloodPressure(BloodPressure {
                    systolic,
                    diastolic,
                    heart_rate,
                }),
            )])
        }
        Some(MeasurementKind::SpO2) => {
            let (whole, tenths) = (bytes[2], bytes[3]);
            let value = f32::from(whole) + f32::from(tenths) / 10.0;
            let candidate = if tenths <= 9 && SPO2_RANGE.contains(&value) {
                Candidate::valid(source, Reading::SpO2(value))
            } else {
                Candidate::rejected(source, Field::SpO2)
            };
            Ok(vec![candidate])
        }
        Some(MeasurementKind::Stress) => Ok(vec![Candidate::checked(
            source,
            Field::Stress,
            bytes[2],
            &STRESS_RANGE,
            Reading::Stress,
        )]),
        Some(MeasurementKind::HeartRate) | None => Err(DropReason::UnknownFamily),
    }
}

fn extract_real_time(bytes: &[u8]) -> Extracted {
    if bytes.len() < HEART_RATE_MIN_LEN {
        return Err(DropReason::TooShort);
    }

    // The value moves between firmware builds; take the first plausible one
    let found = HEART_RATE_WINDOW
        .iter()
        .filter_map(|offset| bytes.get(*offset))
        .find(|bpm| HEART_RATE_RANGE.contains(*bpm));

    Ok(vec![match found {
        Some(&bpm) => Candidate::valid(Source::RealTime, Reading::HeartRate(bpm)),
        None => Candidate::rejected(Source::RealTime, Field::HeartRate),
    }])
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode one packet into validated readings, without source priority.
///
/// Pure: the same packet always yields the same readings. Malformed, unknown
/// and out-of-range data simply yields nothing.
///
/// # Examples
///
/// ```
/// use ringlink::{decoder, Channel, RawPacket, Reading};
///
/// let packet = RawPacket::new(
///     Channel::Steps,
///     vec![0x07, 0x89, 0x00, 0x26, 0x01, 0x0B, 0x00, 0x00, 0x00],
/// );
/// let readings = decoder::decode(&packet);
/// assert_eq!(readings[0], Reading::Steps(137));
/// ```
#[must_use]
pub fn decode(packet: &RawPacket) -> Vec<Reading> {
    extract(packet)
        .map(|candidates| candidates.into_iter().filter_map(|c| c.reading).collect())
        .unwrap_or_default()
}

/// Session-scoped decoder that applies per-field source priority.
///
/// Once a field has been filled from a source, readings from lower-priority
/// sources are dropped until the owning source reports an out-of-range value,
/// which counts as that source going silent.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    owners: HashMap<Field, (Source, u8)>,
    stats: DecodeStats,
}

impl PacketDecoder {
    /// Create a decoder with no field owners
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `packet` and return the readings that pass source priority, in
    /// packet order
    pub fn decode(&mut self, packet: &RawPacket) -> Vec<Reading> {
        self.stats.packets += 1;

        let candidates = match extract(packet) {
            Ok(candidates) => candidates,
            Err(reason) => {
                self.stats.record(reason);
                if reason == DropReason::TooShort {
                    trace!("Dropped short {} packet: {}", packet.channel, hex(&packet.bytes));
                } else {
                    debug!(
                        "Ignored {} packet ({}): {}",
                        packet.channel,
                        reason,
                        hex(&packet.bytes)
                    );
                }
                return Vec::new();
            }
        };

        candidates
            .into_iter()
            .filter_map(|candidate| self.admit(candidate))
            .collect()
    }

    fn admit(&mut self, candidate: Candidate) -> Option<Reading> {
        let Candidate {
            source,
            field,
            reading,
        } = candidate;
        let priority = source.priority(field)?;
        let owner = self.owners.get(&field).copied();
        let outranked = owner.is_some_and(|(_, held)| priority < held);

        let Some(reading) = reading else {
            self.stats.record(DropReason::OutOfRange);
            if !outranked && owner.is_some() {
                debug!("{} went silent for {:?}, releasing field", source, field);
                self.owners.remove(&field);
            }
            return None;
        };

        if outranked {
            self.stats.record(DropReason::Superseded);
            trace!("{:?} from {} superseded", reading, source);
            return None;
        }

        self.owners.insert(field, (source, priority));
        self.stats.decoded += 1;
        Some(reading)
    }

    /// Source currently owning `field`, if any
    #[must_use]
    pub fn owner(&self, field: Field) -> Option<Source> {
        self.owners.get(&field).map(|(source, _)| *source)
    }

    /// Diagnostic counters since the decoder was created
    #[must_use]
    pub const fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Forget all field owners; called when the link goes away.
    /// Counters keep accumulating.
    pub fn reset(&mut self) {
        self.owners.clear();
    }
}
