#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Ringlink
//!
//! Session engine and packet decoder for BLE smart rings that ship without
//! public protocol documentation.
//!
//! The crate takes a ring from "discovered" to "streaming validated data" and
//! keeps it there over an unreliable link. It is built from four parts:
//!
//! - **Connection supervisor**: the state machine that bonds, discovers,
//!   subscribes, runs the readiness handshake, keeps the link alive and
//!   reconnects with exponential backoff.
//! - **Packet decoder**: demultiplexes several incompatible binary families
//!   sharing the same notification channels into typed [`Reading`]s, with a
//!   per-field source priority so that less trustworthy packets never overwrite
//!   better data.
//! - **Measurement controller**: drives timed heart rate, blood pressure, SpO2
//!   and stress measurements to completion.
//! - **Ring state store**: the last-known-good [`RingSnapshot`], reset whenever
//!   the link goes away.
//!
//! The engine never touches platform Bluetooth APIs directly. It talks to a
//! [`Transport`]; [`BtleplugTransport`] drives real hardware and
//! [`MockTransport`] scripts a ring in memory.
//!
//! ## Protocol notes
//!
//! The wire format was reverse-engineered from captured notifications:
//!
//! - **Steps channel**: 9 or 10 byte activity frames behind a `0x07` sentinel
//! - **Status channel**: family/subtype multiplexed frames carrying battery,
//!   stress, heart rate and measurement results
//! - **Heart rate channel**: real-time frames whose value position varies by
//!   firmware, so a small window of offsets is searched
//! - **Commands**: an opcode byte followed by a short payload; replies arrive
//!   asynchronously on the notification channels
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ringlink::{BtleplugTransport, MeasurementKind, ScanParams, SessionConfig, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleplugTransport::new().await?);
//!     let supervisor = Supervisor::new(transport, SessionConfig::default());
//!
//!     // Find the strongest ring nearby and bring the session up
//!     let device = supervisor.find_first(&ScanParams::default()).await?;
//!     let session = supervisor.connect(device)?;
//!     session.wait_established().await?;
//!
//!     // Run a heart rate measurement
//!     session.start_measurement(MeasurementKind::HeartRate).await?;
//!
//!     println!("Battery: {:?}", session.snapshot().battery_percent);
//!     supervisor.disconnect().await?;
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Bluetooth Low Energy backend built on btleplug
pub mod ble;
/// Packet decoding and source priority
pub mod decoder;
/// Error types and handling
pub mod error;
/// Timed on-demand measurements
pub mod measurement;
/// In-memory transport for tests and offline development
pub mod mock;
/// Wire constants and command encoding
pub mod protocol;
mod queue;
/// Device discovery
pub mod scanner;
/// Connection lifecycle state machine
pub mod state;
/// Last-known-good ring readings
pub mod store;
/// Session supervisor and handles
pub mod supervisor;
/// Transport capability traits
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::BtleplugTransport;
pub use decoder::{DecodeStats, DropReason, PacketDecoder, Source};
pub use error::{Result, RingError};
pub use measurement::{CancelReason, CommandSink, MeasurementController, MeasurementEvent};
pub use mock::{MockBehaviour, MockTransport};
pub use protocol::{Command, Opcode};
pub use scanner::Scanner;
pub use state::{ConnectionState, FailureReason, SessionEvent, StateTransition};
pub use store::{RingSnapshot, RingStateStore};
pub use supervisor::{SessionHandle, Supervisor};
pub use transport::{BondState, Link, LinkEvent, Transport};
pub use types::{
    BloodPressure, Channel, ChannelKey, ChannelMap, DeviceHandle, Field, MeasurementKind,
    MeasurementSession, MeasurementTiming, MeasurementWindow, RawPacket, Reading,
    ReconnectPolicy, ScanParams, SessionConfig, SleepSummary, TimeoutConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Vendor service carrying the status notifications and the command endpoint
pub const RING_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_fff0_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Status characteristic (notify): battery, stress and measurement results
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Command characteristic (write)
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Pedometer service exposed by the ring firmware
pub const STEPS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_fee7_0000_1000_8000_0080_5f9b_34fb);

/// Activity characteristic (notify): steps, distance, calories
pub const STEPS_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_fea1_0000_1000_8000_0080_5f9b_34fb);

/// Standard heart rate service
pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Standard heart rate measurement characteristic (notify)
pub const HEART_RATE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);
