use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};

use crate::{
    error::{Result, RingError},
    types::{ChannelKey, DeviceHandle},
};

/// Platform pairing state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BondState {
    /// Not paired
    None,
    /// Pairing in progress
    Bonding,
    /// Paired
    Bonded,
}

impl fmt::Display for BondState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Bonding => write!(f, "bonding"),
            Self::Bonded => write!(f, "bonded"),
        }
    }
}

/// Link-level events reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkEvent {
    /// The link is connected
    Connected,
    /// The link dropped
    Disconnected,
    /// Pairing state changed
    BondStateChanged(BondState),
}

/// A Bluetooth backend able to find and open rings
#[async_trait]
pub trait Transport: Send + Sync {
    /// Scan for `duration`; the stream ends when the scan stops
    async fn scan(&self, duration: Duration) -> Result<BoxStream<'static, DeviceHandle>>;

    /// Open a link to `device`
    ///
    /// # Errors
    ///
    /// Returns [`RingError::LinkUnavailable`](crate::RingError::LinkUnavailable)
    /// when no adapter is present; any other error is treated as retryable.
    async fn open(&self, device: &DeviceHandle) -> Result<Arc<dyn Link>>;
}

/// An open link to one ring.
///
/// The supervisor is the only writer; implementations may assume at most one
/// `write_command` is in flight.
#[async_trait]
pub trait Link: Send + Sync {
    /// Current platform pairing state
    async fn bond_state(&self) -> Result<BondState>;

    /// Start pairing and wait for the platform to finish it.
    ///
    /// Backends that cannot pair on request leave this out and report
    /// [`RingError::Unsupported`]; the session then fails with `BondRejected`
    /// instead of assuming success.
    async fn bond(&self) -> Result<()> {
        Err(RingError::Unsupported("pairing"))
    }

    /// Discover services and list every channel the device exposes
    async fn discover(&self) -> Result<Vec<ChannelKey>>;

    /// Enable notifications on `channel`
    async fn subscribe(&self, channel: &ChannelKey) -> Result<BoxStream<'static, Bytes>>;

    /// Write one command and wait for the transport acknowledgement
    async fn write_command(&self, channel: &ChannelKey, data: &[u8]) -> Result<()>;

    /// Link event stream; ends when the link is gone
    async fn events(&self) -> Result<BoxStream<'static, LinkEvent>>;

    /// Tear the link down
    async fn close(&self) -> Result<()>;
}
