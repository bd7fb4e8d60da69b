//! Scriptable in-memory ring.
//!
//! [`MockTransport`] behaves like a single ring in radio range. Tests push
//! notifications with [`MockTransport::notify`], drop the link with
//! [`MockTransport::drop_link`] and inspect written commands with
//! [`MockTransport::writes`]. Failure modes are set through
//! [`MockBehaviour`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    channel::mpsc,
    future,
    stream::{self, BoxStream, StreamExt},
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::debug;

use crate::{
    error::{Result, RingError},
    transport::{BondState, Link, LinkEvent, Transport},
    types::{Channel, ChannelKey, ChannelMap, DeviceHandle},
};

/// Failure modes of the mock ring
#[derive(Debug, Clone)]
pub struct MockBehaviour {
    /// Pairing state reported when a link opens
    pub bond_state: BondState,
    /// Whether an explicit `bond()` succeeds
    pub bond_succeeds: bool,
    /// When opening in [`BondState::Bonding`], announce completion on the event stream
    pub announce_bond: bool,
    /// Channels left out of service discovery
    pub missing_channels: Vec<Channel>,
    /// Number of subscription attempts to fail, per channel
    pub subscribe_failures: HashMap<Channel, u32>,
    /// Number of `open` calls to fail before succeeding
    pub open_failures: u32,
    /// Report that no adapter is present
    pub unavailable: bool,
    /// `open` never completes
    pub stall_open: bool,
    /// The link drops as soon as its event stream is requested
    pub drop_on_open: bool,
    /// Command writes never complete
    pub stall_writes: bool,
    /// Number of command writes to reject
    pub reject_writes: u32,
}

impl Default for MockBehaviour {
    fn default() -> Self {
        Self {
            bond_state: BondState::Bonded,
            bond_succeeds: true,
            announce_bond: false,
            missing_channels: Vec::new(),
            subscribe_failures: HashMap::new(),
            open_failures: 0,
            unavailable: false,
            stall_open: false,
            drop_on_open: false,
            stall_writes: false,
            reject_writes: 0,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    behaviour: MockBehaviour,
    devices: Vec<DeviceHandle>,
    generation: u64,
    connected: bool,
    open_count: u32,
    notify: HashMap<Channel, mpsc::UnboundedSender<Bytes>>,
    events: Vec<mpsc::UnboundedSender<LinkEvent>>,
    writes: Vec<Vec<u8>>,
}

impl MockState {
    fn hang_up(&mut self) {
        self.connected = false;
        self.notify.clear();
        self.events.clear();
    }
}

/// In-memory [`Transport`] for tests and offline development
#[derive(Debug, Clone)]
pub struct MockTransport {
    channels: ChannelMap,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// A transport whose scans report `devices`
    #[must_use]
    pub fn new(devices: Vec<DeviceHandle>) -> Self {
        Self {
            channels: ChannelMap::default(),
            state: Arc::new(Mutex::new(MockState {
                devices,
                ..MockState::default()
            })),
        }
    }

    /// A transport with one well-behaved ring nearby
    #[must_use]
    pub fn with_ring() -> Self {
        Self::new(vec![Self::ring()])
    }

    /// The device reported by [`MockTransport::with_ring`]
    #[must_use]
    pub fn ring() -> DeviceHandle {
        DeviceHandle::new(Some("R02_1A2B".to_string()), "AA:BB:CC:DD:EE:01", Some(-55))
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change failure modes
    pub fn configure(&self, f: impl FnOnce(&mut MockBehaviour)) {
        f(&mut self.lock().behaviour);
    }

    /// Push a notification on `channel`; returns whether anyone was subscribed
    pub fn notify(&self, channel: Channel, bytes: &[u8]) -> bool {
        self.lock()
            .notify
            .get(&channel)
            .is_some_and(|tx| tx.unbounded_send(Bytes::copy_from_slice(bytes)).is_ok())
    }

    /// Simulate the ring going out of range
    pub fn drop_link(&self) {
        let mut state = self.lock();
        debug!("Mock link dropped");
        for tx in &state.events {
            let _ = tx.unbounded_send(LinkEvent::Disconnected);
        }
        state.hang_up();
    }

    /// Push a raw link event
    pub fn emit(&self, event: LinkEvent) {
        self.lock()
            .events
            .retain(|tx| tx.unbounded_send(event).is_ok());
    }

    /// Every command written so far, in order
    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Opcode of every command written so far
    #[must_use]
    pub fn opcodes(&self) -> Vec<u8> {
        self.lock()
            .writes
            .iter()
            .filter_map(|w| w.first().copied())
            .collect()
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// How many times `open` was called
    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.lock().open_count
    }

    /// Whether a link is currently up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn scan(&self, _duration: Duration) -> Result<BoxStream<'static, DeviceHandle>> {
        let state = self.lock();
        if state.behaviour.unavailable {
            return Err(RingError::LinkUnavailable);
        }
        Ok(stream::iter(state.devices.clone()).boxed())
    }

    async fn open(&self, device: &DeviceHandle) -> Result<Arc<dyn Link>> {
        let stall = {
            let mut state = self.lock();
            state.open_count += 1;
            if state.behaviour.unavailable {
                return Err(RingError::LinkUnavailable);
            }
            if !state.devices.iter().any(|d| d.address() == device.address()) {
                return Err(RingError::DeviceNotFound);
            }
            if state.behaviour.open_failures > 0 {
                state.behaviour.open_failures -= 1;
                return Err(RingError::Transport("connection refused".to_string()));
            }
            state.behaviour.stall_open
        };
        if stall {
            future::pending::<()>().await;
        }

        let mut state = self.lock();
        state.hang_up();
        state.generation += 1;
        state.connected = true;
        debug!("Mock link {} opened to {}", state.generation, device);

        Ok(Arc::new(MockLink {
            generation: state.generation,
            channels: self.channels.clone(),
            transport: self.clone(),
        }))
    }
}

struct MockLink {
    generation: u64,
    channels: ChannelMap,
    transport: MockTransport,
}

impl MockLink {
    fn live(&self) -> Result<MutexGuard<'_, MockState>> {
        let state = self.transport.lock();
        if state.connected && state.generation == self.generation {
            Ok(state)
        } else {
            Err(RingError::Disconnected)
        }
    }
}

#[async_trait]
impl Link for MockLink {
    async fn bond_state(&self) -> Result<BondState> {
        Ok(self.live()?.behaviour.bond_state)
    }

    async fn bond(&self) -> Result<()> {
        let mut state = self.live()?;
        if state.behaviour.bond_succeeds {
            state.behaviour.bond_state = BondState::Bonded;
            Ok(())
        } else {
            Err(RingError::Transport("pairing rejected".to_string()))
        }
    }

    async fn discover(&self) -> Result<Vec<ChannelKey>> {
        let state = self.live()?;
        Ok(Channel::ALL
            .into_iter()
            .filter(|c| !state.behaviour.missing_channels.contains(c))
            .map(|c| self.channels.key(c))
            .collect())
    }

    async fn subscribe(&self, channel: &ChannelKey) -> Result<BoxStream<'static, Bytes>> {
        let logical = self
            .channels
            .channel_for(channel)
            .ok_or_else(|| RingError::Protocol(format!("Unknown channel {channel}")))?;

        let mut state = self.live()?;
        if let Some(remaining) = state.behaviour.subscribe_failures.get_mut(&logical) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RingError::Transport(format!(
                    "descriptor write failed on {logical}"
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded();
        state.notify.insert(logical, tx);
        Ok(rx.boxed())
    }

    async fn write_command(&self, _channel: &ChannelKey, data: &[u8]) -> Result<()> {
        let stall = {
            let mut state = self.live()?;
            if state.behaviour.reject_writes > 0 {
                state.behaviour.reject_writes -= 1;
                return Err(RingError::CommandRejected("write not permitted".to_string()));
            }
            if !state.behaviour.stall_writes {
                state.writes.push(data.to_vec());
            }
            state.behaviour.stall_writes
        };
        if stall {
            future::pending::<()>().await;
        }
        Ok(())
    }

    async fn events(&self) -> Result<BoxStream<'static, LinkEvent>> {
        let mut state = self.live()?;
        let (tx, rx) = mpsc::unbounded();

        if state.behaviour.drop_on_open {
            let _ = tx.unbounded_send(LinkEvent::Disconnected);
            state.hang_up();
            return Ok(rx.boxed());
        }
        if state.behaviour.bond_state == BondState::Bonding && state.behaviour.announce_bond {
            let _ = tx.unbounded_send(LinkEvent::BondStateChanged(BondState::Bonded));
        }
        state.events.push(tx);
        Ok(rx.boxed())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.transport.lock();
        if state.generation == self.generation {
            state.hang_up();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_scan_reports_devices() {
        let transport = MockTransport::with_ring();
        let found: Vec<_> = transport
            .scan(Duration::from_secs(1))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(found, vec![MockTransport::ring()]);
    }

    #[tokio::test]
    async fn test_notifications_reach_subscriber() {
        let transport = MockTransport::with_ring();
        let link = transport.open(&MockTransport::ring()).await.unwrap();
        let map = ChannelMap::default();
        let mut status = link.subscribe(&map.status).await.unwrap();

        assert!(transport.notify(Channel::Status, &[0xA0, 0x01]));
        assert!(!transport.notify(Channel::Steps, &[0x07]));
        assert_eq!(status.next().await.unwrap(), Bytes::from_static(&[0xA0, 0x01]));
    }

    #[tokio::test]
    async fn test_stale_link_rejects_writes() {
        let transport = MockTransport::with_ring();
        let map = ChannelMap::default();
        let first = transport.open(&MockTransport::ring()).await.unwrap();
        assert_ok!(first.write_command(&map.command, &[0x02]).await);

        transport.drop_link();
        assert_err!(first.write_command(&map.command, &[0x03]).await);

        let second = transport.open(&MockTransport::ring()).await.unwrap();
        assert_err!(first.write_command(&map.command, &[0x03]).await);
        assert_ok!(second.write_command(&map.command, &[0x04]).await);
        assert_eq!(transport.opcodes(), vec![0x02, 0x04]);
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test]
    async fn test_drop_link_ends_streams() {
        let transport = MockTransport::with_ring();
        let link = transport.open(&MockTransport::ring()).await.unwrap();
        let mut events = link.events().await.unwrap();
        let mut steps = link.subscribe(&ChannelMap::default().steps).await.unwrap();

        transport.drop_link();
        assert_eq!(events.next().await, Some(LinkEvent::Disconnected));
        assert_eq!(events.next().await, None);
        assert_eq!(steps.next().await, None);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_failure_budgets() {
        let transport = MockTransport::with_ring();
        transport.configure(|b| {
            b.open_failures = 1;
            b.subscribe_failures.insert(Channel::HeartRate, 1);
            b.missing_channels.push(Channel::Steps);
        });

        assert!(transport.open(&MockTransport::ring()).await.is_err());
        let link = transport.open(&MockTransport::ring()).await.unwrap();

        let keys = link.discover().await.unwrap();
        assert_eq!(keys.len(), 3);

        let heart_rate = ChannelMap::default().heart_rate;
        assert!(link.subscribe(&heart_rate).await.is_err());
        assert_ok!(link.subscribe(&heart_rate).await);
    }
}
