use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::{
    future,
    stream::{self, BoxStream, StreamExt},
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, RingError},
    transport::{BondState, Link, LinkEvent, Transport},
    types::{ChannelKey, DeviceHandle},
};

/// [`Transport`] backed by the platform Bluetooth stack through btleplug
///
/// btleplug has no pairing API. Links always report [`BondState::Bonded`] and
/// do not implement [`Link::bond`], which therefore fails with
/// [`RingError::Unsupported`].
pub struct BtleplugTransport {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BtleplugTransport {
    /// Create a new transport
    ///
    /// # Errors
    ///
    /// Returns [`RingError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn adapter(&self) -> Result<Adapter> {
        self.manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(RingError::LinkUnavailable)
    }

    async fn peripheral(&self, adapter: &Adapter, address: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.lock().await.get(address) {
            return Ok(peripheral.clone());
        }

        // Not seen by our own scans; the platform may still know it
        adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == address)
            .ok_or(RingError::DeviceNotFound)
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn scan(&self, duration: Duration) -> Result<BoxStream<'static, DeviceHandle>> {
        let adapter = self.adapter().await?;
        let events = adapter.events().await?;

        info!("Starting scan for {:?}", duration);
        adapter.start_scan(ScanFilter::default()).await?;

        let lookup = adapter.clone();
        let cache = Arc::clone(&self.peripherals);
        let found = events.filter_map(move |event| {
            let adapter = lookup.clone();
            let cache = Arc::clone(&cache);
            async move {
                let (CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) = event
                else {
                    return None;
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let properties = peripheral.properties().await.ok().flatten()?;
                let handle = DeviceHandle::new(
                    properties.local_name,
                    peripheral.id().to_string(),
                    properties.rssi,
                );
                cache
                    .lock()
                    .await
                    .insert(handle.address().to_string(), peripheral);
                Some(handle)
            }
        });

        let stop = stream::once(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
            debug!("Scan stopped");
        })
        .filter_map(|()| future::ready(None::<DeviceHandle>));

        Ok(found
            .take_until(tokio::time::sleep(duration))
            .chain(stop)
            .boxed())
    }

    async fn open(&self, device: &DeviceHandle) -> Result<Arc<dyn Link>> {
        let adapter = self.adapter().await?;
        let peripheral = self.peripheral(&adapter, device.address()).await?;

        info!("Connecting to device: {}", device);
        peripheral.connect().await?;

        Ok(Arc::new(BtleplugLink {
            adapter,
            peripheral,
        }))
    }
}

/// One connected peripheral
struct BtleplugLink {
    adapter: Adapter,
    peripheral: Peripheral,
}

impl BtleplugLink {
    fn characteristic(&self, key: &ChannelKey) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == key.service && c.uuid == key.characteristic)
            .ok_or_else(|| RingError::Protocol(format!("Characteristic {key} not found")))
    }
}

#[async_trait]
impl Link for BtleplugLink {
    /// btleplug exposes no pairing state, so every link reports `Bonded` and
    /// the OS negotiates pairing on first encrypted access. Explicit pairing
    /// falls through to [`Link::bond`]'s `Unsupported` error.
    async fn bond_state(&self) -> Result<BondState> {
        Ok(BondState::Bonded)
    }

    async fn discover(&self) -> Result<Vec<ChannelKey>> {
        self.peripheral.discover_services().await?;

        let keys: Vec<ChannelKey> = self
            .peripheral
            .services()
            .iter()
            .flat_map(|service| {
                service
                    .characteristics
                    .iter()
                    .map(|c| ChannelKey::new(service.uuid, c.uuid))
            })
            .collect();
        debug!("Discovered {} characteristics", keys.len());
        Ok(keys)
    }

    async fn subscribe(&self, channel: &ChannelKey) -> Result<BoxStream<'static, Bytes>> {
        let characteristic = self.characteristic(channel)?;
        let uuid = characteristic.uuid;

        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&characteristic).await?;
        debug!("Subscribed to {}", channel);

        Ok(notifications
            .filter_map(move |n| future::ready((n.uuid == uuid).then(|| Bytes::from(n.value))))
            .boxed())
    }

    async fn write_command(&self, channel: &ChannelKey, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(channel)?;
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        debug!("Sending command: {:02X?}", data);
        self.peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| RingError::CommandRejected(e.to_string()))
    }

    async fn events(&self) -> Result<BoxStream<'static, LinkEvent>> {
        let id = self.peripheral.id();
        let events = self.adapter.events().await?;

        Ok(events
            .filter_map(move |event| {
                future::ready(match event {
                    CentralEvent::DeviceConnected(peer) if peer == id => Some(LinkEvent::Connected),
                    CentralEvent::DeviceDisconnected(peer) if peer == id => {
                        Some(LinkEvent::Disconnected)
                    }
                    _ => None,
                })
            })
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
