use futures::StreamExt;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info};

use crate::{
    error::{Result, RingError},
    transport::Transport,
    types::{DeviceHandle, ScanParams},
};

/// Finds rings through a [`Transport`]
#[derive(Clone)]
pub struct Scanner {
    transport: Arc<dyn Transport>,
}

impl Scanner {
    /// Create a scanner over `transport`
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Scan for rings, strongest signal first.
    ///
    /// Each address appears once; a later advertisement replaces an earlier
    /// one.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::LinkUnavailable`] if no adapter is present, or the
    /// backend error if the scan cannot start.
    pub async fn scan(&self, params: &ScanParams) -> Result<Vec<DeviceHandle>> {
        info!("Starting scan for rings...");

        let mut seen: HashMap<String, DeviceHandle> = HashMap::new();
        let mut stream = self.transport.scan(params.scan_timeout()).await?;
        while let Some(device) = stream.next().await {
            if is_ring_device(&device, params) {
                seen.insert(device.address().to_string(), device);
            } else {
                debug!("Skipping non-ring device: {}", device);
            }
        }

        let mut devices: Vec<DeviceHandle> = seen.into_values().collect();
        devices.sort_by(|a, b| {
            b.rssi()
                .cmp(&a.rssi())
                .then_with(|| a.address().cmp(b.address()))
        });

        info!("Scan completed. Found {} ring(s)", devices.len());
        Ok(devices)
    }

    /// Scan and return the strongest ring
    ///
    /// # Errors
    ///
    /// Returns [`RingError::DeviceNotFound`] if no ring was seen.
    pub async fn find_first(&self, params: &ScanParams) -> Result<DeviceHandle> {
        self.scan(params)
            .await?
            .into_iter()
            .next()
            .ok_or(RingError::DeviceNotFound)
    }
}

/// Whether an advertisement looks like a ring
#[must_use]
pub fn is_ring_device(device: &DeviceHandle, params: &ScanParams) -> bool {
    device.name().map_or(params.include_unnamed, |name| {
        let name = name.to_uppercase();
        params
            .name_prefixes
            .iter()
            .any(|prefix| name.starts_with(&prefix.to_uppercase()))
    })
}
