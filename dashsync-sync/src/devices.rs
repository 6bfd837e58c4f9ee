//! Device registry for preference sync.

use crate::error::{SyncError, SyncResult};
use crate::preferences::PreferenceBackend;
use dashsync_types::{Device, DeviceId, Timestamp};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Local view of the devices registered for the current user.
pub struct DeviceRegistry {
    backend: Arc<dyn PreferenceBackend>,
    current: DeviceId,
    devices: BTreeMap<DeviceId, Device>,
}

impl DeviceRegistry {
    /// Creates a registry for the device running this engine.
    pub fn new(backend: Arc<dyn PreferenceBackend>, current: DeviceId) -> Self {
        Self {
            backend,
            current,
            devices: BTreeMap::new(),
        }
    }

    /// This device's id.
    pub fn current_id(&self) -> &DeviceId {
        &self.current
    }

    /// This device's record, once registered.
    #[must_use]
    pub fn current(&self) -> Option<&Device> {
        self.devices.get(&self.current)
    }

    #[must_use]
    pub fn get(&self, device_id: &DeviceId) -> Option<&Device> {
        self.devices.get(device_id)
    }

    /// Known devices ordered by id.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Other active devices; a change is synced once all of them applied it.
    pub fn active_peers(&self) -> impl Iterator<Item = &Device> {
        self.devices
            .values()
            .filter(|d| d.is_active && d.device_id != self.current)
    }

    /// Registers this device, keeping trust and name if it was already known.
    pub async fn register_current(
        &mut self,
        name: impl Into<String>,
        now: Timestamp,
    ) -> SyncResult<Device> {
        self.refresh().await?;
        let device = match self.devices.get(&self.current) {
            Some(existing) => Device {
                is_active: true,
                last_seen: now,
                ..existing.clone()
            },
            None => Device::new(self.current.clone(), name, now),
        };
        let stored = self.backend.register_device(&device).await?;
        info!("Registered device {} ({})", stored.device_id, stored.device_name);
        self.devices.insert(stored.device_id.clone(), stored.clone());
        Ok(stored)
    }

    /// Reloads the device list from the backend.
    pub async fn refresh(&mut self) -> SyncResult<usize> {
        let devices = self.backend.get_devices().await?;
        self.devices = devices
            .into_iter()
            .map(|d| (d.device_id.clone(), d))
            .collect();
        debug!("Loaded {} devices", self.devices.len());
        Ok(self.devices.len())
    }

    /// Marks a device trusted or untrusted.
    pub async fn set_trusted(&mut self, device_id: &DeviceId, trusted: bool) -> SyncResult<Device> {
        self.update(device_id, |d| d.is_trusted = trusted).await
    }

    /// Activates or deactivates a device.
    pub async fn set_active(&mut self, device_id: &DeviceId, active: bool) -> SyncResult<Device> {
        self.update(device_id, |d| d.is_active = active).await
    }

    /// Renames a device.
    pub async fn rename(
        &mut self,
        device_id: &DeviceId,
        name: impl Into<String>,
    ) -> SyncResult<Device> {
        let name = name.into();
        self.update(device_id, |d| d.device_name = name).await
    }

    /// Records that this device was just seen syncing.
    pub async fn touch(&mut self, now: Timestamp) -> SyncResult<Device> {
        let current = self.current.clone();
        self.update(&current, |d| d.last_seen = now).await
    }

    /// Forgets a device. This device cannot remove itself.
    pub async fn remove(&mut self, device_id: &DeviceId) -> SyncResult<()> {
        if *device_id == self.current {
            return Err(SyncError::Backend("cannot remove the current device".into()));
        }
        self.backend.remove_device(device_id).await?;
        self.devices.remove(device_id);
        info!("Removed device {}", device_id);
        Ok(())
    }

    async fn update(
        &mut self,
        device_id: &DeviceId,
        change: impl FnOnce(&mut Device),
    ) -> SyncResult<Device> {
        let Some(existing) = self.devices.get(device_id) else {
            return Err(SyncError::Backend(format!("unknown device {device_id}")));
        };
        let mut device = existing.clone();
        change(&mut device);
        let stored = self.backend.update_device(&device).await?;
        self.devices.insert(stored.device_id.clone(), stored.clone());
        Ok(stored)
    }
}
