// Persisted device records live outside the engine; this is the seam.
use super::types::{DeviceIdentity, DeviceTarget};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Write brand/model/serial read from a connected device and mark the
    /// record identified.
    async fn apply_identification(&self, uuid: &str, identity: &DeviceIdentity);

    /// Upsert by serial after a successful pairing.
    async fn record_pairing(&self, serial: &str, peer_identity: &str, host: &str);
}

#[derive(Debug, Clone, Default)]
pub struct StoredDevice {
    pub target: DeviceTarget,
    pub name: String,
    pub brand: String,
    pub serial: String,
}

/// Store used by the CLI and tests.
#[derive(Default)]
pub struct InMemoryDeviceStore {
    devices: RwLock<HashMap<String, StoredDevice>>,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, target: DeviceTarget) {
        let uuid = target.uuid.clone();
        self.devices.write().await.insert(
            uuid,
            StoredDevice {
                target,
                ..Default::default()
            },
        );
    }

    pub async fn get(&self, uuid: &str) -> Option<StoredDevice> {
        self.devices.read().await.get(uuid).cloned()
    }

    pub async fn find_by_serial(&self, serial: &str) -> Option<StoredDevice> {
        self.devices
            .read()
            .await
            .values()
            .find(|d| d.serial == serial)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DeviceStore for InMemoryDeviceStore {
    async fn apply_identification(&self, uuid: &str, identity: &DeviceIdentity) {
        let mut devices = self.devices.write().await;
        let Some(device) = devices.get_mut(uuid) else {
            log::warn!("Identification for unknown device {uuid} dropped");
            return;
        };
        device.brand = identity.brand.clone();
        device.name = identity.model.clone();
        if !identity.serial.is_empty() {
            device.serial = identity.serial.clone();
        }
        device.target.identified = true;
    }

    async fn record_pairing(&self, serial: &str, peer_identity: &str, host: &str) {
        let mut devices = self.devices.write().await;
        if let Some(device) = devices.values_mut().find(|d| d.serial == serial) {
            device.target.tls_peer_identity = Some(peer_identity.to_string());
            log::debug!("Updated device {serial} via pairing");
            return;
        }
        let mut target = DeviceTarget::new(format!("paired-{serial}"));
        target.tls_peer_identity = Some(peer_identity.to_string());
        devices.insert(
            target.uuid.clone(),
            StoredDevice {
                target,
                name: host.to_string(),
                brand: String::new(),
                serial: serial.to_string(),
            },
        );
        log::debug!("Added device {serial} via pairing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pairing_upserts_by_serial() {
        let store = InMemoryDeviceStore::new();
        store.record_pairing("R5CT", "adb-R5CT-abc", "192.168.1.7").await;
        store.record_pairing("R5CT", "adb-R5CT-def", "192.168.1.7").await;
        assert_eq!(store.len().await, 1);
        let device = store.find_by_serial("R5CT").await.unwrap();
        assert_eq!(device.target.tls_peer_identity.as_deref(), Some("adb-R5CT-def"));
        assert_eq!(device.name, "192.168.1.7");
    }

    #[tokio::test]
    async fn identification_marks_record() {
        let store = InMemoryDeviceStore::new();
        store.insert(DeviceTarget::new("dev-1").with_tcp("10.0.0.2", 5555)).await;
        let identity = DeviceIdentity {
            brand: "google".into(),
            model: "Pixel 7".into(),
            serial: "28011FDH".into(),
        };
        store.apply_identification("dev-1", &identity).await;
        let device = store.get("dev-1").await.unwrap();
        assert!(device.target.identified);
        assert_eq!(device.serial, "28011FDH");
        assert_eq!(device.name, "Pixel 7");
    }
}
