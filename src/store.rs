//! Persistence façade (spec §4.8): a narrow, dialect-agnostic interface
//! the engine depends on instead of talking to SQL directly.
//!
//! Grounded on `original_source/floranet/models/*.py`'s twistar/adbapi
//! query methods (`find`, `findBy`, `all`) and `floranet/netserver.py`'s
//! usage of them. `MemoryStore` is the only backend shipped here, the way
//! `jfabienke-mbuscrate`'s tests inject fakes instead of driving real
//! hardware; a `sqlx`-backed `SqlStore` (dialect selected by the
//! connection URL so the trait itself never names Postgres or SQLite) is
//! the natural production extension point but is not implemented — see
//! DESIGN.md.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{NetServerError, Result};
use crate::models::{AppInterface, AppProperty, Application, Config, Device, Gateway};

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_device_by_devaddr(&self, dev_addr: u32) -> Result<Vec<Device>>;
    async fn find_device_by_deveui(&self, dev_eui: u64) -> Result<Option<Device>>;
    async fn find_all_devices(&self) -> Result<Vec<Device>>;
    async fn find_devices_in_range(&self, start: u32, end: u32) -> Result<Vec<Device>>;
    async fn find_application_by_appeui(&self, app_eui: u64) -> Result<Option<Application>>;
    async fn find_application(&self, id: i64) -> Result<Option<Application>>;
    async fn find_app_property(&self, application_id: i64, port: u8) -> Result<Option<AppProperty>>;
    async fn find_gateway_by_host(&self, host: &str) -> Result<Option<Gateway>>;
    async fn find_all_gateways(&self) -> Result<Vec<Gateway>>;
    async fn find_interface(&self, id: i64) -> Result<Option<AppInterface>>;
    async fn find_config(&self) -> Result<Config>;

    async fn save_device(&self, device: Device) -> Result<Device>;
    async fn save_gateway(&self, gateway: Gateway) -> Result<Gateway>;
    async fn save_application(&self, application: Application) -> Result<Application>;
    async fn save_interface(&self, iface: AppInterface) -> Result<AppInterface>;
    async fn save_config(&self, config: Config) -> Result<Config>;

    async fn update_device(&self, device: Device) -> Result<Device>;
    async fn update_gateway(&self, gateway: Gateway) -> Result<Gateway>;

    async fn delete_device(&self, id: i64) -> Result<()>;
    async fn delete_gateway(&self, id: i64) -> Result<()>;
    async fn delete_interface(&self, id: i64) -> Result<()>;

    async fn exists_device(&self, dev_eui: u64) -> Result<bool>;
}

/// In-memory `Store`, keyed by primary id. Not meant for production use —
/// it exists so the engine and its tests can run without a database.
#[derive(Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<i64, Device>>,
    gateways: RwLock<HashMap<i64, Gateway>>,
    applications: RwLock<HashMap<i64, Application>>,
    app_properties: RwLock<HashMap<(i64, u8), AppProperty>>,
    interfaces: RwLock<HashMap<i64, AppInterface>>,
    config: RwLock<Option<Config>>,
    next_id: RwLock<i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&self) -> i64 {
        let mut next = self.next_id.write().unwrap();
        *next += 1;
        *next
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_device_by_devaddr(&self, dev_addr: u32) -> Result<Vec<Device>> {
        Ok(self
            .devices
            .read()
            .unwrap()
            .values()
            .filter(|d| d.dev_addr == dev_addr)
            .cloned()
            .collect())
    }

    async fn find_device_by_deveui(&self, dev_eui: u64) -> Result<Option<Device>> {
        Ok(self.devices.read().unwrap().values().find(|d| d.dev_eui == dev_eui).cloned())
    }

    async fn find_all_devices(&self) -> Result<Vec<Device>> {
        Ok(self.devices.read().unwrap().values().cloned().collect())
    }

    async fn find_devices_in_range(&self, start: u32, end: u32) -> Result<Vec<Device>> {
        Ok(self
            .devices
            .read()
            .unwrap()
            .values()
            .filter(|d| d.dev_addr >= start && d.dev_addr <= end)
            .cloned()
            .collect())
    }

    async fn find_application_by_appeui(&self, app_eui: u64) -> Result<Option<Application>> {
        Ok(self
            .applications
            .read()
            .unwrap()
            .values()
            .find(|a| a.app_eui == app_eui)
            .cloned())
    }

    async fn find_application(&self, id: i64) -> Result<Option<Application>> {
        Ok(self.applications.read().unwrap().get(&id).cloned())
    }

    async fn find_app_property(&self, application_id: i64, port: u8) -> Result<Option<AppProperty>> {
        Ok(self.app_properties.read().unwrap().get(&(application_id, port)).cloned())
    }

    async fn find_gateway_by_host(&self, host: &str) -> Result<Option<Gateway>> {
        Ok(self.gateways.read().unwrap().values().find(|g| g.host == host).cloned())
    }

    async fn find_all_gateways(&self) -> Result<Vec<Gateway>> {
        Ok(self.gateways.read().unwrap().values().cloned().collect())
    }

    async fn find_interface(&self, id: i64) -> Result<Option<AppInterface>> {
        Ok(self.interfaces.read().unwrap().get(&id).cloned())
    }

    async fn find_config(&self) -> Result<Config> {
        self.config
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| NetServerError::UnknownResource("config not yet saved".into()))
    }

    async fn save_device(&self, mut device: Device) -> Result<Device> {
        if device.id == 0 {
            device.id = self.alloc_id();
        }
        self.devices.write().unwrap().insert(device.id, device.clone());
        Ok(device)
    }

    async fn save_gateway(&self, mut gateway: Gateway) -> Result<Gateway> {
        if gateway.id == 0 {
            gateway.id = self.alloc_id();
        }
        self.gateways.write().unwrap().insert(gateway.id, gateway.clone());
        Ok(gateway)
    }

    async fn save_application(&self, mut application: Application) -> Result<Application> {
        if application.id == 0 {
            application.id = self.alloc_id();
        }
        self.applications.write().unwrap().insert(application.id, application.clone());
        Ok(application)
    }

    async fn save_interface(&self, mut iface: AppInterface) -> Result<AppInterface> {
        if iface.id == 0 {
            iface.id = self.alloc_id();
        }
        self.interfaces.write().unwrap().insert(iface.id, iface.clone());
        Ok(iface)
    }

    async fn save_config(&self, config: Config) -> Result<Config> {
        *self.config.write().unwrap() = Some(config.clone());
        Ok(config)
    }

    async fn update_device(&self, device: Device) -> Result<Device> {
        let mut guard = self.devices.write().unwrap();
        if !guard.contains_key(&device.id) {
            return Err(NetServerError::UnknownResource(format!("device {}", device.id)));
        }
        guard.insert(device.id, device.clone());
        Ok(device)
    }

    async fn update_gateway(&self, gateway: Gateway) -> Result<Gateway> {
        let mut guard = self.gateways.write().unwrap();
        if !guard.contains_key(&gateway.id) {
            return Err(NetServerError::UnknownResource(format!("gateway {}", gateway.id)));
        }
        guard.insert(gateway.id, gateway.clone());
        Ok(gateway)
    }

    async fn delete_device(&self, id: i64) -> Result<()> {
        self.devices.write().unwrap().remove(&id);
        Ok(())
    }

    async fn delete_gateway(&self, id: i64) -> Result<()> {
        self.gateways.write().unwrap().remove(&id);
        Ok(())
    }

    async fn delete_interface(&self, id: i64) -> Result<()> {
        self.interfaces.write().unwrap().remove(&id);
        Ok(())
    }

    async fn exists_device(&self, dev_eui: u64) -> Result<bool> {
        Ok(self.devices.read().unwrap().values().any(|d| d.dev_eui == dev_eui))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceClass;
    use chrono::Utc;

    fn sample_device(dev_addr: u32) -> Device {
        Device {
            id: 0,
            dev_eui: dev_addr as u64,
            dev_addr,
            application_id: 1,
            name: "dev".into(),
            otaa: true,
            enabled: true,
            devclass: DeviceClass::A,
            dev_nonces: vec![],
            nwk_s_key: [0; 16],
            app_s_key: [0; 16],
            fcntup: 0,
            fcntdown: 0,
            fcnt_error: false,
            adr_enable: false,
            adr_datr: None,
            tx_chan: None,
            tx_datr: None,
            tmst: None,
            app_name: None,
            latitude: None,
            longitude: None,
            snr_history: vec![],
            gw_addr: None,
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_then_find_by_devaddr() {
        let store = MemoryStore::new();
        let saved = store.save_device(sample_device(0x0A)).await.unwrap();
        assert_ne!(saved.id, 0);
        let found = store.find_device_by_devaddr(0x0A).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn find_devices_in_range_filters() {
        let store = MemoryStore::new();
        store.save_device(sample_device(1)).await.unwrap();
        store.save_device(sample_device(10)).await.unwrap();
        store.save_device(sample_device(100)).await.unwrap();
        let in_range = store.find_devices_in_range(1, 10).await.unwrap();
        assert_eq!(in_range.len(), 2);
    }

    #[tokio::test]
    async fn update_unknown_device_is_unknown_resource() {
        let store = MemoryStore::new();
        let mut dev = sample_device(1);
        dev.id = 999;
        let err = store.update_device(dev).await.unwrap_err();
        assert!(matches!(err, NetServerError::UnknownResource(_)));
    }
}
