use crate::envelope::ProtocolType;
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// A physical device, identified by its unique serial number.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: Uuid,
    pub serial_number: String,
    pub name: String,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A protocol binding for a device, unique per `(device_id, protocol_type)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProtocol {
    pub id: Uuid,
    pub device_id: Uuid,
    pub protocol_type: ProtocolType,
    pub mb_ip: String,
    pub token: String,
    pub token_created_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The mutable part of a protocol binding; `token_created_at` is the
/// authority for conflict resolution.
#[derive(Debug, Clone)]
pub struct ProtocolBinding {
    pub mb_ip: String,
    pub token: String,
    pub token_created_at: DateTime<Utc>,
}

/// Persistence port for the device/protocol registry.
///
/// Each method is a single short transaction in a relational implementation;
/// no call spans more than one item's mutation. A concurrent create racing on
/// a unique constraint surfaces as `IngestError::Conflict`.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn get_or_create_device(
        &self,
        serial_number: &str,
        location: Option<&str>,
    ) -> Result<(Device, bool)>;

    async fn update_device_location(&self, device_id: Uuid, location: &str) -> Result<()>;

    async fn get_or_create_protocol(
        &self,
        device_id: Uuid,
        protocol_type: ProtocolType,
        binding: &ProtocolBinding,
    ) -> Result<(DeviceProtocol, bool)>;

    async fn update_protocol_binding(&self, protocol_id: Uuid, binding: &ProtocolBinding)
        -> Result<()>;

    async fn get_device(&self, serial_number: &str) -> Result<Option<Device>>;

    async fn get_protocol(
        &self,
        device_id: Uuid,
        protocol_type: ProtocolType,
    ) -> Result<Option<DeviceProtocol>>;

    async fn device_count(&self) -> Result<usize>;

    async fn protocol_count(&self) -> Result<usize>;
}

/// In-memory registry implementation for development/testing.
pub struct InMemoryRegistry {
    devices: Arc<Mutex<HashMap<Uuid, Device>>>,
    protocols: Arc<Mutex<HashMap<Uuid, DeviceProtocol>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(Mutex::new(HashMap::new())),
            protocols: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistry {
    async fn get_or_create_device(
        &self,
        serial_number: &str,
        location: Option<&str>,
    ) -> Result<(Device, bool)> {
        let mut devices = self.devices.lock().unwrap();
        if let Some(existing) = devices
            .values()
            .find(|d| d.serial_number == serial_number)
            .cloned()
        {
            return Ok((existing, false));
        }
        let now = Utc::now();
        let device = Device {
            id: Uuid::new_v4(),
            serial_number: serial_number.to_string(),
            name: String::new(),
            location: location.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        devices.insert(device.id, device.clone());
        debug!("Created device {} with id {}", serial_number, device.id);
        Ok((device, true))
    }

    async fn update_device_location(&self, device_id: Uuid, location: &str) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(&device_id).ok_or_else(|| {
            IngestError::Storage(format!("device {} not found for update", device_id))
        })?;
        device.location = Some(location.to_string());
        device.updated_at = Utc::now();
        debug!("Updated location for device {}", device_id);
        Ok(())
    }

    async fn get_or_create_protocol(
        &self,
        device_id: Uuid,
        protocol_type: ProtocolType,
        binding: &ProtocolBinding,
    ) -> Result<(DeviceProtocol, bool)> {
        let mut protocols = self.protocols.lock().unwrap();
        if let Some(existing) = protocols
            .values()
            .find(|p| p.device_id == device_id && p.protocol_type == protocol_type)
            .cloned()
        {
            return Ok((existing, false));
        }
        let now = Utc::now();
        let protocol = DeviceProtocol {
            id: Uuid::new_v4(),
            device_id,
            protocol_type,
            mb_ip: binding.mb_ip.clone(),
            token: binding.token.clone(),
            token_created_at: binding.token_created_at,
            created_at: now,
            updated_at: now,
        };
        protocols.insert(protocol.id, protocol.clone());
        debug!(
            "Created protocol {} for device {} with id {}",
            protocol_type, device_id, protocol.id
        );
        Ok((protocol, true))
    }

    async fn update_protocol_binding(
        &self,
        protocol_id: Uuid,
        binding: &ProtocolBinding,
    ) -> Result<()> {
        let mut protocols = self.protocols.lock().unwrap();
        let protocol = protocols.get_mut(&protocol_id).ok_or_else(|| {
            IngestError::Storage(format!("protocol {} not found for update", protocol_id))
        })?;
        protocol.mb_ip = binding.mb_ip.clone();
        protocol.token = binding.token.clone();
        protocol.token_created_at = binding.token_created_at;
        protocol.updated_at = Utc::now();
        debug!("Updated binding for protocol {}", protocol_id);
        Ok(())
    }

    async fn get_device(&self, serial_number: &str) -> Result<Option<Device>> {
        let devices = self.devices.lock().unwrap();
        Ok(devices
            .values()
            .find(|d| d.serial_number == serial_number)
            .cloned())
    }

    async fn get_protocol(
        &self,
        device_id: Uuid,
        protocol_type: ProtocolType,
    ) -> Result<Option<DeviceProtocol>> {
        let protocols = self.protocols.lock().unwrap();
        Ok(protocols
            .values()
            .find(|p| p.device_id == device_id && p.protocol_type == protocol_type)
            .cloned())
    }

    async fn device_count(&self) -> Result<usize> {
        Ok(self.devices.lock().unwrap().len())
    }

    async fn protocol_count(&self) -> Result<usize> {
        Ok(self.protocols.lock().unwrap().len())
    }
}
