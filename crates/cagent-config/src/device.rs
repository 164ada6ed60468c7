//! Device inventory types

use serde::{Deserialize, Serialize};

/// Slot identifier of a device on this agent
pub type DeviceId = u32;

/// Kind of device a slot is backed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Cuda,
    Rocm,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Rocm => write!(f, "rocm"),
        }
    }
}

/// A schedulable device slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(rename = "kind")]
    pub device_type: DeviceType,
    /// PCI bus address, e.g. `0000:03:00.0`; ROCm devices are mapped by it
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pci_bus: String,
}

impl Device {
    pub fn new(id: DeviceId, device_type: DeviceType) -> Self {
        Self {
            id,
            brand: String::new(),
            uuid: String::new(),
            device_type,
            pci_bus: String::new(),
        }
    }
}

/// UUIDs of all devices of the given type, in order
pub fn device_uuids_by_type(devices: &[Device], device_type: DeviceType) -> Vec<String> {
    devices
        .iter()
        .filter(|d| d.device_type == device_type)
        .map(|d| d.uuid.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_uuids_by_type() {
        let mut gpu = Device::new(1, DeviceType::Cuda);
        gpu.uuid = "GPU-abc".to_string();
        let devices = vec![Device::new(0, DeviceType::Cpu), gpu];

        assert_eq!(device_uuids_by_type(&devices, DeviceType::Cuda), vec!["GPU-abc"]);
        assert!(device_uuids_by_type(&devices, DeviceType::Rocm).is_empty());
    }
}
