//! Known and connected devices
//!
//! One registry is typically shared by every device of a process. A device is inserted
//! when its bring-up completes and leaves the connected set when it closes; its
//! information stays known so a later reconnection can be matched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::info::DeviceInfo;

#[derive(Debug, Default)]
struct Inner {
    known: HashMap<String, DeviceInfo>,
    connected: HashSet<String>,
}

/// Shared registry of devices
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a device that finished its bring-up
    pub fn insert(&self, id: &str, info: DeviceInfo) {
        let mut inner = self.inner.lock();
        inner.known.insert(id.to_owned(), info);
        inner.connected.insert(id.to_owned());
    }

    /// Remove a device from the connected set
    pub fn remove(&self, id: &str) -> bool {
        self.inner.lock().connected.remove(id)
    }

    /// Whether the device is currently connected
    pub fn is_connected(&self, id: &str) -> bool {
        self.inner.lock().connected.contains(id)
    }

    /// Information recorded the last time the device was created
    pub fn known(&self, id: &str) -> Option<DeviceInfo> {
        self.inner.lock().known.get(id).cloned()
    }

    /// Identifiers of the connected devices, sorted
    pub fn connected(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.lock().connected.iter().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let registry = DeviceRegistry::new();
        let info = DeviceInfo {
            firmware_revision: Some("1.52".into()),
            ..Default::default()
        };

        registry.insert("usb:1", info.clone());
        assert!(registry.is_connected("usb:1"));
        assert_eq!(registry.connected(), vec!["usb:1".to_owned()]);

        assert!(registry.remove("usb:1"));
        assert!(!registry.remove("usb:1"));
        assert!(!registry.is_connected("usb:1"));
        assert_eq!(registry.known("usb:1"), Some(info));
    }

    #[test]
    fn test_shared_between_clones() {
        let registry = DeviceRegistry::new();
        let other = registry.clone();
        other.insert("ble:AA", DeviceInfo::default());
        assert!(registry.is_connected("ble:AA"));
    }
}
