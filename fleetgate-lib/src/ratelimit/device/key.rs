use serde::{Deserialize, Serialize};
use std::fmt;

/// A normalized device address used as the registry key.
///
/// Devices are addressed by IP address or hostname. Keys are trimmed and
/// lower-cased so that the same device always maps to the same state,
/// regardless of how the caller spelled its address.
///
/// # Examples
///
/// ```
/// use fleetgate_lib::ratelimit::DeviceKey;
///
/// let key = DeviceKey::from(" Kitchen-Plug.LOCAL ");
/// assert_eq!(key.as_str(), "kitchen-plug.local");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct DeviceKey(String);

impl DeviceKey {
    /// Get the address as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the address as an owned String
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

fn normalize(address: &str) -> String {
    address.trim().to_lowercase()
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceKey {
    fn from(address: String) -> Self {
        DeviceKey(normalize(&address))
    }
}

impl From<&str> for DeviceKey {
    fn from(address: &str) -> Self {
        DeviceKey(normalize(address))
    }
}

impl From<&String> for DeviceKey {
    fn from(address: &String) -> Self {
        DeviceKey(normalize(address))
    }
}

impl From<&DeviceKey> for DeviceKey {
    fn from(key: &DeviceKey) -> Self {
        key.clone()
    }
}

impl From<DeviceKey> for String {
    fn from(key: DeviceKey) -> Self {
        key.0
    }
}

impl AsRef<str> for DeviceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_device_key_normalization() {
        let key = DeviceKey::from("Living-Room.LAN");
        assert_eq!(key.as_str(), "living-room.lan");
    }

    #[test]
    fn test_device_key_trims_whitespace() {
        assert_eq!(DeviceKey::from("  192.168.1.20\n"), DeviceKey::from("192.168.1.20"));
    }

    #[test]
    fn test_device_key_display() {
        let key = DeviceKey::from("192.168.1.20");
        assert_eq!(format!("{key}"), "192.168.1.20");
    }

    #[test]
    fn test_device_key_hash_consistency() {
        let mut map = HashMap::new();
        map.insert(DeviceKey::from("Garage.local"), 1);
        assert_eq!(map.get(&DeviceKey::from("garage.LOCAL")), Some(&1));
    }

    #[test]
    fn test_device_key_deserialize_normalizes() {
        let key: DeviceKey = serde_json::from_str("\"Porch.Local\"").unwrap();
        assert_eq!(key.as_str(), "porch.local");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"porch.local\"");
    }
}
