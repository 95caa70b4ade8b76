use std::collections::HashMap;

use serde::Serialize;
use serde::ser::SerializeStruct;
use tokio::time::Instant;

use super::key::DeviceKey;
use crate::Generation;
use crate::ratelimit::{CircuitState, CircuitStats};

/// A [`HashMap`] mapping devices to their [`DeviceStats`]
#[derive(Debug, Default, Serialize)]
pub struct DeviceStatsMap(HashMap<DeviceKey, DeviceStats>);

impl DeviceStatsMap {
    /// Sort device statistics by admitted requests (descending order),
    /// breaking ties by address
    #[must_use]
    pub fn sorted(&self) -> Vec<(DeviceKey, DeviceStats)> {
        let mut sorted_devices: Vec<_> = self.0.clone().into_iter().collect();
        sorted_devices.sort_by(|(a_key, a), (b_key, b)| {
            b.admitted.cmp(&a.admitted).then_with(|| a_key.cmp(b_key))
        });
        sorted_devices
    }

    /// Statistics of a single device
    #[must_use]
    pub fn get(&self, device: &DeviceKey) -> Option<&DeviceStats> {
        self.0.get(device)
    }

    /// Number of devices in the map
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map holds no devices
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<DeviceStats>> for DeviceStatsMap {
    fn from(value: Vec<DeviceStats>) -> Self {
        Self(
            value
                .into_iter()
                .map(|stats| (stats.address.clone(), stats))
                .collect(),
        )
    }
}

/// Snapshot of a [`crate::ratelimit::Device`]'s throttling state
#[derive(Debug, Clone)]
pub struct DeviceStats {
    /// Normalized device address
    pub address: DeviceKey,
    /// Generation whose limits currently apply
    pub generation: Generation,
    /// Requests admitted and not yet released
    pub in_flight: usize,
    /// When the last request was admitted
    pub last_request: Option<Instant>,
    /// Requests admitted since the device was first seen
    pub admitted: u64,
    /// Admission attempts refused by the circuit breaker
    pub circuit_rejections: u64,
    /// State of the device's circuit breaker
    pub circuit: CircuitStats,
}

impl DeviceStats {
    /// Get human-readable summary of the stats
    #[must_use]
    pub fn summary(&self) -> String {
        let last = self.last_request.map_or_else(
            || "never".to_string(),
            |at| format!("{}ms ago", at.elapsed().as_millis()),
        );
        let circuit = match self.circuit.state {
            CircuitState::Closed => "closed".to_string(),
            state => format!(
                "{state} after {} failures",
                self.circuit.consecutive_failures
            ),
        };

        format!(
            "{} ({}): {} admitted, {} in flight, {} rejected, last request {}, circuit {}",
            self.address,
            self.generation,
            self.admitted,
            self.in_flight,
            self.circuit_rejections,
            last,
            circuit
        )
    }
}

impl Serialize for DeviceStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let last_request_ms_ago = self.last_request.map(|at| at.elapsed().as_millis());

        let mut s = serializer.serialize_struct("DeviceStats", 7)?;
        s.serialize_field("address", &self.address)?;
        s.serialize_field("generation", &self.generation)?;
        s.serialize_field("in_flight", &self.in_flight)?;
        s.serialize_field("last_request_ms_ago", &last_request_ms_ago)?;
        s.serialize_field("admitted", &self.admitted)?;
        s.serialize_field("circuit_rejections", &self.circuit_rejections)?;
        s.serialize_field("circuit", &self.circuit)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn stats(address: &str, admitted: u64) -> DeviceStats {
        DeviceStats {
            address: address.into(),
            generation: Generation::Gen1,
            in_flight: 0,
            last_request: None,
            admitted,
            circuit_rejections: 0,
            circuit: CircuitStats {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            },
        }
    }

    #[test]
    fn test_sorted_by_admitted_then_address() {
        let map = DeviceStatsMap::from(vec![
            stats("10.0.0.3", 4),
            stats("10.0.0.1", 9),
            stats("10.0.0.2", 4),
        ]);

        let order: Vec<_> = map
            .sorted()
            .into_iter()
            .map(|(key, _)| key.into_string())
            .collect();
        assert_eq!(order, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&"10.0.0.1".into()).map(|s| s.admitted), Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serialization() {
        let mut stats = stats("Plug.Local", 3);
        stats.generation = Generation::Gen2;
        stats.last_request = Some(Instant::now());
        tokio::time::advance(Duration::from_millis(250)).await;

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "address": "plug.local",
                "generation": 2,
                "in_flight": 0,
                "last_request_ms_ago": 250,
                "admitted": 3,
                "circuit_rejections": 0,
                "circuit": {
                    "state": "closed",
                    "consecutive_failures": 0,
                    "consecutive_successes": 0,
                    "opened_ms_ago": null,
                },
            })
        );
    }

    #[test]
    fn test_summary_formatting() {
        let mut stats = stats("10.0.0.4", 12);
        stats.circuit_rejections = 2;
        stats.circuit.state = CircuitState::Open;
        stats.circuit.consecutive_failures = 3;

        let summary = stats.summary();
        assert!(summary.starts_with("10.0.0.4 (gen1): 12 admitted"));
        assert!(summary.contains("2 rejected"));
        assert!(summary.contains("last request never"));
        assert!(summary.contains("circuit open after 3 failures"));
    }
}
