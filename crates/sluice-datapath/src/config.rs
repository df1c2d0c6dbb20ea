//! Datapath configuration

use crate::error::{DatapathError, Result};
use serde::{Deserialize, Serialize};

/// Smallest accepted queue ring size
pub const MIN_RING_SIZE: u32 = 8;
/// Largest accepted queue ring size
pub const MAX_RING_SIZE: u32 = 8192;

/// Tunables shared by every queue and socket of a [`crate::State`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatapathConfig {
    /// Frame ring size of RX queues (power of 2)
    pub rx_ring_size: u32,

    /// Minimum frame ring size of TX queues (power of 2)
    pub tx_ring_size: u32,

    /// Transmit straight from the socket payload area in generic mode
    pub disable_tx_bounce: bool,

    /// Deliver redirected frames without copying their payload
    pub rx_zero_copy: bool,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            rx_ring_size: 32,
            tx_ring_size: 32,
            disable_tx_bounce: false,
            rx_zero_copy: false,
        }
    }
}

impl DatapathConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        for (name, size) in [
            ("rx_ring_size", self.rx_ring_size),
            ("tx_ring_size", self.tx_ring_size),
        ] {
            if !size.is_power_of_two() {
                return Err(DatapathError::InvalidConfig(format!(
                    "{name} must be power of 2"
                )));
            }
            if !(MIN_RING_SIZE..=MAX_RING_SIZE).contains(&size) {
                return Err(DatapathError::InvalidConfig(format!(
                    "{name} must be in {MIN_RING_SIZE}..={MAX_RING_SIZE}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = DatapathConfig::default();
        assert_eq!(config.rx_ring_size, 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_ring_sizes() {
        let config = DatapathConfig {
            rx_ring_size: 48,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DatapathConfig {
            tx_ring_size: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DatapathConfig {
            rx_ring_size: 16384,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: DatapathConfig = serde_json::from_str(r#"{"rx_ring_size": 64}"#).unwrap();
        assert_eq!(config.rx_ring_size, 64);
        assert_eq!(config.tx_ring_size, 32);
        assert!(!config.disable_tx_bounce);
    }
}
