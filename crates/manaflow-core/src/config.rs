//! Tunables for caching, scanning, and transfer scheduling.
//!
//! All durations are in ticks. Defaults assume 20 ticks per second.
//! With the `data-loader` feature a [`NetworkConfig`] can be read from a
//! `.json`, `.ron`, or `.toml` file; any field left out takes its default.

use serde::{Deserialize, Serialize};

use crate::sim::{Mana, Ticks};
use crate::tier::TIER_COUNT;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors from validating or loading a [`NetworkConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field that must be positive was zero.
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
    /// The target cache would outlive the topology it was derived from.
    #[error("target_ttl ({target_ttl}) must not exceed topology_ttl ({topology_ttl})")]
    TtlOrder { target_ttl: Ticks, topology_ttl: Ticks },
    /// The path history is too short to hold an A,B,A,B pattern.
    #[error("history_len must be at least 4, got {0}")]
    HistoryTooShort(usize),
    #[cfg(feature = "data-loader")]
    #[error("unsupported config format: {file}")]
    UnsupportedFormat { file: std::path::PathBuf },
    #[cfg(feature = "data-loader")]
    #[error("parse error in {file}: {detail}")]
    Parse {
        file: std::path::PathBuf,
        detail: String,
    },
    #[cfg(feature = "data-loader")]
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// NetworkConfig
// ---------------------------------------------------------------------------

/// Every knob the routing core reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Lifetime of a per-node target snapshot (about 2 s).
    pub target_ttl: Ticks,
    /// Lifetime of a shared topology entry (about 30 s).
    pub topology_ttl: Ticks,
    /// Age after which a node's target cache counts as stale (about 5 s).
    pub rescan_interval: Ticks,
    /// Period of the staggered scan schedule.
    pub scan_interval: Ticks,
    /// One in this many scheduled scans is a full rescan; the rest are
    /// quick single-endpoint checks.
    pub full_scan_ratio: u64,
    /// Minimum ticks between two scans of the same node.
    pub min_scan_interval: Ticks,
    /// Period of the global maintenance sweep.
    pub maintenance_interval: Ticks,
    /// Shared entries untouched for this long are purged (about 5 min).
    pub stale_entry_age: Ticks,
    /// Upper bound on transfers per node per tick.
    pub max_transfers_per_tick: u32,
    /// A node will not send back through a port it received on for this
    /// many ticks.
    pub backflow_window: Ticks,
    /// Length of the recent-path window used for cycle detection.
    pub history_len: usize,
    /// The recent path is forgotten after this many ticks without a transfer.
    pub history_decay_ticks: Ticks,
    /// Minimum ticks between two rate-limited diagnostics.
    pub log_window_ticks: Ticks,
    /// Per-tick transfer cap for each tier, indexed by tier.
    pub tier_rates: [Mana; TIER_COUNT],
    /// Capacity of each per-kind event ring buffer.
    pub event_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            target_ttl: 40,
            topology_ttl: 600,
            rescan_interval: 100,
            scan_interval: 20,
            full_scan_ratio: 4,
            min_scan_interval: 1,
            maintenance_interval: 1200,
            stale_entry_age: 6000,
            max_transfers_per_tick: 4,
            backflow_window: 3,
            history_len: 5,
            history_decay_ticks: 20,
            log_window_ticks: 200,
            tier_rates: [20, 80, 320, 1280],
            event_capacity: 1024,
        }
    }
}

impl NetworkConfig {
    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 8] = [
            ("target_ttl", self.target_ttl),
            ("topology_ttl", self.topology_ttl),
            ("rescan_interval", self.rescan_interval),
            ("scan_interval", self.scan_interval),
            ("full_scan_ratio", self.full_scan_ratio),
            ("maintenance_interval", self.maintenance_interval),
            ("stale_entry_age", self.stale_entry_age),
            ("max_transfers_per_tick", self.max_transfers_per_tick as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.target_ttl > self.topology_ttl {
            return Err(ConfigError::TtlOrder {
                target_ttl: self.target_ttl,
                topology_ttl: self.topology_ttl,
            });
        }
        if self.history_len < 4 {
            return Err(ConfigError::HistoryTooShort(self.history_len));
        }
        Ok(())
    }

    /// Load and validate a config file; the format follows the extension.
    #[cfg(feature = "data-loader")]
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let parse_err = |detail: String| ConfigError::Parse {
            file: path.to_path_buf(),
            detail,
        };
        let config: NetworkConfig = match ext.as_deref() {
            Some("json") => serde_json::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
            Some("ron") => ron::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
            Some("toml") => toml::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    file: path.to_path_buf(),
                });
            }
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        NetworkConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_interval_rejected() {
        let config = NetworkConfig {
            scan_interval: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero("scan_interval"))));
    }

    #[test]
    fn zero_transfer_cap_rejected() {
        let config = NetworkConfig {
            max_transfers_per_tick: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("max_transfers_per_tick"))
        ));
    }

    #[test]
    fn target_ttl_longer_than_topology_rejected() {
        let config = NetworkConfig {
            target_ttl: 700,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::TtlOrder { .. })));
    }

    #[test]
    fn short_history_rejected() {
        let config = NetworkConfig {
            history_len: 3,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::HistoryTooShort(3))));
    }

    #[cfg(feature = "data-loader")]
    mod loading {
        use super::*;
        use std::fs;
        use std::path::PathBuf;

        fn scratch(name: &str) -> PathBuf {
            let dir = std::env::temp_dir().join(format!("manaflow_config_{name}"));
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir_all(&dir).unwrap();
            dir
        }

        #[test]
        fn load_json_fills_defaults() {
            let dir = scratch("json");
            let path = dir.join("net.json");
            fs::write(&path, r#"{ "scan_interval": 10, "max_transfers_per_tick": 2 }"#).unwrap();

            let config = NetworkConfig::load(&path).unwrap();
            assert_eq!(config.scan_interval, 10);
            assert_eq!(config.max_transfers_per_tick, 2);
            assert_eq!(config.target_ttl, NetworkConfig::default().target_ttl);

            let _ = fs::remove_dir_all(&dir);
        }

        #[test]
        fn load_toml() {
            let dir = scratch("toml");
            let path = dir.join("net.toml");
            fs::write(&path, "backflow_window = 5\ntier_rates = [10, 40, 160, 640]\n").unwrap();

            let config = NetworkConfig::load(&path).unwrap();
            assert_eq!(config.backflow_window, 5);
            assert_eq!(config.tier_rates, [10, 40, 160, 640]);

            let _ = fs::remove_dir_all(&dir);
        }

        #[test]
        fn load_ron() {
            let dir = scratch("ron");
            let path = dir.join("net.ron");
            fs::write(&path, "(history_len: 6, full_scan_ratio: 2)").unwrap();

            let config = NetworkConfig::load(&path).unwrap();
            assert_eq!(config.history_len, 6);
            assert_eq!(config.full_scan_ratio, 2);

            let _ = fs::remove_dir_all(&dir);
        }

        #[test]
        fn load_rejects_invalid_values() {
            let dir = scratch("invalid");
            let path = dir.join("net.json");
            fs::write(&path, r#"{ "history_len": 2 }"#).unwrap();

            assert!(matches!(
                NetworkConfig::load(&path),
                Err(ConfigError::HistoryTooShort(2))
            ));

            let _ = fs::remove_dir_all(&dir);
        }

        #[test]
        fn load_unknown_extension() {
            let dir = scratch("yaml");
            let path = dir.join("net.yaml");
            fs::write(&path, "").unwrap();

            assert!(matches!(
                NetworkConfig::load(&path),
                Err(ConfigError::UnsupportedFormat { .. })
            ));

            let _ = fs::remove_dir_all(&dir);
        }

        #[test]
        fn load_parse_error() {
            let dir = scratch("broken");
            let path = dir.join("net.json");
            fs::write(&path, "{ not json").unwrap();

            assert!(matches!(NetworkConfig::load(&path), Err(ConfigError::Parse { .. })));

            let _ = fs::remove_dir_all(&dir);
        }
    }
}
