//! Configuration for the usbredir CD-ROM service.
//!
//! Stores which backing files are exposed and how the service listens for a
//! usbredir peer, in a TOML file at `~/.config/cdredir/config.toml` (or
//! `$XDG_CONFIG_HOME`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration structure containing all persistent settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// How the usbredir peer connects to us.
    pub listen: ListenConfig,
    /// Synthetic USB bus parameters.
    pub bus: BusConfig,
    /// Logical units exposed by the device, in LUN order.
    pub luns: Vec<LunConfig>,
    /// Logging settings.
    pub log: LogConfig,
}

/// Transport the service listens on for a usbredir peer.
///
/// The real deployment carries usbredir packets over a spice-server
/// channel; that transport is out of scope for this crate (see spec
/// section 1). A plain TCP listener stands in for it so the binary is
/// self-contained and testable end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Address to bind, e.g. "127.0.0.1:7652".
    pub address: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7652".to_string(),
        }
    }
}

/// Synthetic bus parameters (spec section 4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Sentinel bus number presented to the guest.
    pub bus_number: u8,
    /// Lowest address handed out by the registry (inclusive).
    pub address_min: u8,
    /// Highest address handed out by the registry (inclusive).
    pub address_max: u8,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_number: 0xFE,
            address_min: 2,
            address_max: 31,
        }
    }
}

/// A single logical unit's configuration: a backing file and its identity
/// strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LunConfig {
    /// Logical unit number this entry occupies.
    pub lun: u32,
    /// Path to the backing file (ISO image or optical device node).
    pub path: PathBuf,
    /// INQUIRY vendor string (space-padded to 8 ASCII on the wire).
    pub vendor: String,
    /// INQUIRY product string (space-padded to 16 ASCII on the wire).
    pub product: String,
    /// INQUIRY version string (space-padded to 4 ASCII on the wire).
    pub version: String,
    /// Optional serial override; auto-derived from the bus address if unset.
    pub serial: Option<String>,
    /// Report a CD-ROM profile (true) or DVD-ROM profile (false) in
    /// GET_CONFIGURATION's current-profile field.
    pub cd_rom: bool,
    /// Load the backing file automatically at realize time.
    pub auto_load: bool,
}

impl Default for LunConfig {
    fn default() -> Self {
        Self {
            lun: 0,
            path: PathBuf::new(),
            vendor: "Red Hat".to_string(),
            product: "SPICE CD".to_string(),
            version: "0".to_string(),
            serial: None,
            cd_rom: true,
            auto_load: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. "cdredir=debug,info".
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Get the default configuration directory.
    pub fn config_dir() -> PathBuf {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(xdg_config).join("cdredir")
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home).join(".config").join("cdredir")
        } else {
            PathBuf::from(".config").join("cdredir")
        }
    }

    /// Get the default configuration file path.
    pub fn config_file() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listen_address_is_loopback() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.listen.address, "127.0.0.1:7652");
    }

    #[test]
    fn default_bus_config_matches_spec_address_range() {
        let bus = BusConfig::default();
        assert_eq!(bus.bus_number, 0xFE);
        assert_eq!(bus.address_min, 2);
        assert_eq!(bus.address_max, 31);
    }

    #[test]
    fn default_lun_identity_matches_spec_strings() {
        let lun = LunConfig::default();
        assert_eq!(lun.vendor, "Red Hat");
        assert_eq!(lun.product, "SPICE CD");
    }
}
