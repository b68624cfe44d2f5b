//! Persisted client configuration: the Bluetooth peer's MAC address and
//! the set of local TCP ports to forward to fixed remote addresses.
//!
//! SPEC_FULL.md §6: the file is JSON, loaded once at startup. A missing
//! file or one that fails to parse is not fatal — we log a warning and
//! fall back to [`Config::default`] (an empty, disabled configuration)
//! rather than aborting the process, mirroring the original
//! `comm/config.go` behavior noted in `examples/original_source/`.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One fixed local-port-to-remote-address forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub local_port: u16,
    pub remote_addr: String,
}

/// Field names and casing match spec.md §6's external JSON contract
/// exactly (`BluetoothMAC`, `Mappings`, `AutoStart`); `socks5_listen` is
/// a supplement outside that contract, so it keeps ordinary snake_case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, rename = "BluetoothMAC")]
    pub bluetooth_mac: String,
    #[serde(default, rename = "Mappings")]
    pub mappings: Vec<PortMapping>,
    #[serde(default, rename = "AutoStart")]
    pub auto_start: bool,
    /// Bind address for the SOCKS5 listener, e.g. `"127.0.0.1:1080"`.
    /// Absent/empty disables the SOCKS5 listener.
    #[serde(default)]
    pub socks5_listen: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bluetooth_mac: String::new(),
            mappings: Vec::new(),
            auto_start: false,
            socks5_listen: String::new(),
        }
    }
}

impl Config {
    /// Load from `path`, falling back to `Config::default()` on any I/O
    /// or parse error (logged, not propagated — a missing config should
    /// not prevent the process from starting with an empty rule set).
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read config, using defaults");
                return Self::default();
            }
        };
        match serde_json::from_str::<Config>(&raw) {
            Ok(mut cfg) => {
                cfg.mappings.retain(|m| {
                    if m.local_port == 0 {
                        warn!(remote = %m.remote_addr, "dropping mapping with local_port 0");
                        false
                    } else {
                        true
                    }
                });
                cfg
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not parse config, using defaults");
                Self::default()
            }
        }
    }

    /// Parsed remote addresses for every valid mapping, paired with
    /// their local port. Mappings whose `remote_addr` fails to resolve
    /// to a `SocketAddr` are skipped and logged.
    pub fn resolved_mappings(&self) -> Vec<(u16, SocketAddr)> {
        self.mappings
            .iter()
            .filter_map(|m| match m.remote_addr.parse::<SocketAddr>() {
                Ok(addr) => Some((m.local_port, addr)),
                Err(e) => {
                    warn!(remote = %m.remote_addr, error = %e, "dropping mapping with unparseable remote_addr");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempFile(std::path::PathBuf);

    impl TempFile {
        fn write(name: &str, contents: &[u8]) -> Self {
            let path = std::env::temp_dir().join(format!("btlink-test-{}-{}", std::process::id(), name));
            std::fs::write(&path, contents).unwrap();
            Self(path)
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let cfg = Config::load(Path::new("/nonexistent/path/to/config.json"));
        assert_eq!(cfg.bluetooth_mac, "");
        assert!(cfg.mappings.is_empty());
    }

    #[test]
    fn malformed_json_falls_back_to_default() {
        let file = TempFile::write("malformed", b"{ not json");
        let cfg = Config::load(&file.0);
        assert!(cfg.mappings.is_empty());
    }

    #[test]
    fn zero_port_mappings_are_dropped() {
        let json = br#"{
            "BluetoothMAC": "AA:BB:CC:DD:EE:FF",
            "Mappings": [
                {"local_port": 0, "remote_addr": "10.0.0.1:22"},
                {"local_port": 1080, "remote_addr": "10.0.0.2:80"}
            ]
        }"#;
        let file = TempFile::write("zero-port", json);
        let cfg = Config::load(&file.0);
        assert_eq!(cfg.mappings.len(), 1);
        assert_eq!(cfg.mappings[0].local_port, 1080);
    }

    #[test]
    fn deserializes_spec_json_contract() {
        let json = br#"{
            "BluetoothMAC": "AA:BB:CC:DD:EE:FF",
            "Mappings": [{"local_port": 22, "remote_addr": "10.0.0.1:22"}],
            "AutoStart": true
        }"#;
        let cfg: Config = serde_json::from_slice(json).unwrap();
        assert_eq!(cfg.bluetooth_mac, "AA:BB:CC:DD:EE:FF");
        assert_eq!(cfg.mappings.len(), 1);
        assert!(cfg.auto_start);
    }

    #[test]
    fn resolved_mappings_skips_unparseable_addresses() {
        let cfg = Config {
            mappings: vec![
                PortMapping { local_port: 22, remote_addr: "not-an-address".into() },
                PortMapping { local_port: 80, remote_addr: "10.0.0.9:80".into() },
            ],
            ..Config::default()
        };
        let resolved = cfg.resolved_mappings();
        assert_eq!(resolved, vec![(80, "10.0.0.9:80".parse().unwrap())]);
    }
}
