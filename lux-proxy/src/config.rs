//! Persisted peer settings.
//!
//! One JSON file per role (`config_client.json` / `config_server.json`)
//! so both peers can run from the same directory during bench tests.
//! Command-line flags override file values and the merged result is
//! written back, which is how the region tracker's last coordinates
//! survive restarts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Peer settings persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Capture-region origin, in screen coordinates.
    pub capture_x: i32,
    pub capture_y: i32,
    /// Margin between the frame edge and the data grid.
    pub margin: usize,
    /// Tunnel heartbeat cadence, seconds.
    pub heartbeat_interval: u64,
    /// SOCKS5 listen address (client role).
    pub listen: String,
    /// Port for a local virtual-camera backend, 0 for ephemeral.
    pub vcam_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            capture_x: 0,
            capture_y: 0,
            margin: 10,
            heartbeat_interval: 30,
            listen: "127.0.0.1:1080".into(),
            vcam_port: 0,
        }
    }
}

impl ProxyConfig {
    /// The per-role config path.
    pub fn path_for(mode: &str) -> PathBuf {
        PathBuf::from(format!("config_{mode}.json"))
    }

    /// Load configuration from a JSON file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Persist the current settings.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.margin, 10);
        assert_eq!(cfg.heartbeat_interval, 30);
        assert_eq!(cfg.listen, "127.0.0.1:1080");
    }

    #[test]
    fn missing_file_loads_defaults() {
        let cfg = ProxyConfig::load(Path::new("definitely/not/here.json"));
        assert_eq!(cfg.margin, ProxyConfig::default().margin);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = std::env::temp_dir().join("lux-proxy-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config_client.json");

        let cfg = ProxyConfig {
            capture_x: 120,
            capture_y: -40,
            margin: 12,
            heartbeat_interval: 15,
            listen: "0.0.0.0:9999".into(),
            vcam_port: 8080,
        };
        cfg.save(&path).unwrap();
        let loaded = ProxyConfig::load(&path);
        assert_eq!(loaded.capture_x, 120);
        assert_eq!(loaded.capture_y, -40);
        assert_eq!(loaded.heartbeat_interval, 15);
        assert_eq!(loaded.listen, "0.0.0.0:9999");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = std::env::temp_dir().join("lux-proxy-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("partial.json");
        std::fs::write(&path, r#"{"margin": 4}"#).unwrap();

        let cfg = ProxyConfig::load(&path);
        assert_eq!(cfg.margin, 4);
        assert_eq!(cfg.heartbeat_interval, 30);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn per_role_paths() {
        assert_eq!(
            ProxyConfig::path_for("client"),
            PathBuf::from("config_client.json")
        );
        assert_eq!(
            ProxyConfig::path_for("server"),
            PathBuf::from("config_server.json")
        );
    }
}
