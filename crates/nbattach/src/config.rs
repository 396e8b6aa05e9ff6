//! Attach settings.
//!
//! Settings are read from a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/nbattach/config.json
//! - Linux: ~/.config/nbattach/config.json
//! - Windows: C:\Users\<User>\AppData\Roaming\nbattach\config.json
//!
//! Every field is optional in the file; CLI flags override what is loaded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

/// Tunables for one attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Delay between heartbeat probes.
    pub heartbeat_interval_ms: u64,
    /// Round-trip timeout for a single heartbeat probe.
    pub heartbeat_timeout_ms: u64,
    /// Consecutive failed probes before `alive` becomes `degraded`.
    pub degrade_after: u32,
    /// Further consecutive failed probes before `degraded` becomes `dead`.
    pub dead_after: u32,
    /// Upper bound on connecting a single channel.
    pub connect_timeout_ms: u64,
    /// Upper bound on waiting for a shell/control reply.
    pub reply_timeout_ms: u64,
    /// Also connect the stdin channel.
    pub open_stdin: bool,
    /// Print kernel restart notices and the idle prompt.
    pub show_status: bool,
    /// First Ctrl+C interrupts the kernel instead of detaching.
    pub interrupt_on_ctrl_c: bool,
    /// A second Ctrl+C within this window detaches.
    pub detach_window_ms: u64,
    /// Capacity of the queue between the iopub reader and the renderer.
    pub queue_depth: usize,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 1000,
            degrade_after: 3,
            dead_after: 3,
            connect_timeout_ms: 3000,
            reply_timeout_ms: 2000,
            open_stdin: false,
            show_status: true,
            interrupt_on_ctrl_c: true,
            detach_window_ms: 2000,
            queue_depth: 1024,
        }
    }
}

impl AttachConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn detach_window(&self) -> Duration {
        Duration::from_millis(self.detach_window_ms)
    }
}

/// Default location of the config file.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nbattach")
        .join("config.json")
}

/// Load settings from `path`, returning defaults if the file is missing or
/// cannot be parsed.
pub fn load_config_from(path: &Path) -> AttachConfig {
    if !path.exists() {
        return AttachConfig::default();
    }
    match std::fs::read_to_string(path) {
        Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
            warn!("[config] Ignoring invalid {}: {}", path.display(), e);
            AttachConfig::default()
        }),
        Err(e) => {
            warn!("[config] Could not read {}: {}", path.display(), e);
            AttachConfig::default()
        }
    }
}

/// Load settings from the default location.
pub fn load_config() -> AttachConfig {
    load_config_from(&config_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AttachConfig::default();
        assert_eq!(config.degrade_after, 3);
        assert_eq!(config.dead_after, 3);
        assert!(config.interrupt_on_ctrl_c);
        assert!(!config.open_stdin);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let json = r#"{"heartbeat_interval_ms": 250, "open_stdin": true}"#;
        let parsed: AttachConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.heartbeat_interval_ms, 250);
        assert!(parsed.open_stdin);
        assert_eq!(parsed.reply_timeout_ms, 2000);
        assert_eq!(parsed.queue_depth, 1024);
    }

    #[test]
    fn test_load_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config_from(&tmp.path().join("nope.json"));
        assert_eq!(config, AttachConfig::default());
    }

    #[test]
    fn test_load_invalid_file_falls_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_config_from(&path), AttachConfig::default());
    }

    #[test]
    fn test_load_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"dead_after": 5, "show_status": false}"#).unwrap();
        let config = load_config_from(&path);
        assert_eq!(config.dead_after, 5);
        assert!(!config.show_status);
    }

    #[test]
    fn test_config_path_is_valid() {
        assert!(config_path().ends_with("nbattach/config.json"));
    }
}
