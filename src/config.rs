//! Configuration persistence
//!
//! `config.json` lives in the XDG config directory (`~/.config/fwpath/`) unless
//! `--config` points elsewhere. Every field has a serde default so partial
//! files keep working across upgrades.

use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Upper bound for `command_timeout_secs`
pub const MAX_COMMAND_TIMEOUT_SECS: u64 = 300;

/// iptables binary baked in at build time (`FWPATH_IPTABLES_PATH`), for
/// distributions that ship `iptables-legacy` or `iptables-nft` only
const BUILD_IPTABLES_PATH: Option<&str> = option_env!("FWPATH_IPTABLES_PATH");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_iptables_path")]
    pub iptables_path: String,
    #[serde(default = "default_ip_path")]
    pub ip_path: String,
    #[serde(default = "default_sysctl_path")]
    pub sysctl_path: String,
    #[serde(default = "default_ss_path")]
    pub ss_path: String,
    /// Per-invocation timeout for external tools (clamped to 1..=300)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_isolation_chain")]
    pub isolation_chain: String,
    /// Prefix shared by container bridge names
    #[serde(default = "default_bridge_prefix")]
    pub bridge_prefix: String,
    /// Prefixes that mark an interface as a point-to-point tunnel
    #[serde(default = "default_tunnel_prefixes")]
    pub tunnel_prefixes: Vec<String>,
    /// Interface tx counters are divided by this when no rule counters exist
    #[serde(default = "default_estimate_divisor")]
    pub estimate_divisor: u64,
    #[serde(default = "default_drop_rate_warning")]
    pub drop_rate_warning_percent: f64,
    #[serde(default = "default_forward_rule_hint")]
    pub forward_rule_count_hint: usize,
    /// Recommend reordering when an earlier DROP pre-empts a permitting rule
    #[serde(default = "default_true")]
    pub strict_first_match: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            iptables_path: default_iptables_path(),
            ip_path: default_ip_path(),
            sysctl_path: default_sysctl_path(),
            ss_path: default_ss_path(),
            command_timeout_secs: default_command_timeout(),
            isolation_chain: default_isolation_chain(),
            bridge_prefix: default_bridge_prefix(),
            tunnel_prefixes: default_tunnel_prefixes(),
            estimate_divisor: default_estimate_divisor(),
            drop_rate_warning_percent: default_drop_rate_warning(),
            forward_rule_count_hint: default_forward_rule_hint(),
            strict_first_match: true,
        }
    }
}

impl AppConfig {
    /// Timeout with the documented bounds applied
    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.command_timeout_secs.clamp(1, MAX_COMMAND_TIMEOUT_SECS))
    }

    /// True if `name` starts with one of the tunnel prefixes
    pub fn is_tunnel_name(&self, name: &str) -> bool {
        self.tunnel_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }
}

fn default_iptables_path() -> String {
    BUILD_IPTABLES_PATH.unwrap_or("iptables").to_string()
}

fn default_ip_path() -> String {
    "ip".to_string()
}

fn default_sysctl_path() -> String {
    "sysctl".to_string()
}

fn default_ss_path() -> String {
    "ss".to_string()
}

fn default_command_timeout() -> u64 {
    10
}

fn default_isolation_chain() -> String {
    "DOCKER-ISOLATION-STAGE-2".to_string()
}

fn default_bridge_prefix() -> String {
    "br-".to_string()
}

fn default_tunnel_prefixes() -> Vec<String> {
    vec!["tun".to_string(), "tap".to_string()]
}

fn default_estimate_divisor() -> u64 {
    10
}

fn default_drop_rate_warning() -> f64 {
    5.0
}

fn default_forward_rule_hint() -> usize {
    20
}

fn default_true() -> bool {
    true
}

/// Default location: `$XDG_CONFIG_HOME/fwpath/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file in the target directory.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_config(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || write_atomic(&path, json.as_bytes()))
        .await
        .map_err(std::io::Error::other)?
}

fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use tempfile::NamedTempFile;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    crate::utils::ensure_dir(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e.error
        }
    })?;
    Ok(())
}

/// Loads the config from `path` (or the default location), falling back to
/// defaults when the file is missing or unreadable.
pub async fn load_config(path: Option<&Path>) -> AppConfig {
    let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) else {
        return AppConfig::default();
    };

    match tokio::fs::read_to_string(&path).await {
        Ok(json) => match serde_json::from_str::<AppConfig>(&json) {
            Ok(config) => {
                debug!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("Ignoring invalid config {}: {}", path.display(), e);
                AppConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => {
            warn!("Cannot read config {}: {}", path.display(), e);
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"iptables_path": "/usr/sbin/iptables-legacy"}"#).unwrap();
        assert_eq!(config.iptables_path, "/usr/sbin/iptables-legacy");
        assert_eq!(config.isolation_chain, "DOCKER-ISOLATION-STAGE-2");
        assert_eq!(config.tunnel_prefixes, ["tun", "tap"]);
        assert!(config.strict_first_match);
    }

    #[test]
    fn test_timeout_is_clamped() {
        let mut config = AppConfig {
            command_timeout_secs: 0,
            ..AppConfig::default()
        };
        assert_eq!(config.command_timeout().as_secs(), 1);
        config.command_timeout_secs = 100_000;
        assert_eq!(config.command_timeout().as_secs(), MAX_COMMAND_TIMEOUT_SECS);
    }

    #[test]
    fn test_tunnel_names() {
        let config = AppConfig::default();
        assert!(config.is_tunnel_name("tun0"));
        assert!(config.is_tunnel_name("tap3"));
        assert!(!config.is_tunnel_name("wg0"));
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = AppConfig {
            bridge_prefix: "docker".to_string(),
            ..AppConfig::default()
        };

        save_config(&config, &path).await.unwrap();
        assert_eq!(load_config(Some(&path)).await, config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_invalid_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert_eq!(load_config(Some(&path)).await, AppConfig::default());
    }
}
