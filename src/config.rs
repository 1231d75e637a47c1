use crate::core::backend::Position;
use crate::core::iptables::{DEFAULT_IP6TABLES, DEFAULT_IPTABLES};
use crate::core::profiles::DEFAULT_PROFILE_NAME;
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration: backend programs, lifecycle defaults and the
/// profile used when none is given on the command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_iptables")]
    pub iptables: String,
    #[serde(default = "default_ip6tables")]
    pub ip6tables: String,
    /// Pass `-w` so concurrent xtables users queue instead of failing
    #[serde(default = "default_true")]
    pub wait_for_lock: bool,
    /// Where `start` places rules when the command line does not say
    #[serde(default)]
    pub insert_at: Position,
    #[serde(default = "default_profile")]
    pub default_profile: String,
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            iptables: default_iptables(),
            ip6tables: default_ip6tables(),
            wait_for_lock: true,
            insert_at: Position::Append,
            default_profile: default_profile(),
            audit_enabled: true,
        }
    }
}

fn default_iptables() -> String {
    DEFAULT_IPTABLES.to_string()
}

fn default_ip6tables() -> String {
    DEFAULT_IP6TABLES.to_string()
}

fn default_profile() -> String {
    DEFAULT_PROFILE_NAME.to_string()
}

fn default_true() -> bool {
    true
}

/// `<data dir>/config.json`
pub fn config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join("config.json"))
}

/// Writes the config atomically: a temp file in the same directory with mode
/// 0o600, then a rename over the target.
///
/// # Errors
///
/// Returns `Err` if the directory is missing or the write fails.
pub async fn save_config_to(path: &Path, config: &AppConfig) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let dir = path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let target = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut temp = NamedTempFile::new_in(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&target).map_err(|e| {
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
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Saves the config to the data directory.
///
/// # Errors
///
/// Returns `Err` if the data directory is unknown or the write fails.
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    let path = config_path().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "Data directory not found")
    })?;
    save_config_to(&path, config).await
}

/// Loads the config at `path`; missing or unreadable files yield defaults.
pub async fn load_config_from(path: &Path) -> AppConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => match serde_json::from_str::<AppConfig>(&json) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring corrupt config {}: {}", path.display(), e);
                AppConfig::default()
            }
        },
        Err(_) => AppConfig::default(),
    }
}

/// Loads the config from the data directory, or returns defaults.
pub async fn load_config() -> AppConfig {
    match config_path() {
        Some(path) => load_config_from(&path).await,
        None => AppConfig::default(),
    }
}
