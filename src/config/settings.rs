use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MigrateConfig {
    pub keyring_dir: PathBuf,
    pub sources_list: PathBuf,
    pub sources_dir: PathBuf,
    pub keyserver: String,
    pub timeout_secs: u64,
    pub backup_suffix: String,
    pub gpg_program: String,
    pub gpgconf_program: String,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            keyring_dir: PathBuf::from("/usr/share/keyrings"),
            sources_list: PathBuf::from("/etc/apt/sources.list"),
            sources_dir: PathBuf::from("/etc/apt/sources.list.d"),
            keyserver: "hkp://keyserver.ubuntu.com:80".to_string(),
            timeout_secs: 30,
            backup_suffix: ".apt-key.bak".to_string(),
            gpg_program: "gpg".to_string(),
            gpgconf_program: "gpgconf".to_string(),
        }
    }
}

impl MigrateConfig {
    pub fn load_from_file(config_path: &Path) -> Result<Self> {
        let config_content = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file {}", config_path.display()))?;
        let config: MigrateConfig = toml::from_str(&config_content)
            .with_context(|| format!("invalid config file {}", config_path.display()))?;

        info!("Configuration loaded from {}", config_path.display());
        Ok(config)
    }

    /// Creates the keyring directory and makes it absolute; `signed-by=`
    /// only accepts absolute paths.
    pub fn prepare_keyring_dir(&mut self) -> Result<()> {
        fs::create_dir_all(&self.keyring_dir).with_context(|| {
            format!("failed to create keyring directory {}", self.keyring_dir.display())
        })?;
        self.keyring_dir = fs::canonicalize(&self.keyring_dir).with_context(|| {
            format!("failed to resolve keyring directory {}", self.keyring_dir.display())
        })?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `<keyring_dir>/<stem>-keyring.gpg`, with a trailing `.list` dropped from the stem.
    pub fn keyring_path_for(&self, repo_file: &Path) -> PathBuf {
        let name = repo_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = name.strip_suffix(".list").unwrap_or(&name);

        self.keyring_dir.join(format!("{}-keyring.gpg", stem))
    }

    pub fn backup_path_for(&self, repo_file: &Path) -> PathBuf {
        let mut backup = repo_file.as_os_str().to_owned();
        backup.push(&self.backup_suffix);
        PathBuf::from(backup)
    }
}
