use crate::error::MigrateError;
use crate::mirror::fetch::MetadataFetcher;
use crate::verify::gpg::KeyTool;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Short or long OpenPGP key id, stored upper-case without a `0x` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyId(String);

impl KeyId {
    pub fn parse(token: &str) -> Option<Self> {
        let token = token
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .trim_start_matches("0x");

        if (8..=40).contains(&token.len()) && token.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(KeyId(token.to_ascii_uppercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-run memo of URL -> key id and of which keys each keyring already holds.
#[derive(Debug, Default)]
pub struct RunContext {
    url_keys: HashMap<String, KeyId>,
    fetched: HashMap<KeyId, Option<DateTime<Utc>>>,
    imported: HashMap<PathBuf, HashSet<KeyId>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_key(&self, url: &str) -> Option<&KeyId> {
        self.url_keys.get(url)
    }

    pub fn remember(&mut self, url: &str, key: KeyId) {
        self.url_keys.entry(url.to_string()).or_insert(key);
    }

    /// Expiry of a key already downloaded this run; the outer `None` means
    /// not downloaded yet.
    pub fn fetched_expiry(&self, key: &KeyId) -> Option<Option<DateTime<Utc>>> {
        self.fetched.get(key).copied()
    }

    pub fn remember_fetched(&mut self, key: KeyId, expiry: Option<DateTime<Utc>>) {
        self.fetched.insert(key, expiry);
    }

    pub fn is_imported(&self, keyring: &Path, key: &KeyId) -> bool {
        self.imported
            .get(keyring)
            .map_or(false, |keys| keys.contains(key))
    }

    pub fn mark_imported(&mut self, keyring: &Path, key: KeyId) {
        self.imported
            .entry(keyring.to_path_buf())
            .or_default()
            .insert(key);
    }
}

pub struct KeyResolver<F, T> {
    fetcher: F,
    tool: T,
    context: RunContext,
}

impl<F: MetadataFetcher, T: KeyTool + Sync> KeyResolver<F, T> {
    pub fn new(fetcher: F, tool: T) -> Self {
        Self {
            fetcher,
            tool,
            context: RunContext::new(),
        }
    }

    pub async fn shutdown(&self) -> Result<(), MigrateError> {
        self.tool.shutdown().await
    }

    /// Returns the key signing `url`'s metadata, making sure `keyring` holds it.
    pub async fn ensure_key(&mut self, url: &str, keyring: &Path) -> Result<KeyId, MigrateError> {
        let key = match self.context.cached_key(url) {
            Some(key) => {
                debug!("Key {} for {} already known", key, url);
                key.clone()
            }
            None => {
                let key = self.lookup_key_id(url).await?;
                self.context.remember(url, key.clone());
                key
            }
        };

        if self.context.is_imported(keyring, &key) {
            debug!("Key {} already in {}", key, keyring.display());
            return Ok(key);
        }

        let expiry = match self.context.fetched_expiry(&key) {
            Some(expiry) => expiry,
            None => {
                let expiry = self.tool.fetch_key(&key).await?;
                self.context.remember_fetched(key.clone(), expiry);
                expiry
            }
        };
        if let Some(expired_at) = expiry.filter(|at| *at < Utc::now()) {
            return Err(MigrateError::KeyExpired {
                key: key.to_string(),
                expired_at,
            });
        }

        self.tool.install_key(&key, keyring).await?;
        fs::set_permissions(keyring, fs::Permissions::from_mode(0o644))?;
        self.context.mark_imported(keyring, key.clone());
        info!("Imported key {} into {}", key, keyring.display());

        Ok(key)
    }

    async fn lookup_key_id(&self, url: &str) -> Result<KeyId, MigrateError> {
        let inrelease = format!("{}InRelease", url);
        let signature = match self.fetcher.fetch(&inrelease).await {
            Ok(data) => data,
            Err(e) => {
                debug!("{}: {}, trying Release.gpg", inrelease, e);
                let release_gpg = format!("{}Release.gpg", url);
                self.fetcher.fetch(&release_gpg).await.map_err(|e| {
                    debug!("{}: {}", release_gpg, e);
                    MigrateError::MetadataUnavailable {
                        url: url.to_string(),
                    }
                })?
            }
        };

        self.tool
            .resolve_key_id(&signature)
            .await?
            .ok_or_else(|| MigrateError::KeyIdNotFound {
                url: url.to_string(),
            })
    }
}
