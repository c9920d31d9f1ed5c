//! In-memory stand-ins for the network and gpg.

use crate::error::MigrateError;
use crate::keys::resolver::KeyId;
use crate::mirror::fetch::MetadataFetcher;
use crate::verify::gpg::KeyTool;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Serves fixed bodies; the body of a signature is the key id it "contains".
#[derive(Clone, Default)]
pub struct FakeFetcher {
    bodies: HashMap<String, Vec<u8>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(mut self, url: &str, body: &str) -> Self {
        self.bodies.insert(url.to_string(), body.as_bytes().to_vec());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        self.calls.lock().unwrap().push(url.to_string());
        self.bodies
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("{} returned status: 404 Not Found", url))
    }
}

#[derive(Clone, Default)]
pub struct FakeKeyTool {
    expiry: HashMap<String, DateTime<Utc>>,
    missing: Vec<String>,
    fetches: Arc<Mutex<Vec<KeyId>>>,
    installs: Arc<Mutex<Vec<(KeyId, PathBuf)>>>,
    shutdowns: Arc<Mutex<usize>>,
}

impl FakeKeyTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expiring(mut self, key: &str, at: DateTime<Utc>) -> Self {
        self.expiry.insert(key.to_string(), at);
        self
    }

    /// Keys the fake keyserver does not have.
    pub fn without(mut self, key: &str) -> Self {
        self.missing.push(key.to_string());
        self
    }

    pub fn fetches(&self) -> Vec<KeyId> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn installs(&self) -> Vec<(KeyId, PathBuf)> {
        self.installs.lock().unwrap().clone()
    }

    pub fn shutdowns(&self) -> usize {
        *self.shutdowns.lock().unwrap()
    }
}

#[async_trait]
impl KeyTool for FakeKeyTool {
    async fn resolve_key_id(&self, signature: &[u8]) -> Result<Option<KeyId>, MigrateError> {
        Ok(KeyId::parse(&String::from_utf8_lossy(signature)))
    }

    async fn fetch_key(&self, key: &KeyId) -> Result<Option<DateTime<Utc>>, MigrateError> {
        if self.missing.iter().any(|k| k == key.as_str()) {
            return Err(MigrateError::KeyDownloadFailed {
                key: key.to_string(),
                reason: "no data".to_string(),
            });
        }

        self.fetches.lock().unwrap().push(key.clone());
        Ok(self.expiry.get(key.as_str()).copied())
    }

    async fn install_key(&self, key: &KeyId, keyring: &Path) -> Result<(), MigrateError> {
        OpenOptions::new().create(true).append(true).open(keyring)?;
        self.installs
            .lock()
            .unwrap()
            .push((key.clone(), keyring.to_path_buf()));
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), MigrateError> {
        *self.shutdowns.lock().unwrap() += 1;
        Ok(())
    }
}
