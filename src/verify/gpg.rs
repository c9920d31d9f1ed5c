use crate::config::settings::MigrateConfig;
use crate::error::MigrateError;
use crate::keys::resolver::KeyId;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Signature inspection and keyserver access.
#[async_trait]
pub trait KeyTool {
    /// Id of the key that made `signature`, which may be inline-signed
    /// (`InRelease`) or detached (`Release.gpg`).
    async fn resolve_key_id(&self, signature: &[u8]) -> Result<Option<KeyId>, MigrateError>;

    /// Downloads `key` into a scratch keyring and returns its expiry, `None`
    /// if it never expires. Target keyrings are not touched.
    async fn fetch_key(&self, key: &KeyId) -> Result<Option<DateTime<Utc>>, MigrateError>;

    /// Copies a previously fetched `key` into `keyring`.
    async fn install_key(&self, key: &KeyId, keyring: &Path) -> Result<(), MigrateError>;

    /// Stops anything the tool left running.
    async fn shutdown(&self) -> Result<(), MigrateError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpgKeyInfo {
    pub key_id: String,
    pub creation_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub validity: String,
}

pub struct GpgKeyTool {
    program: String,
    gpgconf_program: String,
    homedir: PathBuf,
    workdir: PathBuf,
    scratch_keyring: PathBuf,
    keyserver: String,
    timeout: Duration,
    scratch: AtomicUsize,
}

impl GpgKeyTool {
    /// `workdir` holds the private gpg home, the scratch keyring and
    /// temporary copies of signatures and exported keys.
    pub fn new(config: &MigrateConfig, workdir: &Path) -> Result<Self, MigrateError> {
        let homedir = workdir.join("gnupg");
        fs::create_dir_all(&homedir)?;
        fs::set_permissions(&homedir, fs::Permissions::from_mode(0o700))?;

        Ok(Self {
            program: config.gpg_program.clone(),
            gpgconf_program: config.gpgconf_program.clone(),
            homedir,
            workdir: workdir.to_path_buf(),
            scratch_keyring: workdir.join("scratch-keyring.gpg"),
            keyserver: config.keyserver.clone(),
            timeout: config.timeout(),
            scratch: AtomicUsize::new(0),
        })
    }

    async fn run_program(&self, program: &str, args: Vec<OsString>) -> Result<Output, MigrateError> {
        let mut command = Command::new(program);
        command
            .arg("--homedir")
            .arg(&self.homedir)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!("Running {} {:?}", program, args);

        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(MigrateError::Tool {
                tool: program.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(MigrateError::Tool {
                tool: program.to_string(),
                reason: format!("timed out after {}s", self.timeout.as_secs()),
            }),
        }
    }

    async fn run(&self, args: Vec<OsString>) -> Result<Output, MigrateError> {
        let mut full: Vec<OsString> = vec!["--batch".into(), "--no-tty".into()];
        full.extend(args);
        self.run_program(&self.program, full).await
    }

    fn keyring_arg(keyring: &Path) -> OsString {
        // gnupg-ring: forces the legacy binary format APT can read
        let mut arg = OsString::from("gnupg-ring:");
        arg.push(keyring);
        arg
    }

    fn scratch_path(&self, prefix: &str) -> PathBuf {
        let n = self.scratch.fetch_add(1, Ordering::Relaxed);
        self.workdir.join(format!("{}-{}", prefix, n))
    }

    async fn list_key(&self, key: &KeyId, keyring: &Path) -> Result<Option<GpgKeyInfo>, MigrateError> {
        let output = self
            .run(vec![
                "--no-default-keyring".into(),
                "--keyring".into(),
                Self::keyring_arg(keyring),
                "--with-colons".into(),
                "--fixed-list-mode".into(),
                "--list-keys".into(),
                key.as_str().into(),
            ])
            .await?;

        Ok(parse_key_list(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .next())
    }
}

#[async_trait]
impl KeyTool for GpgKeyTool {
    async fn resolve_key_id(&self, signature: &[u8]) -> Result<Option<KeyId>, MigrateError> {
        let sig_path = self.scratch_path("signature");
        fs::write(&sig_path, signature)?;

        let verify = self
            .run(vec![
                "--verbose".into(),
                "--status-fd".into(),
                "1".into(),
                "--verify".into(),
                sig_path.clone().into_os_string(),
            ])
            .await;

        let mut key = verify.ok().and_then(|output| parse_key_id(&combined_output(&output)));

        if key.is_none() {
            debug!("No key id in verify output, listing packets");
            let packets = self
                .run(vec!["--list-packets".into(), sig_path.clone().into_os_string()])
                .await?;
            key = parse_key_id(&combined_output(&packets));
        }

        let _ = fs::remove_file(&sig_path);
        Ok(key)
    }

    async fn fetch_key(&self, key: &KeyId) -> Result<Option<DateTime<Utc>>, MigrateError> {
        let download_failed = |reason: String| MigrateError::KeyDownloadFailed {
            key: key.to_string(),
            reason,
        };

        let output = self
            .run(vec![
                "--no-default-keyring".into(),
                "--keyring".into(),
                Self::keyring_arg(&self.scratch_keyring),
                "--keyserver".into(),
                self.keyserver.clone().into(),
                "--recv-keys".into(),
                key.as_str().into(),
            ])
            .await
            .map_err(|e| download_failed(e.to_string()))?;

        if !output.status.success() {
            return Err(download_failed(last_line(&output.stderr, "keyserver returned no key")));
        }

        match self.list_key(key, &self.scratch_keyring).await? {
            Some(info) => {
                debug!(
                    "Key {} validity={} created={:?} expires={:?}",
                    info.key_id, info.validity, info.creation_date, info.expiration_date
                );
                Ok(info.expiration_date)
            }
            None => Err(download_failed("key not present after download".to_string())),
        }
    }

    async fn install_key(&self, key: &KeyId, keyring: &Path) -> Result<(), MigrateError> {
        let tool_failed = |reason: String| MigrateError::Tool {
            tool: self.program.clone(),
            reason,
        };

        let exported = self
            .run(vec![
                "--no-default-keyring".into(),
                "--keyring".into(),
                Self::keyring_arg(&self.scratch_keyring),
                "--export".into(),
                key.as_str().into(),
            ])
            .await?;
        if !exported.status.success() || exported.stdout.is_empty() {
            return Err(tool_failed(format!("could not export key {}", key)));
        }

        let key_path = self.scratch_path("key");
        fs::write(&key_path, &exported.stdout)?;

        let imported = self
            .run(vec![
                "--no-default-keyring".into(),
                "--keyring".into(),
                Self::keyring_arg(keyring),
                "--import".into(),
                key_path.clone().into_os_string(),
            ])
            .await;
        let _ = fs::remove_file(&key_path);

        let imported = imported?;
        if !imported.status.success() {
            return Err(tool_failed(last_line(&imported.stderr, "import failed")));
        }

        remove_keyring_backup(keyring);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), MigrateError> {
        let output = self
            .run_program(&self.gpgconf_program, vec!["--kill".into(), "all".into()])
            .await?;

        if !output.status.success() {
            return Err(MigrateError::Tool {
                tool: self.gpgconf_program.clone(),
                reason: last_line(&output.stderr, "--kill all failed"),
            });
        }
        Ok(())
    }
}

/// gpg leaves `<keyring>~` behind when it rewrites an existing keyring.
fn remove_keyring_backup(keyring: &Path) {
    let mut backup = keyring.as_os_str().to_owned();
    backup.push("~");
    let backup = PathBuf::from(backup);

    if backup.exists() {
        if let Err(e) = fs::remove_file(&backup) {
            warn!("failed to remove {}: {}", backup.display(), e);
        }
    }
}

fn last_line(stderr: &[u8], fallback: &str) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .last()
        .unwrap_or(fallback)
        .to_string()
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push('\n');
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

/// Picks the signing key id out of gpg's status lines, `--verbose`
/// diagnostics or `--list-packets` dump, whichever shows up first.
pub fn parse_key_id(output: &str) -> Option<KeyId> {
    for line in output.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();

        for (i, word) in words.iter().enumerate() {
            let marker = matches!(*word, "NO_PUBKEY" | "ERRSIG" | "VALIDSIG" | "key" | "ID" | "keyid");
            if !marker {
                continue;
            }
            if let Some(key) = words.get(i + 1).and_then(|next| KeyId::parse(next)) {
                return Some(key);
            }
        }
    }

    None
}

pub fn parse_key_list(output: &str) -> Vec<GpgKeyInfo> {
    output
        .lines()
        .filter(|line| line.starts_with("pub:"))
        .filter_map(parse_key_line)
        .collect()
}

fn parse_key_line(line: &str) -> Option<GpgKeyInfo> {
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() < 7 {
        return None;
    }

    Some(GpgKeyInfo {
        key_id: parts[4].to_string(),
        creation_date: parse_timestamp(parts[5]),
        expiration_date: parse_timestamp(parts[6]),
        validity: parts[1].to_string(),
    })
}

/// Colon listings carry epoch seconds, or ISO 8601 basic format on some builds.
fn parse_timestamp(field: &str) -> Option<DateTime<Utc>> {
    if field.is_empty() || field == "0" {
        return None;
    }

    if let Ok(secs) = field.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0);
    }

    match NaiveDateTime::parse_from_str(field, "%Y%m%dT%H%M%S") {
        Ok(naive) => Some(naive.and_utc()),
        Err(_) => {
            warn!("Unrecognised gpg timestamp: {}", field);
            None
        }
    }
}
