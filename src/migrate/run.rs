use crate::audit::report::{FileOutcome, FileReport, RunReport};
use crate::config::settings::MigrateConfig;
use crate::error::MigrateError;
use crate::keys::resolver::KeyResolver;
use crate::mirror::fetch::MetadataFetcher;
use crate::sources::commit::{commit_file, CommitResult};
use crate::sources::enumerate::display_name;
use crate::sources::line::{add_signed_by, classify, metadata_url, LineClass};
use crate::verify::gpg::KeyTool;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub struct Migrator<F, T> {
    config: MigrateConfig,
    resolver: KeyResolver<F, T>,
}

impl<F: MetadataFetcher, T: KeyTool + Sync> Migrator<F, T> {
    pub fn new(config: MigrateConfig, fetcher: F, tool: T) -> Self {
        Self {
            config,
            resolver: KeyResolver::new(fetcher, tool),
        }
    }

    /// Files are handled one after another; a failed file never rolls back
    /// the ones committed before it.
    pub async fn run(&mut self, files: &[PathBuf]) -> RunReport {
        let mut report = RunReport::new();

        for path in files {
            let file_report = self.migrate_file(path).await;
            report.push(file_report);
        }

        report.finish();
        report
    }

    /// Stops helpers the key tool started; called once, after the last file.
    pub async fn shutdown(&self) -> Result<(), MigrateError> {
        self.resolver.shutdown().await
    }

    pub async fn migrate_file(&mut self, path: &Path) -> FileReport {
        let (lines_migrated, outcome) = match self.try_migrate_file(path).await {
            Ok(done) => done,
            Err(e @ MigrateError::UnreadableFile { .. }) => {
                warn!("{}: {}", display_name(path), e);
                (0, FileOutcome::Unreadable { reason: e.to_string() })
            }
            Err(e) => {
                error!("{}: {}, leaving file untouched", display_name(path), e);
                (0, FileOutcome::Abandoned { reason: e.to_string() })
            }
        };

        FileReport {
            path: path.to_path_buf(),
            lines_migrated,
            outcome,
        }
    }

    async fn try_migrate_file(&mut self, path: &Path) -> Result<(usize, FileOutcome), MigrateError> {
        let name = display_name(path);
        let unreadable = |source: std::io::Error| MigrateError::UnreadableFile {
            path: path.to_path_buf(),
            source,
        };

        let original = fs::read(path).map_err(unreadable)?;

        info!("{}: processing", name);

        let keyring = self.config.keyring_path_for(path);
        let mut rewritten: Vec<u8> = Vec::with_capacity(original.len() + 64);
        let mut migrated = 0;

        for raw in original.split_inclusive(|b| *b == b'\n') {
            let raw = match std::str::from_utf8(raw) {
                Ok(raw) => raw,
                Err(_) => {
                    debug!("{}: line is not UTF-8, copying it verbatim", name);
                    rewritten.extend_from_slice(raw);
                    continue;
                }
            };
            let (body, ending) = split_line_ending(raw);

            match classify(body) {
                LineClass::Passthrough => rewritten.extend_from_slice(raw.as_bytes()),
                LineClass::AlreadySigned => {
                    debug!("{}: already signed: {}", name, body.trim());
                    rewritten.extend_from_slice(raw.as_bytes());
                }
                LineClass::NeedsMigration => {
                    let url = match metadata_url(body) {
                        Ok(url) => url,
                        Err(e) => {
                            warn!("{}: {}, leaving it unchanged", name, e);
                            rewritten.extend_from_slice(raw.as_bytes());
                            continue;
                        }
                    };

                    let key = self.resolver.ensure_key(&url, &keyring).await?;
                    info!("{}: {} is signed by {}", name, url, key);

                    rewritten.extend_from_slice(add_signed_by(body, &keyring)?.as_bytes());
                    rewritten.extend_from_slice(ending.as_bytes());
                    migrated += 1;
                }
            }
        }

        let backup = self.config.backup_path_for(path);
        match commit_file(path, &original, &rewritten, &backup)? {
            CommitResult::Unchanged => Ok((0, FileOutcome::Unchanged)),
            CommitResult::Written { backup } => Ok((migrated, FileOutcome::Migrated { backup })),
        }
    }
}

fn split_line_ending(raw: &str) -> (&str, &str) {
    let body = raw.trim_end_matches(['\n', '\r']);
    (body, &raw[body.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::testing::{FakeFetcher, FakeKeyTool};
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    const FOCAL: &str = "http://example.org/ubuntu/dists/focal/";
    const FLAT: &str = "http://example.org/flat/./";

    struct Fixture {
        dir: TempDir,
        config: MigrateConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let keyring_dir = dir.path().join("keyrings");
            fs::create_dir(&keyring_dir).unwrap();
            let config = MigrateConfig {
                keyring_dir,
                ..MigrateConfig::default()
            };
            Self { dir, config }
        }

        fn write(&self, name: &str, content: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, content).unwrap();
            path
        }
    }

    fn fetcher() -> FakeFetcher {
        FakeFetcher::new()
            .serve(&format!("{}InRelease", FOCAL), "871920D1991BC93C")
            .serve(&format!("{}Release.gpg", FLAT), "3B4FE6ACC0B21F32")
    }

    #[tokio::test]
    async fn test_migrates_file_and_keeps_backup() {
        let fx = Fixture::new();
        let original = "# main archive\n\
                        deb http://example.org/ubuntu focal main\n\
                        deb-src [arch=amd64] http://example.org/ubuntu focal main\n\
                        deb [signed-by=/etc/apt/keyrings/other.gpg] http://other.org/debian stable main\n\
                        deb http://example.org/flat/ ./\n";
        let path = fx.write("example.list", original);
        let fetcher = fetcher();
        let tool = FakeKeyTool::new();
        let mut migrator = Migrator::new(fx.config.clone(), fetcher.clone(), tool.clone());

        let report = migrator.migrate_file(&path).await;

        let keyring = fx.config.keyring_dir.join("example-keyring.gpg");
        let expected = format!(
            "# main archive\n\
             deb [signed-by={k}] http://example.org/ubuntu focal main\n\
             deb-src [arch=amd64 signed-by={k}] http://example.org/ubuntu focal main\n\
             deb [signed-by=/etc/apt/keyrings/other.gpg] http://other.org/debian stable main\n\
             deb [signed-by={k}] http://example.org/flat/ ./\n",
            k = keyring.display()
        );
        let backup = fx.config.backup_path_for(&path);

        assert_eq!(report.outcome, FileOutcome::Migrated { backup: backup.clone() });
        assert_eq!(report.lines_migrated, 3);
        assert_eq!(fs::read_to_string(&path).unwrap(), expected);
        assert_eq!(fs::read_to_string(&backup).unwrap(), original);

        assert_eq!(
            fetcher.calls(),
            vec![
                format!("{}InRelease", FOCAL),
                format!("{}InRelease", FLAT),
                format!("{}Release.gpg", FLAT),
            ]
        );
        assert_eq!(tool.fetches().len(), 2);
        assert_eq!(tool.installs().len(), 2);
    }

    #[tokio::test]
    async fn test_second_run_changes_nothing() {
        let fx = Fixture::new();
        let path = fx.write("example.list", "deb http://example.org/ubuntu focal main\n");

        let mut first = Migrator::new(fx.config.clone(), fetcher(), FakeKeyTool::new());
        first.migrate_file(&path).await;
        let migrated = fs::read(&path).unwrap();
        fs::remove_file(fx.config.backup_path_for(&path)).unwrap();

        let fetcher = fetcher();
        let mut second = Migrator::new(fx.config.clone(), fetcher.clone(), FakeKeyTool::new());
        let report = second.migrate_file(&path).await;

        assert_eq!(report.outcome, FileOutcome::Unchanged);
        assert_eq!(fs::read(&path).unwrap(), migrated);
        assert!(!fx.config.backup_path_for(&path).exists());
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_expired_key_abandons_whole_file() {
        let fx = Fixture::new();
        let original = "deb http://example.org/flat/ ./\ndeb http://example.org/ubuntu focal main\n";
        let path = fx.write("expired.list", original);
        let tool = FakeKeyTool::new().expiring("871920D1991BC93C", Utc::now() - Duration::days(30));
        let mut migrator = Migrator::new(fx.config.clone(), fetcher(), tool);

        let report = migrator.migrate_file(&path).await;

        match report.outcome {
            FileOutcome::Abandoned { reason } => {
                assert!(reason.contains("871920D1991BC93C"));
                assert!(reason.contains("expired on"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
        assert!(!fx.config.backup_path_for(&path).exists());
    }

    #[tokio::test]
    async fn test_nothing_to_migrate_is_unchanged() {
        let fx = Fixture::new();
        let path = fx.write(
            "plain.list",
            "# comment only\n\ndeb [signed-by=/k.gpg] http://example.org/ubuntu focal main",
        );
        let mut migrator = Migrator::new(fx.config.clone(), fetcher(), FakeKeyTool::new());

        let report = migrator.migrate_file(&path).await;

        assert_eq!(report.outcome, FileOutcome::Unchanged);
        assert!(!fx.config.backup_path_for(&path).exists());
    }

    #[tokio::test]
    async fn test_malformed_line_left_alone() {
        let fx = Fixture::new();
        let path = fx.write(
            "broken.list",
            "deb http://example.org/ubuntu\r\ndeb http://example.org/ubuntu focal main\r\n",
        );
        let mut migrator = Migrator::new(fx.config.clone(), fetcher(), FakeKeyTool::new());

        let report = migrator.migrate_file(&path).await;

        assert_eq!(report.lines_migrated, 1);
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("deb http://example.org/ubuntu\r\ndeb [signed-by="));
        assert!(content.ends_with("focal main\r\n"));
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_other_files() {
        let fx = Fixture::new();
        let missing = fx.dir.path().join("missing.list");
        let unsigned = fx.write("unknown.list", "deb http://example.org/gone focal main\n");
        let no_key = fx.write("flat.list", "deb http://example.org/flat/ ./\n");
        let good = fx.write("good.list", "deb http://example.org/ubuntu focal main\n");
        let tool = FakeKeyTool::new().without("3B4FE6ACC0B21F32");
        let mut migrator = Migrator::new(fx.config.clone(), fetcher(), tool);

        let report = migrator
            .run(&[missing, unsigned.clone(), no_key.clone(), good.clone()])
            .await;

        assert!(matches!(report.files[0].outcome, FileOutcome::Unreadable { .. }));
        assert!(matches!(report.files[1].outcome, FileOutcome::Abandoned { ref reason } if reason.contains("http://example.org/gone/dists/focal/")));
        assert!(matches!(report.files[2].outcome, FileOutcome::Abandoned { ref reason } if reason.contains("3B4FE6ACC0B21F32")));
        assert!(matches!(report.files[3].outcome, FileOutcome::Migrated { .. }));
        assert_eq!(report.exit_code(), 1);
        assert!(report.finished_at.is_some());
        assert_eq!(fs::read_to_string(&no_key).unwrap(), "deb http://example.org/flat/ ./\n");
    }

    #[tokio::test]
    async fn test_url_cache_spans_files() {
        let fx = Fixture::new();
        let a = fx.write("a.list", "deb http://example.org/ubuntu focal main\n");
        let b = fx.write("b.list", "deb http://example.org/ubuntu focal universe\n");
        let fetcher = fetcher();
        let tool = FakeKeyTool::new();
        let mut migrator = Migrator::new(fx.config.clone(), fetcher.clone(), tool.clone());

        let report = migrator.run(&[a, b]).await;

        assert_eq!(report.exit_code(), 0);
        assert_eq!(fetcher.calls().len(), 1);
        assert_eq!(tool.fetches().len(), 1);
        let keyrings: Vec<PathBuf> = tool.installs().into_iter().map(|(_, k)| k).collect();
        assert_eq!(
            keyrings,
            vec![
                fx.config.keyring_dir.join("a-keyring.gpg"),
                fx.config.keyring_dir.join("b-keyring.gpg"),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_utf8_comment_copied_verbatim() {
        let fx = Fixture::new();
        let path = fx.dir.path().join("latin1.list");
        let original = b"# Caf\xe9 mirror\ndeb http://example.org/ubuntu focal main\n".to_vec();
        fs::write(&path, &original).unwrap();
        let mut migrator = Migrator::new(fx.config.clone(), fetcher(), FakeKeyTool::new());

        let report = migrator.migrate_file(&path).await;

        assert!(matches!(report.outcome, FileOutcome::Migrated { .. }));
        assert_eq!(report.lines_migrated, 1);
        let mut expected = b"# Caf\xe9 mirror\n".to_vec();
        expected.extend_from_slice(
            format!(
                "deb [signed-by={}] http://example.org/ubuntu focal main\n",
                fx.config.keyring_dir.join("latin1-keyring.gpg").display()
            )
            .as_bytes(),
        );
        assert_eq!(fs::read(&path).unwrap(), expected);
        assert_eq!(fs::read(fx.config.backup_path_for(&path)).unwrap(), original);
    }

    #[test]
    fn test_split_line_ending() {
        assert_eq!(split_line_ending("deb x\r\n"), ("deb x", "\r\n"));
        assert_eq!(split_line_ending("deb x"), ("deb x", ""));
    }
}
