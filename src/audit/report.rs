use crate::sources::enumerate::display_name;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Unchanged,
    Migrated { backup: PathBuf },
    Abandoned { reason: String },
    Unreadable { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub lines_migrated: usize,
    #[serde(flatten)]
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub files: Vec<FileReport>,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            files: Vec::new(),
        }
    }

    pub fn push(&mut self, report: FileReport) {
        self.files.push(report);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn failed(&self) -> usize {
        self.files
            .iter()
            .filter(|f| {
                matches!(
                    f.outcome,
                    FileOutcome::Abandoned { .. } | FileOutcome::Unreadable { .. }
                )
            })
            .count()
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed() == 0 {
            0
        } else {
            1
        }
    }

    pub fn log_summary(&self) {
        for file in &self.files {
            let name = display_name(&file.path);
            match &file.outcome {
                FileOutcome::Unchanged => info!("{}: unchanged", name),
                FileOutcome::Migrated { backup } => info!(
                    "{}: migrated {} line(s), original saved as {}",
                    name,
                    file.lines_migrated,
                    backup.display()
                ),
                FileOutcome::Abandoned { reason } => error!("{}: not migrated: {}", name, reason),
                FileOutcome::Unreadable { reason } => warn!("{}: skipped: {}", name, reason),
            }
        }

        info!(
            "{} file(s) processed, {} migrated, {} failed",
            self.files.len(),
            self.files
                .iter()
                .filter(|f| matches!(f.outcome, FileOutcome::Migrated { .. }))
                .count(),
            self.failed()
        );
    }
}
