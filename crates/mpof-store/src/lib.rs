//! Persisted opportunity store: dedup, active/expired partitioning, archive.
//!
//! Two JSON collections live under the data directory. The active set is
//! fully rewritten after every merge; the archive only ever grows, each
//! entry tagged with the date it expired.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use mpof_core::{dedup_key, Opportunity};
use thiserror::Error;
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mpof-store";

pub const ACTIVE_FILE: &str = "opportunities.json";
pub const ARCHIVE_FILE: &str = "archive/archived_opportunities.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing records: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Counts reported back from a [`OpportunityStore::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub active: usize,
    pub archived: usize,
}

/// Merge previously persisted records with freshly scraped ones, dropping
/// later duplicates by case-folded (title, institute) key. Existing records
/// come first, so on conflict the original keeps its `dateAdded`/`scrapedAt`.
pub fn merge_and_dedup(existing: Vec<Opportunity>, incoming: Vec<Opportunity>) -> Vec<Opportunity> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for record in existing.into_iter().chain(incoming) {
        if seen.insert(dedup_key(&record.title, &record.institute)) {
            merged.push(record);
        }
    }
    merged
}

/// Split records into (active, expired) relative to `today`.
///
/// A deadline strictly in the past expires the record and stamps its
/// archival date. Deadlines today or later, and deadlines that fail to
/// parse, stay active: unparseable dates fail open toward retention.
pub fn partition(records: Vec<Opportunity>, today: NaiveDate) -> (Vec<Opportunity>, Vec<Opportunity>) {
    let mut active = Vec::new();
    let mut expired = Vec::new();
    for mut record in records {
        match NaiveDate::parse_from_str(&record.deadline, "%Y-%m-%d") {
            Ok(deadline) if deadline < today => {
                record.archived_date = Some(today.format("%Y-%m-%d").to_string());
                expired.push(record);
            }
            _ => active.push(record),
        }
    }
    (active, expired)
}

/// File-backed active + archive record sets.
#[derive(Debug, Clone)]
pub struct OpportunityStore {
    active_path: PathBuf,
    archive_path: PathBuf,
}

impl OpportunityStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            active_path: data_dir.join(ACTIVE_FILE),
            archive_path: data_dir.join(ARCHIVE_FILE),
        }
    }

    pub fn active_path(&self) -> &Path {
        &self.active_path
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Prior active set. Missing or malformed files are empty prior state.
    pub async fn load_active(&self) -> Vec<Opportunity> {
        read_records(&self.active_path).await
    }

    pub async fn load_archive(&self) -> Vec<Opportunity> {
        read_records(&self.archive_path).await
    }

    /// Idempotent merge-and-archive: merge the prior active set with
    /// `incoming`, dedup, partition by `today`, rewrite the active file and
    /// append the newly expired records to the archive. The archive is
    /// read-concat-rewritten in full, never truncated.
    pub async fn commit(
        &self,
        incoming: Vec<Opportunity>,
        today: NaiveDate,
    ) -> Result<CommitOutcome, StoreError> {
        let existing = self.load_active().await;
        let merged = merge_and_dedup(existing, incoming);
        let (active, expired) = partition(merged, today);

        write_records(&self.active_path, &active).await?;

        if !expired.is_empty() {
            let mut archived = self.load_archive().await;
            archived.extend(expired.iter().cloned());
            write_records(&self.archive_path, &archived).await?;
        }

        Ok(CommitOutcome {
            active: active.len(),
            archived: expired.len(),
        })
    }
}

async fn read_records(path: &Path) -> Vec<Opportunity> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str(&text) {
        Ok(records) => records,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "malformed store file, treating as empty");
            Vec::new()
        }
    }
}

/// Full rewrite through a temp file + rename so a crash mid-write never
/// leaves a half-serialized store behind.
async fn write_records(path: &Path, records: &[Opportunity]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(|source| StoreError::Io {
        path: parent.to_path_buf(),
        source,
    })?;

    let bytes = serde_json::to_vec_pretty(records)?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp_path, &bytes).await.map_err(|source| StoreError::Io {
        path: temp_path.clone(),
        source,
    })?;
    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(source) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}
