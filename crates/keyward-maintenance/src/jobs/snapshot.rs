//! Compressed point-in-time copies of the database.
//!
//! A snapshot is `VACUUM INTO` a scratch file, gzipped into the snapshot
//! directory as `keyward-<unix_ms>.db.gz`, sent to the admin chats and
//! pruned to the configured retention.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, info, instrument, warn};

use crate::notify::DocumentSender;
use crate::storage::{Database, DatabaseError};

const FILE_PREFIX: &str = "keyward-";
const FILE_SUFFIX: &str = ".db.gz";

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Snapshot I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// A snapshot file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub path: PathBuf,
    pub file_name: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

#[async_trait]
pub trait SnapshotTarget: Send + Sync {
    async fn create_snapshot(&self, now_ms: i64) -> Result<Snapshot, SnapshotError>;

    /// Best-effort: a failing recipient never blocks the others.
    async fn deliver(&self, snapshot: &Snapshot, recipients: &[i64]) -> DeliveryReport;

    /// Delete the oldest snapshots beyond `retention`. Returns how many went.
    async fn prune(&self, retention: usize) -> Result<usize, SnapshotError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotJobReport {
    pub snapshot: Snapshot,
    pub delivery: DeliveryReport,
    pub pruned: usize,
}

/// Create, deliver, prune. Only a failed creation fails the job; a failed
/// prune is logged and reported as zero removals.
#[instrument(skip_all, fields(recipients = recipients.len(), retention = retention))]
pub async fn run_snapshot_job(
    target: &dyn SnapshotTarget,
    recipients: &[i64],
    retention: usize,
    now_ms: i64,
) -> Result<SnapshotJobReport, SnapshotError> {
    let snapshot = target.create_snapshot(now_ms).await?;
    let delivery = target.deliver(&snapshot, recipients).await;
    let pruned = target.prune(retention).await.unwrap_or_else(|e| {
        warn!(error = %e, "Pruning snapshots failed");
        0
    });

    info!(
        file = %snapshot.file_name,
        delivered = delivery.delivered,
        failed = delivery.failed,
        pruned,
        "Snapshot job complete"
    );
    Ok(SnapshotJobReport {
        snapshot,
        delivery,
        pruned,
    })
}

/// Production [`SnapshotTarget`] over the `SQLite` store.
#[derive(Clone)]
pub struct SqliteSnapshotter {
    db: Database,
    directory: PathBuf,
    sender: Option<Arc<dyn DocumentSender>>,
}

impl SqliteSnapshotter {
    pub fn new(db: Database, directory: impl Into<PathBuf>) -> Self {
        Self {
            db,
            directory: directory.into(),
            sender: None,
        }
    }

    /// Deliver snapshots through `sender`. Without one, delivery is skipped.
    #[must_use]
    pub fn with_sender(mut self, sender: Arc<dyn DocumentSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Snapshot files in the directory, newest first.
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>, SnapshotError> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(created_at_ms) = parse_file_name(&file_name) {
                snapshots.push(Snapshot {
                    path: entry.path(),
                    file_name,
                    created_at_ms,
                });
            }
        }
        snapshots.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        Ok(snapshots)
    }
}

pub(crate) fn file_name_for(now_ms: i64) -> String {
    format!("{FILE_PREFIX}{now_ms}{FILE_SUFFIX}")
}

pub(crate) fn parse_file_name(file_name: &str) -> Option<i64> {
    file_name
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

fn gzip_file(source: &Path, destination: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(source)?);
    let mut encoder = GzEncoder::new(
        BufWriter::new(File::create(destination)?),
        Compression::default(),
    );
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?.into_inner().map_err(io::IntoInnerError::into_error)?;
    Ok(())
}

#[async_trait]
impl SnapshotTarget for SqliteSnapshotter {
    async fn create_snapshot(&self, now_ms: i64) -> Result<Snapshot, SnapshotError> {
        tokio::fs::create_dir_all(&self.directory).await?;

        let scratch = tempfile::tempdir_in(&self.directory)?;
        let raw = scratch.path().join("keyward.db");
        self.db.vacuum_into(&raw).await?;

        let file_name = file_name_for(now_ms);
        let path = self.directory.join(&file_name);
        let destination = path.clone();
        tokio::task::spawn_blocking(move || gzip_file(&raw, &destination))
            .await
            .map_err(io::Error::other)??;

        debug!(path = %path.display(), "Snapshot written");
        Ok(Snapshot {
            path,
            file_name,
            created_at_ms: now_ms,
        })
    }

    async fn deliver(&self, snapshot: &Snapshot, recipients: &[i64]) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let Some(sender) = &self.sender else {
            debug!("No document sender configured, skipping snapshot delivery");
            return report;
        };
        if recipients.is_empty() {
            return report;
        }

        let bytes = match tokio::fs::read(&snapshot.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %snapshot.path.display(), error = %e, "Reading snapshot failed");
                report.failed = recipients.len();
                return report;
            }
        };

        let caption = format!("Keyward snapshot {}", snapshot.file_name);
        for &chat_id in recipients {
            match sender
                .send_document(chat_id, &snapshot.file_name, bytes.clone(), &caption)
                .await
            {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(chat_id, error = %e, "Snapshot delivery failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn prune(&self, retention: usize) -> Result<usize, SnapshotError> {
        let mut removed = 0;
        for old in self.list_snapshots()?.into_iter().skip(retention) {
            match tokio::fs::remove_file(&old.path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}
