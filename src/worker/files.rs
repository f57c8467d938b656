// Result-file store.
//
// Task runners append encoded rows to a writing-name file; when the bundle
// finishes the file is atomically renamed to its ready name and only then
// announced to the coordinator, so a reader never sees a partial file.
// Files are reclaimed on coordinator acknowledgement, on cancel notices,
// or by the retention sweep.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::common::{BundleId, CoordinatorId, QueryId};
use crate::error::{CoreError, Result};
use crate::rows::encode_row;

const WRITING_SUFFIX: &str = ".part";

/// Deterministic ready-name for a bundle's result file.
pub fn result_file_name(czar_id: CoordinatorId, query_id: QueryId, bundle_id: BundleId) -> String {
    format!("qr_{}_{}_{}.rows", czar_id, query_id, bundle_id)
}

pub struct ResultFileStore {
    dir: PathBuf,
}

/// Buffered append-only writer for one bundle's result file.
pub struct RowFileWriter {
    writer: BufWriter<File>,
    bytes_written: u64,
}

impl RowFileWriter {
    pub async fn write_row(&mut self, fields: &[Option<String>]) -> Result<()> {
        let mut line = encode_row(fields);
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.bytes_written += line.len() as u64;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<u64> {
        self.writer.flush().await?;
        self.writer.into_inner().sync_all().await?;
        Ok(self.bytes_written)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

#[cfg(test)]
impl RowFileWriter {
    /// Wrap an already-open std file; test-only.
    pub fn from_std_for_tests(file: std::fs::File) -> Self {
        Self {
            writer: BufWriter::new(File::from_std(file)),
            bytes_written: 0,
        }
    }
}

impl ResultFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CoreError::Config(format!("cannot create {}: {}", self.dir.display(), e)))
    }

    fn ready_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn writing_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", name, WRITING_SUFFIX))
    }

    pub async fn create_writer(&self, name: &str) -> Result<RowFileWriter> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(self.writing_path(name))
            .await?;
        Ok(RowFileWriter {
            writer: BufWriter::new(file),
            bytes_written: 0,
        })
    }

    /// Atomic handoff from writer to reader.
    pub async fn publish(&self, name: &str) -> Result<()> {
        fs::rename(self.writing_path(name), self.ready_path(name)).await?;
        Ok(())
    }

    /// Open a ready file for serving; absent files are a typed not-found so
    /// the HTTP layer can answer 404.
    pub async fn open_ready(&self, name: &str) -> Result<(File, u64)> {
        if name.contains('/') || name.contains("..") {
            return Err(CoreError::InvalidProtocol(format!(
                "bad result file name '{}'",
                name
            )));
        }
        let path = self.ready_path(name);
        let meta = fs::metadata(&path)
            .await
            .map_err(|_| CoreError::Transport(format!("result file {} not present", name)))?;
        let file = File::open(&path).await?;
        Ok((file, meta.len()))
    }

    /// Remove one bundle's file, ready or still being written.
    pub async fn remove(&self, name: &str) {
        for path in [self.ready_path(name), self.writing_path(name)] {
            match fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "result file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "result file removal failed"),
            }
        }
    }

    /// Remove every file belonging to `(czar_id, query_id)`.
    pub async fn remove_query_files(&self, czar_id: CoordinatorId, query_id: QueryId) {
        let prefix = format!("qr_{}_{}_", czar_id, query_id);
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with(&prefix) {
                let _ = fs::remove_file(entry.path()).await;
            }
        }
    }

    /// Drop ready files and orphaned writing-name files older than
    /// `max_age`. Returns the number removed. Transient errors are logged
    /// and skipped.
    pub async fn sweep_older_than(&self, max_age: Duration) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return 0;
        };
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !is_result_file(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let stamp = meta.modified().or_else(|_| meta.created());
            let Ok(stamp) = stamp else { continue };
            if stamp < cutoff {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "retention removal failed"),
                }
            }
        }
        removed
    }
}

fn is_result_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("qr_") && (n.ends_with(".rows") || n.ends_with(WRITING_SUFFIX)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn rows_are_invisible_until_published() {
        let dir = TempDir::new().unwrap();
        let store = ResultFileStore::new(dir.path());
        let name = result_file_name(1, 2, 3);

        let mut writer = store.create_writer(&name).await.unwrap();
        writer
            .write_row(&[Some("a".into()), None])
            .await
            .unwrap();
        assert!(writer.bytes_written() > 0);
        writer.finish().await.unwrap();

        assert!(store.open_ready(&name).await.is_err());
        store.publish(&name).await.unwrap();
        let (_file, len) = store.open_ready(&name).await.unwrap();
        assert!(len > 0);
    }

    #[tokio::test]
    async fn reclaimed_files_answer_not_found() {
        let dir = TempDir::new().unwrap();
        let store = ResultFileStore::new(dir.path());
        let name = result_file_name(1, 2, 3);
        let writer = store.create_writer(&name).await.unwrap();
        writer.finish().await.unwrap();
        store.publish(&name).await.unwrap();

        store.remove(&name).await;
        assert!(store.open_ready(&name).await.is_err());
    }

    #[tokio::test]
    async fn query_wide_removal_leaves_other_queries() {
        let dir = TempDir::new().unwrap();
        let store = ResultFileStore::new(dir.path());
        for (qid, ujid) in [(7, 1), (7, 2), (8, 1)] {
            let name = result_file_name(1, qid, ujid);
            let writer = store.create_writer(&name).await.unwrap();
            writer.finish().await.unwrap();
            store.publish(&name).await.unwrap();
        }
        store.remove_query_files(1, 7).await;
        assert!(store.open_ready(&result_file_name(1, 7, 1)).await.is_err());
        assert!(store.open_ready(&result_file_name(1, 8, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn sweep_removes_orphaned_partials() {
        let dir = TempDir::new().unwrap();
        let store = ResultFileStore::new(dir.path());
        let name = result_file_name(1, 9, 9);
        let writer = store.create_writer(&name).await.unwrap();
        writer.finish().await.unwrap();
        // Age zero: everything qualifies.
        let removed = store.sweep_older_than(Duration::ZERO).await;
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn traversal_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = ResultFileStore::new(dir.path());
        assert!(store.open_ready("../etc/passwd").await.is_err());
    }
}
