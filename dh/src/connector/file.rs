//! File source adapter
//!
//! Scans a directory for line-delimited payload files and reads them
//! newest-first (unless the source declares otherwise). The cursor is
//! the current file name plus a byte offset, so a restart resumes
//! exactly where the last committed batch ended.

use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use walkdir::WalkDir;

use super::{Connector, ConnectorStats, FetchResult, SharedStats, payload};
use crate::domain::{ConnectionConfig, DataSource};
use crate::error::SyncError;

/// Resumable position: which file, and how far into it
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileCursor {
    file: String,
    offset: u64,
}

impl FileCursor {
    fn parse(raw: Option<&str>) -> Result<Option<Self>, SyncError> {
        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| SyncError::Fatal(format!("malformed file cursor '{raw}': {e}"))),
        }
    }

    fn encode(&self) -> String {
        serde_json::to_string(self).expect("cursor serializes")
    }
}

pub struct FileConnector {
    dir: PathBuf,
    suffix: Option<String>,
    newest_first: bool,
    opened: bool,
    stats: SharedStats,
}

impl FileConnector {
    pub fn new(source: &DataSource) -> Result<Self, SyncError> {
        let ConnectionConfig::File {
            dir,
            suffix,
            newest_first,
        } = &source.connection
        else {
            return Err(SyncError::Config("source is not a file source".into()));
        };
        Ok(Self {
            dir: PathBuf::from(dir),
            suffix: suffix.clone(),
            newest_first: *newest_first,
            opened: false,
            stats: SharedStats::default(),
        })
    }

    /// Snapshot of matching files in read order
    fn list_files(&self) -> Result<Vec<(String, PathBuf)>, SyncError> {
        let mut files: Vec<(String, PathBuf, SystemTime)> = Vec::new();
        for entry in WalkDir::new(&self.dir).max_depth(1) {
            let entry = entry.map_err(|e| SyncError::Unavailable(format!("cannot scan {}: {e}", self.dir.display())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(suffix) = &self.suffix {
                if !name.ends_with(suffix.as_str()) {
                    continue;
                }
            }
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((name, entry.path().to_path_buf(), mtime));
        }
        // Tie-break on name so equal mtimes stay deterministic
        files.sort_by(|a, b| {
            let ordering = a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0));
            if self.newest_first { ordering.reverse() } else { ordering }
        });
        Ok(files.into_iter().map(|(name, path, _)| (name, path)).collect())
    }
}

#[async_trait]
impl Connector for FileConnector {
    async fn open(&mut self) -> Result<(), SyncError> {
        if !self.dir.is_dir() {
            return Err(SyncError::Config(format!("{} is not a directory", self.dir.display())));
        }
        self.opened = true;
        Ok(())
    }

    async fn fetch_batch(&mut self, cursor: Option<&str>, max: usize) -> Result<FetchResult, SyncError> {
        let files = self.list_files()?;
        if files.is_empty() {
            return Ok(FetchResult::eof());
        }

        let (mut index, mut offset) = match FileCursor::parse(cursor)? {
            None => (0usize, 0u64),
            Some(cursor) => match files.iter().position(|(name, _)| *name == cursor.file) {
                Some(index) => (index, cursor.offset),
                // The cursor's file vanished between batches; restart the
                // scan order from the top (idempotent upsert absorbs it)
                None => (0, 0),
            },
        };

        let mut records: Vec<Value> = Vec::new();
        while records.len() < max && index < files.len() {
            let (name, path) = &files[index];
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| SyncError::Unavailable(format!("cannot read {}: {e}", path.display())))?;

            if (offset as usize) >= bytes.len() {
                index += 1;
                offset = 0;
                continue;
            }

            let mut consumed = offset as usize;
            for line in bytes[offset as usize..].split_inclusive(|b| *b == b'\n') {
                if records.len() >= max {
                    break;
                }
                consumed += line.len();
                let trimmed: &[u8] = if line.ends_with(b"\n") { &line[..line.len() - 1] } else { line };
                if trimmed.iter().all(|b| b.is_ascii_whitespace()) {
                    continue;
                }
                records.push(payload::decode(trimmed).map_err(|e| {
                    SyncError::Schema(format!("{name}: {e}"))
                })?);
            }
            offset = consumed as u64;
            if consumed >= bytes.len() {
                index += 1;
                offset = 0;
            }
        }

        self.stats.batch();
        self.stats.record(records.len() as u64);

        let eof = index >= files.len();
        let next_cursor = if eof {
            None
        } else {
            Some(
                FileCursor {
                    file: files[index].0.clone(),
                    offset,
                }
                .encode(),
            )
        };
        Ok(FetchResult {
            records,
            next_cursor,
            eof,
        })
    }

    async fn health(&self) -> Result<(), SyncError> {
        if self.dir.is_dir() {
            Ok(())
        } else {
            Err(SyncError::Unavailable(format!("{} is not readable", self.dir.display())))
        }
    }

    fn stats(&self) -> ConnectorStats {
        self.stats.snapshot()
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.opened = false;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}
