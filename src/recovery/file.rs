//! JSON file recovery store.
//!
//! One file per session under a directory (by default
//! `~/.parley/recovery/`). Writes go to a temp file that is then renamed over
//! the target, so a crash mid-write never leaves a torn record behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{decode, encode, RecoveryStore, SessionRecoveryRecord};
use crate::error::Result;

/// Recovery records stored as JSON files.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(session_id)))
    }

    async fn read(&self, path: &Path) -> Result<Option<SessionRecoveryRecord>> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => decode(&raw).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RecoveryStore for JsonFileStore {
    async fn save(&self, record: &SessionRecoveryRecord) -> Result<()> {
        let path = self.record_path(&record.session_id);
        let tmp = path.with_extension("json.tmp");
        let body = encode(record)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(
            session_id = %record.session_id,
            reason = %record.reason,
            path = %path.display(),
            "Saved recovery record"
        );
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionRecoveryRecord>> {
        self.read(&self.record_path(session_id)).await
    }

    async fn take(&self, session_id: &str) -> Result<Option<SessionRecoveryRecord>> {
        let path = self.record_path(session_id);
        let record = self.read(&path).await?;
        if record.is_some() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                // The record carries the real id; the file name is only an encoding of it.
                match self.read(&path).await {
                    Ok(Some(record)) => ids.push(record.session_id),
                    Ok(None) => {}
                    Err(e) => warn!(path = %path.display(), "Skipping unreadable recovery file: {}", e),
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Percent-encode characters that are unsafe in file names.
///
/// The mapping is one-to-one, so distinct session ids never share a file:
/// - "room:42" → "room%3A42"
/// - "a/b" → "a%2Fb"
pub fn sanitize_key(key: &str) -> String {
    let mut result = String::with_capacity(key.len() * 3);
    for c in key.chars() {
        match c {
            '/' => result.push_str("%2F"),
            '\\' => result.push_str("%5C"),
            ':' => result.push_str("%3A"),
            '*' => result.push_str("%2A"),
            '?' => result.push_str("%3F"),
            '"' => result.push_str("%22"),
            '<' => result.push_str("%3C"),
            '>' => result.push_str("%3E"),
            '|' => result.push_str("%7C"),
            '%' => result.push_str("%25"),
            '.' if result.is_empty() => result.push_str("%2E"),
            c => result.push(c),
        }
    }
    result
}
