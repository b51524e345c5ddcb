use std::path::{Path, PathBuf};

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;

/// On-disk file store. Uploads land under
/// `{root}/{knowledge_id}/{YYYYMMDD}/{uuid}.{ext}` so a knowledge base can
/// be wiped by removing one directory.
#[derive(Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist uploaded bytes, returning the relative path stored on the
    /// document row.
    pub fn save(&self, knowledge_id: i64, original_filename: &str, bytes: &[u8]) -> Result<String> {
        let ext = Path::new(original_filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_lowercase();
        let day = chrono::Utc::now().format("%Y%m%d");
        let relative = format!("{}/{}/{}.{}", knowledge_id, day, Uuid::new_v4(), ext);

        let absolute = self.root.join(&relative);
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&absolute, bytes)?;
        info!(path = %relative, size = bytes.len(), "stored uploaded file");
        Ok(relative)
    }

    pub fn absolute(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn read(&self, relative: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.absolute(relative))?)
    }

    /// Best effort: a file already gone (or still open elsewhere) is logged,
    /// not fatal, so row cleanup can proceed.
    pub fn delete(&self, relative: &str) {
        let path = self.absolute(relative);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %relative, "deleted stored file"),
            Err(e) => debug!(path = %relative, error = %e, "could not delete stored file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_uses_dated_uuid_layout() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let relative = storage.save(7, "notes.MD", b"hello").unwrap();

        let parts: Vec<&str> = relative.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "7");
        assert_eq!(parts[1].len(), 8); // YYYYMMDD
        assert!(parts[2].ends_with(".md"));

        assert_eq!(storage.read(&relative).unwrap(), b"hello");
    }

    #[test]
    fn delete_is_silent_on_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.delete("1/20260101/ghost.txt");
    }
}
