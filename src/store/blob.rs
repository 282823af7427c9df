//! Content-addressed attachment storage on disk.
//!
//! Layout: `<root>/<first two hex digits>/<remaining 62 hex digits>` of the
//! SHA-256 of the content. Identical payloads share one file.

use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{RegistryError, Result};
use crate::model::AttachmentPart;

/// Directory of attachment blobs.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) a blob directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| RegistryError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `content` and return its path relative to the root.
    pub fn put(&self, content: &[u8]) -> Result<PathBuf> {
        let relative = relative_path_for(content);
        let path = self.root.join(&relative);
        if path.exists() {
            debug!(path = %relative.display(), "Blob already stored");
            return Ok(relative);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RegistryError::io(parent, e))?;
        }

        // Write under a temporary name so a crash never leaves a truncated blob
        let tmp = path.with_extension("part");
        let mut file = std::fs::File::create(&tmp).map_err(|e| RegistryError::io(&tmp, e))?;
        file.write_all(content).map_err(|e| RegistryError::io(&tmp, e))?;
        file.sync_all().map_err(|e| RegistryError::io(&tmp, e))?;
        drop(file);
        std::fs::rename(&tmp, &path).map_err(|e| RegistryError::io(&path, e))?;

        debug!(path = %relative.display(), size = content.len(), "Stored blob");
        Ok(relative)
    }

    pub fn read(&self, relative: &Path) -> Result<Vec<u8>> {
        let path = self.root.join(relative);
        std::fs::read(&path).map_err(|e| RegistryError::io(path, e))
    }

    /// Delete a blob. A missing file is not an error.
    pub fn remove(&self, relative: &Path) {
        let path = self.root.join(relative);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %relative.display(), "Removed blob"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove blob"),
        }
    }
}

fn relative_path_for(content: &[u8]) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let hash = format!("{:x}", hasher.finalize());
    PathBuf::from(&hash[..2]).join(&hash[2..])
}

/// Read a file from disk as an attachment named after its last path component.
pub fn load_file(path: &Path) -> Result<AttachmentPart> {
    let content = std::fs::read(path).map_err(|e| RegistryError::io(path, e))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());
    Ok(AttachmentPart { filename, content })
}

/// Copy `content` into `dir` as `filename`, adding a counter if the name is taken.
pub fn export_to(dir: &Path, filename: &str, content: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| RegistryError::io(dir, e))?;
    let path = unique_path(&dir.join(filename));
    std::fs::write(&path, content).map_err(|e| RegistryError::io(&path, e))?;
    Ok(path)
}

/// If `path` already exists, append a counter to make it unique.
fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let parent = path.parent().unwrap_or(Path::new("."));

    (1..)
        .map(|i| {
            if ext.is_empty() {
                parent.join(format!("{stem}_{i}"))
            } else {
                parent.join(format!("{stem}_{i}.{ext}"))
            }
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("blobs")).unwrap();

        let a = store.put(b"scan").unwrap();
        let b = store.put(b"scan").unwrap();
        let c = store.put(b"other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.components().count(), 2);
        assert_eq!(store.read(&a).unwrap(), b"scan");
    }

    #[test]
    fn test_remove_missing_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let p = store.put(b"x").unwrap();
        store.remove(&p);
        store.remove(&p);
        assert!(store.read(&p).is_err());
    }

    #[test]
    fn test_export_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let first = export_to(dir.path(), "letter.pdf", b"1").unwrap();
        let second = export_to(dir.path(), "letter.pdf", b"2").unwrap();
        assert_eq!(first.file_name().unwrap(), "letter.pdf");
        assert_eq!(second.file_name().unwrap(), "letter_1.pdf");
        assert_eq!(std::fs::read(second).unwrap(), b"2");
    }

    #[test]
    fn test_load_file_uses_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("letter.pdf");
        std::fs::write(&path, b"%PDF").unwrap();

        let part = load_file(&path).unwrap();
        assert_eq!(part.filename, "letter.pdf");
        assert_eq!(part.content, b"%PDF");

        assert!(matches!(
            load_file(&dir.path().join("missing.pdf")),
            Err(RegistryError::Io { .. })
        ));
    }
}
