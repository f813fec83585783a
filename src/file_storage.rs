use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Durable home for finished result files. The assembler hands over
/// `(key, local temp file)` pairs; after `move_into_storage` returns the
/// local file is gone and the bytes are retrievable under the key.
pub trait FileStorage: Send + Sync {
    fn move_into_storage(&self, key: &str, local_file: &Path) -> io::Result<()>;
}

/// Filesystem-backed storage rooted at one directory. Stands in for an
/// object store in offline deployments and tests.
pub struct LocalFileStorage {
    base_dir: PathBuf,
}

impl LocalFileStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> io::Result<LocalFileStorage> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(LocalFileStorage { base_dir })
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }
}

impl FileStorage for LocalFileStorage {
    fn move_into_storage(&self, key: &str, local_file: &Path) -> io::Result<()> {
        let destination = self.path_for(key);
        match fs::rename(local_file, &destination) {
            Ok(()) => Ok(()),
            Err(_) => {
                // rename fails across filesystems; fall back to copy + unlink
                fs::copy(local_file, &destination)?;
                fs::remove_file(local_file)
            }
        }
    }
}
