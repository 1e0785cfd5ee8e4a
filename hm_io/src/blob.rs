use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use hm_core::Error;

/// On-disk, content-addressed blob store backing the fetch cache.
///
/// A blob is written to `tmp/` and only renamed into `blobs/<hash>` after
/// the caller has verified it, so every file under `blobs/` is verified.
#[derive(Clone)]
pub struct BlobCache {
    blobs_dir: PathBuf,
    tmp_dir: PathBuf,
}

/// A verified cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl BlobCache {
    pub fn new(cache_root: &Path) -> io::Result<Self> {
        let blobs_dir = cache_root.join("blobs");
        let tmp_dir = cache_root.join("tmp");

        fs::create_dir_all(&blobs_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        Ok(Self { blobs_dir, tmp_dir })
    }

    pub fn blob_path(&self, key: &str) -> PathBuf {
        self.blobs_dir.join(key)
    }

    pub fn has_blob(&self, key: &str) -> bool {
        self.blob_path(key).is_file()
    }

    pub fn remove_blob(&self, key: &str) -> io::Result<bool> {
        let path = self.blob_path(key);
        if path.exists() {
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn start_write(&self, key: &str) -> io::Result<BlobWriter> {
        let final_path = self.blob_path(key);
        // Unique temp name so racing writers never share a file
        let unique_id = std::process::id();
        let thread_id = std::thread::current().id();
        let tmp_path = self
            .tmp_dir
            .join(format!("{key}.{unique_id}.{thread_id:?}.part"));

        let file = fs::File::create(&tmp_path)?;

        Ok(BlobWriter {
            key: key.to_string(),
            file,
            tmp_path,
            final_path,
            committed: false,
        })
    }

    /// Write `bytes` under `key` in one step.
    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<PathBuf, Error> {
        let mut writer = self.start_write(key).map_err(|e| Error::InstallIo {
            resource: key.to_string(),
            message: format!("failed to create cache file: {e}"),
        })?;
        writer.write_all(bytes).map_err(|e| Error::InstallIo {
            resource: key.to_string(),
            message: format!("failed to write cache file: {e}"),
        })?;
        writer.commit()
    }

    /// List all entries, sorted by key.
    pub fn list(&self) -> io::Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();

        for entry in fs::read_dir(&self.blobs_dir)? {
            let entry = entry?;
            let path = entry.path();

            if let Some(key) = path.file_name().and_then(|n| n.to_str())
                && let Ok(metadata) = entry.metadata()
                && metadata.is_file()
                && let Ok(modified) = metadata.modified()
            {
                entries.push(CacheEntry {
                    key: key.to_string(),
                    path: path.clone(),
                    size: metadata.len(),
                    modified,
                });
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    pub fn total_size(&self) -> io::Result<u64> {
        let mut total = 0;

        for entry in fs::read_dir(&self.blobs_dir)? {
            let entry = entry?;
            if let Ok(metadata) = entry.metadata()
                && metadata.is_file()
            {
                total += metadata.len();
            }
        }

        Ok(total)
    }

    /// Remove every blob. Returns the number removed and the bytes freed.
    pub fn clear(&self) -> io::Result<(usize, u64)> {
        let mut count = 0;
        let mut bytes_freed = 0;

        for entry in fs::read_dir(&self.blobs_dir)? {
            let entry = entry?;
            let path = entry.path();

            if let Ok(metadata) = entry.metadata()
                && metadata.is_file()
            {
                fs::remove_file(&path)?;
                count += 1;
                bytes_freed += metadata.len();
            }
        }

        Ok((count, bytes_freed))
    }

    /// Remove leftover `.part` files from interrupted writes.
    pub fn cleanup_temp_files(&self) -> io::Result<(usize, u64)> {
        let mut count = 0;
        let mut bytes_freed = 0;

        for entry in fs::read_dir(&self.tmp_dir)? {
            let entry = entry?;
            let path = entry.path();

            if let Some(name) = path.file_name().and_then(|n| n.to_str())
                && name.ends_with(".part")
                && let Ok(metadata) = entry.metadata()
            {
                let size = metadata.len();
                if fs::remove_file(&path).is_ok() {
                    count += 1;
                    bytes_freed += size;
                }
            }
        }

        Ok((count, bytes_freed))
    }
}

pub struct BlobWriter {
    key: String,
    file: fs::File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl BlobWriter {
    pub fn commit(mut self) -> Result<PathBuf, Error> {
        self.file.flush().map_err(|e| Error::InstallIo {
            resource: self.key.clone(),
            message: format!("failed to flush blob: {e}"),
        })?;

        // Same key means same bytes: a blob that appeared meanwhile is ours too
        if self.final_path.exists() {
            let _ = fs::remove_file(&self.tmp_path);
            self.committed = true;
            return Ok(self.final_path.clone());
        }

        match fs::rename(&self.tmp_path, &self.final_path) {
            Ok(()) => {}
            Err(_e) if self.final_path.exists() => {
                let _ = fs::remove_file(&self.tmp_path);
            }
            Err(e) => {
                return Err(Error::InstallIo {
                    resource: self.key.clone(),
                    message: format!("failed to rename blob: {e}"),
                });
            }
        }

        self.committed = true;
        Ok(self.final_path.clone())
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.committed && self.tmp_path.exists() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
