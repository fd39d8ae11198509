use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use super::CacheEntry;

/// Namespace for persisted cache files.
const CACHE_FILE_PREFIX: &str = "urbanlens_cache_";

/// Durable storage behind the process-local cache tier.
///
/// Callers treat every error as best-effort: failures are logged, never
/// surfaced to a fetch.
pub trait PersistentTier: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>>;

    fn save(&self, entry: &CacheEntry) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Remove every entry this tier owns.
    fn clear(&self) -> Result<()>;
}

/// Persistent tier storing one JSON file per key in a directory.
pub struct DiskTier {
    dir: PathBuf,
}

impl DiskTier {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// URLs are not valid file names, so files are named by key digest.
    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir
            .join(format!("{}{}.json", CACHE_FILE_PREFIX, hex::encode(digest)))
    }

    fn owned_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let owned = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(CACHE_FILE_PREFIX))
                .unwrap_or(false);
            if owned {
                files.push(path);
            }
        }
        Ok(files)
    }
}

fn write_and_rename(temp_path: &Path, path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::rename(temp_path, path)
}

impl PersistentTier for DiskTier {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache file for {}", key))?;
        let entry: CacheEntry = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse cache file for {}", key))?;

        if entry.key != key {
            anyhow::bail!("Cache file for {} holds entry for {}", key, entry.key);
        }
        Ok(Some(entry))
    }

    fn save(&self, entry: &CacheEntry) -> Result<()> {
        let path = self.entry_path(&entry.key);
        let json = serde_json::to_string(entry)?;

        // Write atomically via temp file
        let temp_path = path.with_extension("tmp");
        let written = write_and_rename(&temp_path, &path, json.as_bytes());
        if written.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        written.with_context(|| format!("Failed to write cache file for {}", entry.key))
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        for path in self.owned_files()? {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}
