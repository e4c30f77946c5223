use std::path::PathBuf;

use anyhow::{Context, Result};

use super::KeyValueStore;

/// Application name used for the data directory path.
const APP_NAME: &str = "loopline";

/// Plain partition: one JSON file per key under the user data directory.
/// Suitable for session metadata; never for tokens.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Store rooted at `~/.local/share/loopline` (platform equivalent).
    pub fn open_default() -> Result<Self> {
        let data_dir = dirs::data_dir().context("Could not find data directory")?;
        Ok(Self::new(data_dir.join(APP_NAME)))
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read store file: {key}"))?;
        Ok(Some(contents))
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir).context("Failed to create store directory")?;
        std::fs::write(self.path(key), value)
            .with_context(|| format!("Failed to write store file: {key}"))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to delete store file: {key}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("loopline-store-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn test_put_get_delete_roundtrip() {
        let store = FileStore::new(scratch_dir("roundtrip"));
        store.put("session_list", "[]").unwrap();
        assert_eq!(store.get("session_list").unwrap().as_deref(), Some("[]"));

        store.delete("session_list").unwrap();
        assert!(store.get("session_list").unwrap().is_none());
        // Deleting again is a no-op.
        store.delete("session_list").unwrap();
    }

    #[test]
    fn test_missing_key_reads_as_none() {
        let store = FileStore::new(scratch_dir("missing"));
        assert!(store.get("never_written").unwrap().is_none());
    }
}
