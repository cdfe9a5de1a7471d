//! Persistence of app registrations
//!
//! The estate is reconstructed at boot from a simple name→gitUrl registry.
//! The trait keeps the estate decoupled from the storage format; the file
//! implementation writes a TOML map next to the app directories.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub trait GitRepoLoader: Send + Sync {
    /// All registered `(name, git_url)` pairs
    fn load_all(&self) -> Result<Vec<(String, String)>>;

    /// Add or update one registration
    fn save(&self, name: &str, git_url: &str) -> Result<()>;

    /// Remove one registration; unknown names are a no-op
    fn delete(&self, name: &str) -> Result<()>;
}

/// TOML-backed registry file
pub struct FileRepoLoader {
    path: PathBuf,
    // Serializes read-modify-write cycles between concurrent API calls
    lock: Mutex<()>,
}

impl FileRepoLoader {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<()> {
        let contents = toml::to_string(map).context("Failed to serialize registry")?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

impl GitRepoLoader for FileRepoLoader {
    fn load_all(&self) -> Result<Vec<(String, String)>> {
        let _guard = self.lock.lock();
        Ok(self.read_map()?.into_iter().collect())
    }

    fn save(&self, name: &str, git_url: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        map.insert(name.to_string(), git_url.to_string());
        self.write_map(&map)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        if map.remove(name).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_across_loader_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("repos.toml");

        let loader = FileRepoLoader::new(path.clone());
        loader.save("blog", "https://example.com/blog.git").unwrap();
        loader.save("shop", "https://example.com/shop.git").unwrap();

        // A fresh loader over the same file sees both entries
        let reloaded = FileRepoLoader::new(path);
        let mut all = reloaded.load_all().unwrap();
        all.sort();
        assert_eq!(
            all,
            vec![
                ("blog".to_string(), "https://example.com/blog.git".to_string()),
                ("shop".to_string(), "https://example.com/shop.git".to_string()),
            ]
        );
    }

    #[test]
    fn test_save_overwrites_and_delete_removes() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = FileRepoLoader::new(tmp.path().join("repos.toml"));

        loader.save("blog", "https://old.example.com/blog.git").unwrap();
        loader.save("blog", "https://new.example.com/blog.git").unwrap();
        assert_eq!(
            loader.load_all().unwrap(),
            vec![("blog".to_string(), "https://new.example.com/blog.git".to_string())]
        );

        loader.delete("blog").unwrap();
        loader.delete("never-existed").unwrap();
        assert!(loader.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = FileRepoLoader::new(tmp.path().join("repos.toml"));
        assert!(loader.load_all().unwrap().is_empty());
    }
}
