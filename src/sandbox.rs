//! Directory layout for everything the host writes to disk
//!
//! All state lives under one root: `repos/{app}` holds the git working copy,
//! `instances/{app}/{timestamp}` holds per-deploy snapshots, `data/{app}` is
//! the app's persistent data directory and `temp/{app}` its scratch space.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FileSandbox {
    root: PathBuf,
}

impl FileSandbox {
    /// Create a sandbox rooted at `root`, creating the top-level directories
    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in ["repos", "instances", "data", "temp"] {
            std::fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the name→gitUrl registry file
    pub fn registry_file(&self) -> PathBuf {
        self.root.join("repos.toml")
    }

    pub fn repo_dir(&self, name: &str) -> PathBuf {
        self.root.join("repos").join(name)
    }

    pub fn instances_dir(&self, name: &str) -> PathBuf {
        self.root.join("instances").join(name)
    }

    pub fn data_dir(&self, name: &str) -> PathBuf {
        self.root.join("data").join(name)
    }

    pub fn temp_dir(&self, name: &str) -> PathBuf {
        self.root.join("temp").join(name)
    }

    /// Create the per-app directories, returning them for env wiring
    pub fn create_app_dirs(&self, name: &str) -> io::Result<()> {
        for dir in [
            self.instances_dir(name),
            self.data_dir(name),
            self.temp_dir(name),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Every directory that must go when the app is deleted
    pub fn app_dirs(&self, name: &str) -> Vec<PathBuf> {
        vec![
            self.repo_dir(name),
            self.instances_dir(name),
            self.data_dir(name),
            self.temp_dir(name),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = FileSandbox::new(tmp.path()).unwrap();

        assert!(tmp.path().join("repos").is_dir());
        assert!(tmp.path().join("instances").is_dir());

        assert_eq!(sandbox.repo_dir("blog"), tmp.path().join("repos/blog"));
        assert_eq!(sandbox.data_dir("blog"), tmp.path().join("data/blog"));
        assert_eq!(sandbox.registry_file(), tmp.path().join("repos.toml"));
    }

    #[test]
    fn test_create_and_list_app_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = FileSandbox::new(tmp.path()).unwrap();

        sandbox.create_app_dirs("blog").unwrap();
        assert!(sandbox.instances_dir("blog").is_dir());
        assert!(sandbox.data_dir("blog").is_dir());
        assert!(sandbox.temp_dir("blog").is_dir());

        let dirs = sandbox.app_dirs("blog");
        assert_eq!(dirs.len(), 4);
        assert!(dirs.contains(&sandbox.repo_dir("blog")));
    }
}
