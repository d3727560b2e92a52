//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage isolated LOCAL/EXTERNAL directories,
//! mount points, and control-socket paths for a single test run, so parallel
//! tests never collide on shared filesystem state.
//!
//! # Usage
//!
//! ```ignore
//! use overlayfs_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.local_dir, env.external_dir, env.mount_point, env.socket_path
//!     // are all isolated under one temp directory.
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs.
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique LOCAL/EXTERNAL/mount paths.
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup).
    _temp_dir: TempDir,
    /// Unique control socket path for this test.
    pub socket_path: PathBuf,
    /// Isolated LOCAL cache directory.
    pub local_dir: PathBuf,
    /// Isolated EXTERNAL backing directory.
    pub external_dir: PathBuf,
    /// Isolated FUSE mount point.
    pub mount_point: PathBuf,
    /// Unique test ID.
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment.
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let local_dir = root.join("local");
        let external_dir = root.join("external");
        let mount_point = root.join("mnt");

        std::fs::create_dir_all(&local_dir)?;
        std::fs::create_dir_all(&external_dir)?;
        std::fs::create_dir_all(&mount_point)?;

        let socket_path = root.join(format!("overlayfs-test-{}.sock", test_id));

        Ok(Self {
            _temp_dir: temp_dir,
            socket_path,
            local_dir,
            external_dir,
            mount_point,
            test_id,
        })
    }

    /// Get the index store path for this test's mount pair.
    pub fn index_path(&self) -> PathBuf {
        self._temp_dir.path().join("index.lmdb")
    }

    /// Create a test file under LOCAL with content.
    pub fn create_local_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.local_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a test file under EXTERNAL with content.
    pub fn create_external_file(
        &self,
        relative_path: &str,
        content: &[u8],
    ) -> anyhow::Result<PathBuf> {
        let path = self.external_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Check if the control socket exists (daemon may be running).
    pub fn is_socket_present(&self) -> bool {
        self.socket_path.exists()
    }

    /// Build a Config wired to this test environment's paths.
    pub fn config(&self) -> crate::Config {
        let mut cfg = crate::Config::default();
        cfg.mount.local_dir = self.local_dir.clone();
        cfg.mount.external_dir = Some(self.external_dir.clone());
        cfg.mount.mount_point = self.mount_point.clone();
        cfg.daemon.socket = self.socket_path.clone();
        cfg
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.local_dir.exists());
        assert!(env.external_dir.exists());
        assert!(env.mount_point.exists());
    }

    #[test]
    fn test_environment_has_unique_socket() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.socket_path, env2.socket_path);
    }

    #[test]
    fn test_create_local_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_local_file("src/main.rs", b"fn main() {}").unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"fn main() {}");
    }

    #[test]
    fn test_config_wires_paths() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.config();
        assert_eq!(cfg.mount.local_dir, env.local_dir);
        assert_eq!(cfg.mount.external_dir, Some(env.external_dir.clone()));
        assert_eq!(cfg.daemon.socket, env.socket_path);
    }
}
