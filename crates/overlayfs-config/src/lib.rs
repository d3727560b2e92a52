//! # overlayfs-config
//!
//! Layered configuration for the overlay engine.
//!
//! Loads configuration from:
//! 1. `~/.overlayfs/config.toml` (global)
//! 2. `<mount-root>/.overlayfs/config.toml` (per-mount-pair, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod path;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance.
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    RwLock::new(Config::load().unwrap_or_else(|e| {
        eprintln!(
            "[overlayfs-config] WARNING: Failed to load config: {}. Using defaults.",
            e
        );
        Config::default()
    }))
});

/// Default Unix control socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/overlayfs.sock";

/// Get global config (read-only).
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk.
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Current config schema version.
pub const CONFIG_VERSION: u32 = 1;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Config schema version (for forward compatibility).
    pub config_version: u32,
    pub mount: MountConfig,
    pub eviction: EvictionConfig,
    pub lock: LockConfig,
    pub security: SecurityConfig,
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            mount: MountConfig::default(),
            eviction: EvictionConfig::default(),
            lock: LockConfig::default(),
            security: SecurityConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl Config {
    /// Load config from standard locations (CWD-relative mount root).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_for_project(Path::new("."))
    }

    /// Load config for a specific mount root directory.
    /// Resolution order: global → per-mount-pair → env vars.
    pub fn load_for_project(mount_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.overlayfs/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Load per-mount-pair config (<mount_root>/.overlayfs/config.toml)
        let local_config_path = mount_root.join(".overlayfs/config.toml");
        if local_config_path.exists() {
            debug!("Loading mount-pair config from {:?}", local_config_path);
            let contents = std::fs::read_to_string(&local_config_path)?;
            let local_config: Config = toml::from_str(&contents)?;
            config.merge(local_config);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        // 4. Validate socket path: if parent dir doesn't exist and can't be
        //    created, fall back to /tmp/overlayfs.sock so all components
        //    (CLI, daemon, tests) resolve to the same socket.
        if let Some(parent) = config.daemon.socket.parent() {
            if !parent.as_os_str().is_empty()
                && !parent.exists()
                && std::fs::create_dir_all(parent).is_err()
            {
                debug!(
                    "Socket directory {:?} unavailable, falling back to {}",
                    parent, DEFAULT_SOCKET_PATH
                );
                config.daemon.socket = PathBuf::from(DEFAULT_SOCKET_PATH);
            }
        }

        Ok(config)
    }

    /// Global config path: ~/.overlayfs/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".overlayfs/config.toml"))
    }

    /// Merge another config (per-mount-pair overrides global).
    /// Non-default values from `other` replace values in `self`.
    fn merge(&mut self, other: Config) {
        // Mount
        let default_mount = MountConfig::default();
        if other.mount.local_dir != default_mount.local_dir {
            self.mount.local_dir = other.mount.local_dir;
        }
        if other.mount.external_dir != default_mount.external_dir {
            self.mount.external_dir = other.mount.external_dir;
        }
        if other.mount.mount_point != default_mount.mount_point {
            self.mount.mount_point = other.mount.mount_point;
        }
        if other.mount.volume_name != default_mount.volume_name {
            self.mount.volume_name = other.mount.volume_name;
        }
        if other.mount.read_only != default_mount.read_only {
            self.mount.read_only = other.mount.read_only;
        }

        // Eviction
        let default_eviction = EvictionConfig::default();
        if other.eviction.trigger_threshold_bytes != default_eviction.trigger_threshold_bytes {
            self.eviction.trigger_threshold_bytes = other.eviction.trigger_threshold_bytes;
        }
        if other.eviction.target_free_bytes != default_eviction.target_free_bytes {
            self.eviction.target_free_bytes = other.eviction.target_free_bytes;
        }
        if other.eviction.max_files_per_run != default_eviction.max_files_per_run {
            self.eviction.max_files_per_run = other.eviction.max_files_per_run;
        }
        if other.eviction.auto_enabled != default_eviction.auto_enabled {
            self.eviction.auto_enabled = other.eviction.auto_enabled;
        }

        // Lock
        let default_lock = LockConfig::default();
        if other.lock.acquire_timeout_secs != default_lock.acquire_timeout_secs {
            self.lock.acquire_timeout_secs = other.lock.acquire_timeout_secs;
        }
        if other.lock.wait_timeout_secs != default_lock.wait_timeout_secs {
            self.lock.wait_timeout_secs = other.lock.wait_timeout_secs;
        }

        // Daemon
        let default_daemon = DaemonConfig::default();
        if other.daemon.socket != default_daemon.socket {
            self.daemon.socket = other.daemon.socket;
        }
        if other.daemon.debug != default_daemon.debug {
            self.daemon.debug = other.daemon.debug;
        }

        // Security
        if !other.security.exclude_patterns.is_empty() {
            self.security.exclude_patterns = other.security.exclude_patterns;
        }
    }

    /// Apply environment variable overrides (highest priority).
    fn apply_env_overrides(&mut self) {
        // Mount
        if let Ok(local) = std::env::var("OVERLAYFS_LOCAL_DIR") {
            self.mount.local_dir = PathBuf::from(local);
        }
        if let Ok(external) = std::env::var("OVERLAYFS_EXTERNAL_DIR") {
            self.mount.external_dir = Some(PathBuf::from(external));
        }
        if let Ok(mp) = std::env::var("OVERLAYFS_MOUNT_POINT") {
            self.mount.mount_point = PathBuf::from(mp);
        }
        if std::env::var("OVERLAYFS_READ_ONLY").is_ok() {
            self.mount.read_only = true;
        }

        // Eviction
        if let Ok(v) = std::env::var("OVERLAYFS_EVICT_TRIGGER_BYTES") {
            if let Ok(n) = v.parse() {
                self.eviction.trigger_threshold_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("OVERLAYFS_EVICT_TARGET_FREE_BYTES") {
            if let Ok(n) = v.parse() {
                self.eviction.target_free_bytes = n;
            }
        }
        if std::env::var("OVERLAYFS_EVICT_DISABLE").is_ok() {
            self.eviction.auto_enabled = false;
        }

        // Lock
        if let Ok(timeout) = std::env::var("OVERLAYFS_LOCK_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.lock.acquire_timeout_secs = secs;
            }
        }

        // Daemon
        if let Ok(socket) = std::env::var("OVERLAYFS_SOCKET_PATH") {
            self.daemon.socket = PathBuf::from(socket);
        }
        if let Ok(log_dir) = std::env::var("OVERLAYFS_LOG_DIR") {
            self.daemon.log_dir = PathBuf::from(log_dir);
        }
        if std::env::var("OVERLAYFS_DEBUG").is_ok() {
            self.daemon.debug = true;
        }
    }

    /// Generate TOML template for `overlayfs-cli init`.
    pub fn init_toml() -> String {
        let default = Config::default();
        format!(
            r#"# overlay engine mount-pair configuration
config_version = 1

[mount]
local_dir = "{local_dir}"
# external_dir = "/path/to/slow/or/offline/backing/store"
mount_point = "{mount_point}"
volume_name = "{volume_name}"
# read_only = false

[daemon]
# socket = "{socket}"
# debug = false

# [eviction]
# trigger_threshold_bytes = {trigger}
# target_free_bytes = {target_free}
# max_files_per_run = {max_files}
# auto_enabled = true

# [security]
# exclude_patterns = [".env", "*.key"]
"#,
            local_dir = default.mount.local_dir.display(),
            mount_point = default.mount.mount_point.display(),
            volume_name = default.mount.volume_name,
            socket = default.daemon.socket.display(),
            trigger = default.eviction.trigger_threshold_bytes,
            target_free = default.eviction.target_free_bytes,
            max_files = default.eviction.max_files_per_run,
        )
    }

    // ========== Convenience Accessors ==========

    /// Get socket path (resolved).
    pub fn socket_path(&self) -> &Path {
        &self.daemon.socket
    }

    /// Get lock acquisition timeout in seconds.
    pub fn lock_timeout(&self) -> u64 {
        self.lock.acquire_timeout_secs
    }

    /// Check if debug mode is enabled.
    pub fn debug_mode(&self) -> bool {
        self.daemon.debug
    }

    /// Get log directory for the daemon.
    pub fn log_dir(&self) -> &Path {
        &self.daemon.log_dir
    }
}

/// Mount-pair configuration: the LOCAL cache directory, the optional
/// EXTERNAL backing directory, and the FUSE mount point that presents
/// their fused view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MountConfig {
    /// Fast local cache directory.
    pub local_dir: PathBuf,
    /// Slower or possibly-offline backing directory. None means
    /// LOCAL-only operation (no EXTERNAL tier).
    pub external_dir: Option<PathBuf>,
    /// Where the fused view is mounted.
    pub mount_point: PathBuf,
    /// Volume name presented to the OS (FUSE `fsname`/`volname` option).
    pub volume_name: String,
    /// Mount the overlay read-only: write-path FUSE operations return EROFS.
    pub read_only: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from("./local"),
            external_dir: None,
            mount_point: PathBuf::from("./mnt"),
            volume_name: "overlayfs".to_string(),
            read_only: false,
        }
    }
}

/// Eviction manager configuration (C8).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvictionConfig {
    /// LOCAL free-space floor that triggers an eviction run.
    pub trigger_threshold_bytes: u64,
    /// Free-space target an eviction run tries to reach before stopping.
    pub target_free_bytes: u64,
    /// Maximum number of files evicted in a single run.
    pub max_files_per_run: usize,
    /// Minimum age (seconds since last access) before a file is eligible.
    pub min_file_age_secs: u64,
    /// How often the auto-eviction timer fires.
    pub check_interval_secs: u64,
    /// Whether the timer-driven auto-eviction loop runs at all.
    pub auto_enabled: bool,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            trigger_threshold_bytes: 5 * 1024 * 1024 * 1024,
            target_free_bytes: 10 * 1024 * 1024 * 1024,
            max_files_per_run: 100,
            min_file_age_secs: 3600,
            check_interval_secs: 300,
            auto_enabled: true,
        }
    }
}

/// Lock manager configuration (C4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    /// How long a path lock may be held before the background sweep
    /// considers it stale and force-releases it.
    pub acquire_timeout_secs: u64,
    /// How long a FUSE callback waits on a locked path before giving up.
    pub wait_timeout_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: 300,
            wait_timeout_secs: 30,
        }
    }
}

/// Security/exclusion filter configuration (feeds C1's user-pattern set).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// User-provided glob patterns excluded from the fused view, in
    /// addition to the built-in excludes (.DS_Store, AppleDouble, etc.).
    pub exclude_patterns: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: Vec::new(),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix control socket path.
    pub socket: PathBuf,
    /// Enable debug mode (verbose logging, relaxed timeouts).
    pub debug: bool,
    /// Log directory for the daemon.
    pub log_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_SOCKET_PATH),
            debug: false,
            log_dir: PathBuf::from("/tmp"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Lock for tests that modify environment variables to prevent race
    // conditions when tests run in parallel.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn test_default_config_has_all_sections() {
        let config = Config::default();

        assert_eq!(config.mount.volume_name, "overlayfs");
        assert!(config.mount.external_dir.is_none());
        assert!(!config.mount.read_only);

        assert_eq!(config.eviction.max_files_per_run, 100);
        assert!(config.eviction.auto_enabled);

        assert_eq!(config.lock.acquire_timeout_secs, 300);
        assert_eq!(config.lock.wait_timeout_secs, 30);

        assert!(!config.daemon.debug);
        assert_eq!(config.daemon.socket, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_toml_roundtrip_preserves_all_values() {
        let original = Config::default();
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(original.mount.volume_name, parsed.mount.volume_name);
        assert_eq!(
            original.eviction.trigger_threshold_bytes,
            parsed.eviction.trigger_threshold_bytes
        );
        assert_eq!(original.lock.acquire_timeout_secs, parsed.lock.acquire_timeout_secs);
        assert_eq!(original.daemon.debug, parsed.daemon.debug);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let partial_toml = r#"
[mount]
read_only = true
"#;
        let config: Config = toml::from_str(partial_toml).unwrap();

        assert!(config.mount.read_only);
        assert_eq!(config.eviction.max_files_per_run, 100);
        assert!(config.eviction.auto_enabled);
    }

    #[test]
    fn test_merge_replaces_non_default_fields() {
        let mut base = Config::default();
        let mut overlay = Config::default();

        overlay.mount.read_only = true;
        overlay.eviction.max_files_per_run = 500;
        base.merge(overlay);

        assert!(base.mount.read_only);
        assert_eq!(base.eviction.max_files_per_run, 500);
    }

    #[test]
    fn test_merge_with_default_overlay_is_noop() {
        let mut base = Config::default();
        base.mount.read_only = true;

        base.merge(Config::default());

        assert!(base.mount.read_only);
    }

    #[test]
    fn test_env_override_local_dir() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut config = Config::default();

        std::env::set_var("OVERLAYFS_LOCAL_DIR", "/env/override/path");
        config.apply_env_overrides();
        std::env::remove_var("OVERLAYFS_LOCAL_DIR");

        assert_eq!(config.mount.local_dir, PathBuf::from("/env/override/path"));
    }

    #[test]
    fn test_env_override_evict_trigger() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut config = Config::default();

        std::env::set_var("OVERLAYFS_EVICT_TRIGGER_BYTES", "1024");
        config.apply_env_overrides();
        std::env::remove_var("OVERLAYFS_EVICT_TRIGGER_BYTES");

        assert_eq!(config.eviction.trigger_threshold_bytes, 1024);
    }

    #[test]
    fn test_env_override_invalid_value_ignored() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut config = Config::default();

        std::env::set_var("OVERLAYFS_EVICT_TRIGGER_BYTES", "not_a_number");
        config.apply_env_overrides();
        std::env::remove_var("OVERLAYFS_EVICT_TRIGGER_BYTES");

        assert_eq!(
            config.eviction.trigger_threshold_bytes,
            EvictionConfig::default().trigger_threshold_bytes
        );
    }

    #[test]
    fn test_global_config_path_exists() {
        let path = Config::global_config_path();
        assert!(path.is_some());
        assert!(path.unwrap().ends_with(".overlayfs/config.toml"));
    }

    #[test]
    fn test_empty_config_uses_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        let default_config = Config::default();

        assert_eq!(config.mount.volume_name, default_config.mount.volume_name);
        assert_eq!(
            config.eviction.max_files_per_run,
            default_config.eviction.max_files_per_run
        );
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let result: Result<Config, _> = toml::from_str("invalid { toml }");
        assert!(result.is_err());
    }

    #[test]
    fn test_init_toml_contains_sections() {
        let toml_str = Config::init_toml();
        assert!(toml_str.contains("[mount]"));
        assert!(toml_str.contains("[daemon]"));
    }
}
