//! Integration tests for overlayfs-config
//!
//! These tests verify the full config loading pipeline with real file system
//! operations (global → per-mount-pair → env var layering).

use std::path::PathBuf;
use tempfile::tempdir;

/// Test config loading from a real per-mount-pair config file.
#[test]
fn test_load_mount_config_from_file() {
    let temp = tempdir().unwrap();
    let overlayfs_dir = temp.path().join(".overlayfs");
    std::fs::create_dir_all(&overlayfs_dir).unwrap();

    let config_content = r#"
[mount]
local_dir = "/custom/local"
mount_point = "/custom/mnt"
volume_name = "custom-vol"

[eviction]
trigger_threshold_bytes = 1073741824
max_files_per_run = 50
"#;
    std::fs::write(overlayfs_dir.join("config.toml"), config_content).unwrap();

    let contents = std::fs::read_to_string(overlayfs_dir.join("config.toml")).unwrap();
    let config: overlayfs_config::Config = toml::from_str(&contents).unwrap();

    assert_eq!(config.mount.local_dir, PathBuf::from("/custom/local"));
    assert_eq!(config.mount.mount_point, PathBuf::from("/custom/mnt"));
    assert_eq!(config.mount.volume_name, "custom-vol");
    assert_eq!(config.eviction.trigger_threshold_bytes, 1073741824);
    assert_eq!(config.eviction.max_files_per_run, 50);
}

/// Test config hierarchy: per-mount-pair config overrides global via
/// `load_for_project`, which reads `~/.overlayfs/config.toml` then
/// `<mount_root>/.overlayfs/config.toml`.
#[test]
fn test_config_hierarchy_project_overrides_global() {
    let temp = tempdir().unwrap();

    let project_dir = temp.path().join("project");
    let overlayfs_dir = project_dir.join(".overlayfs");
    std::fs::create_dir_all(&overlayfs_dir).unwrap();

    let project_config = r#"
[mount]
volume_name = "project-vol"
read_only = true

[eviction]
max_files_per_run = 25
"#;
    std::fs::write(overlayfs_dir.join("config.toml"), project_config).unwrap();

    let config = overlayfs_config::Config::load_for_project(&project_dir).unwrap();

    assert_eq!(config.mount.volume_name, "project-vol");
    assert!(config.mount.read_only);
    assert_eq!(config.eviction.max_files_per_run, 25);
    // Untouched sections keep their defaults.
    assert!(config.eviction.auto_enabled);
}

/// Test config with environment variable override, using the crate's own
/// `apply_env_overrides` path via `load_for_project` (env vars win last).
#[test]
fn test_config_env_override_integration() {
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    let _guard = ENV_LOCK.lock().unwrap();

    let temp = tempdir().unwrap();

    std::env::set_var("OVERLAYFS_LOCAL_DIR", "/override/local");
    std::env::set_var("OVERLAYFS_EVICT_TRIGGER_BYTES", "2048");

    let config = overlayfs_config::Config::load_for_project(temp.path()).unwrap();

    std::env::remove_var("OVERLAYFS_LOCAL_DIR");
    std::env::remove_var("OVERLAYFS_EVICT_TRIGGER_BYTES");

    assert_eq!(config.mount.local_dir, PathBuf::from("/override/local"));
    assert_eq!(config.eviction.trigger_threshold_bytes, 2048);
}

/// Test complete config serialization/deserialization cycle.
#[test]
fn test_config_full_roundtrip_with_all_sections() {
    let original = overlayfs_config::Config::default();

    let temp = tempdir().unwrap();
    let config_path = temp.path().join("config.toml");
    let toml_str = toml::to_string_pretty(&original).unwrap();
    std::fs::write(&config_path, &toml_str).unwrap();

    let contents = std::fs::read_to_string(&config_path).unwrap();
    let loaded: overlayfs_config::Config = toml::from_str(&contents).unwrap();

    assert_eq!(original.mount.volume_name, loaded.mount.volume_name);
    assert_eq!(
        original.eviction.trigger_threshold_bytes,
        loaded.eviction.trigger_threshold_bytes
    );
    assert_eq!(
        original.lock.acquire_timeout_secs,
        loaded.lock.acquire_timeout_secs
    );
    assert_eq!(
        original.security.exclude_patterns.len(),
        loaded.security.exclude_patterns.len()
    );
    assert_eq!(original.daemon.debug, loaded.daemon.debug);
}

/// Test partial config with defaults filling in untouched sections.
#[test]
fn test_partial_config_defaults_applied() {
    let partial = r#"
[mount]
read_only = true
"#;
    let config: overlayfs_config::Config = toml::from_str(partial).unwrap();

    assert!(config.mount.read_only);
    assert_eq!(config.mount.volume_name, "overlayfs");
    assert_eq!(config.eviction.max_files_per_run, 100);
    assert!(config.eviction.auto_enabled);
}

/// `init_toml` produces a template that itself parses back to defaults for
/// every commented-out section.
#[test]
fn test_init_toml_roundtrips_through_parser() {
    let rendered = overlayfs_config::Config::init_toml();
    let parsed: overlayfs_config::Config = toml::from_str(&rendered).unwrap();

    let default = overlayfs_config::Config::default();
    assert_eq!(parsed.mount.volume_name, default.mount.volume_name);
    assert_eq!(parsed.mount.local_dir, default.mount.local_dir);
}
