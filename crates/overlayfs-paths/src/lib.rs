//! Virtual path join/resolve helpers and the junk-file exclusion list.
//!
//! Every function here is pure: no locking, no index lookups beyond a plain
//! `Path::exists` probe in [`resolve_actual`]. The eviction-set check that
//! `resolve_actual` needs is passed in by the caller rather than imported,
//! so this crate stays free of a dependency on `overlayfs-state`.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path too deep (loop guard)")]
    TooManyLinks,
}

/// Maximum number of path components before we assume a symlink loop.
pub const MAX_PATH_DEPTH: usize = 40;

/// Names and suffixes that never surface through `readdir`, regardless of
/// which tier they live in.
const BUILTIN_EXCLUDES: &[&str] = &[
    ".DS_Store",
    ".Spotlight-V100",
    ".Trashes",
    ".fseventsd",
    ".TemporaryItems",
    ".FUSE",
];

/// Where a resolved file actually lives, as seen by [`resolve_actual`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    External,
}

/// Strips the virtual path's leading slash and joins it onto `base`,
/// collapsing any trailing slash on `base` first.
fn join(base: &Path, virtual_path: &str) -> PathBuf {
    let trimmed_base = base.to_string_lossy();
    let trimmed_base = trimmed_base.trim_end_matches('/');
    let trimmed_vp = virtual_path.trim_start_matches('/');
    if trimmed_vp.is_empty() {
        return PathBuf::from(trimmed_base);
    }
    Path::new(trimmed_base).join(trimmed_vp)
}

pub fn virtual_to_local(local_dir: &Path, virtual_path: &str) -> PathBuf {
    join(local_dir, virtual_path)
}

pub fn virtual_to_external(external_dir: &Path, virtual_path: &str) -> PathBuf {
    join(external_dir, virtual_path)
}

/// Returns the first of LOCAL/EXTERNAL that actually has the path, skipping
/// LOCAL when `vp` is mid-eviction so a demoted file reads through to
/// EXTERNAL instead of briefly reappearing at its old LOCAL path.
pub fn resolve_actual(
    local_dir: &Path,
    external_dir: Option<&Path>,
    virtual_path: &str,
    is_evicting: bool,
) -> Option<(Tier, PathBuf)> {
    if !is_evicting {
        let local = virtual_to_local(local_dir, virtual_path);
        if local.exists() {
            return Some((Tier::Local, local));
        }
    }
    if let Some(external_dir) = external_dir {
        let external = virtual_to_external(external_dir, virtual_path);
        if external.exists() {
            return Some((Tier::External, external));
        }
    }
    None
}

/// Matches junk/system names plus AppleDouble `._*` sidecar files and a
/// caller-supplied glob list.
pub fn should_exclude(name: &str, user_patterns: &[glob::Pattern]) -> bool {
    if BUILTIN_EXCLUDES.contains(&name) || name.starts_with("._") {
        return true;
    }
    user_patterns.iter().any(|p| p.matches(name))
}

/// Rejects paths with more than [`MAX_PATH_DEPTH`] components.
pub fn check_path_depth(virtual_path: &str) -> Result<(), PathError> {
    let depth = virtual_path
        .split('/')
        .filter(|c| !c.is_empty())
        .count();
    if depth > MAX_PATH_DEPTH {
        return Err(PathError::TooManyLinks);
    }
    Ok(())
}

/// Compiles a user's glob strings, skipping ones that fail to parse rather
/// than failing the whole mount over one bad pattern.
pub fn compile_exclude_patterns(raw: &[String]) -> Vec<glob::Pattern> {
    raw.iter()
        .filter_map(|s| glob::Pattern::new(s).ok())
        .collect()
}

/// Normalizes a virtual path: absolute, forward-slash, no `.`/`..`
/// components, no trailing slash except at the root.
pub fn normalize_vfs_path(path: &str) -> String {
    let mut out = String::from("/");
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if out.len() > 1 {
                    if let Some(idx) = out.trim_end_matches('/').rfind('/') {
                        out.truncate(idx.max(1));
                    }
                }
            }
            other => {
                if out != "/" {
                    out.push('/');
                }
                out.push_str(other);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_strips_leading_and_trailing_slashes() {
        let local = Path::new("/mnt/local");
        assert_eq!(
            virtual_to_local(local, "/foo/bar.txt"),
            PathBuf::from("/mnt/local/foo/bar.txt")
        );
        assert_eq!(virtual_to_local(local, "/"), PathBuf::from("/mnt/local"));
    }

    #[test]
    fn resolve_prefers_local_then_external() {
        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("local");
        let external = tmp.path().join("external");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::create_dir_all(&external).unwrap();
        std::fs::write(external.join("only-external.txt"), b"x").unwrap();
        std::fs::write(local.join("both.txt"), b"l").unwrap();
        std::fs::write(external.join("both.txt"), b"e").unwrap();

        let (tier, _) =
            resolve_actual(&local, Some(&external), "/only-external.txt", false).unwrap();
        assert_eq!(tier, Tier::External);

        let (tier, _) = resolve_actual(&local, Some(&external), "/both.txt", false).unwrap();
        assert_eq!(tier, Tier::Local);

        assert!(resolve_actual(&local, Some(&external), "/missing.txt", false).is_none());
    }

    #[test]
    fn resolve_skips_local_while_evicting() {
        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("local");
        let external = tmp.path().join("external");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::create_dir_all(&external).unwrap();
        std::fs::write(local.join("both.txt"), b"l").unwrap();
        std::fs::write(external.join("both.txt"), b"e").unwrap();

        let (tier, _) = resolve_actual(&local, Some(&external), "/both.txt", true).unwrap();
        assert_eq!(tier, Tier::External);
    }

    #[test]
    fn exclusion_list_matches_builtins_and_appledouble() {
        let patterns = compile_exclude_patterns(&["*.tmp".to_string()]);
        assert!(should_exclude(".DS_Store", &patterns));
        assert!(should_exclude("._resource", &patterns));
        assert!(should_exclude("scratch.tmp", &patterns));
        assert!(!should_exclude("notes.txt", &patterns));
    }

    #[test]
    fn depth_guard_rejects_excess_components() {
        let deep = format!("/{}", vec!["a"; MAX_PATH_DEPTH + 1].join("/"));
        assert!(matches!(
            check_path_depth(&deep),
            Err(PathError::TooManyLinks)
        ));
        let ok = format!("/{}", vec!["a"; MAX_PATH_DEPTH].join("/"));
        assert!(check_path_depth(&ok).is_ok());
    }

    #[test]
    fn normalize_collapses_dots_and_double_slashes() {
        assert_eq!(normalize_vfs_path("/a//b/./c/../d"), "/a/b/d");
        assert_eq!(normalize_vfs_path("/"), "/");
        assert_eq!(normalize_vfs_path(""), "/");
    }
}
