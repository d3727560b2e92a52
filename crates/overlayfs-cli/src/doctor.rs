//! `overlayfs doctor`: environment and mount health report.
//!
//! `DiagResult` pass/warn/fail counters with `console`-styled emoji output
//! and a final summary line, checking mount-lifecycle concerns (spec.md
//! §4.7/§4.9): config loadability, LOCAL/EXTERNAL/TARGET directory state
//! and back-end-protection mode bits, control-socket reachability, and
//! index-db presence.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;
use console::{style, Emoji};

use overlayfs_config::path::{get_index_db_path, get_mount_socket_path};
use overlayfs_ipc::ControlRequest;

use crate::{client, mount};

static CHECK: Emoji<'_, '_> = Emoji("✔ ", "[ok] ");
static CROSS: Emoji<'_, '_> = Emoji("✘ ", "[!!] ");
static WARN_ICON: Emoji<'_, '_> = Emoji("⚠ ", "[??] ");
static DOT: Emoji<'_, '_> = Emoji("● ", "[-] ");

#[derive(Args, Debug)]
pub struct DoctorArgs {
    /// Sync-pair identity, or derive one from --target.
    #[arg(long)]
    pub pair: Option<String>,
    /// The mount's TARGET directory.
    #[arg(long)]
    pub target: Option<PathBuf>,
}

struct DiagResult {
    passed: u32,
    warned: u32,
    failed: u32,
}

impl DiagResult {
    fn new() -> Self {
        Self { passed: 0, warned: 0, failed: 0 }
    }

    fn pass(&mut self, msg: &str) {
        self.passed += 1;
        eprintln!("  {} {}", CHECK, style(msg).green());
    }

    fn warn(&mut self, msg: &str) {
        self.warned += 1;
        eprintln!("  {} {}", WARN_ICON, style(msg).yellow());
    }

    fn fail(&mut self, msg: &str) {
        self.failed += 1;
        eprintln!("  {} {}", CROSS, style(msg).red());
    }

    fn info(&self, msg: &str) {
        eprintln!("  {} {}", DOT, style(msg).dim());
    }
}

pub async fn cmd_doctor(args: DoctorArgs) -> Result<()> {
    eprintln!();
    eprintln!("{}", style("overlayfs doctor").bold().cyan());
    eprintln!("{}", style("─".repeat(40)).dim());

    let mut d = DiagResult::new();
    let pair = mount::resolve_pair(&args.pair, &args.target).ok();

    eprintln!();
    eprintln!("{}", style("Config").bold());
    check_config(&mut d);

    eprintln!();
    eprintln!("{}", style("Mount").bold());
    check_mount(args.target.as_deref(), &mut d);

    eprintln!();
    eprintln!("{}", style("Control socket").bold());
    check_socket(pair.as_deref(), &mut d).await;

    eprintln!();
    eprintln!("{}", style("Index").bold());
    check_index(pair.as_deref(), &mut d);

    eprintln!();
    eprintln!("{}", style("─".repeat(40)).dim());
    eprintln!(
        "  {} passed, {} warnings, {} errors",
        style(d.passed).green().bold(),
        style(d.warned).yellow().bold(),
        style(d.failed).red().bold(),
    );

    if d.failed > 0 {
        eprintln!();
        eprintln!(
            "{}",
            style("Run 'overlayfs mount --local <dir> --target <dir>' to (re)mount.").dim()
        );
        std::process::exit(1);
    } else if d.warned > 0 {
        eprintln!("{}", style("Some warnings detected. The overlay should still work.").dim());
    } else {
        eprintln!("{}", style("All checks passed.").dim());
    }
    eprintln!();
    Ok(())
}

fn check_config(d: &mut DiagResult) {
    match overlayfs_config::Config::global_config_path() {
        Some(path) => {
            if path.exists() {
                d.pass(&format!("Global config: {}", path.display()));
            } else {
                d.warn(&format!("Global config not found: {}", path.display()));
                d.info("Defaults will be used until one is written there.");
            }
        }
        None => d.fail("Cannot determine home directory"),
    }

    match overlayfs_config::Config::load() {
        Ok(cfg) => d.pass(&format!("Config loads successfully (version {})", cfg.config_version)),
        Err(e) => d.fail(&format!("Config load failed: {e}")),
    }
}

fn check_mount(target: Option<&Path>, d: &mut DiagResult) {
    let Some(target) = target else {
        d.info("No --target given, skipping TARGET/LOCAL/EXTERNAL checks.");
        return;
    };

    match std::fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => d.pass(&format!("TARGET exists: {}", target.display())),
        Ok(_) => d.fail(&format!("TARGET exists but is not a directory: {}", target.display())),
        Err(_) => d.warn(&format!("TARGET does not exist yet: {}", target.display())),
    }

    if is_kernel_mounted(target) {
        d.pass("TARGET is an active kernel mount");
    } else {
        d.warn("TARGET is not currently mounted");
    }
}

fn is_kernel_mounted(target: &Path) -> bool {
    let Ok(target) = target.canonicalize() else { return false };
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else { return false };
    mounts
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(target.to_string_lossy().as_ref()))
}

async fn check_socket(pair: Option<&str>, d: &mut DiagResult) {
    let Some(pair) = pair else {
        d.info("No --pair/--target given, skipping control-socket check.");
        return;
    };

    let socket = get_mount_socket_path(pair)
        .unwrap_or_else(|| overlayfs_config::config().socket_path().to_path_buf());
    if !socket.exists() {
        d.warn(&format!("Control socket not found: {}", socket.display()));
        d.info("The daemon for this pair is not running.");
        return;
    }
    d.pass(&format!("Control socket exists: {}", socket.display()));

    match client::request(pair, ControlRequest::Ping).await {
        Ok(overlayfs_ipc::ControlResponse::Pong) => d.pass("Daemon responds to ping"),
        Ok(other) => d.warn(&format!("Daemon responded unexpectedly: {other:?}")),
        Err(e) => d.warn(&format!("Socket exists but ping failed: {e}")),
    }
}

fn check_index(pair: Option<&str>, d: &mut DiagResult) {
    let Some(pair) = pair else {
        return;
    };
    match get_index_db_path(pair) {
        Some(path) if path.exists() => {
            let size = dir_size_approx(&path);
            d.pass(&format!("Index DB: {} ({})", path.display(), format_bytes(size)));
        }
        Some(path) => d.warn(&format!("Index DB not found yet: {}", path.display())),
        None => d.warn("Cannot determine index DB path"),
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes}B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1}K", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1}M", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1}G", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn dir_size_approx(path: &Path) -> u64 {
    if path.is_file() {
        return std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    }
    std::fs::read_dir(path)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}
