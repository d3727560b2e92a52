//! # overlayfs
//!
//! Control API front-end for the overlay engine (spec.md §6): mounts and
//! unmounts sync pairs, drives a running `overlayfsd` over its per-pair
//! Unix control socket, and reports on the environment's health.
//!
//! `clap` derive `Cli`/`Commands`, one module per area of functionality,
//! plus a `doctor` diagnostic report.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod client;
mod control;
mod doctor;
mod mount;

#[derive(Parser)]
#[command(name = "overlayfs")]
#[command(version, about = "Control the overlay engine's mounts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a LOCAL/EXTERNAL pair at TARGET.
    Mount(mount::MountArgs),
    /// Unmount a sync pair.
    Unmount(mount::UnmountArgs),
    /// Print a mount's status record.
    Status(control::PairArgs),
    /// Print the daemon's loop-exit diagnostics (spec.md §4.9).
    Diagnostics(control::PairArgs),
    /// Round-trip a ping to confirm the control socket is alive.
    Ping(control::PairArgs),
    /// Point EXTERNAL at a new directory, or detach it entirely (omit PATH).
    SetExternal(control::SetExternalArgs),
    /// Mark EXTERNAL online or offline without remounting.
    SetExternalOnline(control::SetOnlineArgs),
    /// Toggle read-only mode.
    SetReadOnly(control::SetReadOnlyArgs),
    /// Query or set the mount's readiness gate (spec.md §4.5 step 1).
    IndexReady(control::IndexReadyArgs),
    /// Index inspection and maintenance.
    Index {
        #[command(subcommand)]
        command: control::IndexCommands,
    },
    /// Explicitly demote a path to ExternalOnly (spec.md §4.8).
    Evict(control::PathArgs),
    /// Explicitly copy a path EXTERNAL -> LOCAL.
    Prefetch(control::PathArgs),
    /// Print cumulative eviction-manager stats.
    EvictionStats(control::PairArgs),
    /// Insert a path into the `evicting` set (hides its LOCAL copy from resolve).
    MarkEvicting(control::PathArgs),
    UnmarkEvicting(control::PathArgs),
    ClearEvicting(control::PairArgs),
    /// Sync-lock a path: fences write/truncate/unlink/rmdir while held.
    Lock(control::PathArgs),
    Unlock(control::PathArgs),
    UnlockAll(control::PairArgs),
    /// Environment and mount health report.
    Doctor(doctor::DoctorArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("OVERLAYFS_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(run(cli.command))
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Mount(args) => mount::run_mount(args).await,
        Commands::Unmount(args) => mount::run_unmount(args).await,
        Commands::Status(args) => control::run_status(args).await,
        Commands::Diagnostics(args) => control::run_diagnostics(args).await,
        Commands::Ping(args) => control::run_ping(args).await,
        Commands::SetExternal(args) => control::run_set_external(args).await,
        Commands::SetExternalOnline(args) => control::run_set_external_online(args).await,
        Commands::SetReadOnly(args) => control::run_set_read_only(args).await,
        Commands::IndexReady(args) => control::run_index_ready(args).await,
        Commands::Index { command } => control::run_index(command).await,
        Commands::Evict(args) => control::run_evict(args).await,
        Commands::Prefetch(args) => control::run_prefetch(args).await,
        Commands::EvictionStats(args) => control::run_eviction_stats(args).await,
        Commands::MarkEvicting(args) => control::run_mark_evicting(args).await,
        Commands::UnmarkEvicting(args) => control::run_unmark_evicting(args).await,
        Commands::ClearEvicting(args) => control::run_clear_evicting(args).await,
        Commands::Lock(args) => control::run_lock(args).await,
        Commands::Unlock(args) => control::run_unlock(args).await,
        Commands::UnlockAll(args) => control::run_unlock_all(args).await,
        Commands::Doctor(args) => doctor::cmd_doctor(args).await,
    }
}
