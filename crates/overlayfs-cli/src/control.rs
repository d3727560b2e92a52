//! Thin front-end over the Control API (spec.md §6): one function per
//! `ControlRequest` variant that isn't already covered by `mount.rs`,
//! plus the shared `--pair`/`--target` resolution and exit-code mapping
//! every subcommand in `main.rs` goes through.
//!
//! One function per RPC, `clap::Args` structs for shared flag groups,
//! driving `overlayfs-ipc::ControlRequest` end to end.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::{Args, ValueEnum};
use overlayfs_index::{FileEntry, IndexStats, Location};
use overlayfs_ipc::{exit_code, ControlRequest, ControlResponse};

use crate::{client, mount};

/// Shared sync-pair identification: either an explicit `--pair`, or a
/// `--target` the pair id is derived from the same way `mount` does.
#[derive(Args, Debug)]
pub struct PairArgs {
    #[arg(long)]
    pub pair: Option<String>,
    #[arg(long)]
    pub target: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct PathArgs {
    #[command(flatten)]
    pub pair: PairArgs,
    /// Virtual path inside the mount (e.g. `/projects/foo.bin`).
    #[arg(value_name = "PATH")]
    pub path: String,
}

#[derive(Args, Debug)]
pub struct SetExternalArgs {
    #[command(flatten)]
    pub pair: PairArgs,
    /// New EXTERNAL directory. Omit to detach EXTERNAL entirely.
    #[arg(value_name = "DIR")]
    pub path: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum OnOff {
    On,
    Off,
}

impl OnOff {
    fn as_bool(self) -> bool {
        matches!(self, OnOff::On)
    }
}

#[derive(Args, Debug)]
pub struct SetOnlineArgs {
    #[command(flatten)]
    pub pair: PairArgs,
    pub state: OnOff,
}

#[derive(Args, Debug)]
pub struct SetReadOnlyArgs {
    #[command(flatten)]
    pub pair: PairArgs,
    pub state: OnOff,
}

#[derive(Args, Debug)]
pub struct IndexReadyArgs {
    #[command(flatten)]
    pub pair: PairArgs,
    /// Omit to query the current readiness gate; pass to set it.
    pub state: Option<OnOff>,
}

#[derive(clap::Subcommand, Debug)]
pub enum IndexCommands {
    /// Look up a single entry.
    Get(PathArgs),
    /// List every indexed entry for a sync pair.
    List(PairArgs),
    /// List entries with `is_dirty = true`.
    Dirty(PairArgs),
    /// List entries the sync collaborator still needs to push upstream
    /// (dirty, or `LocalOnly` and never yet synced).
    ToSync(PairArgs),
    /// List entries eligible for eviction right now (§4.8 step 1).
    Evictable(PairArgs),
    /// Print aggregate index statistics.
    Stats(PairArgs),
    /// Force a full index rebuild (§4.3).
    Rebuild(PairArgs),
}

async fn send(pair: &PairArgs, req: ControlRequest) -> Result<ControlResponse> {
    let pair_id = mount::resolve_pair(&pair.pair, &pair.target)?;
    client::request(&pair_id, req).await
}

/// Prints an error response's message and exits with the errno-derived
/// code from spec.md §6; returns the response unchanged on success so
/// callers can pattern-match the payload they actually asked for.
fn check(resp: ControlResponse) -> ControlResponse {
    if let ControlResponse::Error(e) = &resp {
        eprintln!("error: {e}");
        std::process::exit(exit_code::for_error_kind(e.kind));
    }
    resp
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn location_str(loc: Location) -> &'static str {
    match loc {
        Location::LocalOnly => "local-only",
        Location::ExternalOnly => "external-only",
        Location::Both => "both",
        Location::NotExists => "not-exists",
    }
}

fn print_entry(e: &FileEntry) {
    println!(
        "{:<40} {:>12} {:<14} {}{} accessed={}",
        e.virtual_path,
        e.size,
        location_str(e.location),
        if e.is_directory { "dir " } else { "" },
        if e.is_dirty { "dirty " } else { "" },
        unix_secs(e.accessed_at),
    );
}

fn print_entries(entries: &[FileEntry]) {
    for e in entries {
        print_entry(e);
    }
    println!("{} entries", entries.len());
}

fn print_stats(s: &IndexStats) {
    println!("files:          {}", s.file_count);
    println!("directories:    {}", s.dir_count);
    println!("total size:     {} bytes", s.total_size);
    println!("dirty:          {}", s.dirty_count);
    println!("local-only:     {}", s.local_only_count);
    println!("external-only:  {}", s.external_only_count);
    println!("both:           {}", s.both_count);
}

pub async fn run_status(args: PairArgs) -> Result<()> {
    match check(send(&args, ControlRequest::Status).await?) {
        ControlResponse::Status(s) => {
            println!("pair:            {}", s.pair);
            println!("target:          {}", s.target.display());
            println!("local:           {}", s.local.display());
            println!(
                "external:        {}",
                s.external.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "-".into())
            );
            println!("mounted:         {}", s.is_mounted);
            println!("error:           {}", s.error);
            println!("external online: {}", s.external_online);
            println!("read only:       {}", s.read_only);
            println!("index ready:     {}", s.index_ready);
            println!("files:           {}", s.file_count);
            println!("total size:      {} bytes", s.total_size);
            if let Some(t) = s.mounted_at {
                println!("mounted at:      {}", unix_secs(t));
            }
            Ok(())
        }
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
}

pub async fn run_diagnostics(args: PairArgs) -> Result<()> {
    match check(send(&args, ControlRequest::Diagnostics).await?) {
        ControlResponse::Diagnostics(d) => {
            println!("mounted:          {}", d.is_mounted);
            println!("loop running:     {}", d.is_loop_running);
            println!("channel valid:    {}", d.channel_valid);
            println!("total ops:        {}", d.total_ops);
            println!(
                "last op time:     {}",
                d.last_op_time.map(unix_secs).map(|t| t.to_string()).unwrap_or_else(|| "-".into())
            );
            println!("last signal:      {}", d.last_signal.as_deref().unwrap_or("-"));
            println!(
                "events:           queued={} processed={} dropped={} pending={}",
                d.cb_queued, d.cb_processed, d.cb_dropped, d.cb_pending
            );
            Ok(())
        }
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
}

pub async fn run_ping(args: PairArgs) -> Result<()> {
    match check(send(&args, ControlRequest::Ping).await?) {
        ControlResponse::Pong => {
            println!("pong");
            Ok(())
        }
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
}

pub async fn run_set_external(args: SetExternalArgs) -> Result<()> {
    let pair_id = mount::resolve_pair(&args.pair.pair, &args.pair.target)?;
    check(
        client::request(
            &pair_id,
            ControlRequest::UpdateExternal {
                pair: pair_id.clone(),
                path: args.path.clone(),
            },
        )
        .await?,
    );
    match args.path {
        Some(p) => println!("EXTERNAL set to {}", p.display()),
        None => println!("EXTERNAL detached"),
    }
    Ok(())
}

pub async fn run_set_external_online(args: SetOnlineArgs) -> Result<()> {
    let pair_id = mount::resolve_pair(&args.pair.pair, &args.pair.target)?;
    check(
        client::request(
            &pair_id,
            ControlRequest::SetExternalOffline {
                pair: pair_id.clone(),
                offline: !args.state.as_bool(),
            },
        )
        .await?,
    );
    println!("external {}", if args.state.as_bool() { "online" } else { "offline" });
    Ok(())
}

pub async fn run_set_read_only(args: SetReadOnlyArgs) -> Result<()> {
    let pair_id = mount::resolve_pair(&args.pair.pair, &args.pair.target)?;
    check(
        client::request(
            &pair_id,
            ControlRequest::SetReadOnly {
                pair: pair_id.clone(),
                read_only: args.state.as_bool(),
            },
        )
        .await?,
    );
    println!("read-only {}", if args.state.as_bool() { "on" } else { "off" });
    Ok(())
}

pub async fn run_index_ready(args: IndexReadyArgs) -> Result<()> {
    let pair_id = mount::resolve_pair(&args.pair.pair, &args.pair.target)?;
    match args.state {
        Some(state) => {
            check(
                client::request(
                    &pair_id,
                    ControlRequest::SetIndexReady {
                        pair: pair_id.clone(),
                        ready: state.as_bool(),
                    },
                )
                .await?,
            );
            println!("index ready: {}", state.as_bool());
        }
        None => match check(
            client::request(&pair_id, ControlRequest::IsIndexReady { pair: pair_id.clone() }).await?,
        ) {
            ControlResponse::Bool(b) => println!("index ready: {b}"),
            other => anyhow::bail!("unexpected response: {other:?}"),
        },
    }
    Ok(())
}

pub async fn run_mark_evicting(args: PathArgs) -> Result<()> {
    check(send(&args.pair, ControlRequest::MarkEvicting { path: args.path.clone() }).await?);
    println!("marked {} as evicting", args.path);
    Ok(())
}

pub async fn run_unmark_evicting(args: PathArgs) -> Result<()> {
    check(send(&args.pair, ControlRequest::UnmarkEvicting { path: args.path.clone() }).await?);
    println!("unmarked {}", args.path);
    Ok(())
}

pub async fn run_clear_evicting(args: PairArgs) -> Result<()> {
    check(send(&args, ControlRequest::ClearEvicting).await?);
    println!("cleared the evicting set");
    Ok(())
}

pub async fn run_lock(args: PathArgs) -> Result<()> {
    check(send(&args.pair, ControlRequest::SyncLock { path: args.path.clone() }).await?);
    println!("locked {}", args.path);
    Ok(())
}

pub async fn run_unlock(args: PathArgs) -> Result<()> {
    check(send(&args.pair, ControlRequest::SyncUnlock { path: args.path.clone() }).await?);
    println!("unlocked {}", args.path);
    Ok(())
}

pub async fn run_unlock_all(args: PairArgs) -> Result<()> {
    check(send(&args, ControlRequest::SyncUnlockAll).await?);
    println!("released every sync lock");
    Ok(())
}

pub async fn run_evict(args: PathArgs) -> Result<()> {
    check(send(&args.pair, ControlRequest::Evict { path: args.path.clone() }).await?);
    println!("evicted {}", args.path);
    Ok(())
}

pub async fn run_prefetch(args: PathArgs) -> Result<()> {
    check(send(&args.pair, ControlRequest::Prefetch { path: args.path.clone() }).await?);
    println!("prefetched {}", args.path);
    Ok(())
}

pub async fn run_eviction_stats(args: PairArgs) -> Result<()> {
    match check(send(&args, ControlRequest::EvictionStats).await?) {
        ControlResponse::EvictionStats(s) => {
            println!("evicted count:    {}", s.evicted_count);
            println!("evicted size:     {} bytes", s.evicted_size);
            println!(
                "last eviction:    {}",
                s.last_eviction_time.map(unix_secs).map(|t| t.to_string()).unwrap_or_else(|| "-".into())
            );
            println!("skipped (dirty):  {}", s.skipped_dirty);
            println!("skipped (locked): {}", s.skipped_locked);
            println!("failed sync:      {}", s.failed_sync);
            Ok(())
        }
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
}

pub async fn run_index(cmd: IndexCommands) -> Result<()> {
    match cmd {
        IndexCommands::Get(args) => {
            let pair_id = mount::resolve_pair(&args.pair.pair, &args.pair.target)?;
            match check(
                client::request(
                    &pair_id,
                    ControlRequest::GetEntry { pair: pair_id.clone(), path: args.path.clone() },
                )
                .await?,
            ) {
                ControlResponse::Entry(Some(e)) => {
                    print_entry(&e);
                    Ok(())
                }
                ControlResponse::Entry(None) => {
                    println!("no entry at {}", args.path);
                    Ok(())
                }
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }
        IndexCommands::List(args) => {
            with_entries(args, |pair| ControlRequest::ListEntries { pair }).await
        }
        IndexCommands::Dirty(args) => {
            with_entries(args, |pair| ControlRequest::GetDirty { pair }).await
        }
        IndexCommands::ToSync(args) => {
            with_entries(args, |pair| ControlRequest::GetFilesToSync { pair }).await
        }
        IndexCommands::Evictable(args) => {
            with_entries(args, |pair| ControlRequest::GetEvictable { pair }).await
        }
        IndexCommands::Stats(args) => {
            let pair_id = mount::resolve_pair(&args.pair, &args.target)?;
            match check(client::request(&pair_id, ControlRequest::Stats { pair: pair_id.clone() }).await?) {
                ControlResponse::Stats(s) => {
                    print_stats(&s);
                    Ok(())
                }
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }
        IndexCommands::Rebuild(args) => {
            let pair_id = mount::resolve_pair(&args.pair, &args.target)?;
            check(client::request(&pair_id, ControlRequest::Rebuild { pair: pair_id.clone() }).await?);
            println!("index rebuilt for '{pair_id}'");
            Ok(())
        }
    }
}

async fn with_entries(
    args: PairArgs,
    req_for: impl FnOnce(String) -> ControlRequest,
) -> Result<()> {
    let pair_id = mount::resolve_pair(&args.pair, &args.target)?;
    match check(client::request(&pair_id, req_for(pair_id.clone())).await?) {
        ControlResponse::Entries(entries) => {
            print_entries(&entries);
            Ok(())
        }
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
}
