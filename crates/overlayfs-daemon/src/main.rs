//! The overlay engine daemon: owns one mount's lifecycle (C7), hosts the
//! eviction timer (C8) and lock sweep (C4), drains the event queue into the
//! index (C6/C3), and serves the Control API (spec.md §6) over a Unix
//! socket. Built around a `tokio` multi-thread runtime, a `clap` CLI, and
//! `tokio::select!` over the accept loop and signals.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

use overlayfs_config::logging::{self, LogLevel};
use overlayfs_config::path::{compute_project_id, get_index_db_path, get_mount_socket_path};
use overlayfs_config::Config;
use overlayfs_evict::{EvictionManager, SyncRequester};
use overlayfs_events::{EventObserver, EventRecord};
use overlayfs_fuse::{MountPoint, OverlayFs};
use overlayfs_index::build::{full_build, incremental_update};
use overlayfs_index::{FileEntry, FileIndex, LockState, Location};
use overlayfs_ipc::{
    exit_code, frame, ControlError, ControlRequest, ControlResponse, Diagnostics, ErrorKind,
    MountStatus,
};
use overlayfs_paths::compile_exclude_patterns;

#[derive(Parser, Debug)]
#[command(name = "overlayfsd", about = "Overlay engine mount daemon")]
struct Cli {
    /// Fast local cache directory.
    #[arg(long)]
    local: PathBuf,

    /// Slower or possibly-offline backing directory.
    #[arg(long)]
    external: Option<PathBuf>,

    /// Directory the fused view is mounted at.
    #[arg(long)]
    target: PathBuf,

    /// Sync-pair identity. Defaults to a hash of the canonicalized target.
    #[arg(long)]
    pair: Option<String>,

    /// Run mount read-only.
    #[arg(long)]
    read_only: bool,
}

/// Diagnostics inputs the loop-exit recovery decision is made from (§4.9).
struct Postmortem {
    total_ops: AtomicU64,
    last_op_time: Mutex<Option<SystemTime>>,
    last_signal: Mutex<Option<String>>,
}

impl Postmortem {
    fn new() -> Self {
        Self {
            total_ops: AtomicU64::new(0),
            last_op_time: Mutex::new(None),
            last_signal: Mutex::new(None),
        }
    }

    fn record_signal(&self, name: &str) {
        *self.last_signal.lock().unwrap() = Some(name.to_string());
    }
}

struct IndexObserver {
    index: Arc<FileIndex>,
    pair: String,
    local_dir: PathBuf,
    postmortem: Arc<Postmortem>,
}

impl IndexObserver {
    fn touch(&self, vp: &str) {
        self.postmortem.total_ops.fetch_add(1, Ordering::Relaxed);
        *self.postmortem.last_op_time.lock().unwrap() = Some(SystemTime::now());
        let _ = self.index.touch_access(&self.pair, vp);
        let _ = vp;
    }
}

impl EventObserver for IndexObserver {
    fn on_created(&self, vp: &str, is_dir: bool) {
        self.touch(vp);
        // New entries always land in LOCAL first (see overlayfs-fuse's
        // create/mkdir/symlink); synthesize the entry here rather than
        // waiting for the next rebuild so it shows up immediately.
        if self.index.get(&self.pair, vp).ok().flatten().is_some() {
            return;
        }
        let local_path = overlayfs_paths::virtual_to_local(&self.local_dir, vp);
        let size = std::fs::metadata(&local_path).map(|m| m.len()).unwrap_or(0);
        let now = SystemTime::now();
        let entry = FileEntry {
            sync_pair_id: self.pair.clone(),
            virtual_path: vp.to_string(),
            local_path: Some(local_path.to_string_lossy().to_string()),
            external_path: None,
            size,
            modified_at: now,
            created_at: now,
            accessed_at: now,
            is_directory: is_dir,
            is_dirty: false,
            lock_state: LockState::Unlocked,
            location: Location::LocalOnly,
        };
        self.index.batch_upsert(vec![entry]);
        let _ = self.index.commit();
    }

    fn on_deleted(&self, vp: &str, is_dir: bool) {
        self.touch(vp);
        let _ = self
            .index
            .batch_remove(&[(self.pair.clone(), vp.to_string())]);
        let _ = is_dir;
        let _ = self.index.commit();
    }

    fn on_written(&self, vp: &str) {
        self.touch(vp);
        let _ = self.index.mark_dirty(&self.pair, vp, true);
    }

    fn on_read(&self, vp: &str) {
        self.touch(vp);
    }

    fn on_renamed(&self, from: &str, to: &str, is_dir: bool) {
        self.touch(to);
        let _ = is_dir;
        let _ = from;
    }
}

/// Implements C8's "never evict unsynced data" escape hatch. Without a real
/// sync collaborator wired up (out of scope per spec.md §1), a requested
/// sync is just logged -- the candidate stays `LocalOnly` and is retried
/// next pass, which is exactly the documented fallback behavior.
struct LoggingSyncRequester;

impl SyncRequester for LoggingSyncRequester {
    fn request_sync(&self, pair: &str, vp: &str) {
        tracing::info!(component = "EVICT", pair, vp, "sync requested for LocalOnly candidate (no sync collaborator attached)");
    }
}

/// All daemon-owned state reachable from an IPC connection handler.
struct DaemonState {
    mp: Arc<MountPoint>,
    index: Arc<FileIndex>,
    evictor: Arc<EvictionManager>,
    config: Config,
    postmortem: Arc<Postmortem>,
    shutdown: Arc<Notify>,
    mounted: AtomicBool,
    /// Set by the FUSE-loop supervisor once recovery (§4.7) has exhausted
    /// its three-attempt budget for an unexpected loop exit.
    mount_errored: Arc<AtomicBool>,
}

impl DaemonState {
    fn status(&self) -> Result<MountStatus, overlayfs_index::IndexError> {
        let stats = self.index.stats(&self.mp.sync_pair_id)?;
        Ok(MountStatus {
            pair: self.mp.sync_pair_id.clone(),
            target: self.mp.target_dir.clone(),
            local: self.mp.local_dir.clone(),
            external: self.mp.external_dir(),
            is_mounted: self.mounted.load(Ordering::Acquire),
            external_online: self.mp.is_external_online(),
            read_only: self.mp.is_read_only(),
            index_ready: self.mp.is_index_ready(),
            mounted_at: Some(self.mp.mounted_at),
            file_count: stats.file_count,
            total_size: stats.total_size,
            error: self.mount_errored.load(Ordering::Acquire),
        })
    }

    fn diagnostics(&self) -> Diagnostics {
        let counters = self.mp.events.counters();
        Diagnostics {
            is_mounted: self.mounted.load(Ordering::Acquire),
            is_loop_running: self.mounted.load(Ordering::Acquire),
            channel_valid: true,
            macfuse_dev_count: 0,
            total_ops: self.postmortem.total_ops.load(Ordering::Relaxed),
            last_op_time: *self.postmortem.last_op_time.lock().unwrap(),
            last_signal: self.postmortem.last_signal.lock().unwrap().clone(),
            cb_queued: counters.queued,
            cb_processed: counters.processed,
            cb_dropped: counters.dropped,
            cb_pending: counters.pending,
        }
    }
}

fn err(kind: ErrorKind, msg: impl Into<String>) -> ControlResponse {
    ControlResponse::Error(ControlError::new(kind, msg))
}

async fn handle_request(state: &DaemonState, req: ControlRequest) -> ControlResponse {
    let pair = state.mp.sync_pair_id.clone();
    match req {
        ControlRequest::Ping => ControlResponse::Pong,

        ControlRequest::Mount { .. } => {
            err(ErrorKind::AlreadyMounted, "this daemon already owns one mount")
        }
        ControlRequest::Unmount { pair: p } => {
            if p != pair {
                return err(ErrorKind::InvalidArgument, "unknown sync pair");
            }
            state.shutdown.notify_one();
            ControlResponse::Ok
        }
        ControlRequest::Status => match state.status() {
            Ok(s) => ControlResponse::Status(s),
            Err(e) => err(ErrorKind::IoError, e.to_string()),
        },
        ControlRequest::Diagnostics => ControlResponse::Diagnostics(state.diagnostics()),

        ControlRequest::UpdateExternal { pair: p, path } => {
            if p != pair {
                return err(ErrorKind::InvalidArgument, "unknown sync pair");
            }
            state.mp.set_external_dir(path);
            ControlResponse::Ok
        }
        ControlRequest::SetExternalOffline { pair: p, offline } => {
            if p != pair {
                return err(ErrorKind::InvalidArgument, "unknown sync pair");
            }
            state
                .mp
                .external_online
                .store(!offline, Ordering::Release);
            ControlResponse::Ok
        }
        ControlRequest::SetReadOnly { pair: p, read_only } => {
            if p != pair {
                return err(ErrorKind::InvalidArgument, "unknown sync pair");
            }
            state.mp.set_read_only(read_only);
            ControlResponse::Ok
        }
        ControlRequest::SetIndexReady { pair: p, ready } => {
            if p != pair {
                return err(ErrorKind::InvalidArgument, "unknown sync pair");
            }
            state.mp.set_index_ready(ready);
            ControlResponse::Ok
        }
        ControlRequest::IsIndexReady { pair: p } => {
            if p != pair {
                return err(ErrorKind::InvalidArgument, "unknown sync pair");
            }
            ControlResponse::Bool(state.mp.is_index_ready())
        }

        ControlRequest::MarkEvicting { path } => {
            state.mp.state.evicting.add(&path);
            ControlResponse::Ok
        }
        ControlRequest::UnmarkEvicting { path } => {
            state.mp.state.evicting.remove(&path);
            ControlResponse::Ok
        }
        ControlRequest::ClearEvicting => {
            state.mp.state.evicting.clear();
            ControlResponse::Ok
        }

        ControlRequest::SyncLock { path } => {
            let acquired = state.mp.locks.acquire(
                &path,
                overlayfs_state::Direction::LocalToExternal,
                &path,
            );
            if acquired {
                state.mp.state.syncing.add(&path);
                ControlResponse::Ok
            } else {
                err(ErrorKind::Busy, "path already locked")
            }
        }
        ControlRequest::SyncUnlock { path } => {
            state.mp.locks.release(&path);
            state.mp.state.syncing.remove(&path);
            ControlResponse::Ok
        }
        ControlRequest::SyncUnlockAll => {
            state.mp.locks.shutdown();
            state.mp.state.syncing.clear();
            ControlResponse::Ok
        }

        ControlRequest::GetEntry { pair: p, path } => match state.index.get(&p, &path) {
            Ok(entry) => ControlResponse::Entry(entry),
            Err(e) => err(ErrorKind::IoError, e.to_string()),
        },
        ControlRequest::ListEntries { pair: p } => match state.index.list(&p) {
            Ok(entries) => ControlResponse::Entries(entries),
            Err(e) => err(ErrorKind::IoError, e.to_string()),
        },
        ControlRequest::GetDirty { pair: p } => match state.index.list(&p) {
            Ok(entries) => {
                ControlResponse::Entries(entries.into_iter().filter(|e| e.is_dirty).collect())
            }
            Err(e) => err(ErrorKind::IoError, e.to_string()),
        },
        ControlRequest::GetFilesToSync { pair: p } => match state.index.list(&p) {
            Ok(entries) => ControlResponse::Entries(
                entries
                    .into_iter()
                    .filter(|e| e.is_dirty || e.location == Location::LocalOnly)
                    .collect(),
            ),
            Err(e) => err(ErrorKind::IoError, e.to_string()),
        },
        ControlRequest::GetEvictable { pair: p } => match state.index.list(&p) {
            Ok(entries) => ControlResponse::Entries(
                entries
                    .into_iter()
                    .filter(|e| {
                        e.location == Location::Both
                            && !e.is_dirty
                            && e.lock_state == LockState::Unlocked
                    })
                    .collect(),
            ),
            Err(e) => err(ErrorKind::IoError, e.to_string()),
        },
        ControlRequest::Stats { pair: p } => match state.index.stats(&p) {
            Ok(stats) => ControlResponse::Stats(stats),
            Err(e) => err(ErrorKind::IoError, e.to_string()),
        },
        ControlRequest::Rebuild { pair: p } => {
            if p != pair {
                return err(ErrorKind::InvalidArgument, "unknown sync pair");
            }
            match full_build(
                &state.index,
                &p,
                &state.mp.local_dir,
                state.mp.external_dir().as_deref(),
            ) {
                Ok(_) => ControlResponse::Ok,
                Err(e) => err(ErrorKind::IoError, e.to_string()),
            }
        }

        ControlRequest::Evict { path } => {
            match state
                .evictor
                .evict(&state.index, &state.mp.state, &pair, &path)
            {
                Ok(()) => ControlResponse::Ok,
                Err(overlayfs_evict::EvictError::NotEligible(_)) => {
                    err(ErrorKind::Busy, "entry is dirty, locked, or not in Both state")
                }
                Err(overlayfs_evict::EvictError::NotFound(_)) => {
                    err(ErrorKind::NoEntry, "no such entry")
                }
                Err(e) => err(ErrorKind::IoError, e.to_string()),
            }
        }
        ControlRequest::Prefetch { path } => {
            match state
                .evictor
                .prefetch(&state.index, &pair, &path, &state.mp.local_dir)
            {
                Ok(()) => ControlResponse::Ok,
                Err(overlayfs_evict::EvictError::NotFound(_)) => {
                    err(ErrorKind::NoEntry, "no such entry")
                }
                Err(e) => err(ErrorKind::IoError, e.to_string()),
            }
        }
        ControlRequest::EvictionStats => ControlResponse::EvictionStats(state.evictor.stats()),
    }
}

async fn serve_connection(state: Arc<DaemonState>, mut stream: UnixStream) {
    loop {
        let (seq, req) = match frame::read_request(&mut stream).await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        let resp = handle_request(&state, req).await;
        if frame::write_response(&mut stream, &resp, seq).await.is_err() {
            return;
        }
    }
}

/// Takeover of a pre-existing TARGET directory (spec.md §4.7 step 3).
fn handle_preexisting_target(target: &Path, local: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(target) {
        Ok(m) => m,
        Err(_) => return Ok(()), // doesn't exist yet
    };

    if meta.file_type().is_symlink() {
        std::fs::remove_file(target).context("removing stale symlink at TARGET")?;
        return Ok(());
    }

    let is_empty = std::fs::read_dir(target)
        .map(|mut rd| rd.next().is_none())
        .unwrap_or(true);

    if is_empty {
        std::fs::remove_dir(target).context("removing empty TARGET directory")?;
        return Ok(());
    }

    if local.exists() && std::fs::read_dir(local).map(|mut rd| rd.next().is_some()).unwrap_or(false) {
        bail!(overlayfs_ipc::ErrorKind::ConflictingPaths.errno().to_string());
    }

    tracing::info!(
        component = "MOUNT",
        target = %target.display(),
        local = %local.display(),
        "non-empty TARGET with no LOCAL yet: taking over its contents as LOCAL"
    );
    std::fs::rename(target, local).context("renaming pre-existing TARGET into LOCAL")
}

/// Sets or clears the `FS_IMMUTABLE_FL` inode attribute via `ioctl(2)`, the
/// same mechanism as the teacher's `vrift-cas::protection::set_immutable`
/// Linux branch. On a directory this blocks creating, renaming, or removing
/// entries inside it even by its owner, which is what actually fences LOCAL/
/// EXTERNAL against a user bypassing the overlay -- plain mode bits don't,
/// since the owner is the user. Requires `CAP_LINUX_IMMUTABLE` (root); if the
/// daemon isn't running as root this is a silent no-op, same as the teacher's
/// unsupported-platform branch.
#[cfg(target_os = "linux")]
fn set_immutable(path: &Path, immutable: bool) -> std::io::Result<()> {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    const FS_IMMUTABLE_FL: libc::c_int = 0x00000010;
    const FS_IOC_GETFLAGS: libc::c_ulong = 0x80086601;
    const FS_IOC_SETFLAGS: libc::c_ulong = 0x40086602;

    let file = File::open(path)?;
    let fd = file.as_raw_fd();

    let mut flags: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd, FS_IOC_GETFLAGS, &mut flags) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }

    if immutable {
        flags |= FS_IMMUTABLE_FL;
    } else {
        flags &= !FS_IMMUTABLE_FL;
    }

    let ret = unsafe { libc::ioctl(fd, FS_IOC_SETFLAGS, &flags) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_immutable(_path: &Path, _immutable: bool) -> std::io::Result<()> {
    Ok(())
}

/// Back-end protection (spec.md §4.7 step 6): lock LOCAL/EXTERNAL to 0700
/// *and* set them immutable so the user can't bypass the overlay by writing
/// to the back-end directories directly. Mode is tightened before the
/// immutable flag is set, since once the flag is set the inode (including
/// its own mode bits) can no longer be changed.
fn protect_backend_dir(dir: &Path) -> std::io::Result<()> {
    let mut perm = std::fs::metadata(dir)?.permissions();
    perm.set_mode(0o700);
    std::fs::set_permissions(dir, perm)?;
    set_immutable(dir, true)
}

/// Idempotent even if `protect_backend_dir` never got `CAP_LINUX_IMMUTABLE`
/// and the flag was never actually set: clearing an already-clear flag is a
/// no-op, and the mode restore below always runs.
fn restore_backend_dir(dir: &Path) -> std::io::Result<()> {
    set_immutable(dir, false)?;
    let mut perm = std::fs::metadata(dir)?.permissions();
    perm.set_mode(0o755);
    std::fs::set_permissions(dir, perm)
}

/// Runs the FUSE loop (§4.7 "Recovery"), retrying on unexpected exit with a
/// 3-second cooldown up to 3 attempts per sync pair. Returns once the loop
/// exits for an expected reason (`unmounting` is set) or recovery is
/// exhausted, at which point `mount_errored` is set so the control API can
/// report the mount as `error` (§8 recovery-convergence law: after at most
/// 3 unexpected exits, the mount is either healthy or errored).
///
/// Shaped like the daemon's other interval-driven supervision (the eviction
/// and lock-sweep tickers): each mount attempt is a blocking kernel loop
/// handed to `spawn_blocking`, reaped by `.await`, and a cooldown ticker
/// paces the retry instead of a raw thread sleep, so the unmounting flag is
/// observed every 100ms rather than only between whole attempts.
async fn run_fuse_loop_with_recovery(
    mp: Arc<MountPoint>,
    target: PathBuf,
    unmounting: Arc<AtomicBool>,
    mount_errored: Arc<AtomicBool>,
) {
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        let attempt_mp = mp.clone();
        let attempt_target = target.clone();
        let result = tokio::task::spawn_blocking(move || {
            let fs = OverlayFs::new(attempt_mp);
            fs.mount(&attempt_target)
        })
        .await;

        if unmounting.load(Ordering::Acquire) {
            return;
        }

        match result {
            Ok(Ok(())) => {
                // A clean return from the kernel loop outside of a requested
                // unmount is itself an unexpected exit per §4.7.
                tracing::warn!(component = "MOUNT", attempt = attempts, "FUSE loop returned without an unmount request");
            }
            Ok(Err(e)) => {
                tracing::error!(component = "MOUNT", error = %e, attempt = attempts, "FUSE loop exited unexpectedly");
            }
            Err(e) => {
                tracing::error!(component = "MOUNT", error = %e, attempt = attempts, "FUSE loop task panicked");
            }
        }

        if attempts >= 3 {
            tracing::error!(component = "MOUNT", attempts, "recovery exhausted, marking mount errored");
            mount_errored.store(true, Ordering::Release);
            return;
        }

        let mut cooldown = tokio::time::interval(Duration::from_millis(100));
        let mut waited = Duration::ZERO;
        loop {
            cooldown.tick().await;
            if unmounting.load(Ordering::Acquire) {
                return;
            }
            waited += Duration::from_millis(100);
            if waited >= Duration::from_secs(3) {
                break;
            }
        }
        tracing::warn!(component = "MOUNT", attempt = attempts + 1, "retrying FUSE mount after unexpected exit");
    }
}

/// Waits up to `first` then retries once up to `second` (total) for the
/// kernel mount to register `target` in `/proc/mounts`, per spec.md §4.7
/// step 5. Assumes success on timeout rather than failing the mount.
async fn wait_for_mount_ready(target: &Path, first: Duration, second: Duration) {
    let deadline_first = tokio::time::Instant::now() + first;
    while tokio::time::Instant::now() < deadline_first {
        if is_mounted(target) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let deadline_second = tokio::time::Instant::now() + second.saturating_sub(first);
    while tokio::time::Instant::now() < deadline_second {
        if is_mounted(target) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::warn!(component = "MOUNT", target = %target.display(), "mount readiness probe timed out, assuming success");
}

fn is_mounted(target: &Path) -> bool {
    let target = match target.canonicalize() {
        Ok(p) => p,
        Err(_) => return false,
    };
    let mounts = match std::fs::read_to_string("/proc/mounts") {
        Ok(s) => s,
        Err(_) => return false,
    };
    mounts
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(target.to_string_lossy().as_ref()))
}

fn force_unmount_stale(target: &Path) {
    if is_mounted(target) {
        tracing::warn!(component = "MOUNT", target = %target.display(), "found a stale kernel mount, forcing unmount before takeover");
        let _ = nix::mount::umount2(target, nix::mount::MntFlags::MNT_FORCE);
    }
}

fn request_kernel_unmount(target: &Path) {
    match nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH) {
        Ok(()) => {}
        Err(e) => tracing::warn!(component = "MOUNT", target = %target.display(), error = %e, "kernel unmount request failed"),
    }
}

async fn install_signal_handlers(shutdown: Arc<Notify>, postmortem: Arc<Postmortem>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut hup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
    let mut usr1 = signal(SignalKind::user_defined1()).expect("install SIGUSR1 handler");
    let mut usr2 = signal(SignalKind::user_defined2()).expect("install SIGUSR2 handler");

    loop {
        tokio::select! {
            _ = term.recv() => {
                postmortem.record_signal("SIGTERM");
                shutdown.notify_one();
                return;
            }
            _ = int.recv() => {
                postmortem.record_signal("SIGINT");
                shutdown.notify_one();
                return;
            }
            _ = hup.recv() => {
                postmortem.record_signal("SIGHUP");
                // HUP reloads config without tearing the mount down.
                if let Err(e) = overlayfs_config::reload() {
                    tracing::warn!(component = "DAEMON", error = %e, "config reload on SIGHUP failed");
                }
            }
            _ = usr1.recv() => {
                postmortem.record_signal("SIGUSR1");
                logging::set_level(LogLevel::Debug);
                tracing::info!(component = "DAEMON", "debug logging enabled via SIGUSR1");
            }
            _ = usr2.recv() => {
                postmortem.record_signal("SIGUSR2");
                logging::set_level(LogLevel::Info);
                tracing::info!(component = "DAEMON", "debug logging disabled via SIGUSR2");
            }
        }
    }
}

fn mount_record_path(pair: &str) -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".overlayfs").join("mounts").join(format!("{pair}.json")))
}

fn persist_mount_record(status: &MountStatus) -> Result<()> {
    let Some(path) = mount_record_path(&status.pair) else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&MountRecordJson::from(status))?;
    std::fs::write(path, json)?;
    Ok(())
}

fn remove_mount_record(pair: &str) {
    if let Some(path) = mount_record_path(pair) {
        let _ = std::fs::remove_file(path);
    }
}

/// JSON-friendly mirror of [`MountStatus`] for the on-disk registry record
/// (spec.md §6's "one small mount-registry record").
#[derive(serde::Serialize)]
struct MountRecordJson {
    pair: String,
    target: PathBuf,
    local: PathBuf,
    external: Option<PathBuf>,
    is_mounted: bool,
    external_online: bool,
    mounted_at: Option<SystemTime>,
    file_count: u64,
    total_size: u64,
}

impl From<&MountStatus> for MountRecordJson {
    fn from(s: &MountStatus) -> Self {
        Self {
            pair: s.pair.clone(),
            target: s.target.clone(),
            local: s.local.clone(),
            external: s.external.clone(),
            is_mounted: s.is_mounted,
            external_online: s.external_online,
            mounted_at: s.mounted_at,
            file_count: s.file_count,
            total_size: s.total_size,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pair = cli
        .pair
        .clone()
        .unwrap_or_else(|| compute_project_id(&cli.target));

    let config = Config::load_for_project(&cli.target).unwrap_or_default();
    logging::init_logging(if config.debug_mode() {
        LogLevel::Debug
    } else {
        LogLevel::Info
    });

    tracing::info!(component = "DAEMON", pair = %pair, target = %cli.target.display(), "starting");

    // --- Mount lifecycle (C7) -------------------------------------------------
    let socket_path = get_mount_socket_path(&pair).unwrap_or_else(|| config.socket_path().to_path_buf());
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    if UnixStream::connect(&socket_path).await.is_ok() {
        eprintln!("a daemon is already serving this mount-pair (socket is live)");
        std::process::exit(exit_code::ALREADY_MOUNTED);
    }
    let _ = std::fs::remove_file(&socket_path); // stale socket from a crashed daemon

    force_unmount_stale(&cli.target);
    if let Err(e) = handle_preexisting_target(&cli.target, &cli.local) {
        eprintln!("mount failed: {e}");
        std::process::exit(exit_code::CONFLICTING_PATHS);
    }
    std::fs::create_dir_all(&cli.local).context("creating LOCAL directory")?;
    std::fs::create_dir_all(&cli.target).context("creating TARGET mount point")?;

    let exclude_patterns = compile_exclude_patterns(&config.security.exclude_patterns);
    let mp = Arc::new(MountPoint::new(
        pair.clone(),
        cli.target.clone(),
        cli.local.clone(),
        cli.external.clone(),
        exclude_patterns,
    ));
    mp.set_read_only(cli.read_only || config.mount.read_only);

    let index_path = get_index_db_path(&pair)
        .unwrap_or_else(|| PathBuf::from("/tmp/overlayfs-index").join(&pair));
    let index = Arc::new(FileIndex::open(&index_path).context("opening file index")?);

    let postmortem = Arc::new(Postmortem::new());
    let observer = Arc::new(IndexObserver {
        index: index.clone(),
        pair: pair.clone(),
        local_dir: cli.local.clone(),
        postmortem: postmortem.clone(),
    });
    mp.events.start(observer);

    let fuse_mp = mp.clone();
    let fuse_target = cli.target.clone();
    let unmounting = Arc::new(AtomicBool::new(false));
    let mount_errored = Arc::new(AtomicBool::new(false));
    let fuse_task = tokio::spawn(run_fuse_loop_with_recovery(
        fuse_mp,
        fuse_target,
        unmounting.clone(),
        mount_errored.clone(),
    ));

    wait_for_mount_ready(&cli.target, Duration::from_millis(1500), Duration::from_millis(2500)).await;

    protect_backend_dir(&cli.local).ok();
    if let Some(ext) = cli.external.as_deref() {
        protect_backend_dir(ext).ok();
    }

    let index_had_entries = !index.list(&pair).unwrap_or_default().is_empty();
    let build_result = if index_had_entries {
        incremental_update(&index, &pair, &cli.local, cli.external.as_deref()).map(|(u, r)| u + r)
    } else {
        full_build(&index, &pair, &cli.local, cli.external.as_deref())
    };
    match build_result {
        Ok(n) => tracing::info!(component = "INDEX", pair = %pair, entries = n, "index build complete"),
        Err(e) => tracing::error!(component = "INDEX", pair = %pair, error = %e, "index build failed"),
    }
    mp.set_index_ready(true);

    let state = Arc::new(DaemonState {
        mp: mp.clone(),
        index: index.clone(),
        evictor: Arc::new(EvictionManager::new(config.eviction.clone())),
        config: config.clone(),
        postmortem: postmortem.clone(),
        shutdown: Arc::new(Notify::new()),
        mounted: AtomicBool::new(true),
        mount_errored: mount_errored.clone(),
    });

    if let Ok(status) = state.status() {
        let _ = persist_mount_record(&status);
    }

    // --- Eviction timer (C8) ---------------------------------------------------
    if config.eviction.auto_enabled {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(config.eviction.check_interval_secs));
            loop {
                ticker.tick().await;
                let free = nix::sys::statvfs::statvfs(&state.mp.local_dir)
                    .map(|s| s.blocks_available() as u64 * s.fragment_size() as u64)
                    .unwrap_or(u64::MAX);
                if free >= state.config.eviction.trigger_threshold_bytes {
                    continue;
                }
                match state.evictor.run_pass(
                    &state.index,
                    &state.mp.state,
                    &LoggingSyncRequester,
                    &state.mp.sync_pair_id,
                    &state.mp.local_dir,
                ) {
                    Ok(n) => tracing::info!(component = "EVICT", evicted = n, "auto eviction pass complete"),
                    Err(e) => tracing::warn!(component = "EVICT", error = %e, "eviction pass failed"),
                }
            }
        });
    }

    // --- Recovery watcher --------------------------------------------------------
    // Once the FUSE-loop supervisor gives up (§4.7), the mount is dead but the
    // process must not crash (§7); fold into the normal unmount/cleanup path so
    // the socket, mount record, and back-end protection are torn down instead
    // of left dangling.
    {
        let state = state.clone();
        let mount_errored = mount_errored.clone();
        tokio::spawn(async move {
            loop {
                if mount_errored.load(Ordering::Acquire) {
                    tracing::error!(component = "MOUNT", pair = %state.mp.sync_pair_id, "mount entered error state, shutting down");
                    state.mounted.store(false, Ordering::Release);
                    state.shutdown.notify_one();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
    }

    // --- Lock sweep (C4) --------------------------------------------------------
    {
        let locks = mp.locks.clone();
        tokio::spawn(async move {
            locks.sweep_forever(Duration::from_secs(30)).await;
        });
    }

    // --- Control API server (spec.md §6) ----------------------------------------
    let listener = UnixListener::bind(&socket_path).context("binding control socket")?;
    {
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let state = state.clone();
                        tokio::spawn(serve_connection(state, stream));
                    }
                    Err(e) => {
                        tracing::warn!(component = "DAEMON", error = %e, "accept failed");
                    }
                }
            }
        });
    }

    let shutdown = state.shutdown.clone();
    tokio::select! {
        _ = install_signal_handlers(shutdown.clone(), postmortem.clone()) => {}
        _ = shutdown.notified() => {}
    }

    // --- Unmount sequence (spec.md §4.7) ----------------------------------------
    tracing::info!(component = "MOUNT", pair = %pair, "unmounting");
    state.mounted.store(false, Ordering::Release);
    let _ = index.commit();
    let _ = index.sync();

    unmounting.store(true, Ordering::Release);
    request_kernel_unmount(&cli.target);
    // Harmless even if the supervisor already gave up and set `mount_errored`
    // before this point; `unmounting` short-circuits its retry loop either way.
    let _ = fuse_task.await;

    mp.events.shutdown();
    restore_backend_dir(&cli.local).ok();
    if let Some(ext) = cli.external.as_deref() {
        restore_backend_dir(ext).ok();
    }
    mp.state.clear_all();
    mp.locks.shutdown();

    let _ = std::fs::remove_file(&socket_path);
    remove_mount_record(&pair);

    tracing::info!(component = "MOUNT", pair = %pair, "unmounted cleanly");
    Ok(())
}
