//! `overlayfs mount` / `overlayfs unmount`.
//!
//! Locates the sibling daemon binary next to the current executable and
//! spawns it detached, polling for its control socket to come up. Instead
//! of one shared daemon process, `mount` spawns a fresh `overlayfsd` per
//! sync pair and waits for its control socket before reporting success.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use overlayfs_config::path::compute_project_id;
use overlayfs_ipc::ControlRequest;
use tokio::net::UnixStream;

use crate::client;

#[derive(Args, Debug)]
pub struct MountArgs {
    /// Fast local cache directory.
    #[arg(long)]
    pub local: PathBuf,

    /// Slower or possibly-offline backing directory.
    #[arg(long)]
    pub external: Option<PathBuf>,

    /// Directory the fused view is mounted at.
    #[arg(value_name = "TARGET")]
    pub target: PathBuf,

    /// Sync-pair identity. Defaults to a hash of the canonicalized target.
    #[arg(long)]
    pub pair: Option<String>,

    #[arg(long)]
    pub read_only: bool,
}

#[derive(Args, Debug)]
pub struct UnmountArgs {
    /// Sync-pair identity, or derive one from --target.
    #[arg(long)]
    pub pair: Option<String>,

    #[arg(long)]
    pub target: Option<PathBuf>,
}

pub fn resolve_pair(pair: &Option<String>, target: &Option<PathBuf>) -> Result<String> {
    if let Some(p) = pair {
        return Ok(p.clone());
    }
    if let Some(t) = target {
        return Ok(compute_project_id(t));
    }
    bail!("specify either --pair or --target")
}

pub async fn run_mount(args: MountArgs) -> Result<()> {
    let pair = args
        .pair
        .clone()
        .unwrap_or_else(|| compute_project_id(&args.target));

    let socket = client::socket_path_for(&pair);
    if UnixStream::connect(&socket).await.is_ok() {
        bail!("'{}' is already mounted (socket {} is live)", pair, socket.display());
    }

    let daemon_bin = find_daemon_binary()?;
    tracing::info!(component = "CLI", pair = %pair, binary = ?daemon_bin, "spawning overlayfsd");

    let mut cmd = std::process::Command::new(&daemon_bin);
    cmd.arg("--local")
        .arg(&args.local)
        .arg("--target")
        .arg(&args.target)
        .arg("--pair")
        .arg(&pair);
    if let Some(external) = &args.external {
        cmd.arg("--external").arg(external);
    }
    if args.read_only {
        cmd.arg("--read-only");
    }
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    cmd.spawn().context("failed to spawn overlayfsd")?;

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if UnixStream::connect(&socket).await.is_ok() {
            println!("Mounted '{}' at {}", pair, args.target.display());
            return Ok(());
        }
    }

    bail!(
        "overlayfsd did not come up within 5s (socket {} never appeared)",
        socket.display()
    )
}

pub async fn run_unmount(args: UnmountArgs) -> Result<()> {
    let pair = resolve_pair(&args.pair, &args.target)?;
    let socket = client::socket_path_for(&pair);

    match client::request(&pair, ControlRequest::Unmount { pair: pair.clone() }).await {
        Ok(overlayfs_ipc::ControlResponse::Ok) => {}
        Ok(overlayfs_ipc::ControlResponse::Error(e)) => {
            bail!("unmount refused: {e}");
        }
        Ok(other) => bail!("unexpected response to unmount: {other:?}"),
        Err(e) => return Err(e),
    }

    for _ in 0..50 {
        if UnixStream::connect(&socket).await.is_err() {
            println!("Unmounted '{}'", pair);
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bail!("'{}' did not shut down within 5s", pair)
}

fn find_daemon_binary() -> Result<PathBuf> {
    let name = if cfg!(target_os = "windows") {
        "overlayfsd.exe"
    } else {
        "overlayfsd"
    };

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join(name));
        }
    }
    candidates.push(Path::new("target/release").join(name));
    candidates.push(Path::new("target/debug").join(name));

    candidates
        .into_iter()
        .find(|p| p.exists())
        .context("could not find overlayfsd binary next to overlayfs-cli")
}
