//! Control API client: connects to a running `overlayfsd` over its
//! per-mount-pair Unix socket and round-trips a single request.
//!
//! `connect`/`send_request`/`read_response` over `overlayfs-ipc`'s framed
//! header, resolving the socket per mount pair rather than one global
//! daemon socket.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use overlayfs_ipc::{frame, next_seq_id, ControlRequest, ControlResponse};
use tokio::net::UnixStream;

pub fn socket_path_for(pair: &str) -> PathBuf {
    overlayfs_config::path::get_mount_socket_path(pair)
        .unwrap_or_else(|| overlayfs_config::config().socket_path().to_path_buf())
}

/// Connects to the daemon owning `pair`. Does not attempt to spawn one:
/// each `overlayfsd` process is bootstrapped with its own mount arguments,
/// so there is nothing generic to spawn here.
pub async fn connect(pair: &str) -> Result<UnixStream> {
    let socket = socket_path_for(pair);
    UnixStream::connect(&socket).await.with_context(|| {
        format!(
            "no overlayfsd listening on {} -- is '{}' mounted?",
            socket.display(),
            pair
        )
    })
}

pub async fn request(pair: &str, req: ControlRequest) -> Result<ControlResponse> {
    let mut stream = connect(pair).await?;
    let seq = next_seq_id();
    frame::write_request(&mut stream, &req, seq)
        .await
        .context("sending control request")?;
    let (resp_seq, resp) = frame::read_response(&mut stream)
        .await
        .context("reading control response")?;
    if resp_seq != seq {
        bail!("control socket returned out-of-order response");
    }
    Ok(resp)
}
