//! Control API wire protocol (spec.md §6): a framed request/response
//! protocol the sync and UI collaborators use to drive a mounted overlay
//! over a Unix domain socket.
//!
//! Frame layout is magic + type/version + flags + length + sequence id,
//! widened from a 16-bit to a 32-bit length since `ListEntries`/
//! `GetEvictable` responses on a large mount can exceed 64 KiB. The payload
//! codec is `bincode`: this protocol carries mount-control messages, not
//! zero-copy content-addressed blobs, so plain `serde` round-tripping is the
//! right tradeoff (see DESIGN.md).

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use overlayfs_evict::EvictionStats;
use overlayfs_index::{FileEntry, IndexStats};

/// Frame magic: "VR" (overlay engine, Rust).
pub const IPC_MAGIC: [u8; 2] = *b"VR";

/// Wire protocol version. Bump when [`ControlRequest`]/[`ControlResponse`]
/// change shape in a way that isn't forward-compatible.
pub const PROTOCOL_VERSION: u8 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Request = 0,
    Response = 1,
    Heartbeat = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Request),
            1 => Ok(FrameType::Response),
            2 => Ok(FrameType::Heartbeat),
            _ => Err(()),
        }
    }
}

/// Fixed 12-byte frame header.
///
/// ```text
/// ┌──────────┬────────────┬─────────┬──────────┬──────────┐
/// │Magic (2B)│Type+Ver(1B)│Flags(1B)│Length(4B)│SeqID (4B)│
/// │  "VR"    │ hi4=type   │reserved │ LE u32   │  LE u32  │
/// │          │ lo4=version│         │          │          │
/// └──────────┴────────────┴─────────┴──────────┴──────────┘
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub magic: [u8; 2],
    pub type_ver: u8,
    pub flags: u8,
    pub length: u32,
    pub seq_id: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 12;
    pub const MAX_LENGTH: usize = 64 * 1024 * 1024;

    pub fn new(frame_type: FrameType, length: u32, seq_id: u32) -> Self {
        Self {
            magic: IPC_MAGIC,
            type_ver: ((frame_type as u8) << 4) | (PROTOCOL_VERSION & 0x0F),
            flags: 0,
            length,
            seq_id,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == IPC_MAGIC
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::try_from(self.type_ver >> 4).ok()
    }

    pub fn version(&self) -> u8 {
        self.type_ver & 0x0F
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.magic);
        out[2] = self.type_ver;
        out[3] = self.flags;
        out[4..8].copy_from_slice(&self.length.to_le_bytes());
        out[8..12].copy_from_slice(&self.seq_id.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1]],
            type_ver: bytes[2],
            flags: bytes[3],
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            seq_id: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        }
    }
}

static NEXT_SEQ_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(1);

pub fn next_seq_id() -> u32 {
    NEXT_SEQ_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame magic")]
    BadMagic,
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("unexpected frame type")]
    UnexpectedFrameType,
}

pub type Result<T> = std::result::Result<T, IpcError>;

/// Async frame IO over any `tokio::io::AsyncRead`/`AsyncWrite` stream
/// (a `UnixStream` in every real deployment, an in-memory duplex in tests).
pub mod frame {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    pub async fn write_request<W: AsyncWrite + Unpin>(
        w: &mut W,
        req: &ControlRequest,
        seq_id: u32,
    ) -> Result<()> {
        write_frame(w, FrameType::Request, req, seq_id).await
    }

    pub async fn write_response<W: AsyncWrite + Unpin>(
        w: &mut W,
        resp: &ControlResponse,
        seq_id: u32,
    ) -> Result<()> {
        write_frame(w, FrameType::Response, resp, seq_id).await
    }

    async fn write_frame<W: AsyncWrite + Unpin, T: Serialize>(
        w: &mut W,
        frame_type: FrameType,
        payload: &T,
        seq_id: u32,
    ) -> Result<()> {
        let bytes = bincode::serialize(payload)?;
        if bytes.len() > FrameHeader::MAX_LENGTH {
            return Err(IpcError::TooLarge(bytes.len()));
        }
        let header = FrameHeader::new(frame_type, bytes.len() as u32, seq_id);
        w.write_all(&header.to_bytes()).await?;
        w.write_all(&bytes).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<FrameHeader> {
        let mut buf = [0u8; FrameHeader::SIZE];
        r.read_exact(&mut buf).await?;
        let header = FrameHeader::from_bytes(buf);
        if !header.is_valid() {
            return Err(IpcError::BadMagic);
        }
        if header.version() != PROTOCOL_VERSION {
            return Err(IpcError::UnsupportedVersion(header.version()));
        }
        if header.length as usize > FrameHeader::MAX_LENGTH {
            return Err(IpcError::TooLarge(header.length as usize));
        }
        Ok(header)
    }

    pub async fn read_request<R: AsyncRead + Unpin>(
        r: &mut R,
    ) -> Result<(u32, ControlRequest)> {
        let header = read_header(r).await?;
        if header.frame_type() != Some(FrameType::Request) {
            return Err(IpcError::UnexpectedFrameType);
        }
        let mut payload = vec![0u8; header.length as usize];
        r.read_exact(&mut payload).await?;
        Ok((header.seq_id, bincode::deserialize(&payload)?))
    }

    pub async fn read_response<R: AsyncRead + Unpin>(
        r: &mut R,
    ) -> Result<(u32, ControlResponse)> {
        let header = read_header(r).await?;
        if header.frame_type() != Some(FrameType::Response) {
            return Err(IpcError::UnexpectedFrameType);
        }
        let mut payload = vec![0u8; header.length as usize];
        r.read_exact(&mut payload).await?;
        Ok((header.seq_id, bincode::deserialize(&payload)?))
    }
}

// ============================================================================
// Control API operations (spec.md §6)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlRequest {
    Ping,
    /// Mount lifecycle. `Mount` is normally only sent to a freshly spawned
    /// daemon process bootstrapped with the same arguments on its command
    /// line; it is accepted over the socket too so a supervisor can drive
    /// lifecycle uniformly.
    Mount {
        pair: String,
        local: PathBuf,
        external: Option<PathBuf>,
        target: PathBuf,
    },
    Unmount {
        pair: String,
    },
    Status,
    Diagnostics,

    UpdateExternal {
        pair: String,
        path: Option<PathBuf>,
    },
    SetExternalOffline {
        pair: String,
        offline: bool,
    },
    SetReadOnly {
        pair: String,
        read_only: bool,
    },
    SetIndexReady {
        pair: String,
        ready: bool,
    },
    IsIndexReady {
        pair: String,
    },

    MarkEvicting {
        path: String,
    },
    UnmarkEvicting {
        path: String,
    },
    ClearEvicting,

    SyncLock {
        path: String,
    },
    SyncUnlock {
        path: String,
    },
    SyncUnlockAll,

    GetEntry {
        pair: String,
        path: String,
    },
    ListEntries {
        pair: String,
    },
    GetDirty {
        pair: String,
    },
    GetFilesToSync {
        pair: String,
    },
    GetEvictable {
        pair: String,
    },
    Stats {
        pair: String,
    },
    Rebuild {
        pair: String,
    },

    Evict {
        path: String,
    },
    Prefetch {
        path: String,
    },
    EvictionStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidArgument,
    NoEntry,
    Busy,
    AccessDenied,
    ReadOnly,
    Exists,
    NotADirectory,
    IsADirectory,
    TooManyOpenFiles,
    TooManyLinks,
    IoError,
    NoSpace,
    ConflictingPaths,
    NotMounted,
    AlreadyMounted,
    MountFailed,
}

impl ErrorKind {
    /// The kernel-boundary errno each kind corresponds to (spec.md §7).
    pub fn errno(self) -> i32 {
        match self {
            ErrorKind::InvalidArgument => libc_einval(),
            ErrorKind::NoEntry => libc_enoent(),
            ErrorKind::Busy => libc_ebusy(),
            ErrorKind::AccessDenied => libc_eacces(),
            ErrorKind::ReadOnly => libc_erofs(),
            ErrorKind::Exists => libc_eexist(),
            ErrorKind::NotADirectory => libc_enotdir(),
            ErrorKind::IsADirectory => libc_eisdir(),
            ErrorKind::TooManyOpenFiles => libc_emfile(),
            ErrorKind::TooManyLinks => libc_eloop(),
            ErrorKind::IoError => libc_eio(),
            ErrorKind::NoSpace => libc_enospc(),
            ErrorKind::ConflictingPaths | ErrorKind::MountFailed => libc_eio(),
            ErrorKind::NotMounted | ErrorKind::AlreadyMounted => libc_ebusy(),
        }
    }
}

// Thin wrappers so this crate doesn't need a direct `libc` dependency just
// for sixteen error constants shared with `overlayfs-fuse`/`overlayfs-cli`.
fn libc_einval() -> i32 {
    22
}
fn libc_enoent() -> i32 {
    2
}
fn libc_ebusy() -> i32 {
    16
}
fn libc_eacces() -> i32 {
    13
}
fn libc_erofs() -> i32 {
    30
}
fn libc_eexist() -> i32 {
    17
}
fn libc_enotdir() -> i32 {
    20
}
fn libc_eisdir() -> i32 {
    21
}
fn libc_emfile() -> i32 {
    24
}
fn libc_eloop() -> i32 {
    40
}
fn libc_eio() -> i32 {
    5
}
fn libc_enospc() -> i32 {
    28
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ControlError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ControlError {}

/// Mirrors the persisted mount-registry record (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountStatus {
    pub pair: String,
    pub target: PathBuf,
    pub local: PathBuf,
    pub external: Option<PathBuf>,
    pub is_mounted: bool,
    pub external_online: bool,
    pub read_only: bool,
    pub index_ready: bool,
    pub mounted_at: Option<SystemTime>,
    pub file_count: u64,
    pub total_size: u64,
    /// Set once recovery (spec.md §4.7) has exhausted its retry budget for
    /// this mount-pair. A mount in this state stays registered but will not
    /// be retried again without an explicit re-mount.
    pub error: bool,
}

/// Mirrors the diagnostics struct of spec.md §6, fed by C9's exit
/// postmortem collection and C6's queue counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub is_mounted: bool,
    pub is_loop_running: bool,
    pub channel_valid: bool,
    pub macfuse_dev_count: u32,
    pub total_ops: u64,
    pub last_op_time: Option<SystemTime>,
    pub last_signal: Option<String>,
    pub cb_queued: u64,
    pub cb_processed: u64,
    pub cb_dropped: u64,
    pub cb_pending: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    Ok,
    Pong,
    Bool(bool),
    Entry(Option<FileEntry>),
    Entries(Vec<FileEntry>),
    Stats(IndexStats),
    EvictionStats(EvictionStats),
    Status(MountStatus),
    Diagnostics(Diagnostics),
    Error(ControlError),
}

impl ControlResponse {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ControlResponse::Error(ControlError::new(kind, message))
    }
}

/// Exit codes for the `overlayfs-cli` control tool (spec.md §6).
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERIC: i32 = 1;
    pub const INVALID_ARGUMENT: i32 = 2;
    pub const ALREADY_MOUNTED: i32 = 3;
    pub const NOT_MOUNTED: i32 = 4;
    pub const MOUNT_FAILED: i32 = 5;
    pub const CONFLICTING_PATHS: i32 = 6;

    pub fn for_error_kind(kind: super::ErrorKind) -> i32 {
        use super::ErrorKind::*;
        match kind {
            InvalidArgument => INVALID_ARGUMENT,
            AlreadyMounted => ALREADY_MOUNTED,
            NotMounted => NOT_MOUNTED,
            MountFailed => MOUNT_FAILED,
            ConflictingPaths => CONFLICTING_PATHS,
            _ => GENERIC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = FrameHeader::new(FrameType::Request, 42, 7);
        let bytes = h.to_bytes();
        let h2 = FrameHeader::from_bytes(bytes);
        assert!(h2.is_valid());
        assert_eq!(h2.frame_type(), Some(FrameType::Request));
        assert_eq!(h2.version(), PROTOCOL_VERSION);
        assert_eq!(h2.length, 42);
        assert_eq!(h2.seq_id, 7);
    }

    #[tokio::test]
    async fn frames_round_trip_over_a_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let req = ControlRequest::Evict {
            path: "/foo/bar.bin".into(),
        };
        frame::write_request(&mut a, &req, 1).await.unwrap();
        let (seq, got) = frame::read_request(&mut b).await.unwrap();
        assert_eq!(seq, 1);
        matches!(got, ControlRequest::Evict { path } if path == "/foo/bar.bin");

        let resp = ControlResponse::error(ErrorKind::Busy, "path is syncing");
        frame::write_response(&mut b, &resp, 1).await.unwrap();
        let (seq, got) = frame::read_response(&mut a).await.unwrap();
        assert_eq!(seq, 1);
        match got {
            ControlResponse::Error(e) => assert_eq!(e.kind, ErrorKind::Busy),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
