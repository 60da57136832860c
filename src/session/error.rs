use crate::protocol::{Koid, MsgType};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- connection state --------------------------------------
    #[error("already connected to an agent")]
    AlreadyConnected,
    #[error("a connection attempt is already pending")]
    ConnectionPending,
    #[error("a snapshot is open, close it before connecting")]
    SnapshotOpen,
    #[error("not connected to an agent")]
    NotConnected,
    #[error("connection attempt canceled")]
    Canceled,

    // --------------------------------- transport ----------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("connection to the agent lost")]
    ConnectionLost,
    #[error("corrupted stream: declared message size {0} exceeds the limit")]
    StreamCorrupt(u32),

    // --------------------------------- protocol -----------------------------------------------
    #[error("agent hello reply carries a bad signature")]
    BadHandshakeMagic,
    #[error("protocol version mismatch: agent speaks {agent}, client speaks {client}")]
    VersionMismatch { agent: u32, client: u32 },
    #[error("message serialize error: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("message deserialize error: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error("unexpected reply type {0} for transaction {1}")]
    UnexpectedReply(u32, u32),

    // --------------------------------- backend status -----------------------------------------
    #[error("{0}")]
    Backend(String),
    /// Raw nonzero agent status for calls without a more specific mapping.
    #[error("request {request} failed, status={status}")]
    BackendStatus { request: MsgType, status: i32 },

    // --------------------------------- object lifecycle ---------------------------------------
    /// The object a queued callback referenced was destroyed before the
    /// reply arrived. Callbacks still fire, with this error.
    #[error("{0} destroyed while a request was in flight")]
    ObjectGone(&'static str),
    #[error("process {0} is already being debugged")]
    AlreadyAttached(Koid),
    #[error("target is already running a process")]
    TargetAlreadyRunning,
    #[error("target has no running process")]
    NoRunningProcess,
    #[error("job context is already attached")]
    JobAlreadyAttached,
    #[error("job context is not attached")]
    JobNotAttached,
    #[error("binary not found on the target system")]
    BinaryNotFound,
    #[error("the last target cannot be deleted")]
    LastTarget,
    #[error("no stack frames available for this operation")]
    NoStackFrames,

    // --------------------------------- entity lookup ------------------------------------------
    #[error("unknown process {0}")]
    ProcessNotFound(Koid),
    #[error("unknown thread {0}")]
    ThreadNotFound(Koid),
    #[error("symbol `{0}` not found")]
    SymbolNotFound(String),
    #[error("no symbol server has debug info for build id {0}")]
    DebugInfoUnavailable(String),
    #[error("download failed: {0}")]
    DownloadFailed(String),

    // --------------------------------- snapshot backend ---------------------------------------
    #[error("snapshot parse error: {0}")]
    SnapshotParse(#[source] serde_json::Error),
    #[error("operation not recorded in the snapshot")]
    NotInSnapshot,
}

impl Error {
    /// Whether the current connection is unusable after this error.
    /// Fatal errors tear the stream down and implicitly detach everything;
    /// the rest surface to the caller and leave the session connected.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::AlreadyConnected => false,
            Error::ConnectionPending => false,
            Error::SnapshotOpen => false,
            Error::NotConnected => false,
            Error::Canceled => false,
            Error::BadHandshakeMagic => false,
            Error::VersionMismatch { .. } => false,
            Error::Serialize(_) => false,
            Error::Deserialize(_) => false,
            Error::UnexpectedReply(_, _) => false,
            Error::Backend(_) => false,
            Error::BackendStatus { .. } => false,
            Error::ObjectGone(_) => false,
            Error::AlreadyAttached(_) => false,
            Error::TargetAlreadyRunning => false,
            Error::NoRunningProcess => false,
            Error::JobAlreadyAttached => false,
            Error::JobNotAttached => false,
            Error::BinaryNotFound => false,
            Error::LastTarget => false,
            Error::NoStackFrames => false,
            Error::ProcessNotFound(_) => false,
            Error::ThreadNotFound(_) => false,
            Error::SymbolNotFound(_) => false,
            Error::DebugInfoUnavailable(_) => false,
            Error::DownloadFailed(_) => false,
            Error::SnapshotParse(_) => false,
            Error::NotInSnapshot => false,

            // currently fatal errors
            Error::Io(_) => true,
            Error::ConnectionLost => true,
            Error::StreamCorrupt(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "session", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "session", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
