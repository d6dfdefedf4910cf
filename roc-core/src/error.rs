use crate::types::{CardId, ResetLevel};

/// Error currency for the whole crate. Every public operation returns
/// `Result<T, Error>`; nothing in the core panics on a recoverable
/// condition or uses exceptions-as-control-flow.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no card matches identifier {id:?}")]
    CardNotFound { id: CardId },

    #[error("channel {channel} is not valid for this card family")]
    InvalidChannel { channel: u32 },

    #[error("bad parameter `{key}`: {reason}")]
    BadParameter { key: String, reason: String },

    #[error("failed to acquire channel lock: {reason}")]
    LockFailed { reason: String },

    #[error("channel lock file is held by another process")]
    FileLocked,

    #[error("channel named mutex is held by a process that no longer holds the file lock")]
    NamedMutexLocked,

    #[error("buffer too small: got {got} bytes, need at least {need} bytes")]
    BufferTooSmall { got: usize, need: usize },

    #[error("SGL entry too small: got {got} bytes, need at least {need} bytes")]
    SglEntryTooSmall { got: usize, need: usize },

    #[error("DMA buffer registration failed: {reason}")]
    DmaRegistrationFailed { reason: String },

    #[error("operation not valid in current state: {reason}")]
    BadState { reason: String },

    #[error("invalid superpage: {reason}")]
    BadSuperpage { reason: String },

    #[error("transfer queue is full")]
    QueueFull,

    #[error("transfer queue is empty")]
    QueueEmpty,

    #[error("slot {slot} reported a hardware arrival error (status=0x{status:08x})")]
    ArrivalError { slot: u32, status: u32 },

    #[error("reset step failed at level {level:?} (loopback={loopback_mode:?})")]
    ResetFailed {
        level: ResetLevel,
        loopback_mode: crate::types::LoopbackMode,
    },

    #[error("firmware compile-info register has unexpected reserved bits: 0x{raw:08x}")]
    FirmwareMagicMismatch { raw: u32 },

    #[error("value unavailable")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, Error>;
