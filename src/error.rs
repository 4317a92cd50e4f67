//! Error types untuk transport core
//!
//! Dua lapis error:
//! - `NetError`: kegagalan di sisi Rust (constructor, bind, connect, loop setup)
//! - `ErrorCode` (lihat `protocol::error_code`): kode yang dibawa di dalam frame,
//!   dikembalikan ke caller lewat continuation, tidak pernah sebagai panic.

use std::io;

use thiserror::Error;

use crate::protocol::{CodecError, ErrorCode};

/// Result alias yang dipakai di seluruh crate
pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("an event loop is already bound to thread {0}")]
    LoopAlreadyBound(String),

    #[error("invalid address `{0}`")]
    InvalidAddress(String),

    #[error("connect failed ({code}): {info}")]
    Connect { code: ErrorCode, info: String },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("io thread {0} failed to start")]
    IoThreadStart(usize),

    #[error("io thread {0} is no longer running")]
    IoThreadGone(usize),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NetError {
    /// Kode wire yang paling dekat dengan error ini
    pub fn error_code(&self) -> ErrorCode {
        match self {
            NetError::Connect { code, .. } => *code,
            NetError::Codec(e) => e.error_code(),
            NetError::InvalidAddress(_) => ErrorCode::RpcPeerAddr,
            NetError::LoopAlreadyBound(_)
            | NetError::IoThreadStart(_)
            | NetError::IoThreadGone(_)
            | NetError::Config(_) => ErrorCode::RpcChannelInit,
            NetError::Io(_) => ErrorCode::FailedConnect,
        }
    }
}
