use thiserror::Error as ThisError;

use crate::memory::TransportError;

/// Top-level error type for the introspection engine.
///
/// Each component keeps its own error enum (`TransportError`, …) and this
/// type stitches them together with `#[from]`, mirroring the teacher's
/// `src/vm/error.rs` / `kernel/src/error.rs` split.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("guest memory transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("required symbol missing: {0}")]
    SymbolMissing(String),

    #[error("vmcoreinfo missing or malformed: {0}")]
    VmcoreinfoMissing(String),

    #[error("address translation failed for {kind} address {addr:#x}")]
    TranslationFailed { kind: &'static str, addr: u64 },

    #[error("printk decoder state is inconsistent: {0}")]
    DecoderInconsistent(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
