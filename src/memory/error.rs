use thiserror::Error as ThisError;

/// Errors surfaced by a guest memory transport.
///
/// Each variant corresponds to a failure mode a transport can actually hit;
/// `TransportIo` is the catch-all for the underlying file/socket layer, the
/// rest are protocol-level (HMP/QMP framing, libvirt symbol resolution).
#[derive(ThisError, Debug)]
pub enum TransportError {
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport is closed")]
    Closed,

    #[error("libvirt shared library unavailable: {0}")]
    LibvirtUnavailable(String),

    #[error("libvirt call failed: {0}")]
    LibvirtCallFailed(String),

    #[error("qmp handshake failed: {0}")]
    QmpHandshakeFailed(String),

    #[error("qmp response malformed: {0}")]
    QmpMalformedResponse(String),

    #[error("hmp response did not contain expected register {0}")]
    RegisterNotFound(&'static str),

    #[error("hmp memory dump response was truncated: expected {expected} bytes, got {got}")]
    TruncatedDump { expected: usize, got: usize },
}
