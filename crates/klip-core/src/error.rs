// crates/klip-core/src/error.rs
//
// Error taxonomy shared by every crate in the workspace. Kinds, not types:
// the variants name *why* an operation failed, not which subsystem raised it.

use thiserror::Error;

/// The error taxonomy surfaced across worker, player, and pre-render
/// operations. Background tasks (the stream loop, the capture loop) log and
/// fall through instead of propagating these; they only return from calls a
/// caller is actively awaiting.
#[derive(Debug, Error)]
pub enum KlipError {
    /// Container or codec not decodable. Fatal to the affected clip, never
    /// fatal to the Player.
    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),

    /// One packet failed to decode. The caller should log and drop the
    /// frame; playback continues.
    #[error("transient decode error: {0}")]
    DecodeTransient(String),

    /// Decoder callback missed within the decode timeout. The decoder is
    /// marked not-ready until the next keyframe.
    #[error("decode timed out waiting for a frame")]
    DecodeTimeout,

    /// Caller aborted a seek/load/pre-render. No partial state is left
    /// behind.
    #[error("operation cancelled")]
    Cancelled,

    /// Worker pool saturated at `loadClip` time.
    #[error("worker pool exhausted")]
    Exhausted,

    /// Record/stop invoked before pre-initialisation.
    #[error("workers not ready")]
    WorkersNotReady,

    /// Catch-all for I/O and FFI failures that don't fit the taxonomy above
    /// (e.g. a Muxer write failure, a malformed project record).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, KlipError>;
