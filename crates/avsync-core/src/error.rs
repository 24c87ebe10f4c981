//! Pipeline error taxonomy.
//!
//! Decode-local failures ([`PipelineError::TransientDecode`],
//! [`PipelineError::SeekFailed`]) are absorbed and logged inside the decode
//! worker. Only [`PipelineError::OpenFailed`] and
//! [`PipelineError::FatalFormat`] ever reach the caller as a definite failure.

use crate::container::ContainerError;

/// Errors surfaced by the playback pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Container or decoder could not be opened; no worker was spawned
    OpenFailed(String),
    /// Pixel or sample layout with no safe conversion path
    FatalFormat(String),
    /// A single packet or frame failed to decode
    TransientDecode(String),
    /// Seek could not be honored on any stream
    SeekFailed(String),
    /// Worker thread could not be spawned or joined
    Thread(String),
}

impl PipelineError {
    /// Returns true for errors that terminate the decode worker.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::FatalFormat(_) | PipelineError::Thread(_))
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::OpenFailed(msg) => write!(f, "Failed to open media: {msg}"),
            PipelineError::FatalFormat(msg) => write!(f, "Unsupported format: {msg}"),
            PipelineError::TransientDecode(msg) => write!(f, "Decode failed: {msg}"),
            PipelineError::SeekFailed(msg) => write!(f, "Seek failed: {msg}"),
            PipelineError::Thread(msg) => write!(f, "Decode thread error: {msg}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<ContainerError> for PipelineError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::Unsupported(msg) => PipelineError::FatalFormat(msg),
            ContainerError::DecoderNotFound(msg) | ContainerError::Io(msg) => {
                PipelineError::OpenFailed(msg)
            }
            ContainerError::Again => {
                PipelineError::TransientDecode("resource temporarily unavailable".to_string())
            }
            ContainerError::InvalidData(msg) => PipelineError::TransientDecode(msg),
            ContainerError::SeekRejected(msg) => PipelineError::SeekFailed(msg),
        }
    }
}
