//! Error type for this library

use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fatal errors. Any of these ends the invocation without touching the device.
///
/// Failures of individual bootloader, mount or rename commands are not represented here: they
/// end the validation sequence with a reported verdict instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Partition assignment is missing or differs from the one recorded when the sequence started.
    #[error("Configuration consistency error: {0}")]
    ConfigConsistency(String),
    #[error("Persistent state {path:?} is corrupt: {source}")]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Unknown validation step {0:?}")]
    UnknownStep(String),
    #[error("Failed to serialize persistent state: {0}")]
    Serialize(serde_json::Error),
    #[error("IO Error: {0}")]
    IoError(#[from] io::Error),
}
