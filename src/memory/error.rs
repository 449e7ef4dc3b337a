//! Error types for the memory access layer.

use thiserror::Error;

/// Errors that can occur while reading a memory snapshot.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("address {0:#x} is not readable")]
    Unreadable(u64),

    #[error("address out of range: {0}")]
    OutOfRange(String),

    #[error("no translation for virtual address {0:#x}")]
    Translation(u64),

    #[error("unsupported read size of {0} bytes")]
    UnsupportedSize(usize),

    #[error("Image size of {found} bytes exceeds the maximum allowed size of {limit} bytes.")]
    ImageTooLarge { limit: u64, found: u64 },

    #[error("An underlying I/O error occurred: {0}")]
    StdIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
