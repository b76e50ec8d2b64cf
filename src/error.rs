use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Reading a file into memory failed.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("file is too large ({size} bytes)")]
    TooLarge { size: u64 },
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: u64 },
    #[error("load aborted")]
    Aborted,
    #[error("{0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported or corrupt image: {0}")]
    Format(String),
    #[error("image has zero size")]
    Empty,
}

/// Why a cache entry has no pixels.
#[derive(Debug, Error)]
pub enum LoadFailure {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl LoadFailure {
    pub fn is_aborted(&self) -> bool {
        matches!(self, LoadFailure::Load(LoadError::Aborted))
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("folder not found: {0}")]
    NotFound(PathBuf),
    #[error("not a folder: {0}")]
    NotADirectory(PathBuf),
    #[error("scan aborted")]
    Aborted,
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// The display collaborator could not present an entry.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("display rejected the image: {0}")]
    Rejected(String),
    #[error("entry has no pixels to show")]
    NothingToShow,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid memory size '{0}' (expected e.g. 512MB or 2GB)")]
    MemorySize(String),
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("could not start folder scanner: {0}")]
    Scanner(io::Error),
}
