use crate::core::header::Index;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u64),

    #[error("Block size mismatch: file uses {on_disk}, requested {requested}")]
    BlockSizeMismatch { on_disk: u32, requested: u32 },

    #[error("File too small: {len} bytes, header needs {required}")]
    FileTooSmall { len: u64, required: u64 },

    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    #[error("Block file is closed")]
    Closed,

    #[error("Invalid block index: {0}")]
    InvalidIndex(Index),

    #[error("Block {0} is not mapped")]
    NotMapped(Index),

    #[error("Double free of block {0}")]
    DoubleFree(Index),

    #[error("Out of space: block index space exhausted")]
    OutOfSpace,

    #[error("Size class for {0}-byte blocks is not open")]
    SizeClassNotOpen(u32),

    #[error("Pool still has open size classes")]
    PoolOpen,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, BlockFileError>;
