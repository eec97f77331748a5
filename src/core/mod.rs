//! Block file storage engine

pub mod block_file;
pub mod config;
pub mod error;
pub mod header;
pub mod pool;
pub mod store;
pub mod sys;
