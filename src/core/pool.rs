//! Block files for several block sizes under one name prefix
//!
//! Each power-of-two size class gets its own [`BlockFile`] named
//! `<base><class>`, opened the first time that size is used.

use crate::core::block_file::{BlockFile, BlockPtr};
use crate::core::config::PoolConfig;
use crate::core::error::{BlockFileError, Result};
use crate::core::header::Index;
use std::ffi::OsString;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub struct BlockFilePool {
    base: PathBuf,
    config: PoolConfig,
    files: Vec<Option<BlockFile>>,
}

impl BlockFilePool {
    /// Pool with the default size classes
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        let config = PoolConfig::default();
        let files = (0..config.size_classes()).map(|_| None).collect();
        BlockFilePool {
            base: base.into(),
            config,
            files,
        }
    }

    pub fn with_config<P: Into<PathBuf>>(base: P, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let files = (0..config.size_classes()).map(|_| None).collect();
        Ok(BlockFilePool {
            base: base.into(),
            config,
            files,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn size_classes(&self) -> usize {
        self.files.len()
    }

    /// Size class for `block_size`
    pub fn file_index(&self, block_size: u32) -> Result<usize> {
        self.config
            .class_index(block_size)
            .ok_or(BlockFileError::InvalidBlockSize(block_size as u64))
    }

    /// Backing file of size class `class`
    pub fn file_name(&self, class: usize) -> PathBuf {
        let mut name = OsString::from(self.base.as_os_str());
        name.push(class.to_string());
        PathBuf::from(name)
    }

    pub fn is_class_open(&self, block_size: u32) -> bool {
        self.file_index(block_size)
            .map(|class| self.files[class].is_some())
            .unwrap_or(false)
    }

    fn open_class(&mut self, class: usize) -> Result<&mut BlockFile> {
        if self.files[class].is_none() {
            let path = self.file_name(class);
            let block_size = self.config.class_block_size(class);
            debug!("Opening size class {} ({}-byte blocks)", class, block_size);
            let file = BlockFile::open_with(&path, block_size, self.config.growth_increment)?;
            self.files[class] = Some(file);
        }

        self.files[class]
            .as_mut()
            .ok_or(BlockFileError::SizeClassNotOpen(self.config.class_block_size(class)))
    }

    fn opened_class(&mut self, block_size: u32) -> Result<&mut BlockFile> {
        let class = self.file_index(block_size)?;
        self.files[class]
            .as_mut()
            .ok_or(BlockFileError::SizeClassNotOpen(block_size))
    }

    /// The block file for `block_size`, opened on first use
    pub fn file_mut(&mut self, block_size: u32) -> Result<&mut BlockFile> {
        let class = self.file_index(block_size)?;
        self.open_class(class)
    }

    pub fn allocate_block(&mut self, block_size: u32) -> Result<(BlockPtr, Index)> {
        self.file_mut(block_size)?.allocate_block()
    }

    pub fn ref_block(&mut self, block_size: u32, index: Index) -> Result<BlockPtr> {
        self.file_mut(block_size)?.ref_block(index)
    }

    /// Free a block of a size class that is already open
    pub fn free_block(&mut self, block_size: u32, index: Index) -> Result<()> {
        self.opened_class(block_size)?.free_block(index)
    }

    /// Release a reference in a size class that is already open
    pub fn unref_block(&mut self, block_size: u32, index: Index) -> Result<()> {
        self.opened_class(block_size)?.unref_block(index);
        Ok(())
    }

    /// Close every open size class.
    ///
    /// All classes are attempted; the first failure is returned.
    pub fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        let mut closed = 0;

        for (class, slot) in self.files.iter_mut().enumerate() {
            let Some(mut file) = slot.take() else {
                continue;
            };
            closed += 1;
            if let Err(e) = file.close() {
                warn!("Failed to close size class {}: {}", class, e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        info!("Closed {} size classes of pool {:?}", closed, self.base);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Delete the backing file of every size class that exists on disk.
    ///
    /// Refuses to run while any class is open here. Every file is
    /// attempted; the first failure is returned.
    pub fn clean(&self) -> Result<()> {
        if self.files.iter().any(Option::is_some) {
            return Err(BlockFileError::PoolOpen);
        }

        let mut first_err = None;
        let mut removed = 0;

        for class in 0..self.size_classes() {
            let path = self.file_name(class);
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to remove {:?}: {}", path, e);
                    if first_err.is_none() {
                        first_err = Some(BlockFileError::Io(e));
                    }
                }
            }
        }

        info!("Removed {} backing files of pool {:?}", removed, self.base);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool_in(dir: &TempDir) -> BlockFilePool {
        BlockFilePool::new(dir.path().join("pool-"))
    }

    #[test]
    fn test_file_index() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir);

        assert_eq!(pool.file_index(4096).unwrap(), 0);
        assert_eq!(pool.file_index(65536).unwrap(), 4);
        assert!(matches!(
            pool.file_index(3000),
            Err(BlockFileError::InvalidBlockSize(3000))
        ));
        assert!(pool.file_index(2 * 1024 * 1024).is_err());
    }

    #[test]
    fn test_file_name_appends_class() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir);
        assert_eq!(pool.file_name(3), dir.path().join("pool-3"));
    }

    #[test]
    fn test_lazy_open() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool_in(&dir);
        assert!(!pool.is_class_open(8192));

        let (_, index) = pool.allocate_block(8192).unwrap();
        assert_eq!(index, 0);
        assert!(pool.is_class_open(8192));
        assert!(!pool.is_class_open(4096));

        assert!(pool.file_name(1).exists());
        assert!(!pool.file_name(0).exists());
        assert!(!pool.file_name(2).exists());
    }

    #[test]
    fn test_free_before_open_is_usage_error() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool_in(&dir);

        assert!(matches!(
            pool.free_block(4096, 0),
            Err(BlockFileError::SizeClassNotOpen(4096))
        ));
        assert!(matches!(
            pool.unref_block(4096, 0),
            Err(BlockFileError::SizeClassNotOpen(4096))
        ));
        assert!(!pool.file_name(0).exists());
    }

    #[test]
    fn test_delegates_to_class_file() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool_in(&dir);

        let (_, a) = pool.allocate_block(4096).unwrap();
        let (_, b) = pool.allocate_block(4096).unwrap();
        pool.free_block(4096, a).unwrap();
        pool.unref_block(4096, b).unwrap();

        let file = pool.file_mut(4096).unwrap();
        assert_eq!(file.free_list_head(), a);
        assert_eq!(file.mapped_blocks(), 0);

        let ptr = pool.ref_block(4096, b).unwrap();
        assert_eq!(ptr.len(), 4096);
        pool.unref_block(4096, b).unwrap();
    }

    #[test]
    fn test_close_then_clean() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool_in(&dir);
        pool.allocate_block(4096).unwrap();
        pool.allocate_block(16384).unwrap();

        assert!(matches!(pool.clean(), Err(BlockFileError::PoolOpen)));
        assert!(pool.file_name(0).exists());

        pool.close().unwrap();
        pool.close().unwrap();
        pool.clean().unwrap();

        for class in 0..pool.size_classes() {
            assert!(!pool.file_name(class).exists());
        }
    }

    #[test]
    fn test_custom_config() {
        let dir = TempDir::new().unwrap();
        let config = PoolConfig::builder()
            .min_block_size(1024)
            .max_block_size(8192)
            .growth_increment(16 * 1024)
            .build()
            .unwrap();
        let mut pool = BlockFilePool::with_config(dir.path().join("small-"), config).unwrap();

        assert_eq!(pool.size_classes(), 4);
        pool.allocate_block(1024).unwrap();
        assert_eq!(pool.file_mut(1024).unwrap().block_size(), 1024);
        assert!(pool.allocate_block(16384).is_err());
    }
}
