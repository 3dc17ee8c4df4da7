//! Read-only view of the bytes a buffer was opened from.
//!
//! Files are memory mapped so that only the pages actually touched by line
//! lookups and the index scan are ever read. The store never changes after
//! construction; all edits live in the overlay.

use crate::error::{EngineError, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A half-open byte range into a [`BackingStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileRegion {
    pub offset: u64,
    pub length: u64,
}

impl FileRegion {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Region covering `[start, end)`
    pub fn from_bounds(start: u64, end: u64) -> Self {
        Self {
            offset: start,
            length: end.saturating_sub(start),
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

enum Storage {
    Mapped(Mmap),
    /// Empty files (which cannot be mapped portably) and in-memory text
    Memory(Vec<u8>),
}

/// Immutable byte source behind a buffer
pub struct BackingStore {
    path: Option<PathBuf>,
    storage: Storage,
}

impl BackingStore {
    /// Open and map a file read-only
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let io_err = |source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(io_err)?;
        let size = file.metadata().map_err(io_err)?.len();

        let storage = if size == 0 {
            Storage::Memory(Vec::new())
        } else {
            // SAFETY: the mapping is read-only. Truncating the file from
            // another process while it is mapped is outside what the
            // engine can defend against, same as any mmap-based reader.
            let mmap = unsafe { Mmap::map(&file) }.map_err(io_err)?;
            Storage::Mapped(mmap)
        };

        tracing::debug!("mapped {} ({} bytes)", path.display(), size);

        Ok(Self {
            path: Some(path.to_path_buf()),
            storage,
        })
    }

    /// Wrap bytes that already live in memory
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            path: None,
            storage: Storage::Memory(bytes),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.storage, Storage::Mapped(_))
    }

    /// Every byte of the store
    pub fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Mapped(mmap) => mmap,
            Storage::Memory(bytes) => bytes,
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// Zero-copy view of `[start, end)`
    pub fn slice(&self, start: u64, end: u64) -> Result<&[u8]> {
        let len = self.len();
        if end > len {
            return Err(EngineError::OutOfRange { offset: end, len });
        }
        if start > end {
            return Err(EngineError::OutOfRange { offset: start, len: end });
        }
        Ok(&self.bytes()[start as usize..end as usize])
    }

    pub fn region(&self, region: FileRegion) -> Result<&[u8]> {
        self.slice(region.offset, region.end())
    }

    /// Release the mapping
    pub fn close(self) {
        if let Some(path) = &self.path {
            tracing::debug!("unmapping {}", path.display());
        }
    }
}

impl std::fmt::Debug for BackingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingStore")
            .field("path", &self.path)
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_open_maps_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello\nworld\n").unwrap();
        file.flush().unwrap();

        let store = BackingStore::open(file.path()).unwrap();
        assert!(store.is_mapped());
        assert_eq!(store.len(), 12);
        assert_eq!(store.slice(6, 11).unwrap(), b"world");
        assert_eq!(store.region(FileRegion::new(0, 5)).unwrap(), b"hello");
    }

    #[test]
    fn test_empty_file_is_not_mapped() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = BackingStore::open(file.path()).unwrap();
        assert!(!store.is_mapped());
        assert!(store.is_empty());
        assert_eq!(store.slice(0, 0).unwrap(), b"");
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.txt");
        match BackingStore::open(&missing) {
            Err(EngineError::Io { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn test_slice_out_of_range() {
        let store = BackingStore::from_bytes(b"abc".to_vec());
        assert!(matches!(
            store.slice(0, 4),
            Err(EngineError::OutOfRange { offset: 4, len: 3 })
        ));
        assert!(store.slice(2, 1).is_err());
        assert_eq!(store.slice(3, 3).unwrap(), b"");
    }

    #[test]
    fn test_file_region_bounds() {
        let region = FileRegion::from_bounds(4, 10);
        assert_eq!(region.length, 6);
        assert_eq!(region.end(), 10);
        assert!(FileRegion::from_bounds(5, 5).is_empty());
    }
}
