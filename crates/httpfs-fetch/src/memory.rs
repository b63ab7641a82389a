//! In-memory range source.
//!
//! Serves byte ranges from a path -> bytes map with fetch counters and
//! switchable failure injection. Used by the cache and runtime tests;
//! not compiled out because downstream crates need it in their own test
//! builds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::{FetchError, RangeReader, RangeSource, Result};

#[derive(Default)]
struct Inner {
    files: Mutex<HashMap<String, Arc<Vec<u8>>>>,
    opens: AtomicUsize,
    reads: AtomicUsize,
    fail_opens: AtomicBool,
    fail_reads: AtomicBool,
}

/// Cloneable handle to a shared in-memory file set.
#[derive(Clone, Default)]
pub struct MemorySource {
    inner: Arc<Inner>,
}

impl MemorySource {
    pub fn new() -> MemorySource {
        MemorySource::default()
    }

    pub fn insert(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.inner
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), Arc::new(content.into()));
    }

    pub fn remove(&self, path: &str) {
        self.inner.files.lock().unwrap().remove(path);
    }

    /// Number of successful `open` calls (first-block fetches included).
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::Relaxed)
    }

    /// Number of range reads performed after open.
    pub fn read_count(&self) -> usize {
        self.inner.reads.load(Ordering::Relaxed)
    }

    /// Make every subsequent `open` fail with a transport error.
    pub fn fail_opens(&self, fail: bool) {
        self.inner.fail_opens.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent range read fail with a transport error.
    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::Relaxed);
    }
}

impl RangeSource for MemorySource {
    fn open(&self, path: &str, first_block: Option<&mut [u8]>) -> Result<Box<dyn RangeReader>> {
        if self.inner.fail_opens.load(Ordering::Relaxed) {
            return Err(FetchError::Transport("injected open failure".into()));
        }
        let data = self
            .inner
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(path.to_string()))?;
        let mut reader = MemoryReader {
            data,
            inner: self.inner.clone(),
        };
        if let Some(buf) = first_block {
            reader.copy_range(0, buf)?;
        }
        self.inner.opens.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(reader))
    }
}

struct MemoryReader {
    data: Arc<Vec<u8>>,
    inner: Arc<Inner>,
}

impl MemoryReader {
    fn copy_range(&self, offset: u64, dest: &mut [u8]) -> Result<usize> {
        let start = offset as usize;
        let end = start + dest.len();
        if end > self.data.len() {
            return Err(FetchError::ShortRead {
                wanted: dest.len(),
                got: self.data.len().saturating_sub(start),
            });
        }
        dest.copy_from_slice(&self.data[start..end]);
        Ok(dest.len())
    }
}

impl RangeReader for MemoryReader {
    fn read_range(&mut self, offset: u64, dest: &mut [u8]) -> Result<usize> {
        if self.inner.fail_reads.load(Ordering::Relaxed) {
            return Err(FetchError::Transport("injected read failure".into()));
        }
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
        self.copy_range(offset, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_path_is_not_found() {
        let source = MemorySource::new();
        let err = source.open("/nope", None).unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[test]
    fn test_first_block_fetched_on_open() {
        let source = MemorySource::new();
        source.insert("/f", b"hello world".to_vec());
        let mut block = [0u8; 5];
        source.open("/f", Some(&mut block)).unwrap();
        assert_eq!(&block, b"hello");
        assert_eq!(source.open_count(), 1);
        assert_eq!(source.read_count(), 0);
    }

    #[test]
    fn test_range_reads_counted() {
        let source = MemorySource::new();
        source.insert("/f", b"0123456789".to_vec());
        let mut reader = source.open("/f", None).unwrap();
        let mut buf = [0u8; 4];
        reader.read_range(3, &mut buf).unwrap();
        assert_eq!(&buf, b"3456");
        assert_eq!(source.read_count(), 1);
    }

    #[test]
    fn test_out_of_range_read_fails() {
        let source = MemorySource::new();
        source.insert("/f", b"short".to_vec());
        let mut reader = source.open("/f", None).unwrap();
        let mut buf = [0u8; 16];
        assert!(reader.read_range(0, &mut buf).is_err());
    }

    #[test]
    fn test_injected_failures() {
        let source = MemorySource::new();
        source.insert("/f", b"data".to_vec());
        source.fail_opens(true);
        assert!(source.open("/f", None).is_err());
        source.fail_opens(false);

        let mut reader = source.open("/f", None).unwrap();
        source.fail_reads(true);
        let mut buf = [0u8; 2];
        assert!(reader.read_range(0, &mut buf).is_err());
        source.fail_reads(false);
        assert_eq!(reader.read_range(0, &mut buf).unwrap(), 2);
    }
}
