//! # httpfs-fetch
//!
//! The range-fetch capability: given a remote target and a byte range,
//! return exactly those bytes or fail.
//!
//! [`RangeSource`] opens a bound connection per file path (optionally
//! fetching a first block of bytes as part of connection establishment,
//! or probing existence only), and [`RangeReader`] performs the actual
//! range reads. The HTTP implementation rides on `ureq` with `Range`
//! request headers; [`memory::MemorySource`] is an in-memory
//! implementation for tests.

pub mod memory;

mod encode;

use std::io::Read;

use thiserror::Error;
use tracing::{debug, trace};

pub use encode::encode_url;

/// Errors from the transport layer. A nonexistent remote target is
/// distinguishable from transient network failure; the cache layer folds
/// both into its single unavailable signal.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("remote target not found: {0}")]
    NotFound(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("short range read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// A connection bound to one remote file. Reads run to completion or
/// failure; there is no cancellation at this layer.
pub trait RangeReader: Send {
    /// Fill `dest` with the bytes at `[offset, offset + dest.len())` of
    /// the remote file. Returns the number of bytes written, which on
    /// success is exactly `dest.len()`.
    fn read_range(&mut self, offset: u64, dest: &mut [u8]) -> Result<usize>;
}

impl std::fmt::Debug for dyn RangeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RangeReader")
    }
}

/// Factory for bound connections.
pub trait RangeSource: Send + Sync {
    /// Open a connection for `path`.
    ///
    /// With `first_block = Some(buf)`, the bytes at `[0, buf.len())` are
    /// fetched synchronously as part of connection establishment. With
    /// `None` this is a probe: existence is checked without requesting a
    /// body.
    fn open(&self, path: &str, first_block: Option<&mut [u8]>) -> Result<Box<dyn RangeReader>>;
}

/// HTTP range source: one base URL, one bound URL per opened path.
#[derive(Clone)]
pub struct HttpSource {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpSource {
    pub fn new(base_url: &str) -> HttpSource {
        HttpSource {
            agent: ureq::AgentBuilder::new()
                .user_agent(concat!("httpfs/", env!("CARGO_PKG_VERSION")))
                .build(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Download the metadata document at `rel_path` (server-relative).
    pub fn fetch_metadata(&self, rel_path: &str) -> Result<String> {
        let url = encode_url(&self.base_url, rel_path);
        debug!(%url, "fetching metadata document");
        let response = self.agent.get(&url).call().map_err(map_ureq)?;
        response
            .into_string()
            .map_err(|e| FetchError::Transport(e.to_string()))
    }
}

fn map_ureq(err: ureq::Error) -> FetchError {
    match err {
        ureq::Error::Status(404, response) => FetchError::NotFound(response.get_url().to_string()),
        other => FetchError::Transport(other.to_string()),
    }
}

impl RangeSource for HttpSource {
    fn open(&self, path: &str, first_block: Option<&mut [u8]>) -> Result<Box<dyn RangeReader>> {
        let url = encode_url(&self.base_url, path);
        let mut reader = HttpReader {
            agent: self.agent.clone(),
            url,
        };
        match first_block {
            // Probe only: existence check without a body.
            None => {
                self.agent.head(&reader.url).call().map_err(map_ureq)?;
            }
            Some(buf) if buf.is_empty() => {
                self.agent.head(&reader.url).call().map_err(map_ureq)?;
            }
            Some(buf) => {
                reader.read_range(0, buf)?;
            }
        }
        debug!(url = %reader.url, "connection established");
        Ok(Box::new(reader))
    }
}

struct HttpReader {
    agent: ureq::Agent,
    url: String,
}

impl RangeReader for HttpReader {
    fn read_range(&mut self, offset: u64, dest: &mut [u8]) -> Result<usize> {
        let wanted = dest.len();
        if wanted == 0 {
            return Ok(0);
        }
        let range = format!("bytes={}-{}", offset, offset + wanted as u64 - 1);
        trace!(url = %self.url, %range, "range read");
        let response = self
            .agent
            .get(&self.url)
            .set("Range", &range)
            .call()
            .map_err(map_ureq)?;
        let mut body = response.into_reader();
        let mut got = 0;
        while got < wanted {
            match body
                .read(&mut dest[got..])
                .map_err(|e| FetchError::Transport(e.to_string()))?
            {
                0 => break,
                n => got += n,
            }
        }
        if got < wanted {
            return Err(FetchError::ShortRead { wanted, got });
        }
        Ok(got)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let source = HttpSource::new("http://example.org/site/");
        assert_eq!(source.base_url(), "http://example.org/site");
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        let err = FetchError::NotFound("http://example.org/x".into());
        assert!(matches!(err, FetchError::NotFound(_)));
        assert!(err.to_string().contains("not found"));
    }
}
