//! Byte transport for documents.
//!
//! The loading machine only needs two things from a transport: whether a
//! resource can be read synchronously ("fast local"), and a blocking streaming
//! fetch that runs inside a background `Transfer` task.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;
use tracing::{debug, trace};

use crate::error::TransferError;

const FILE_SCHEME: &str = "file://";

/// Identity of a resource: a URL string, or a bare filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentUrl(String);

impl DocumentUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn from_path(path: &Path) -> Self {
        Self(format!("{}{}", FILE_SCHEME, path.to_string_lossy()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem path for `file://` URLs and bare paths.
    pub fn local_path(&self) -> Option<PathBuf> {
        if let Some(rest) = self.0.strip_prefix(FILE_SCHEME) {
            return Some(PathBuf::from(rest));
        }
        if self.0.contains("://") {
            return None;
        }
        Some(PathBuf::from(&self.0))
    }

    /// Last path segment, for display.
    pub fn file_name(&self) -> &str {
        self.0
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for DocumentUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Path> for DocumentUrl {
    fn from(path: &Path) -> Self {
        Self::from_path(path)
    }
}

impl From<&str> for DocumentUrl {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

/// Messages a streaming transfer produces.
#[derive(Debug)]
pub enum TransferEvent {
    Data(Vec<u8>),
    Finished(Result<(), TransferError>),
}

/// Receiving end of a streaming transfer, handed to `Transport::fetch`.
pub struct TransferSink {
    tx: Sender<TransferEvent>,
    cancelled: Arc<AtomicBool>,
}

impl TransferSink {
    pub fn new(tx: Sender<TransferEvent>, cancelled: Arc<AtomicBool>) -> Self {
        Self { tx, cancelled }
    }

    /// Deliver a chunk. Returns false once nobody wants more data; transports
    /// should stop fetching at that point.
    pub fn push(&mut self, chunk: Vec<u8>) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.tx.send(TransferEvent::Data(chunk)).is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn finish(self, result: Result<(), TransferError>) {
        if !self.is_cancelled() {
            let _ = self.tx.send(TransferEvent::Finished(result));
        }
    }
}

/// Source of document bytes.
pub trait Transport: Send + Sync {
    /// Whether `read_all` is cheap enough to call on the interactive thread.
    fn is_fast_local(&self, url: &DocumentUrl) -> bool;

    fn read_all(&self, url: &DocumentUrl) -> Result<Vec<u8>, TransferError>;

    /// Stream the resource into `sink`. Blocks until done, failed or cancelled.
    fn fetch(&self, url: &DocumentUrl, sink: &mut TransferSink) -> Result<(), TransferError>;
}

/// Transport for local files. Small files are fast-local; large ones stream.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    fast_local_max_bytes: u64,
    chunk_bytes: usize,
}

impl LocalTransport {
    pub fn new(fast_local_max_bytes: u64, chunk_bytes: usize) -> Self {
        Self {
            fast_local_max_bytes,
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    fn path_for(url: &DocumentUrl) -> Result<PathBuf, TransferError> {
        url.local_path()
            .ok_or_else(|| TransferError::new(format!("Unsupported URL scheme: {}", url)))
    }

    fn stream_file(&self, path: &Path, sink: &mut TransferSink) -> Result<()> {
        let mut file =
            File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let mut buffer = vec![0u8; self.chunk_bytes];
        let mut total = 0usize;
        loop {
            let read = file
                .read(&mut buffer)
                .with_context(|| format!("Failed to read {:?}", path))?;
            if read == 0 {
                break;
            }
            total += read;
            if !sink.push(buffer[..read].to_vec()) {
                trace!(?path, total, "Transfer cancelled");
                break;
            }
        }
        debug!(?path, total, "Streamed local file");
        Ok(())
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        let config = crate::config::LoaderConfig::global();
        Self::new(config.fast_local_max_bytes, config.transfer_chunk_bytes)
    }
}

impl Transport for LocalTransport {
    fn is_fast_local(&self, url: &DocumentUrl) -> bool {
        url.local_path()
            .and_then(|path| std::fs::metadata(path).ok())
            .map(|meta| meta.is_file() && meta.len() <= self.fast_local_max_bytes)
            .unwrap_or(false)
    }

    fn read_all(&self, url: &DocumentUrl) -> Result<Vec<u8>, TransferError> {
        let path = Self::path_for(url)?;
        std::fs::read(&path)
            .with_context(|| format!("Failed to read {:?}", path))
            .map_err(|e| TransferError::new(format!("{:#}", e)))
    }

    fn fetch(&self, url: &DocumentUrl, sink: &mut TransferSink) -> Result<(), TransferError> {
        let path = Self::path_for(url)?;
        self.stream_file(&path, sink)
            .map_err(|e| TransferError::new(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_local_path_parsing() {
        assert_eq!(
            DocumentUrl::new("file:///tmp/a.jpg").local_path(),
            Some(PathBuf::from("/tmp/a.jpg"))
        );
        assert_eq!(
            DocumentUrl::new("/tmp/b.png").local_path(),
            Some(PathBuf::from("/tmp/b.png"))
        );
        assert_eq!(DocumentUrl::new("https://example.org/c.png").local_path(), None);
        assert_eq!(DocumentUrl::new("https://example.org/c.png").file_name(), "c.png");
    }

    #[test]
    fn test_fast_local_threshold() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&[0u8; 2048]).unwrap();
        let url = DocumentUrl::from_path(temp.path());

        assert!(LocalTransport::new(4096, 512).is_fast_local(&url));
        assert!(!LocalTransport::new(1024, 512).is_fast_local(&url));
        assert!(!LocalTransport::new(4096, 512).is_fast_local(&DocumentUrl::new("/nonexistent/x")));
    }

    #[test]
    fn test_fetch_streams_in_chunks() {
        let mut temp = NamedTempFile::new().unwrap();
        let payload: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        temp.write_all(&payload).unwrap();

        let transport = LocalTransport::new(0, 1024);
        let (tx, rx) = flume::unbounded();
        let mut sink = TransferSink::new(tx, Arc::new(AtomicBool::new(false)));
        transport
            .fetch(&DocumentUrl::from_path(temp.path()), &mut sink)
            .unwrap();
        drop(sink);

        let chunks: Vec<Vec<u8>> = rx
            .iter()
            .filter_map(|event| match event {
                TransferEvent::Data(bytes) => Some(bytes),
                TransferEvent::Finished(_) => None,
            })
            .collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), payload);
    }

    #[test]
    fn test_missing_file_reports_error_text() {
        let transport = LocalTransport::new(1024, 1024);
        let err = transport
            .read_all(&DocumentUrl::new("/nonexistent/missing.jpg"))
            .unwrap_err();
        assert!(err.to_string().contains("missing.jpg"));
    }

    #[test]
    fn test_remote_scheme_is_rejected() {
        let transport = LocalTransport::new(1024, 1024);
        let err = transport
            .read_all(&DocumentUrl::new("sftp://host/file.png"))
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported URL scheme"));
    }
}
