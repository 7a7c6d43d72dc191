use crate::traits::ByteSource;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::fmt;
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Download aborted because the content is larger than the accepted limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimitExceeded {
    pub limit: u64,
    pub received: u64,
}

impl fmt::Display for SizeLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "content exceeds size limit: received at least {} bytes (max {})",
            self.received, self.limit
        )
    }
}

impl std::error::Error for SizeLimitExceeded {}

/// Streams chunks into `dest`, stopping once `max_bytes` is exceeded.
pub async fn stream_to_file<S, E>(stream: S, dest: &Path, max_bytes: u64) -> Result<u64>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| anyhow::anyhow!("create {}: {e}", dest.display()))?;
    let mut written: u64 = 0;
    let mut stream = std::pin::pin!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        written = written.saturating_add(chunk.len() as u64);
        if written > max_bytes {
            return Err(SizeLimitExceeded {
                limit: max_bytes,
                received: written,
            }
            .into());
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(written)
}

/// In-memory content, used by local tooling and tests.
#[derive(Clone)]
pub struct MemorySource {
    bytes: Bytes,
}

impl MemorySource {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn fetch_to(&self, dest: &Path, max_bytes: u64) -> Result<u64> {
        let chunks = self
            .bytes
            .chunks(64 * 1024)
            .map(|chunk| Ok::<_, std::io::Error>(Bytes::copy_from_slice(chunk)))
            .collect::<Vec<_>>();
        stream_to_file(futures_util::stream::iter(chunks), dest, max_bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_source_writes_content() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("in.pdf");
        let source = MemorySource::new(b"%PDF-1.7 hello".to_vec());
        let written = source.fetch_to(&dest, 1024).await.unwrap();
        assert_eq!(written, 14);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"%PDF-1.7 hello");
    }

    #[tokio::test]
    async fn memory_source_rejects_content_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("big.pdf");
        let source = MemorySource::new(vec![0_u8; 4096]);
        let err = source.fetch_to(&dest, 1000).await.unwrap_err();
        let exceeded = err
            .downcast_ref::<SizeLimitExceeded>()
            .expect("size limit error");
        assert_eq!(exceeded.limit, 1000);
        assert!(exceeded.received > 1000);
    }
}
