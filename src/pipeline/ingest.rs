// Size-limited persistence of the uploaded bundle

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::error::PipelineError;

/// Raised through `io::Error` when a [`BoundedWriter`] refuses a write
#[derive(Debug, Error)]
#[error("write limit of {limit} bytes exceeded")]
pub struct LimitExceeded {
    pub limit: u64,
}

/// Writer that refuses any write which would take the cumulative total past `limit`.
///
/// A refused write leaves the underlying writer untouched, so at most `limit`
/// bytes ever reach it.
#[derive(Debug)]
pub struct BoundedWriter<W> {
    inner: W,
    limit: u64,
    written: u64,
}

impl<W> BoundedWriter<W> {
    pub fn new(inner: W, limit: u64) -> Self {
        Self {
            inner,
            limit,
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for BoundedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.written.saturating_add(buf.len() as u64) > this.limit {
            return Poll::Ready(Err(io::Error::other(LimitExceeded { limit: this.limit })));
        }
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn classify_write_error(err: io::Error) -> PipelineError {
    let limit = err
        .get_ref()
        .and_then(|e| e.downcast_ref::<LimitExceeded>())
        .map(|exceeded| exceeded.limit);
    match limit {
        Some(limit) => PipelineError::PayloadTooLarge { limit },
        None => PipelineError::IngestIo(err),
    }
}

/// Stream `source` into a new file at `destination`, never writing more than `limit` bytes.
///
/// The next chunk is only pulled once the previous one has been written, so the
/// file's write speed governs how fast the source is consumed. On failure the
/// destination may hold a partial upload; removing it is left to cleanup.
pub async fn ingest<S, E>(source: S, destination: &Path, limit: u64) -> Result<u64, PipelineError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let file = File::create(destination)
        .await
        .map_err(PipelineError::IngestIo)?;
    let mut writer = BoundedWriter::new(file, limit);

    tokio::pin!(source);
    while let Some(chunk) = source.next().await {
        let chunk = chunk.map_err(|e| PipelineError::MalformedUpload(io::Error::other(e)))?;
        if chunk.is_empty() {
            continue;
        }
        writer.write_all(&chunk).await.map_err(classify_write_error)?;
    }

    writer.flush().await.map_err(PipelineError::IngestIo)?;
    let written = writer.written();
    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(PipelineError::IngestIo)?;

    debug!(bytes = written, path = %destination.display(), "Upload persisted");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::TempDir;

    fn chunks(parts: &[&[u8]]) -> impl Stream<Item = Result<Bytes, io::Error>> {
        let owned: Vec<Result<Bytes, io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();
        stream::iter(owned)
    }

    #[tokio::test]
    async fn test_ingest_under_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.zip");

        let written = ingest(chunks(&[b"hello ", b"world"]), &path, 64)
            .await
            .unwrap();

        assert_eq!(written, 11);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_ingest_exactly_at_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.zip");

        let written = ingest(chunks(&[b"1234", b"5678"]), &path, 8).await.unwrap();
        assert_eq!(written, 8);
    }

    #[tokio::test]
    async fn test_ingest_over_limit_counts_across_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.zip");

        // every chunk is below the limit, the total is not
        let err = ingest(chunks(&[b"1234", b"5678", b"9"]), &path, 8)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::PayloadTooLarge { limit: 8 }));
        let on_disk = tokio::fs::metadata(&path).await.unwrap().len();
        assert!(on_disk <= 8, "wrote {} bytes past the limit", on_disk);
    }

    #[tokio::test]
    async fn test_ingest_stops_pulling_after_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.zip");

        let pulled = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = pulled.clone();
        let source = stream::iter(0..100).map(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok::<_, io::Error>(Bytes::from_static(b"0123456789"))
        });

        let err = ingest(source, &path, 25).await.unwrap_err();
        assert!(matches!(err, PipelineError::PayloadTooLarge { .. }));
        assert_eq!(pulled.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_ingest_source_error_is_malformed_upload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.zip");

        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]);

        let err = ingest(source, &path, 1024).await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedUpload(_)));
    }

    #[tokio::test]
    async fn test_ingest_missing_directory_is_io_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("upload.zip");

        let err = ingest(chunks(&[b"data"]), &path, 1024).await.unwrap_err();
        assert!(matches!(err, PipelineError::IngestIo(_)));
    }

    #[tokio::test]
    async fn test_bounded_writer_rejects_whole_write() {
        let mut writer = BoundedWriter::new(Vec::new(), 4);
        writer.write_all(b"abc").await.unwrap();

        let err = writer.write_all(b"de").await.unwrap_err();
        assert!(err.get_ref().unwrap().is::<LimitExceeded>());
        assert_eq!(writer.written(), 3);
        assert_eq!(writer.into_inner(), b"abc");
    }
}
