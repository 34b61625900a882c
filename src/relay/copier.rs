//! Stream Copier
//!
//! Moves bytes from one side of a session to the other, one chunk at a
//! time. Each chunk is shown to the sink, then written in full to the
//! destination before the next read, so a slow destination throttles the
//! source and at most one chunk per direction is ever in memory.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{CopyError, CopyStage};
use crate::relay::session::RelaySession;
use crate::sink::{Direction, SinkGuard};

/// Default chunk size, matching the classic 8 KiB socket buffer
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Copies one direction of a session
pub struct StreamCopier {
    direction: Direction,
    chunk_size: usize,
    sink: SinkGuard,
    session: Arc<RelaySession>,
}

impl StreamCopier {
    pub fn new(
        direction: Direction,
        chunk_size: usize,
        sink: SinkGuard,
        session: Arc<RelaySession>,
    ) -> Self {
        Self {
            direction,
            chunk_size: chunk_size.max(1),
            sink,
            session,
        }
    }

    /// Copy until `source` reaches end-of-stream; returns the bytes forwarded
    pub async fn copy<R, W>(&self, source: &mut R, destination: &mut W) -> Result<u64, CopyError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = BytesMut::zeroed(self.chunk_size);
        let mut total: u64 = 0;

        loop {
            let n = match source.read(&mut buf[..]).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(CopyStage::Read, e)),
            };
            let chunk = &buf[..n];

            self.sink.observe(self.session.session_id, self.direction, chunk);

            destination
                .write_all(chunk)
                .await
                .map_err(|e| self.fail(CopyStage::Write, e))?;
            destination
                .flush()
                .await
                .map_err(|e| self.fail(CopyStage::Write, e))?;

            self.session.record_chunk(self.direction, n);
            total += n as u64;
            trace!(
                session = %self.session.session_id,
                direction = %self.direction,
                n,
                "forwarded chunk"
            );
        }

        Ok(total)
    }

    fn fail(&self, stage: CopyStage, cause: io::Error) -> CopyError {
        CopyError {
            direction: self.direction,
            stage,
            cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::session::SessionPeers;
    use crate::sink::{ByteSink, SessionEventKind, SessionId};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_test::io::Builder;

    #[derive(Default)]
    struct RecordingSink {
        chunks: Mutex<Vec<(Direction, Vec<u8>)>>,
        observed: AtomicU64,
        largest: AtomicUsize,
    }

    impl ByteSink for RecordingSink {
        fn observe(&self, _: SessionId, direction: Direction, bytes: &[u8]) -> anyhow::Result<()> {
            self.observed.fetch_add(bytes.len() as u64, Ordering::SeqCst);
            self.largest.fetch_max(bytes.len(), Ordering::SeqCst);
            self.chunks.lock().unwrap().push((direction, bytes.to_vec()));
            Ok(())
        }

        fn session_event(&self, _: SessionId, _: SessionEventKind, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct BrokenSink;

    impl ByteSink for BrokenSink {
        fn observe(&self, _: SessionId, _: Direction, _: &[u8]) -> anyhow::Result<()> {
            anyhow::bail!("viewer closed")
        }

        fn session_event(&self, _: SessionId, _: SessionEventKind, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn copier(sink: Arc<dyn ByteSink>, chunk_size: usize) -> (StreamCopier, Arc<RelaySession>) {
        let session = Arc::new(RelaySession::new(SessionId(1), SessionPeers::default()));
        let copier = StreamCopier::new(
            Direction::DownstreamToUpstream,
            chunk_size,
            SinkGuard::new(sink),
            session.clone(),
        );
        (copier, session)
    }

    #[tokio::test]
    async fn test_forwards_chunks_in_order_and_observes_them() {
        let sink = Arc::new(RecordingSink::default());
        let (copier, session) = copier(sink.clone(), DEFAULT_CHUNK_SIZE);

        let mut source = Builder::new().read(b"PING\n").read(b"second").build();
        let mut destination = Builder::new().write(b"PING\n").write(b"second").build();

        let total = copier.copy(&mut source, &mut destination).await.unwrap();

        assert_eq!(total, 11);
        assert_eq!(session.bytes_up(), 11);
        let chunks = sink.chunks.lock().unwrap();
        assert_eq!(
            chunks.as_slice(),
            &[
                (Direction::DownstreamToUpstream, b"PING\n".to_vec()),
                (Direction::DownstreamToUpstream, b"second".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_error_reports_direction() {
        let (copier, _) = copier(Arc::new(RecordingSink::default()), 64);

        let mut source = Builder::new()
            .read(b"abc")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
            .build();
        let mut destination = Builder::new().write(b"abc").build();

        let err = copier.copy(&mut source, &mut destination).await.unwrap_err();
        assert_eq!(err.direction, Direction::DownstreamToUpstream);
        assert_eq!(err.stage, CopyStage::Read);
        assert_eq!(err.cause.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_write_error_stops_copy() {
        let sink = Arc::new(RecordingSink::default());
        let (copier, session) = copier(sink.clone(), 64);

        let mut source = Builder::new().read(b"doomed").build();
        let mut destination = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();

        let err = copier.copy(&mut source, &mut destination).await.unwrap_err();
        assert_eq!(err.stage, CopyStage::Write);
        // The chunk is observed before the write is attempted.
        assert_eq!(sink.observed.load(Ordering::SeqCst), 6);
        assert_eq!(session.bytes_up(), 0);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_abort_copy() {
        let (copier, _) = copier(Arc::new(BrokenSink), 64);

        let mut source = Builder::new().read(b"still flows").build();
        let mut destination = Builder::new().write(b"still flows").build();

        assert_eq!(copier.copy(&mut source, &mut destination).await.unwrap(), 11);
        assert_eq!(copier.sink.failures(), 1);
    }

    #[tokio::test]
    async fn test_slow_destination_bounds_buffering() {
        const CHUNK: usize = 1024;
        const PIPE: usize = 256;
        const TOTAL: usize = 64 * 1024;

        let sink = Arc::new(RecordingSink::default());
        let (copier, _) = copier(sink.clone(), CHUNK);

        let (mut producer, mut source) = tokio::io::duplex(64 * 1024);
        let (mut destination, mut consumer) = tokio::io::duplex(PIPE);

        let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        tokio::spawn(async move {
            producer.write_all(&payload).await.unwrap();
            producer.shutdown().await.unwrap();
        });

        let copy = tokio::spawn(async move { copier.copy(&mut source, &mut destination).await });

        let mut received = Vec::with_capacity(TOTAL);
        let mut buf = [0u8; 128];
        loop {
            let n = consumer.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);

            let in_flight = sink.observed.load(Ordering::SeqCst) - received.len() as u64;
            assert!(in_flight <= (CHUNK + PIPE) as u64, "{} bytes buffered", in_flight);
            tokio::time::sleep(std::time::Duration::from_micros(200)).await;
        }

        assert_eq!(copy.await.unwrap().unwrap(), TOTAL as u64);
        assert_eq!(received, expected);
        assert!(sink.largest.load(Ordering::SeqCst) <= CHUNK);
    }
}
