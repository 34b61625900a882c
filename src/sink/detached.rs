//! Detached Sink
//!
//! Bounded-latency adapter for slow sinks (files on slow disks, UI
//! renderers). Calls are queued into a bounded channel and drained on a
//! dedicated thread; when the queue is full the record is dropped and
//! counted instead of stalling the copier that produced it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::{ByteSink, Direction, SessionEventKind, SessionId, SinkGuard};

enum Record {
    Chunk {
        session: SessionId,
        direction: Direction,
        bytes: Bytes,
    },
    Event {
        session: SessionId,
        kind: SessionEventKind,
        detail: String,
    },
}

pub struct DetachedSink {
    sender: RwLock<Option<mpsc::Sender<Record>>>,
    dropped: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DetachedSink {
    /// Wrap `inner`, buffering at most `capacity` pending records
    pub fn new(inner: Arc<dyn ByteSink>, capacity: usize) -> anyhow::Result<Self> {
        let (sender, mut receiver) = mpsc::channel::<Record>(capacity.max(1));
        let guard = SinkGuard::new(inner);

        let worker = std::thread::Builder::new()
            .name("trampoline-sink".to_string())
            .spawn(move || {
                while let Some(record) = receiver.blocking_recv() {
                    match record {
                        Record::Chunk {
                            session,
                            direction,
                            bytes,
                        } => guard.observe(session, direction, &bytes),
                        Record::Event {
                            session,
                            kind,
                            detail,
                        } => guard.event(session, kind, detail),
                    }
                }
                debug!("Detached sink worker drained and stopped");
            })?;

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            dropped: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stop taking records and wait until the worker has drained the queue.
    ///
    /// The join runs on the blocking pool, so no runtime worker stalls.
    pub async fn close(&self) {
        let Some(worker) = self.shut() else {
            return;
        };
        match tokio::task::spawn_blocking(move || worker.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("Detached sink worker panicked"),
            Err(e) => warn!("Failed to wait for detached sink worker: {}", e),
        }
    }

    /// Close the queue and take the worker handle, once
    fn shut(&self) -> Option<JoinHandle<()>> {
        // Closing the channel lets the worker drain what is queued, then exit.
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Records discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, record: Record) -> anyhow::Result<()> {
        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let sender = guard
            .as_ref()
            .ok_or_else(|| anyhow!("detached sink is closed"))?;

        match sender.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!("Sink queue full, {} records dropped so far", dropped);
                }
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(anyhow!("detached sink worker has stopped")),
        }
    }
}

impl ByteSink for DetachedSink {
    fn observe(
        &self,
        session: SessionId,
        direction: Direction,
        bytes: &[u8],
    ) -> anyhow::Result<()> {
        self.enqueue(Record::Chunk {
            session,
            direction,
            bytes: Bytes::copy_from_slice(bytes),
        })
    }

    fn session_event(
        &self,
        session: SessionId,
        kind: SessionEventKind,
        detail: &str,
    ) -> anyhow::Result<()> {
        self.enqueue(Record::Event {
            session,
            kind,
            detail: detail.to_string(),
        })
    }
}

impl Drop for DetachedSink {
    fn drop(&mut self) {
        let Some(worker) = self.shut() else {
            return;
        };
        let join = move || {
            if worker.join().is_err() {
                warn!("Detached sink worker panicked");
            }
        };
        // Inside a runtime the drain must not block the dropping worker thread.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(join);
            }
            Err(_) => join(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;

    struct GatedSink {
        gate: Mutex<std_mpsc::Receiver<()>>,
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl ByteSink for GatedSink {
        fn observe(&self, _: SessionId, _: Direction, bytes: &[u8]) -> anyhow::Result<()> {
            let _ = self.gate.lock().unwrap().recv();
            self.seen.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }

        fn session_event(&self, _: SessionId, _: SessionEventKind, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let (open_gate, gate) = std_mpsc::channel();
        let inner = Arc::new(GatedSink {
            gate: Mutex::new(gate),
            seen: Mutex::new(Vec::new()),
        });
        let sink = DetachedSink::new(inner.clone(), 2).unwrap();

        for i in 0..5u8 {
            sink.observe(SessionId(1), Direction::DownstreamToUpstream, &[i]).unwrap();
        }

        let dropped = sink.dropped();
        assert!((2..=3).contains(&dropped), "dropped {}", dropped);

        // Dropping the gate sender unblocks every pending recv.
        drop(open_gate);
        drop(sink);

        let seen = inner.seen.lock().unwrap();
        assert_eq!(seen.len() as u64, 5 - dropped);
        assert_eq!(seen[0], vec![0u8]);
    }

    #[test]
    fn test_events_are_delivered_in_order() {
        #[derive(Default)]
        struct EventLog(Mutex<Vec<SessionEventKind>>);

        impl ByteSink for EventLog {
            fn observe(&self, _: SessionId, _: Direction, _: &[u8]) -> anyhow::Result<()> {
                Ok(())
            }

            fn session_event(
                &self,
                _: SessionId,
                kind: SessionEventKind,
                _: &str,
            ) -> anyhow::Result<()> {
                self.0.lock().unwrap().push(kind);
                Ok(())
            }
        }

        let log = Arc::new(EventLog::default());
        let sink = DetachedSink::new(log.clone(), 16).unwrap();
        sink.session_event(SessionId(4), SessionEventKind::Opened, "").unwrap();
        sink.session_event(SessionId(4), SessionEventKind::Summary, "").unwrap();
        drop(sink);

        assert_eq!(
            log.0.lock().unwrap().as_slice(),
            &[SessionEventKind::Opened, SessionEventKind::Summary]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_drains_queue_without_blocking_runtime() {
        let (open_gate, gate) = std_mpsc::channel();
        let inner = Arc::new(GatedSink {
            gate: Mutex::new(gate),
            seen: Mutex::new(Vec::new()),
        });
        let sink = Arc::new(DetachedSink::new(inner.clone(), 8).unwrap());
        for i in 0..3u8 {
            sink.observe(SessionId(2), Direction::UpstreamToDownstream, &[i]).unwrap();
        }

        let closing = {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { sink.close().await })
        };

        // The worker is parked on the gate; the runtime must stay responsive.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!closing.is_finished());

        drop(open_gate);
        tokio::time::timeout(std::time::Duration::from_secs(5), closing)
            .await
            .expect("close never finished")
            .unwrap();

        assert_eq!(inner.seen.lock().unwrap().len(), 3);
        assert!(sink
            .observe(SessionId(2), Direction::UpstreamToDownstream, b"late")
            .is_err());
    }
}
