//! Transcript Sink
//!
//! Appends a human-readable transcript of relayed traffic to a file: a
//! header line per chunk followed by the chunk decoded as lossy UTF-8.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::{anyhow, Context};

use super::{ByteSink, Direction, SessionEventKind, SessionId};

pub struct TranscriptSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl TranscriptSink {
    /// Open (or create) the transcript file in append mode
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open transcript file: {}", path.display()))?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, header: &str, body: Option<&[u8]>) -> anyhow::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("transcript writer poisoned"))?;

        writeln!(writer, "{}", header)?;
        if let Some(body) = body {
            let text = String::from_utf8_lossy(body);
            writer.write_all(text.as_bytes())?;
            if !text.ends_with('\n') {
                writer.write_all(b"\n")?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

fn timestamp() -> String {
    humantime::format_rfc3339_millis(SystemTime::now()).to_string()
}

impl ByteSink for TranscriptSink {
    fn observe(
        &self,
        session: SessionId,
        direction: Direction,
        bytes: &[u8],
    ) -> anyhow::Result<()> {
        let header = format!(
            "--- {} {} {} ({} bytes) ---",
            timestamp(),
            session,
            direction,
            bytes.len()
        );
        self.append(&header, Some(bytes))
    }

    fn session_event(
        &self,
        session: SessionId,
        kind: SessionEventKind,
        detail: &str,
    ) -> anyhow::Result<()> {
        let header = format!("=== {} {} {}: {}", timestamp(), session, kind, detail);
        self.append(&header, None)
    }
}
