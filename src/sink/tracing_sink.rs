//! Tracing Sink
//!
//! Default sink: reports session events through `tracing` and, when enabled,
//! a lossy text preview of every observed chunk at debug level.

use tracing::{debug, info, warn};

use super::{ByteSink, Direction, SessionEventKind, SessionId};

pub struct TracingSink {
    log_payload: bool,
    preview_bytes: usize,
}

impl TracingSink {
    pub fn new(log_payload: bool, preview_bytes: usize) -> Self {
        Self {
            log_payload,
            preview_bytes,
        }
    }

    /// Render at most `preview_bytes` of a chunk as escaped text
    pub fn preview(&self, bytes: &[u8]) -> String {
        let shown = &bytes[..bytes.len().min(self.preview_bytes)];
        let mut text = String::from_utf8_lossy(shown).escape_debug().to_string();
        if bytes.len() > shown.len() {
            text.push_str(&format!("... (+{} bytes)", bytes.len() - shown.len()));
        }
        text
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new(true, 256)
    }
}

impl ByteSink for TracingSink {
    fn observe(
        &self,
        session: SessionId,
        direction: Direction,
        bytes: &[u8],
    ) -> anyhow::Result<()> {
        if self.log_payload {
            debug!(
                session = %session,
                direction = %direction,
                len = bytes.len(),
                "{}",
                self.preview(bytes)
            );
        }
        Ok(())
    }

    fn session_event(
        &self,
        session: SessionId,
        kind: SessionEventKind,
        detail: &str,
    ) -> anyhow::Result<()> {
        if kind.is_failure() {
            warn!(session = %session, event = %kind, "{}", detail);
        } else if kind == SessionEventKind::HalfClosed {
            debug!(session = %session, event = %kind, "{}", detail);
        } else {
            info!(session = %session, event = %kind, "{}", detail);
        }
        Ok(())
    }
}
