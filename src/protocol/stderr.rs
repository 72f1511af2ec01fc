//! Bounded ring buffer over an agent child's stderr.
//!
//! Stderr is never parsed; the tail is attached to errors surfaced when the
//! child exits unexpectedly, so operators see the crash output without the
//! gateway retaining unbounded logs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

/// Maximum number of retained stderr lines.
pub const MAX_LINES: usize = 60;

/// Maximum total bytes retained across all lines.
pub const MAX_BYTES: usize = 8 * 1024;

/// Shared handle to the retained stderr tail.
#[derive(Debug, Clone, Default)]
pub struct StderrRing {
    inner: Arc<Mutex<RingState>>,
}

#[derive(Debug, Default)]
struct RingState {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrRing {
    /// Create an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line, evicting from the front to stay within bounds.
    pub fn push(&self, line: String) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        state.bytes += line.len();
        state.lines.push_back(line);
        while state.lines.len() > MAX_LINES || state.bytes > MAX_BYTES {
            if let Some(evicted) = state.lines.pop_front() {
                state.bytes -= evicted.len();
            } else {
                break;
            }
        }
    }

    /// The retained tail joined with newlines; empty when nothing was read.
    #[must_use]
    pub fn tail(&self) -> String {
        self.inner
            .lock()
            .map(|state| {
                state
                    .lines
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    }
}

/// Spawn a background task that drains `stderr` into `ring` until EOF.
#[must_use]
pub fn drain<R>(thread_id: String, stderr: R, ring: StderrRing) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            ring.push(line);
        }
        debug!(thread_id, "stderr drain: stream closed");
    })
}
