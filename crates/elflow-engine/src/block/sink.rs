//! Line sinks fed by the per-stream output proxy tasks.

use std::sync::{Arc, Mutex};

use elflow_types::message::ProtocolLine;
use elflow_types::state::StateMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Which output stream of a block a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Receives every line a block writes to one of its streams.
pub trait LineSink: Send {
    fn line(&mut self, block: &str, stream: OutputStream, line: &str);
}

/// Forwards lines to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LineSink for TracingSink {
    fn line(&mut self, block: &str, stream: OutputStream, line: &str) {
        tracing::info!(block, stream = stream.as_str(), "{line}");
    }
}

/// Keeps the `value` of the last STATE message seen.
///
/// Clones share the captured value, so a clone can be handed to a proxy task
/// and read back once the task has finished.
#[derive(Debug, Clone, Default)]
pub struct StateCapture {
    latest: Arc<Mutex<Option<StateMap>>>,
}

impl StateCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last captured state, if any STATE message was seen.
    #[must_use]
    pub fn latest(&self) -> Option<StateMap> {
        self.latest.lock().ok().and_then(|latest| latest.clone())
    }
}

impl LineSink for StateCapture {
    fn line(&mut self, block: &str, _stream: OutputStream, line: &str) {
        let Some(message) = ProtocolLine::decode(line) else {
            return;
        };
        let Some(value) = message.state_value() else {
            return;
        };
        tracing::debug!(block, keys = value.len(), "Captured state message");
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(value.clone());
        }
    }
}

/// Read `reader` line by line until EOF, handing each line to every sink.
///
/// Invalid UTF-8 is replaced rather than treated as an error. Returns the
/// number of lines read.
///
/// # Errors
///
/// Returns the underlying read error.
pub async fn proxy_lines<R>(
    block: &str,
    stream: OutputStream,
    reader: R,
    sinks: &mut [Box<dyn LineSink>],
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0u64;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(count);
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);
        for sink in sinks.iter_mut() {
            sink.line(block, stream, line);
        }
        count += 1;
    }
}
