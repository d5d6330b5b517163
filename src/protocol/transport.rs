//! Newline-delimited JSON framing for the parent↔worker channel.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::IpcEnvelope;

/// Writes envelopes as single JSON lines to any async byte sink.
///
/// The worker wraps its stdout in one of these; the supervisor wraps each
/// child's stdin. Flushing per message keeps the channel low-latency, which
/// matters more here than throughput.
pub struct IpcWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> IpcWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, envelope: &IpcEnvelope) -> io::Result<()> {
        let mut line = serde_json::to_string(envelope)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await
    }
}
