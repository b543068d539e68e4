//! Framed message transport over an agent's byte streams
//!
//! One envelope per newline-terminated JSON line, the framing the wire
//! codec collaborator defines. Decode failure is terminal for the stream:
//! the protocol is not self-healing mid-stream, so the reader surfaces the
//! violation and the connection tears down.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::trace;

use crate::launcher::{BoxedReader, BoxedWriter};
use crate::{ClientError, Result};
use tether_protocol::Message;

/// Reads one [`Message`] per line from the agent's output stream.
pub(crate) struct MessageReader {
    inner: BufReader<BoxedReader>,
    line: String,
}

impl MessageReader {
    pub(crate) fn new(reader: BoxedReader) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Next decoded envelope, or `None` at end of stream.
    ///
    /// Blank lines are skipped; an undecodable line is a
    /// [`ClientError::Protocol`].
    pub(crate) async fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            self.line.clear();
            let read = self.inner.read_line(&mut self.line).await?;
            if read == 0 {
                return Ok(None);
            }
            if self.line.trim().is_empty() {
                continue;
            }
            trace!(target: "tether::wire", frame = %self.line.trim_end(), "recv");
            return Message::from_line(&self.line)
                .map(Some)
                .map_err(|e| ClientError::Protocol(e.to_string()));
        }
    }
}

/// Writes one [`Message`] per line to the agent's input stream.
pub(crate) struct MessageWriter {
    inner: BoxedWriter,
}

impl MessageWriter {
    pub(crate) fn new(writer: BoxedWriter) -> Self {
        Self { inner: writer }
    }

    pub(crate) async fn write_message(&mut self, message: &Message) -> Result<()> {
        let line = message.to_json_line()?;
        trace!(target: "tether::wire", frame = %line.trim_end(), "send");
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
