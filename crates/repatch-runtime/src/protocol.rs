//! Host/worker wire protocol
//!
//! Newline-delimited JSON over a Unix socket the host binds before spawning
//! the worker. The worker speaks first:
//!
//! ```text
//! worker → host   {"type":"hello","build_id":"…","pid":42}
//! host → worker   {"type":"start","parameters":{…}}
//! worker → host   {"type":"log",…} / {"type":"event",…}   (any number)
//! worker → host   {"type":"finished","error":null}
//! host → worker   {"type":"exit"}
//! ```

use crate::error::ProtocolError;
use crate::params::WorkerParameters;
use repatch_core::{ProgressEvent, RemoteError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Messages sent by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// First message after connecting
    Hello {
        /// Build the worker binary was compiled in
        build_id: String,
        /// Worker process id
        pid: u32,
    },
    /// Log line to re-emit on the host
    Log {
        /// Severity
        level: LogLevel,
        /// Rendered message
        message: String,
    },
    /// Progress event to relay
    Event {
        /// The event
        event: ProgressEvent,
    },
    /// Patching ended; `error` is set on failure
    Finished {
        /// Failure record
        error: Option<RemoteError>,
    },
}

/// Messages sent by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Run one patch session
    Start {
        /// Session parameters
        parameters: Box<WorkerParameters>,
    },
    /// Terminate
    Exit,
}

/// Log severity on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace
    Trace,
    /// Debug
    Debug,
    /// Info
    Info,
    /// Warn
    Warn,
    /// Error
    Error,
}

impl LogLevel {
    /// Re-emit `message` under the `worker` target
    pub fn emit(self, message: &str) {
        match self {
            Self::Trace => tracing::trace!(target: "worker", "{}", message),
            Self::Debug => tracing::debug!(target: "worker", "{}", message),
            Self::Info => tracing::info!(target: "worker", "{}", message),
            Self::Warn => tracing::warn!(target: "worker", "{}", message),
            Self::Error => tracing::error!(target: "worker", "{}", message),
        }
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            _ => Self::Error,
        }
    }
}

/// Reads one JSON message per line
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    line: String,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    /// Wrap a buffered reader
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }

    /// Next message, or `None` at end of stream; blank lines are skipped
    ///
    /// # Errors
    /// I/O failure or a line that does not decode as `T`.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                return Ok(None);
            }
            let frame = self.line.trim();
            if frame.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(frame)?));
        }
    }
}

/// Write one message followed by a newline
///
/// # Errors
/// Encoding or I/O failure.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use repatch_core::StepId;
    use tokio::io::BufReader;

    #[test]
    fn wire_shape_is_tagged() {
        let hello = WorkerMessage::Hello {
            build_id: "abc".into(),
            pid: 7,
        };
        assert_eq!(
            serde_json::to_string(&hello).unwrap(),
            r#"{"type":"hello","build_id":"abc","pid":7}"#
        );
        assert_eq!(serde_json::to_string(&HostMessage::Exit).unwrap(), r#"{"type":"exit"}"#);
    }

    #[tokio::test]
    async fn frames_survive_a_pipe() {
        let (mut client, server) = tokio::io::duplex(1024);

        let sent = vec![
            WorkerMessage::Event {
                event: ProgressEvent::started(StepId::ExecutePatch(3)),
            },
            WorkerMessage::Finished { error: None },
        ];
        for message in &sent {
            write_frame(&mut client, message).await.unwrap();
        }
        drop(client);

        let mut reader = FrameReader::new(BufReader::new(server));
        let mut received = Vec::new();
        while let Some(message) = reader.next::<WorkerMessage>().await.unwrap() {
            received.push(message);
        }
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let mut reader = FrameReader::new(&b"not json\n"[..]);
        let err = reader.next::<HostMessage>().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)), "{err}");
    }
}
