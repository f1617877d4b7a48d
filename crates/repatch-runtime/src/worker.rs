//! Worker side of the isolated runtime
//!
//! Connects to the host, introduces itself with this binary's build id and
//! runs at most one pipeline. Log lines and progress events go back over the
//! connection; the outcome is reported once as `finished`. An `exit` from the
//! host at any point abandons the session.

use crate::error::{ProtocolError, RuntimeError};
use crate::logging;
use crate::pipeline::run_pipeline;
use crate::protocol::{write_frame, FrameReader, HostMessage, WorkerMessage};
use crate::BUILD_ID;
use repatch_core::launch::{HEAP_SIZE_ENV, TMPDIR_PROPERTY};
use repatch_core::EventSink;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

/// Parsed worker command line
///
/// `-D<property>=<value> / --nice-name=<label> <entry> [args…]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    /// Temporary directory handed down by the host
    pub tmp_dir: Option<PathBuf>,
    /// Process label
    pub nice_name: Option<String>,
    /// Entry to run
    pub entry: String,
    /// Entry arguments
    pub args: Vec<String>,
}

impl WorkerArgs {
    /// Parse arguments following the program name
    ///
    /// # Errors
    /// [`RuntimeError::Config`] when no entry is named.
    pub fn parse<I>(args: I) -> Result<Self, RuntimeError>
    where
        I: IntoIterator<Item = String>,
    {
        let property = format!("-D{TMPDIR_PROPERTY}=");
        let mut tmp_dir = None;
        let mut nice_name = None;
        let mut args = args.into_iter();

        let entry = loop {
            let Some(arg) = args.next() else {
                return Err(RuntimeError::Config("no worker entry given".into()));
            };
            if let Some(dir) = arg.strip_prefix(&property) {
                tmp_dir = Some(PathBuf::from(dir));
            } else if let Some(name) = arg.strip_prefix("--nice-name=") {
                nice_name = Some(name.to_string());
            } else if arg == "/" || arg.starts_with("-D") {
                continue;
            } else {
                break arg;
            }
        };

        Ok(Self {
            tmp_dir,
            nice_name,
            entry,
            args: args.collect(),
        })
    }
}

/// Run the patch worker against the host listening on `endpoint`
///
/// # Errors
/// The host cannot be reached or the connection breaks before `start`.
pub async fn run(endpoint: &Path) -> Result<(), RuntimeError> {
    let stream = UnixStream::connect(endpoint).await?;
    let (read, write) = stream.into_split();

    let (outbox, inbox) = mpsc::unbounded_channel();
    let writer = tokio::spawn(drain(write, inbox));
    logging::init_worker(outbox.clone());

    let _ = outbox.send(WorkerMessage::Hello {
        build_id: BUILD_ID.to_string(),
        pid: std::process::id(),
    });
    log_memory_limit();

    let mut reader = FrameReader::new(BufReader::new(read));
    let outcome = serve(&mut reader, &outbox).await;
    // The logging layer holds a sender, so the writer never drains by itself.
    writer.abort();
    outcome
}

/// Serve one session from `reader`, replying through `outbox`
///
/// # Errors
/// Protocol failure before the session starts. Pipeline failures are
/// reported to the host, not returned.
pub async fn serve<R>(reader: &mut FrameReader<R>, outbox: &mpsc::UnboundedSender<WorkerMessage>) -> Result<(), RuntimeError>
where
    R: AsyncBufRead + Unpin,
{
    let parameters = match reader.next::<HostMessage>().await? {
        Some(HostMessage::Start { parameters }) => parameters,
        Some(HostMessage::Exit) | None => {
            tracing::debug!("Host asked to exit before starting");
            return Ok(());
        }
    };

    let events = outbox.clone();
    let sink = EventSink::new(move |event| {
        let _ = events.send(WorkerMessage::Event { event });
    });

    let outcome = tokio::select! {
        outcome = run_pipeline(&parameters, &sink) => outcome,
        exit = wait_for_exit(reader) => {
            if let Err(err) = exit {
                tracing::warn!("Lost connection to host: {}", err);
            }
            tracing::info!("Abandoning patch session");
            return Ok(());
        }
    };

    if let Err(err) = &outcome {
        tracing::error!("Patching failed: {}", err);
    }
    let _ = outbox.send(WorkerMessage::Finished {
        error: outcome.err().map(|err| err.to_remote()),
    });

    if let Err(err) = wait_for_exit(reader).await {
        tracing::debug!("Connection closed before exit: {}", err);
    }
    Ok(())
}

async fn wait_for_exit<R: AsyncBufRead + Unpin>(reader: &mut FrameReader<R>) -> Result<(), ProtocolError> {
    loop {
        match reader.next::<HostMessage>().await? {
            Some(HostMessage::Exit) | None => return Ok(()),
            Some(HostMessage::Start { .. }) => tracing::warn!("Ignoring start while a session is running"),
        }
    }
}

async fn drain<W: AsyncWrite + Unpin>(mut writer: W, mut inbox: mpsc::UnboundedReceiver<WorkerMessage>) {
    while let Some(message) = inbox.recv().await {
        if write_frame(&mut writer, &message).await.is_err() {
            break;
        }
    }
}

fn log_memory_limit() {
    match std::env::var(HEAP_SIZE_ENV) {
        Ok(limit) => tracing::info!("Memory limit: {}", limit.replace('M', "MB")),
        Err(_) => tracing::debug!("Memory limit: unbounded"),
    }
}
