//! Runtime executing the pipeline in an isolated worker process
//!
//! The host binds a Unix socket in the cache directory, spawns the worker
//! bounded by the memory budget and waits for its `hello`. A worker from
//! another build is told to exit before it ever receives `start`. Worker
//! log lines and progress events are relayed until `finished`; the exit
//! status is watched the whole time and a non-zero code wins over anything
//! the worker reported.

use crate::config::RepatchConfig;
use crate::error::{ProtocolError, RuntimeError};
use crate::params::WorkerParameters;
use crate::protocol::{write_frame, FrameReader, HostMessage, WorkerMessage};
use crate::runtime::{Runtime, SessionSlot};
use crate::BUILD_ID;
use async_trait::async_trait;
use parking_lot::Mutex;
use repatch_core::{exit_code, EventSink, MemoryPolicy, WorkerLaunch, FALLBACK_DEFAULT_MB};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixListener;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Entry name selecting the patch worker
pub const PATCHER_ENTRY: &str = "patcher";

/// Default worker connect timeout
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Host side of a connected worker
///
/// `exit` may be called any number of times; only the first sends.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: u32,
    outbox: mpsc::UnboundedSender<HostMessage>,
    exited: AtomicBool,
}

impl WorkerHandle {
    /// Start a writer task feeding `writer`
    pub fn spawn<W>(mut writer: W, pid: u32) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, mut inbox) = mpsc::unbounded_channel::<HostMessage>();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                let last = matches!(message, HostMessage::Exit);
                if let Err(err) = write_frame(&mut writer, &message).await {
                    tracing::debug!("Worker {} connection closed: {}", pid, err);
                    break;
                }
                if last {
                    break;
                }
            }
        });
        Self {
            pid,
            outbox,
            exited: AtomicBool::new(false),
        }
    }

    /// Worker process id
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Queue a message unless the worker was told to exit
    pub fn send(&self, message: HostMessage) {
        if !self.has_exited() {
            let _ = self.outbox.send(message);
        }
    }

    /// Tell the worker to exit
    pub fn exit(&self) {
        if !self.exited.swap(true, Ordering::AcqRel) {
            tracing::debug!("Asking worker {} to exit", self.pid);
            let _ = self.outbox.send(HostMessage::Exit);
        }
    }

    /// `true` once [`WorkerHandle::exit`] has been called
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

/// Isolated worker runtime
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    worker: PathBuf,
    classpath: PathBuf,
    cache_dir: PathBuf,
    memory: MemoryPolicy,
    memory_limit_mb: u64,
    aggressive_memory: bool,
    heap_shim: Option<PathBuf>,
    handshake_timeout: Duration,
    build_id: String,
    slot: SessionSlot,
    active: Arc<Mutex<Option<Arc<WorkerHandle>>>>,
}

impl ProcessRuntime {
    /// Runtime spawning `worker`, with sockets and temp files in `cache_dir`
    #[must_use]
    pub fn new(worker: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        let worker = worker.into();
        let classpath = std::env::current_exe().unwrap_or_else(|_| worker.clone());
        Self {
            worker,
            classpath,
            cache_dir: cache_dir.into(),
            memory: MemoryPolicy::default(),
            memory_limit_mb: FALLBACK_DEFAULT_MB,
            aggressive_memory: false,
            heap_shim: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            build_id: BUILD_ID.to_string(),
            slot: SessionSlot::default(),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Runtime configured from `[runtime]` and `[patching]`
    ///
    /// # Errors
    /// [`RuntimeError::Config`] when the worker binary cannot be located.
    pub fn from_config(config: &RepatchConfig) -> Result<Self, RuntimeError> {
        Ok(Self::new(config.worker_binary()?, config.cache_dir())
            .with_memory(
                config.memory_policy(),
                config.runtime.memory_limit_mb,
                config.runtime.aggressive_memory,
            )
            .with_heap_shim(config.runtime.heap_shim.clone())
            .with_handshake_timeout(config.handshake_timeout()))
    }

    /// Memory policy and requested budget
    #[inline]
    #[must_use]
    pub fn with_memory(mut self, policy: MemoryPolicy, limit_mb: u64, aggressive: bool) -> Self {
        self.memory = policy;
        self.memory_limit_mb = limit_mb;
        self.aggressive_memory = aggressive;
        self
    }

    /// Preload library enforcing the heap limit
    #[inline]
    #[must_use]
    pub fn with_heap_shim(mut self, shim: Option<PathBuf>) -> Self {
        self.heap_shim = shim;
        self
    }

    /// Worker connect timeout
    #[inline]
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Classpath exported to the worker
    #[inline]
    #[must_use]
    pub fn with_classpath(mut self, classpath: impl Into<PathBuf>) -> Self {
        self.classpath = classpath.into();
        self
    }

    /// Build id the worker must report
    #[inline]
    #[must_use]
    pub fn with_build_id(mut self, build_id: impl Into<String>) -> Self {
        self.build_id = build_id.into();
        self
    }

    /// Effective worker memory budget (MB)
    #[must_use]
    pub fn memory_limit(&self) -> u64 {
        self.memory.effective(self.memory_limit_mb, self.aggressive_memory)
    }

    /// Worker command line for a session listening on `endpoint`
    #[must_use]
    pub fn launch(&self, endpoint: &Path) -> WorkerLaunch {
        if self.heap_shim.is_none() {
            tracing::warn!("No heap shim configured, worker memory limit is not enforced");
        }
        WorkerLaunch::new(&self.worker, PATCHER_ENTRY)
            .with_tmp_dir(&self.cache_dir)
            .arg(endpoint)
            .with_classpath(&self.classpath)
            .with_heap_limit(self.memory_limit(), self.heap_shim.clone())
    }

    async fn drive(
        &self,
        child: &mut Child,
        listener: &UnixListener,
        parameters: WorkerParameters,
        sink: &EventSink,
        cancelled: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let connection = tokio::select! {
            accepted = tokio::time::timeout(self.handshake_timeout, accept_hello(listener)) => match accepted {
                Ok(connection) => connection?,
                Err(_) => return Err(RuntimeError::WorkerHandshakeTimeout(self.handshake_timeout)),
            },
            status = child.wait() => {
                let code = exit_code(status?);
                return Err(if code == 0 {
                    ProtocolError::Unexpected("worker exited before connecting".into()).into()
                } else {
                    RuntimeError::ProcessExit(code)
                });
            }
            () = cancelled.cancelled() => {
                tracing::info!("Session cancelled before the worker connected");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(RuntimeError::Cancelled);
            }
        };

        let Connection {
            mut reader,
            handle,
            build_id,
        } = connection;
        let handle = Arc::new(handle);
        if build_id != self.build_id {
            handle.exit();
            return Err(RuntimeError::StaleWorkerBuild {
                expected: self.build_id.clone(),
                actual: build_id,
            });
        }
        tracing::info!("Worker {} connected", handle.pid());

        let _active = ActiveWorker::install(&self.active, handle.clone());
        if cancelled.is_cancelled() {
            handle.exit();
        }
        handle.send(HostMessage::Start {
            parameters: Box::new(parameters),
        });

        let relay = relay_messages(&mut reader, &handle, sink);
        tokio::pin!(relay);
        let finished = tokio::select! {
            finished = &mut relay => finished,
            status = child.wait() => {
                let code = exit_code(status?);
                if code != 0 {
                    return Err(RuntimeError::ProcessExit(code));
                }
                relay.await
            }
        };

        let code = exit_code(child.wait().await?);
        tracing::debug!("Worker {} finished with exit code {}", handle.pid(), code);
        if code != 0 {
            return Err(RuntimeError::ProcessExit(code));
        }
        match finished {
            Some(outcome) => outcome,
            None if handle.has_exited() => Err(RuntimeError::Cancelled),
            None => Err(ProtocolError::Unexpected("worker closed the connection without finishing".into()).into()),
        }
    }
}

#[async_trait]
impl Runtime for ProcessRuntime {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, parameters: WorkerParameters, sink: EventSink) -> Result<(), RuntimeError> {
        let guard = self.slot.acquire()?;
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let endpoint = Endpoint::bind(&self.cache_dir)?;

        let launch = self.launch(endpoint.path());
        tracing::info!(
            "Spawning {} with a {}MB memory limit",
            self.worker.display(),
            self.memory_limit()
        );
        let mut child = launch.command().spawn()?;
        relay_stdio(&mut child);

        self.drive(&mut child, &endpoint.listener, parameters, &sink, guard.token())
            .await
    }

    fn cancel(&self) {
        self.slot.cancel();
        if let Some(handle) = self.active.lock().take() {
            handle.exit();
        }
    }
}

struct Connection {
    reader: FrameReader<BufReader<OwnedReadHalf>>,
    handle: WorkerHandle,
    build_id: String,
}

async fn accept_hello(listener: &UnixListener) -> Result<Connection, RuntimeError> {
    let (stream, _) = listener.accept().await?;
    let (read, write) = stream.into_split();
    let mut reader = FrameReader::new(BufReader::new(read));
    match reader.next::<WorkerMessage>().await? {
        Some(WorkerMessage::Hello { build_id, pid }) => Ok(Connection {
            reader,
            handle: WorkerHandle::spawn(write, pid),
            build_id,
        }),
        Some(other) => Err(ProtocolError::Unexpected(format!("expected hello, got {other:?}")).into()),
        None => Err(ProtocolError::Unexpected("worker disconnected before hello".into()).into()),
    }
}

/// Relay worker messages until `finished`
///
/// Returns `None` when the connection closes first.
pub async fn relay_messages<R>(
    reader: &mut FrameReader<R>,
    handle: &WorkerHandle,
    sink: &EventSink,
) -> Option<Result<(), RuntimeError>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match reader.next::<WorkerMessage>().await {
            Ok(Some(WorkerMessage::Log { level, message })) => level.emit(&message),
            Ok(Some(WorkerMessage::Event { event })) => sink.emit(event),
            Ok(Some(WorkerMessage::Finished { error })) => {
                handle.exit();
                return Some(error.map_or(Ok(()), |error| Err(RuntimeError::RemoteFailure(error))));
            }
            Ok(Some(WorkerMessage::Hello { .. })) => tracing::warn!("Ignoring repeated hello from worker {}", handle.pid()),
            Ok(None) => return None,
            Err(err) => {
                handle.exit();
                return Some(Err(err.into()));
            }
        }
    }
}

/// Clears the active-worker slot and exits the worker on drop
struct ActiveWorker<'a> {
    slot: &'a Mutex<Option<Arc<WorkerHandle>>>,
}

impl<'a> ActiveWorker<'a> {
    fn install(slot: &'a Mutex<Option<Arc<WorkerHandle>>>, handle: Arc<WorkerHandle>) -> Self {
        if let Some(previous) = slot.lock().replace(handle) {
            previous.exit();
        }
        Self { slot }
    }
}

impl Drop for ActiveWorker<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.slot.lock().take() {
            handle.exit();
        }
    }
}

/// Socket file removed on drop
struct Endpoint {
    path: PathBuf,
    listener: UnixListener,
}

impl Endpoint {
    fn bind(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join(format!("worker-{}.sock", uuid::Uuid::new_v4().simple()));
        let listener = UnixListener::bind(&path)?;
        Ok(Self { path, listener })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn relay_stdio(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(log_stdio(stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_stdio(stderr));
    }
}

// The worker talks over the socket; anything on stdio is unexpected.
async fn log_stdio<R: AsyncRead + Unpin>(reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::warn!(target: "worker", "[STDIO]: {}", line);
    }
}
