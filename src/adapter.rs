// ABOUTME: The adapter façade: thread-safe sync and async access to one worker-owned endpoint
// ABOUTME: Every method is exactly one command round-trip; query is made atomic by façade-level locks

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::fragment::Frame;
use crate::stop::StopCondition;
use crate::timeout::Timeout;
use crate::worker::{self, Command, Completion, WorkerConfig};
use bytes::Bytes;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Default response timeout when the caller never configures one.
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default inter-fragment quiet time that closes frames when the caller
/// installs no stop conditions of their own.
const DEFAULT_CONTINUATION: Duration = Duration::from_millis(100);

/// How long the façade waits for the worker to acknowledge a non-read
/// command before reporting a worker failure. Generous on purpose: expiry
/// means the worker is wedged, not that the device is slow.
const COMMAND_GUARD: Duration = Duration::from_secs(5);

/// Which completed frames a read may consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadScope {
    /// Any completed frame counts, including frames that arrived before the
    /// read was issued; served from the buffer immediately when available.
    #[default]
    Buffered,
    /// Only frames whose first fragment was observed strictly after the read
    /// was admitted.
    Next,
}

/// Per-read options: a timeout override, a stop-condition override (installed
/// at the next frame boundary, never mid-frame) and the read scope.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub(crate) timeout: Option<Timeout>,
    pub(crate) stop_conditions: Option<Vec<StopCondition>>,
    pub(crate) scope: ReadScope,
}

impl ReadOptions {
    pub fn new() -> ReadOptions {
        ReadOptions::default()
    }

    /// Overrides the adapter's timeout for this read only. Pass
    /// [`Timeout::disabled`] to wait indefinitely.
    pub fn timeout(mut self, timeout: Timeout) -> ReadOptions {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the adapter's stop conditions for this read only.
    pub fn stop_conditions(mut self, conditions: Vec<StopCondition>) -> ReadOptions {
        self.stop_conditions = Some(conditions);
        self
    }

    pub fn scope(mut self, scope: ReadScope) -> ReadOptions {
        self.scope = scope;
        self
    }
}

/// Event delivered to the adapter's event callback, on the worker thread.
/// Callbacks must be non-blocking; a panicking callback is logged and
/// suppressed.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// A frame completed (whether or not a read consumed it).
    Frame(Frame),
    /// The endpoint disconnected.
    Disconnected,
}

pub type EventCallback = Arc<dyn Fn(AdapterEvent) + Send + Sync>;

#[derive(Default)]
struct DefaultFlags {
    timeout_customized: bool,
    stop_customized: bool,
}

/// Configures and builds an [`Adapter`].
pub struct AdapterBuilder {
    descriptor: Descriptor,
    timeout: Option<Timeout>,
    stop_conditions: Option<Vec<StopCondition>>,
    auto_open: bool,
}

impl AdapterBuilder {
    pub fn new(descriptor: Descriptor) -> AdapterBuilder {
        AdapterBuilder {
            descriptor,
            timeout: None,
            stop_conditions: None,
            auto_open: true,
        }
    }

    /// Response-timeout policy for reads on this adapter.
    pub fn timeout(mut self, timeout: Timeout) -> AdapterBuilder {
        self.timeout = Some(timeout);
        self
    }

    /// Stop conditions installed on this adapter.
    pub fn stop_conditions(mut self, conditions: Vec<StopCondition>) -> AdapterBuilder {
        self.stop_conditions = Some(conditions);
        self
    }

    /// Whether a write on a closed adapter opens the transport first.
    /// Defaults to true.
    pub fn auto_open(mut self, auto_open: bool) -> AdapterBuilder {
        self.auto_open = auto_open;
        self
    }

    pub fn build(self) -> Adapter {
        let flags = DefaultFlags {
            timeout_customized: self.timeout.is_some(),
            stop_customized: self.stop_conditions.is_some(),
        };
        let config = WorkerConfig {
            descriptor: self.descriptor,
            timeout: self.timeout.unwrap_or(Timeout::new(DEFAULT_RESPONSE_TIMEOUT)),
            stop_conditions: self
                .stop_conditions
                .unwrap_or_else(|| vec![StopCondition::continuation(DEFAULT_CONTINUATION)]),
            auto_open: self.auto_open,
        };
        let (commands, thread) = worker::spawn(config);
        Adapter {
            commands: Some(commands),
            thread: Some(thread),
            sync_lock: Mutex::new(()),
            async_lock: tokio::sync::Mutex::new(()),
            flags: Mutex::new(flags),
        }
    }
}

/// Thread-safe façade over one transport endpoint and its worker.
///
/// The async methods are the primary surface; every one of them has a
/// `blocking_` twin for synchronous code, mirroring tokio's channel API.
/// The blocking variants must not be called from inside an async runtime.
///
/// ```no_run
/// use instrio::{Adapter, Descriptor, StopCondition};
///
/// #[tokio::main]
/// async fn main() -> instrio::Result<()> {
///     let adapter = Adapter::builder(Descriptor::tcp("192.168.1.26", 9000))
///         .stop_conditions(vec![StopCondition::termination(&b"\n"[..])])
///         .build();
///     adapter.open().await?;
///     let reply = adapter.query(b"*IDN?\n").await?;
///     println!("{:?}", reply);
///     Ok(())
/// }
/// ```
pub struct Adapter {
    commands: Option<mpsc::Sender<Command>>,
    thread: Option<std::thread::JoinHandle<()>>,
    /// Serializes multi-step blocking operations (query) between threads.
    sync_lock: Mutex<()>,
    /// Same guarantee across async callers.
    async_lock: tokio::sync::Mutex<()>,
    flags: Mutex<DefaultFlags>,
}

fn worker_gone() -> Error {
    Error::Worker("the adapter worker is gone".into())
}

impl Adapter {
    /// An adapter with default timeout (2 s, error action) and a default
    /// 100 ms continuation stop condition.
    pub fn new(descriptor: Descriptor) -> Adapter {
        AdapterBuilder::new(descriptor).build()
    }

    pub fn builder(descriptor: Descriptor) -> AdapterBuilder {
        AdapterBuilder::new(descriptor)
    }

    fn sender(&self) -> Result<&mpsc::Sender<Command>> {
        self.commands.as_ref().ok_or_else(worker_gone)
    }

    /// Sends one command and awaits its completion. `guard` bounds the wait
    /// for commands the worker answers promptly; reads pass `None` because a
    /// device may legitimately stream for an unbounded time.
    async fn command<T>(
        &self,
        guard: Option<Duration>,
        make: impl FnOnce(Completion<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender()?
            .send(make(Completion::Async(tx)))
            .await
            .map_err(|_| worker_gone())?;
        match guard {
            Some(window) => match tokio::time::timeout(window, rx).await {
                Err(_) => Err(Error::Worker(
                    "worker did not respond within the guard window".into(),
                )),
                Ok(Err(_)) => Err(worker_gone()),
                Ok(Ok(result)) => result,
            },
            None => rx.await.map_err(|_| worker_gone())?,
        }
    }

    fn blocking_command<T>(
        &self,
        guard: Option<Duration>,
        make: impl FnOnce(Completion<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.sender()?
            .blocking_send(make(Completion::Blocking(tx)))
            .map_err(|_| worker_gone())?;
        match guard {
            Some(window) => match rx.recv_timeout(window) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(Error::Worker(
                    "worker did not respond within the guard window".into(),
                )),
                Err(RecvTimeoutError::Disconnected) => Err(worker_gone()),
            },
            None => rx.recv().map_err(|_| worker_gone())?,
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Opens the transport. Re-opening an open adapter succeeds as a no-op.
    pub async fn open(&self) -> Result<()> {
        self.command(Some(COMMAND_GUARD), Command::Open).await
    }

    pub fn blocking_open(&self) -> Result<()> {
        self.blocking_command(Some(COMMAND_GUARD), Command::Open)
    }

    /// Closes the transport, cancelling any pending read with a disconnected
    /// error and clearing buffered frames and the in-progress assembly.
    pub async fn close(&self) -> Result<()> {
        self.command(Some(COMMAND_GUARD), Command::Close).await
    }

    pub fn blocking_close(&self) -> Result<()> {
        self.blocking_command(Some(COMMAND_GUARD), Command::Close)
    }

    pub async fn is_open(&self) -> Result<bool> {
        self.command(Some(COMMAND_GUARD), Command::IsOpen).await
    }

    pub fn blocking_is_open(&self) -> Result<bool> {
        self.blocking_command(Some(COMMAND_GUARD), Command::IsOpen)
    }

    // ---- I/O -------------------------------------------------------------

    /// Writes bytes to the device, opening the transport first if auto-open
    /// is enabled.
    pub async fn write(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let data = Bytes::copy_from_slice(data.as_ref());
        self.command(Some(COMMAND_GUARD), move |done| Command::Write { data, done })
            .await
    }

    pub fn blocking_write(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let data = Bytes::copy_from_slice(data.as_ref());
        self.blocking_command(Some(COMMAND_GUARD), move |done| Command::Write {
            data,
            done,
        })
    }

    /// Reads one frame with the adapter defaults and returns its payload.
    pub async fn read(&self) -> Result<Bytes> {
        self.read_with(ReadOptions::new()).await
    }

    pub fn blocking_read(&self) -> Result<Bytes> {
        self.blocking_read_with(ReadOptions::new())
    }

    pub async fn read_with(&self, options: ReadOptions) -> Result<Bytes> {
        Ok(self.read_detailed(options).await?.payload())
    }

    pub fn blocking_read_with(&self, options: ReadOptions) -> Result<Bytes> {
        Ok(self.blocking_read_detailed(options)?.payload())
    }

    /// Reads one frame and returns it with its metadata (stop kind,
    /// response delay, fragment timestamps).
    pub async fn read_detailed(&self, options: ReadOptions) -> Result<Frame> {
        self.command(None, move |done| Command::Read { options, done })
            .await
    }

    pub fn blocking_read_detailed(&self, options: ReadOptions) -> Result<Frame> {
        self.blocking_command(None, move |done| Command::Read { options, done })
    }

    /// Clears buffered frames, the in-progress assembly and deferred bytes.
    /// Idempotent.
    pub async fn flush_read(&self) -> Result<()> {
        self.command(Some(COMMAND_GUARD), Command::FlushRead).await
    }

    pub fn blocking_flush_read(&self) -> Result<()> {
        self.blocking_command(Some(COMMAND_GUARD), Command::FlushRead)
    }

    /// Flush, write, read as one façade-level atomic step: no other async
    /// caller's query or write interleaves on this adapter.
    pub async fn query(&self, data: impl AsRef<[u8]>) -> Result<Bytes> {
        self.query_with(data, ReadOptions::new()).await
    }

    pub fn blocking_query(&self, data: impl AsRef<[u8]>) -> Result<Bytes> {
        self.blocking_query_with(data, ReadOptions::new())
    }

    pub async fn query_with(&self, data: impl AsRef<[u8]>, options: ReadOptions) -> Result<Bytes> {
        Ok(self.query_detailed(data, options).await?.payload())
    }

    pub fn blocking_query_with(
        &self,
        data: impl AsRef<[u8]>,
        options: ReadOptions,
    ) -> Result<Bytes> {
        Ok(self.blocking_query_detailed(data, options)?.payload())
    }

    pub async fn query_detailed(
        &self,
        data: impl AsRef<[u8]>,
        options: ReadOptions,
    ) -> Result<Frame> {
        let _atomic = self.async_lock.lock().await;
        self.command(Some(COMMAND_GUARD), Command::FlushRead).await?;
        let data = Bytes::copy_from_slice(data.as_ref());
        self.command(Some(COMMAND_GUARD), move |done| Command::Write { data, done })
            .await?;
        self.command(None, move |done| Command::Read { options, done })
            .await
    }

    pub fn blocking_query_detailed(
        &self,
        data: impl AsRef<[u8]>,
        options: ReadOptions,
    ) -> Result<Frame> {
        let _atomic = self.sync_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.blocking_command(Some(COMMAND_GUARD), Command::FlushRead)?;
        let data = Bytes::copy_from_slice(data.as_ref());
        self.blocking_command(Some(COMMAND_GUARD), move |done| Command::Write {
            data,
            done,
        })?;
        self.blocking_command(None, move |done| Command::Read { options, done })
    }

    // ---- configuration ---------------------------------------------------

    /// Sets the adapter timeout and marks it caller-configured, so later
    /// [`set_default_timeout`](Adapter::set_default_timeout) calls become
    /// no-ops.
    pub async fn set_timeout(&self, timeout: Timeout) -> Result<()> {
        self.mark_timeout_customized();
        self.command(Some(COMMAND_GUARD), move |done| Command::SetTimeout {
            timeout,
            done,
        })
        .await
    }

    pub fn blocking_set_timeout(&self, timeout: Timeout) -> Result<()> {
        self.mark_timeout_customized();
        self.blocking_command(Some(COMMAND_GUARD), move |done| Command::SetTimeout {
            timeout,
            done,
        })
    }

    /// Sets the timeout only if the caller never configured one; used by
    /// protocol layers to install their defaults.
    pub async fn set_default_timeout(&self, timeout: Timeout) -> Result<()> {
        if self.timeout_customized() {
            return Ok(());
        }
        self.command(Some(COMMAND_GUARD), move |done| Command::SetTimeout {
            timeout,
            done,
        })
        .await
    }

    pub fn blocking_set_default_timeout(&self, timeout: Timeout) -> Result<()> {
        if self.timeout_customized() {
            return Ok(());
        }
        self.blocking_command(Some(COMMAND_GUARD), move |done| Command::SetTimeout {
            timeout,
            done,
        })
    }

    pub async fn set_stop_conditions(&self, conditions: Vec<StopCondition>) -> Result<()> {
        self.mark_stop_customized();
        self.command(Some(COMMAND_GUARD), move |done| {
            Command::SetStopConditions { conditions, done }
        })
        .await
    }

    pub fn blocking_set_stop_conditions(&self, conditions: Vec<StopCondition>) -> Result<()> {
        self.mark_stop_customized();
        self.blocking_command(Some(COMMAND_GUARD), move |done| {
            Command::SetStopConditions { conditions, done }
        })
    }

    /// Installs stop conditions only if the caller never configured any.
    pub async fn set_default_stop_conditions(
        &self,
        conditions: Vec<StopCondition>,
    ) -> Result<()> {
        if self.stop_conditions_customized() {
            return Ok(());
        }
        self.command(Some(COMMAND_GUARD), move |done| {
            Command::SetStopConditions { conditions, done }
        })
        .await
    }

    pub fn blocking_set_default_stop_conditions(
        &self,
        conditions: Vec<StopCondition>,
    ) -> Result<()> {
        if self.stop_conditions_customized() {
            return Ok(());
        }
        self.blocking_command(Some(COMMAND_GUARD), move |done| {
            Command::SetStopConditions { conditions, done }
        })
    }

    /// Replaces the endpoint descriptor. Refused while the adapter is open.
    pub async fn set_descriptor(&self, descriptor: Descriptor) -> Result<()> {
        self.command(Some(COMMAND_GUARD), move |done| Command::SetDescriptor {
            descriptor,
            done,
        })
        .await
    }

    pub fn blocking_set_descriptor(&self, descriptor: Descriptor) -> Result<()> {
        self.blocking_command(Some(COMMAND_GUARD), move |done| Command::SetDescriptor {
            descriptor,
            done,
        })
    }

    /// Injects a port into a TCP/UDP descriptor whose port is unset; no-op
    /// otherwise. Protocol layers use this for their well-known ports.
    pub async fn set_default_port(&self, port: u16) -> Result<()> {
        self.command(Some(COMMAND_GUARD), move |done| Command::SetDefaultPort {
            port,
            done,
        })
        .await
    }

    pub fn blocking_set_default_port(&self, port: u16) -> Result<()> {
        self.blocking_command(Some(COMMAND_GUARD), move |done| Command::SetDefaultPort {
            port,
            done,
        })
    }

    /// Installs a callback invoked on the worker thread for every completed
    /// frame and on disconnect.
    pub async fn set_event_callback(
        &self,
        callback: impl Fn(AdapterEvent) + Send + Sync + 'static,
    ) -> Result<()> {
        let callback: EventCallback = Arc::new(callback);
        self.command(Some(COMMAND_GUARD), move |done| Command::SetEventCallback {
            callback: Some(callback),
            done,
        })
        .await
    }

    pub fn blocking_set_event_callback(
        &self,
        callback: impl Fn(AdapterEvent) + Send + Sync + 'static,
    ) -> Result<()> {
        let callback: EventCallback = Arc::new(callback);
        self.blocking_command(Some(COMMAND_GUARD), move |done| Command::SetEventCallback {
            callback: Some(callback),
            done,
        })
    }

    pub async fn clear_event_callback(&self) -> Result<()> {
        self.command(Some(COMMAND_GUARD), |done| Command::SetEventCallback {
            callback: None,
            done,
        })
        .await
    }

    pub fn blocking_clear_event_callback(&self) -> Result<()> {
        self.blocking_command(Some(COMMAND_GUARD), |done| Command::SetEventCallback {
            callback: None,
            done,
        })
    }

    /// True when the caller has configured stop conditions (directly or via
    /// the builder). Protocol layers that need exclusive control of framing
    /// check this before layering.
    pub fn has_custom_stop_conditions(&self) -> bool {
        self.stop_conditions_customized()
    }

    fn mark_timeout_customized(&self) {
        self.flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .timeout_customized = true;
    }

    fn mark_stop_customized(&self) {
        self.flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stop_customized = true;
    }

    fn timeout_customized(&self) -> bool {
        self.flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .timeout_customized
    }

    fn stop_conditions_customized(&self) -> bool {
        self.flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stop_customized
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        // Best-effort close, then let the channel closure stop the worker.
        if let Some(commands) = self.commands.take() {
            let (tx, _rx) = std::sync::mpsc::sync_channel(1);
            let _ = commands.try_send(Command::Close(Completion::Blocking(tx)));
            drop(commands);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("alive", &self.commands.is_some())
            .finish()
    }
}
