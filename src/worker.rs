// ABOUTME: The per-adapter worker: a reactor on a dedicated thread that owns the transport
// ABOUTME: Runs command dispatch, the fragment pipeline, stop-condition evaluation and frame delivery

use crate::adapter::{AdapterEvent, EventCallback, ReadOptions, ReadScope};
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::fragment::{Fragment, Frame, StopKind};
use crate::stop::StopCondition;
use crate::timeout::{Timeout, TimeoutAction};
use crate::transport::Link;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

/// Completed frames kept for later reads; oldest is dropped on overflow.
pub(crate) const FRAME_BUFFER_CAPACITY: usize = 256;

const COMMAND_QUEUE_DEPTH: usize = 32;

/// Completion handle for one command. Blocking callers wait on a rendezvous
/// std channel (so the façade can bound the wait with `recv_timeout`); async
/// callers wait on a oneshot.
pub(crate) enum Completion<T> {
    Blocking(std::sync::mpsc::SyncSender<Result<T>>),
    Async(oneshot::Sender<Result<T>>),
}

impl<T> Completion<T> {
    pub(crate) fn complete(self, result: Result<T>) {
        match self {
            // The receiver may have given up; a dropped completion is not an
            // error on the worker side.
            Completion::Blocking(tx) => {
                let _ = tx.try_send(result);
            }
            Completion::Async(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

/// Commands accepted by the worker, processed strictly in FIFO order.
pub(crate) enum Command {
    Open(Completion<()>),
    Close(Completion<()>),
    Write {
        data: Bytes,
        done: Completion<()>,
    },
    Read {
        options: ReadOptions,
        done: Completion<Frame>,
    },
    FlushRead(Completion<()>),
    SetStopConditions {
        conditions: Vec<StopCondition>,
        done: Completion<()>,
    },
    SetTimeout {
        timeout: Timeout,
        done: Completion<()>,
    },
    SetDescriptor {
        descriptor: Descriptor,
        done: Completion<()>,
    },
    SetDefaultPort {
        port: u16,
        done: Completion<()>,
    },
    IsOpen(Completion<bool>),
    SetEventCallback {
        callback: Option<EventCallback>,
        done: Completion<()>,
    },
}

/// The at-most-one in-flight read registered with the worker.
struct PendingRead {
    done: Completion<Frame>,
    scope: ReadScope,
    admitted: Instant,
    timeout: Timeout,
    response_deadline: Option<Instant>,
    /// Per-read stop-condition override, installed at the next frame boundary.
    override_conditions: Option<Vec<StopCondition>>,
    /// The adapter-level conditions displaced by the override.
    saved_conditions: Option<Vec<StopCondition>>,
    got_first_fragment: bool,
}

impl PendingRead {
    /// A frame whose first fragment has this timestamp qualifies for this
    /// read.
    fn qualifies(&self, first_fragment_ts: Instant) -> bool {
        match self.scope {
            ReadScope::Buffered => true,
            ReadScope::Next => first_fragment_ts > self.admitted,
        }
    }
}

pub(crate) struct WorkerConfig {
    pub descriptor: Descriptor,
    pub timeout: Timeout,
    pub stop_conditions: Vec<StopCondition>,
    pub auto_open: bool,
}

pub(crate) struct Worker {
    commands: mpsc::Receiver<Command>,
    descriptor: Descriptor,
    link: Option<Link>,
    stop_conditions: Vec<StopCondition>,
    timeout: Timeout,
    auto_open: bool,
    /// Fragments of the frame currently being assembled.
    assembly: Vec<Fragment>,
    /// Whether the current frame was seeded from parked deferred bytes.
    carry_seeded: bool,
    /// Deferred bytes parked between frames; absorbed at the next frame
    /// boundary. Invariant: `carry.is_some()` implies the assembly is empty.
    carry: Option<Fragment>,
    last_write: Option<Instant>,
    frames: VecDeque<Frame>,
    pending: Option<PendingRead>,
    callback: Option<EventCallback>,
}

enum Wakeup {
    Command(Option<Command>),
    Data(io::Result<Bytes>),
    Deadline,
}

/// Spawns the worker on its own thread with a current-thread runtime and
/// returns the command channel plus the join handle.
pub(crate) fn spawn(config: WorkerConfig) -> (mpsc::Sender<Command>, std::thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let handle = std::thread::Builder::new()
        .name("instrio-worker".into())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
                .expect("worker runtime construction cannot fail");
            runtime.block_on(Worker::new(rx, config).run());
        })
        .expect("spawning the adapter worker thread cannot fail");
    (tx, handle)
}

impl Worker {
    fn new(commands: mpsc::Receiver<Command>, config: WorkerConfig) -> Worker {
        Worker {
            commands,
            descriptor: config.descriptor,
            link: None,
            stop_conditions: config.stop_conditions,
            timeout: config.timeout,
            auto_open: config.auto_open,
            assembly: Vec::new(),
            carry_seeded: false,
            carry: None,
            last_write: None,
            frames: VecDeque::new(),
            pending: None,
            callback: None,
        }
    }

    async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();
            let has_link = self.link.is_some();
            let commands = &mut self.commands;
            let link = &mut self.link;
            let wakeup = tokio::select! {
                biased;
                command = commands.recv() => Wakeup::Command(command),
                _ = sleep_until(deadline.unwrap_or_else(far_deadline)), if deadline.is_some() => {
                    Wakeup::Deadline
                }
                read = async {
                    match link.as_mut() {
                        Some(link) => link.read_chunk().await,
                        None => std::future::pending().await,
                    }
                }, if has_link => Wakeup::Data(read),
            };
            match wakeup {
                Wakeup::Command(Some(command)) => self.handle_command(command).await,
                Wakeup::Command(None) => break,
                Wakeup::Deadline => self.handle_deadline(Instant::now()),
                Wakeup::Data(result) => self.handle_data(result),
            }
        }
        // The façade dropped its sender: release everything.
        self.close_link();
        tracing::debug!("worker stopped");
    }

    /// The next instant at which the worker must act without input: the
    /// earliest stop-condition wakeup (only while a frame is in progress)
    /// or the pending read's response deadline (only while armed).
    fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = None;
        if !self.assembly.is_empty() {
            for condition in &self.stop_conditions {
                deadline = merge_deadline(deadline, condition.wakeup());
            }
        }
        if let Some(pending) = &self.pending {
            if !pending.got_first_fragment {
                deadline = merge_deadline(deadline, pending.response_deadline);
            }
        }
        deadline
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open(done) => {
                let result = self.open_link().await;
                done.complete(result);
            }
            Command::Close(done) => {
                self.close_link();
                done.complete(Ok(()));
            }
            Command::Write { data, done } => {
                let result = self.write_link(data).await;
                done.complete(result);
            }
            Command::Read { options, done } => self.register_read(options, done),
            Command::FlushRead(done) => {
                self.frames.clear();
                self.reset_assembly();
                done.complete(Ok(()));
            }
            Command::SetStopConditions {
                mut conditions,
                done,
            } => {
                for condition in &mut conditions {
                    condition.flush();
                }
                self.stop_conditions = conditions;
                done.complete(Ok(()));
            }
            Command::SetTimeout { timeout, done } => {
                self.timeout = timeout;
                done.complete(Ok(()));
            }
            Command::SetDescriptor { descriptor, done } => {
                let result = if self.link.is_some() {
                    Err(Error::Configuration(
                        "cannot replace the descriptor while the adapter is open".into(),
                    ))
                } else {
                    self.descriptor = descriptor;
                    Ok(())
                };
                done.complete(result);
            }
            Command::SetDefaultPort { port, done } => {
                self.descriptor.apply_default_port(port);
                done.complete(Ok(()));
            }
            Command::IsOpen(done) => done.complete(Ok(self.link.is_some())),
            Command::SetEventCallback { callback, done } => {
                self.callback = callback;
                done.complete(Ok(()));
            }
        }
    }

    async fn open_link(&mut self) -> Result<()> {
        if self.link.is_some() {
            // Re-opening an open transport is a no-op success.
            return Ok(());
        }
        if !self.descriptor.is_initialized() {
            return Err(Error::Configuration(format!(
                "descriptor {} is missing mandatory parameters",
                self.descriptor
            )));
        }
        let link = Link::open(&self.descriptor).await?;
        tracing::debug!(endpoint = %self.descriptor, "transport opened");
        self.link = Some(link);
        Ok(())
    }

    /// Explicit close: cancels any pending read with a disconnected error
    /// and clears the frame buffer and assembly. Idempotent.
    fn close_link(&mut self) {
        if self.link.take().is_some() {
            tracing::debug!(endpoint = %self.descriptor, "transport closed");
        }
        self.frames.clear();
        self.reset_assembly();
        if let Some(mut pending) = self.pending.take() {
            self.restore_override(&mut pending);
            pending.done.complete(Err(Error::Disconnected));
        }
    }

    async fn write_link(&mut self, data: Bytes) -> Result<()> {
        if self.link.is_none() {
            if !self.auto_open {
                return Err(Error::Configuration("adapter is not open".into()));
            }
            self.open_link().await?;
        }
        let Some(link) = self.link.as_mut() else {
            return Err(Error::Configuration("adapter is not open".into()));
        };
        match link.write_all(&data).await {
            Ok(()) => {
                self.last_write = Some(Instant::now());
                tracing::debug!(bytes = data.len(), "write");
                Ok(())
            }
            Err(error) => {
                tracing::warn!("transport write failed: {error}");
                self.drop_link(Error::Disconnected);
                Err(Error::Write(error))
            }
        }
    }

    fn register_read(&mut self, options: ReadOptions, done: Completion<Frame>) {
        if self.pending.is_some() {
            done.complete(Err(Error::Worker(
                "a read is already pending on this adapter".into(),
            )));
            return;
        }
        if self.link.is_none() {
            done.complete(Err(Error::Configuration("adapter is not open".into())));
            return;
        }

        let timeout = options.timeout.unwrap_or(self.timeout);
        let scope = options.scope;

        // Buffered scope is served from already-completed frames first.
        if scope == ReadScope::Buffered {
            if let Some(frame) = self.frames.pop_front() {
                done.complete(Ok(frame));
                return;
            }
        }

        // Without a stop condition to close frames and without a response
        // window, the read could never complete.
        let no_conditions = options
            .stop_conditions
            .as_ref()
            .map_or(self.stop_conditions.is_empty(), Vec::is_empty);
        if no_conditions && timeout.response().is_none() {
            done.complete(Err(Error::Configuration(
                "read needs a stop condition or a response timeout to complete".into(),
            )));
            return;
        }

        let now = Instant::now();
        self.pending = Some(PendingRead {
            done,
            scope,
            admitted: now,
            timeout,
            response_deadline: timeout.deadline_from(now),
            override_conditions: options.stop_conditions,
            saved_conditions: None,
            got_first_fragment: false,
        });

        // A read admission is a frame boundary: parked deferred bytes are
        // re-evaluated under the read's effective conditions and may satisfy
        // it immediately.
        if self.assembly.is_empty() {
            if let Some(carry) = self.carry.take() {
                self.revisit_carry(carry);
            }
        }
    }

    fn handle_data(&mut self, result: io::Result<Bytes>) {
        match result {
            Err(error) => {
                tracing::warn!("transport read failed: {error}");
                self.drop_link(Error::Read(error));
            }
            Ok(data) if data.is_empty() => {
                tracing::debug!(endpoint = %self.descriptor, "endpoint closed the connection");
                self.drop_link(Error::Disconnected);
            }
            Ok(data) => {
                let fragment = Fragment::new(data, Instant::now());
                self.ingest(fragment);
            }
        }
    }

    /// Unexpected loss of the transport: resets the assembly, fails the
    /// pending read and emits a disconnect event. Buffered frames survive.
    fn drop_link(&mut self, error: Error) {
        self.link = None;
        self.reset_assembly();
        if let Some(mut pending) = self.pending.take() {
            self.restore_override(&mut pending);
            pending.done.complete(Err(error));
        }
        self.emit(AdapterEvent::Disconnected);
    }

    fn handle_deadline(&mut self, now: Instant) {
        // Response timeout strictly precedes stop-condition deadlines, and
        // only applies while no qualifying fragment has been seen.
        let response_due = self.pending.as_ref().is_some_and(|pending| {
            !pending.got_first_fragment
                && pending.response_deadline.is_some_and(|d| now >= d)
        });
        if response_due {
            if let Some(mut pending) = self.pending.take() {
                self.restore_override(&mut pending);
                match pending.timeout.action() {
                    TimeoutAction::ReturnEmpty => {
                        tracing::debug!("response timeout, returning an empty frame");
                        pending.done.complete(Ok(Frame::empty(now)));
                    }
                    TimeoutAction::Error => {
                        let window = pending.timeout.response().unwrap_or_default();
                        pending.done.complete(Err(Error::Timeout(window)));
                    }
                }
            }
            return;
        }

        // A stop-condition deadline closes the current frame; first due
        // condition in install order wins.
        if !self.assembly.is_empty() {
            let fired = self
                .stop_conditions
                .iter()
                .find(|condition| condition.due(now))
                .map(StopCondition::kind);
            if let Some(kind) = fired {
                self.finish_frame(kind, now);
            }
        }
    }

    /// Feeds one live transport fragment through the pipeline, preceded by
    /// any parked deferred bytes so byte order is preserved.
    fn ingest(&mut self, fragment: Fragment) {
        if self.assembly.is_empty() {
            if let Some(carry) = self.carry.take() {
                self.absorb(carry, true, true);
            }
        }
        self.absorb(fragment, false, false);
    }

    /// Runs one fragment through the stop-condition stack, completing every
    /// frame it closes. A trailing remainder that does not close a frame is
    /// committed to the assembly when `commit_tail` is set (more data follows
    /// immediately) and parked as deferred carry otherwise, so the next frame
    /// boundary can still install a per-read override before consuming it.
    fn absorb(&mut self, fragment: Fragment, from_carry: bool, commit_tail: bool) {
        let mut frag = fragment;
        let mut is_remainder = false;
        loop {
            let starting = self.assembly.is_empty();
            if starting && is_remainder && !commit_tail {
                if !self.try_complete_at_boundary(&mut frag, from_carry) {
                    return;
                }
                continue;
            }
            if starting {
                self.begin_frame(&frag, from_carry);
            }
            match self.evaluate_ordered(&frag) {
                None => {
                    self.assembly.push(frag);
                    return;
                }
                Some((kind, kept, deferred)) => {
                    if !kept.is_empty() {
                        self.assembly.push(frag.with_data(kept));
                    }
                    self.finish_frame(kind, frag.timestamp());
                    if deferred.is_empty() {
                        return;
                    }
                    frag = frag.with_data(deferred);
                    is_remainder = true;
                }
            }
        }
    }

    /// Re-evaluates parked deferred bytes at a read admission boundary.
    fn revisit_carry(&mut self, carry: Fragment) {
        let mut frag = carry;
        loop {
            if !self.try_complete_at_boundary(&mut frag, true) {
                return;
            }
        }
    }

    /// Speculative frame boundary for deferred bytes: completes a frame if
    /// the bytes close one outright, otherwise parks them untouched. Returns
    /// true when a frame completed and `frag` now holds the next remainder.
    fn try_complete_at_boundary(&mut self, frag: &mut Fragment, from_carry: bool) -> bool {
        self.install_override();
        let now = frag.timestamp();
        for condition in &mut self.stop_conditions {
            condition.init(now);
        }
        match self.evaluate_ordered(frag) {
            Some((kind, kept, deferred)) => {
                self.carry_seeded = from_carry;
                if !kept.is_empty() {
                    self.assembly.push(frag.with_data(kept));
                }
                self.finish_frame(kind, frag.timestamp());
                if deferred.is_empty() {
                    return false;
                }
                *frag = frag.with_data(deferred);
                true
            }
            None => {
                for condition in &mut self.stop_conditions {
                    condition.flush();
                }
                self.carry = Some(frag.clone());
                false
            }
        }
    }

    /// First fragment of a new frame: installs any pending override, inits
    /// the stop conditions and disarms the response timeout if the fragment
    /// qualifies.
    fn begin_frame(&mut self, first: &Fragment, from_carry: bool) {
        self.install_override();
        let now = first.timestamp();
        for condition in &mut self.stop_conditions {
            condition.init(now);
        }
        self.carry_seeded = from_carry;
        if let Some(pending) = &mut self.pending {
            if !pending.got_first_fragment && pending.qualifies(first.timestamp()) {
                pending.got_first_fragment = true;
            }
        }
    }

    /// Evaluates the installed conditions in order; the first stop wins.
    fn evaluate_ordered(&mut self, fragment: &Fragment) -> Option<(StopKind, Bytes, Bytes)> {
        for condition in &mut self.stop_conditions {
            let eval = condition.evaluate(fragment);
            if eval.stop {
                return Some((condition.kind(), eval.kept, eval.deferred));
            }
        }
        None
    }

    fn finish_frame(&mut self, kind: StopKind, stop_timestamp: Instant) {
        let fragments = std::mem::take(&mut self.assembly);
        let response_delay = match (fragments.first(), self.last_write) {
            (Some(first), Some(write)) if first.timestamp() >= write => {
                Some(first.timestamp().duration_since(write))
            }
            _ => None,
        };
        let duration = fragments
            .first()
            .map(|first| stop_timestamp.duration_since(first.timestamp()));
        let frame = Frame {
            fragments,
            stop_timestamp,
            stop_kind: Some(kind),
            previous_buffer_used: self.carry_seeded,
            response_delay,
        };
        self.carry_seeded = false;
        for condition in &mut self.stop_conditions {
            condition.flush();
        }
        tracing::debug!(stop = ?kind, bytes = frame.len(), ?duration, "frame completed");
        self.deliver(frame);
    }

    /// Completes the pending read with the frame if it qualifies, otherwise
    /// buffers it. The event callback sees every frame either way.
    fn deliver(&mut self, frame: Frame) {
        if self.callback.is_some() {
            self.emit(AdapterEvent::Frame(frame.clone()));
        }
        let qualifies = match (&self.pending, frame.fragments().first()) {
            (Some(pending), Some(first)) => pending.qualifies(first.timestamp()),
            _ => false,
        };
        if qualifies {
            if let Some(mut pending) = self.pending.take() {
                self.restore_override(&mut pending);
                pending.done.complete(Ok(frame));
            }
        } else {
            if self.frames.len() == FRAME_BUFFER_CAPACITY {
                self.frames.pop_front();
                tracing::debug!("frame buffer full, dropping the oldest frame");
            }
            self.frames.push_back(frame);
        }
    }

    fn install_override(&mut self) {
        if let Some(pending) = &mut self.pending {
            if let Some(conditions) = pending.override_conditions.take() {
                pending.saved_conditions =
                    Some(std::mem::replace(&mut self.stop_conditions, conditions));
            }
        }
    }

    fn restore_override(&mut self, pending: &mut PendingRead) {
        pending.override_conditions = None;
        if let Some(saved) = pending.saved_conditions.take() {
            self.stop_conditions = saved;
            if self.assembly.is_empty() {
                for condition in &mut self.stop_conditions {
                    condition.flush();
                }
            }
        }
    }

    fn reset_assembly(&mut self) {
        self.assembly.clear();
        self.carry = None;
        self.carry_seeded = false;
        for condition in &mut self.stop_conditions {
            condition.flush();
        }
    }

    /// Invokes the user event callback, suppressing panics so a misbehaving
    /// callback can never take the worker down.
    fn emit(&self, event: AdapterEvent) {
        if let Some(callback) = &self.callback {
            if catch_unwind(AssertUnwindSafe(|| callback.as_ref()(event))).is_err() {
                tracing::error!("event callback panicked; event dropped");
            }
        }
    }
}

fn merge_deadline(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Placeholder instant for a disabled sleep arm; never actually awaited.
fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}
