//! The channel: one command stream in each direction over a stream pair
//!
//! A reader task decodes inbound frames in order and dispatches them. Responses,
//! unexport notices and pipe traffic are handled inline; requests run on their
//! own tasks, bounded by a semaphore. A writer task owns the outbound stream
//! and stamps frames with sequence numbers in the order they were queued.

use crate::builder::{ChannelConfig, DecodeFailurePolicy, Established};
use crate::call::{CallContext, Callable, Ping, RemoteFuture, UnitRegistry};
use crate::current::{self, Recording, Scope};
use crate::diagnostics::{ChannelListener, Counters, PerformanceCounters};
use crate::export::{method_result, ExportList, ExportTable, ImportTable, MethodCall, CHANNEL_OID};
use crate::loader::{CodeBase, LoaderTable};
use crate::mode::Mode;
use crate::pipe::PipeTable;
use crate::{CallError, ChannelError};
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use remoting_proto::{
    CallId, Capability, Command, FailureKind, Frame, FrameCodec, ObjectId, Outcome, ProtocolError, ProxyError,
    Sequencer,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, Location};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch, Notify, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub(crate) type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Room for the frame header around a command payload
const FRAME_OVERHEAD: usize = 16;

tokio::task_local! {
    static EXECUTING: Channel;
}

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Accepting calls and dispatching commands
    Active,
    /// No new calls; outstanding ones still resolve
    Closing,
    /// Terminated
    Closed,
}

enum Outgoing {
    Frame { payload: Bytes, last: bool },
    Shutdown,
}

type Pending = HashMap<CallId, oneshot::Sender<Result<Outcome, ChannelError>>>;

enum Request {
    Unit {
        unit: String,
        payload: Bytes,
        loader: Option<ObjectId>,
        refs: Vec<ObjectId>,
    },
    Method {
        oid: ObjectId,
        method: String,
        args: Bytes,
        refs: Vec<ObjectId>,
    },
}

pub(crate) struct Inner {
    name: String,
    id: Uuid,
    pub(crate) config: ChannelConfig,
    capability: Capability,
    remote_capability: Capability,
    mode: Mode,
    header: Option<Bytes>,
    outbound: mpsc::UnboundedSender<Outgoing>,
    state: watch::Sender<ChannelState>,
    cause: Mutex<Option<ChannelError>>,
    out_closed: AtomicBool,
    next_call_id: AtomicU64,
    pending: Mutex<Option<Pending>>,
    pending_changed: Notify,
    executing: Mutex<HashMap<CallId, AbortHandle>>,
    workers: Arc<Semaphore>,
    pub(crate) exports: ExportTable,
    pub(crate) imports: ImportTable,
    pub(crate) loaders: LoaderTable,
    pub(crate) pipes: PipeTable,
    properties: Mutex<HashMap<String, Value>>,
    properties_changed: watch::Sender<u64>,
    listeners: Mutex<Vec<Arc<dyn ChannelListener>>>,
    pub(crate) counters: Counters,
    registry: UnitRegistry,
    runtime: Handle,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

/// A bidirectional command channel to a peer.
///
/// Cloning is cheap; every clone refers to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    pub(crate) fn start(config: ChannelConfig, registry: UnitRegistry, established: Established) -> Self {
        let Established {
            mode,
            header,
            remote_capability,
            reader,
            writer,
            codec_in,
            codec_out,
            seq_in,
            seq_out,
        } = established;

        let (outbound, outgoing) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Active);
        let (properties_changed, _) = watch::channel(0);
        let capability = config.capability.negotiate(remote_capability);

        let channel = Channel {
            inner: Arc::new(Inner {
                name: config.name.clone(),
                id: Uuid::new_v4(),
                capability,
                remote_capability,
                mode,
                header,
                outbound,
                state,
                cause: Mutex::new(None),
                out_closed: AtomicBool::new(false),
                next_call_id: AtomicU64::new(1),
                pending: Mutex::new(Some(HashMap::new())),
                pending_changed: Notify::new(),
                executing: Mutex::new(HashMap::new()),
                workers: Arc::new(Semaphore::new(config.max_concurrent_calls)),
                exports: ExportTable::new(),
                imports: ImportTable::default(),
                loaders: LoaderTable::default(),
                pipes: PipeTable::default(),
                properties: Mutex::new(HashMap::new()),
                properties_changed,
                listeners: Mutex::new(Vec::new()),
                counters: Counters::default(),
                registry,
                runtime: Handle::current(),
                reader_task: Mutex::new(None),
                config,
            }),
        };
        info!("Channel {} established ({:?}, {:?})", channel.name(), mode, capability);

        tokio::spawn(channel.clone().write_loop(writer, codec_out, seq_out, outgoing));
        let reader_task = tokio::spawn(channel.clone().read_loop(reader, codec_in, seq_in));
        if !channel.is_closed() {
            *channel.inner.reader_task.lock() = Some(reader_task);
        }
        channel
    }

    pub(crate) fn inner(&self) -> &Inner {
        &self.inner
    }

    /// Whether both handles refer to the same channel
    pub fn same(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Unique identifier of this channel instance
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Features both peers support
    pub fn capability(&self) -> Capability {
        self.inner.capability
    }

    /// Features the peer announced
    pub fn remote_capability(&self) -> Capability {
        self.inner.remote_capability
    }

    /// Transmission mode in effect
    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    /// Bytes the peer sent before its preamble, if capture was requested
    pub fn header(&self) -> Option<&Bytes> {
        self.inner.header.as_ref()
    }

    /// Whether this side refuses work units from the peer
    pub fn is_restricted(&self) -> bool {
        self.inner.config.restricted
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    /// Whether the channel has terminated
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// What terminated the channel
    pub fn close_cause(&self) -> Option<ChannelError> {
        self.inner.cause.lock().clone()
    }

    /// Channel executing the current request, or encoding/decoding on this thread
    pub fn current() -> Option<Channel> {
        EXECUTING
            .try_with(Channel::clone)
            .ok()
            .or_else(|| current::current().map(|scope| scope.channel))
    }

    pub(crate) fn closed_error(&self) -> ChannelError {
        match self.inner.cause.lock().as_ref() {
            Some(closed @ ChannelError::Closed { .. }) => closed.clone(),
            cause => ChannelError::Closed {
                channel: self.inner.name.clone(),
                cause: cause.map(ToString::to_string),
            },
        }
    }

    fn ensure_active(&self) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Active => Ok(()),
            ChannelState::Closing => Err(ChannelError::Closed {
                channel: self.inner.name.clone(),
                cause: Some("channel is closing".to_string()),
            }),
            ChannelState::Closed => Err(self.closed_error()),
        }
    }

    pub(crate) fn scope(&self, recording: Option<Recording>) -> Scope {
        let inherited = current::current().filter(|scope| scope.channel.same(self));
        let (inherited_recording, created_at) = match inherited {
            Some(scope) => (scope.recording, scope.created_at),
            None => (None, None),
        };
        Scope {
            channel: self.clone(),
            recording: recording.or(inherited_recording),
            counted: None,
            created_at,
        }
    }

    /// Encode a value in the context of this channel.
    ///
    /// Local objects inside the value are exported; inside an export
    /// recording they are recorded and released with it.
    pub fn encode<V: Serialize + ?Sized>(&self, value: &V) -> Result<Bytes, ChannelError> {
        current::with_scope(self.scope(None), || rmp_serde::to_vec(value))
            .map(Bytes::from)
            .map_err(ChannelError::from)
    }

    /// Decode a value in the context of this channel
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ChannelError> {
        current::with_scope(self.scope(None), || rmp_serde::from_slice(bytes)).map_err(ChannelError::from)
    }

    /// Decode a request payload, also returning the counted references it claimed
    pub(crate) fn decode_counted<T: DeserializeOwned>(&self, bytes: &[u8]) -> (Result<T, ChannelError>, Vec<ObjectId>) {
        let counted = Recording::default();
        let scope = Scope {
            counted: Some(counted.clone()),
            ..self.scope(None)
        };
        let decoded = current::with_scope(scope, || rmp_serde::from_slice(bytes)).map_err(ChannelError::from);
        let claimed = counted.borrow_mut().drain(..).collect();
        (decoded, claimed)
    }

    /// Hand back counted references of a payload that were never claimed
    pub(crate) fn return_refs(&self, mut refs: Vec<ObjectId>, claimed: &[ObjectId]) {
        for oid in claimed {
            if let Some(index) = refs.iter().position(|r| r == oid) {
                refs.swap_remove(index);
            }
        }
        let mut counts: HashMap<ObjectId, u32> = HashMap::new();
        for oid in refs {
            *counts.entry(oid).or_default() += 1;
        }
        for (oid, count) in counts {
            debug!("Returning {} unclaimed references to #{} on {}", count, oid, self.inner.name);
            if let Err(e) = self.send(Command::Unexport { oid, count }) {
                debug!("Could not return references to #{}: {}", oid, e);
            }
        }
    }

    fn encode_recorded<V: Serialize + ?Sized>(
        &self,
        value: &V,
        site: &'static Location<'static>,
    ) -> Result<(Bytes, ExportList, Vec<ObjectId>), ChannelError> {
        let recording = Recording::default();
        let counted = Recording::default();
        let scope = Scope {
            channel: self.clone(),
            recording: Some(recording.clone()),
            counted: Some(counted.clone()),
            created_at: Some(site.to_string()),
        };
        let encoded = current::with_scope(scope, || rmp_serde::to_vec(value));
        let oids = recording.borrow_mut().drain(..).collect();
        let refs = counted.borrow_mut().drain(..).collect();
        let exports = ExportList::new(self.clone(), oids);
        match encoded {
            Ok(bytes) => Ok((Bytes::from(bytes), exports, refs)),
            Err(e) => {
                exports.release();
                Err(e.into())
            }
        }
    }

    /// Queue a command for the writer
    pub(crate) fn send(&self, command: Command) -> Result<(), ChannelError> {
        if self.inner.out_closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        self.enqueue(command)
    }

    fn enqueue(&self, command: Command) -> Result<(), ChannelError> {
        let last = matches!(command, Command::Close { .. });
        let payload = command
            .to_msgpack()
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;
        if payload.len() + FRAME_OVERHEAD > self.inner.config.max_frame_size {
            return Err(ChannelError::Serialization(format!(
                "{} needs {} bytes, more than the {} byte frame limit",
                command,
                payload.len(),
                self.inner.config.max_frame_size
            )));
        }
        debug!("Sending {} on {}", command, self.inner.name);
        self.inner
            .outbound
            .send(Outgoing::Frame {
                payload: Bytes::from(payload),
                last,
            })
            .map_err(|_| self.closed_error())
    }

    fn register_call(&self) -> Result<(CallId, oneshot::Receiver<Result<Outcome, ChannelError>>), ChannelError> {
        self.ensure_active()?;
        let (tx, rx) = oneshot::channel();
        let id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        match self.inner.pending.lock().as_mut() {
            Some(pending) => {
                pending.insert(id, tx);
                Ok((id, rx))
            }
            None => Err(self.closed_error()),
        }
    }

    /// Timer on the channel's runtime, usable from threads outside it
    pub(crate) fn sleep(&self, duration: Duration) -> Pin<Box<Sleep>> {
        let _runtime = self.inner.runtime.enter();
        Box::pin(tokio::time::sleep(duration))
    }

    pub(crate) fn forget_call(&self, id: CallId) {
        if let Some(pending) = self.inner.pending.lock().as_mut() {
            pending.remove(&id);
        }
        self.inner.pending_changed.notify_waiters();
    }

    fn pending_count(&self) -> usize {
        self.inner.pending.lock().as_ref().map_or(0, HashMap::len)
    }

    fn start_call<T, E, V>(
        &self,
        value: &V,
        site: &'static Location<'static>,
        request: impl FnOnce(CallId, Bytes, Vec<ObjectId>, String) -> Command,
    ) -> RemoteFuture<T, E>
    where
        V: Serialize + ?Sized,
    {
        if let Err(e) = self.ensure_active() {
            return RemoteFuture::failed(self.clone(), e.into());
        }
        let (payload, exports, refs) = match self.encode_recorded(value, site) {
            Ok(encoded) => encoded,
            Err(e) => return RemoteFuture::failed(self.clone(), e.into()),
        };
        let (id, rx) = match self.register_call() {
            Ok(registered) => registered,
            Err(e) => {
                exports.release();
                return RemoteFuture::failed(self.clone(), e.into());
            }
        };
        if let Err(e) = self.send(request(id, payload, refs, site.to_string())) {
            self.forget_call(id);
            exports.release();
            return RemoteFuture::failed(self.clone(), e.into());
        }
        RemoteFuture::waiting(self.clone(), id, rx, exports, self.inner.config.call_timeout)
    }

    fn submit<U: Callable>(
        &self,
        code_base: Option<&CodeBase>,
        unit: U,
        site: &'static Location<'static>,
    ) -> RemoteFuture<U::Output, U::Error> {
        let code_base = code_base.or(self.inner.config.code_base.as_ref());
        let loader = match code_base.map(|cb| self.code_base_ref(cb)).transpose() {
            Ok(loader) => loader.map(|(oid, _)| oid),
            Err(e) => return RemoteFuture::failed(self.clone(), e.into()),
        };
        self.start_call(&unit, site, |id, payload, refs, created_at| Command::UserRequest {
            id,
            unit: U::NAME.to_string(),
            payload,
            loader,
            refs,
            created_at: Some(created_at),
        })
    }

    /// Send `unit` to the peer and return a handle on its eventual result
    #[track_caller]
    pub fn call_async<U: Callable>(&self, unit: U) -> RemoteFuture<U::Output, U::Error> {
        self.submit(None, unit, Location::caller())
    }

    /// Execute `unit` on the peer and wait for its result
    #[track_caller]
    pub fn call<U: Callable>(
        &self,
        unit: U,
    ) -> impl Future<Output = Result<U::Output, CallError<U::Error>>> + Send + 'static {
        self.submit(None, unit, Location::caller())
    }

    /// Like [`Channel::call_async`], resolving code through `code_base`
    #[track_caller]
    pub fn call_with_async<U: Callable>(&self, code_base: &CodeBase, unit: U) -> RemoteFuture<U::Output, U::Error> {
        self.submit(Some(code_base), unit, Location::caller())
    }

    /// Like [`Channel::call`], resolving code through `code_base`
    #[track_caller]
    pub fn call_with<U: Callable>(
        &self,
        code_base: &CodeBase,
        unit: U,
    ) -> impl Future<Output = Result<U::Output, CallError<U::Error>>> + Send + 'static {
        self.submit(Some(code_base), unit, Location::caller())
    }

    /// Execute `unit` on the peer, blocking the current thread.
    ///
    /// Must not be called from inside an async task.
    #[track_caller]
    pub fn call_blocking<U: Callable>(&self, unit: U) -> Result<U::Output, CallError<U::Error>> {
        let site = Location::caller();
        let _runtime = self.inner.runtime.enter();
        futures::executor::block_on(self.submit(None, unit, site))
    }

    /// Round trip to the peer
    #[track_caller]
    pub fn ping(&self) -> impl Future<Output = Result<(), CallError>> + Send + 'static {
        self.submit(None, Ping, Location::caller())
    }

    pub(crate) fn invoke_remote<A, R>(
        &self,
        oid: ObjectId,
        method: &str,
        args: &A,
        site: &'static Location<'static>,
    ) -> RemoteFuture<R>
    where
        A: Serialize + ?Sized,
    {
        let method = method.to_string();
        self.start_call(args, site, |id, args, refs, created_at| Command::RpcRequest {
            id,
            oid,
            method,
            args,
            refs,
            created_at: Some(created_at),
        })
    }

    async fn read_loop(self, mut reader: BoxReader, mut codec: FrameCodec, mut sequencer: Sequencer) {
        info!("Starting reader for {}", self.inner.name);
        let cause = loop {
            let frame = match codec.read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break ChannelError::Transport("Unexpected termination of the channel".to_string()),
                Err(ProtocolError::Serialization(msg)) => {
                    sequencer.skip();
                    match self.decode_failed(&msg) {
                        Some(cause) => break cause,
                        None => continue,
                    }
                }
                Err(e) => break e.into(),
            };
            if let Err(e) = sequencer.accept(&frame) {
                break e.into();
            }

            let command = match Command::from_msgpack(&frame.payload) {
                Ok(command) => command,
                Err(e) => match self.decode_failed(&e.to_string()) {
                    Some(cause) => break cause,
                    None => continue,
                },
            };
            debug!("Received {} on {}", command, self.inner.name);
            if let Some(cause) = self.handle(command) {
                break cause;
            }
            if frame.is_last() {
                break self.closed_error();
            }
        };
        self.terminate(cause);
    }

    fn decode_failed(&self, msg: &str) -> Option<ChannelError> {
        match self.inner.config.decode_failure_policy {
            DecodeFailurePolicy::Skip => {
                warn!("Skipping undecodable command on {}: {}", self.inner.name, msg);
                None
            }
            DecodeFailurePolicy::Terminate => Some(ChannelError::Protocol(format!("Malformed command: {}", msg))),
        }
    }

    async fn write_loop(
        self,
        mut writer: BoxWriter,
        codec: FrameCodec,
        mut sequencer: Sequencer,
        mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    ) {
        while let Some(item) = outgoing.recv().await {
            let (payload, last) = match item {
                Outgoing::Frame { payload, last } => (payload, last),
                Outgoing::Shutdown => break,
            };
            let frame = if last {
                Frame::last(sequencer.advance(), payload)
            } else {
                Frame::data(sequencer.advance(), payload)
            };
            if let Err(e) = codec.write_frame(&mut writer, &frame).await {
                error!("Failed to write to {}: {}", self.inner.name, e);
                self.terminate(e.into());
                break;
            }
            if last {
                break;
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!("Shutting down the stream of {}: {}", self.inner.name, e);
        }
    }

    /// Dispatch one inbound command; returns the cause if it ends the channel
    fn handle(&self, command: Command) -> Option<ChannelError> {
        match command {
            Command::Capability(capability) => {
                warn!("Ignoring repeated capability announcement {:?}", capability);
            }
            Command::UserRequest {
                id,
                unit,
                payload,
                loader,
                refs,
                created_at,
            } => {
                debug!("Request {} for {} from {}", id, unit, created_at.as_deref().unwrap_or("unknown site"));
                self.spawn_request(
                    id,
                    Request::Unit {
                        unit,
                        payload,
                        loader,
                        refs,
                    },
                );
            }
            Command::RpcRequest {
                id,
                oid,
                method,
                args,
                refs,
                created_at,
            } => {
                debug!("Call {} to #{}.{} from {}", id, oid, method, created_at.as_deref().unwrap_or("unknown site"));
                self.spawn_request(id, Request::Method { oid, method, args, refs });
            }
            Command::Response { id, outcome } => {
                let waiter = self.inner.pending.lock().as_mut().and_then(|p| p.remove(&id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(outcome));
                    }
                    None => warn!("Received response for unknown request: {}", id),
                }
                self.inner.pending_changed.notify_waiters();
            }
            Command::Unexport { oid, count } => self.inner.exports.release(oid, count),
            command @ (Command::PipeConnect { .. }
            | Command::PipeData { .. }
            | Command::PipeAck { .. }
            | Command::PipeEof { .. }
            | Command::PipeDead { .. }) => self.inner.pipes.handle(self, command),
            Command::Close { created_at, cause } => {
                info!(
                    "Peer closed {} ({}) at {}",
                    self.inner.name,
                    cause.as_deref().unwrap_or("no reason given"),
                    created_at.as_deref().unwrap_or("unknown site")
                );
                let initiated = self.state() == ChannelState::Closing;
                if let Err(e) = self.send_close(None, Some("acknowledging close from peer".to_string())) {
                    debug!("Could not acknowledge close: {}", e);
                }
                let cause = if initiated { "orderly shutdown" } else { "orderly shutdown by peer" };
                return Some(ChannelError::Closed {
                    channel: self.inner.name.clone(),
                    cause: Some(cause.to_string()),
                });
            }
        }
        None
    }

    fn spawn_request(&self, id: CallId, request: Request) {
        let channel = self.clone();
        let workers = self.inner.workers.clone();
        let mut executing = self.inner.executing.lock();
        let task = tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            let execution = EXECUTING.scope(channel.clone(), channel.execute(request));
            let outcome = AssertUnwindSafe(execution)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Outcome::failure(FailureKind::Panic, ProxyError::new(panic_message(&*panic))));
            channel.inner.executing.lock().remove(&id);
            channel.respond(id, outcome);
        });
        executing.insert(id, task.abort_handle());
    }

    fn respond(&self, id: CallId, outcome: Outcome) {
        match self.send(Command::Response { id, outcome }) {
            Ok(()) => {}
            Err(ChannelError::Serialization(msg)) => {
                warn!("Response to {} could not be sent: {}", id, msg);
                let outcome = Outcome::failure(FailureKind::Serialization, ProxyError::new(msg));
                if let Err(e) = self.send(Command::Response { id, outcome }) {
                    debug!("Could not answer {}: {}", id, e);
                }
            }
            Err(e) => debug!("Could not answer {}: {}", id, e),
        }
    }

    async fn execute(&self, request: Request) -> Outcome {
        match request {
            Request::Unit {
                unit,
                payload,
                loader,
                refs,
            } => {
                let Some(handler) = self.inner.registry.get(&unit) else {
                    self.return_refs(refs, &[]);
                    return Outcome::failure(
                        FailureKind::UnknownUnit,
                        ProxyError::new(format!("No unit registered as {}", unit)),
                    );
                };
                if self.is_restricted() && !handler.restricted_safe() {
                    warn!("Refused {} on restricted channel {}", unit, self.inner.name);
                    self.return_refs(refs, &[]);
                    return Outcome::failure(
                        FailureKind::Refused,
                        ProxyError::new(format!("{} is not allowed on restricted channel {}", unit, self.inner.name)),
                    );
                }
                let loader = loader.map(|oid| self.remote_loader(oid));
                handler.run(CallContext::new(self.clone(), loader), payload, refs).await
            }
            Request::Method { oid, method, args, refs } => {
                if oid == CHANNEL_OID {
                    return self.invoke_channel_object(&method, &args, refs).await;
                }
                let Some(object) = self.inner.exports.lookup(oid) else {
                    self.return_refs(refs, &[]);
                    return Outcome::failure(
                        FailureKind::UnknownObject,
                        ProxyError::new(format!("Object #{} is not exported on {}", oid, self.inner.name)),
                    );
                };
                let call = MethodCall::new(method, args, Some(self.clone()));
                match method_result(object.invoke(call).await) {
                    Ok(bytes) => Outcome::Value(bytes),
                    Err((kind, error)) => Outcome::failure(kind, error),
                }
            }
        }
    }

    async fn invoke_channel_object(&self, method: &str, args: &[u8], refs: Vec<ObjectId>) -> Outcome {
        let key: String = match self.decode_counted(args) {
            (Ok(key), _) => key,
            (Err(e), claimed) => {
                self.return_refs(refs, &claimed);
                return Outcome::failure(FailureKind::Deserialization, ProxyError::capture(&e));
            }
        };
        let encoded = match method {
            "get_property" => self.encode(&self.get_property(&key)),
            "wait_for_property" => match self.wait_for_property(&key).await {
                Ok(value) => self.encode(&value),
                Err(e) => return Outcome::failure(FailureKind::Execution, ProxyError::capture(&e)),
            },
            other => {
                return Outcome::failure(
                    FailureKind::UnknownMethod,
                    ProxyError::new(format!("No such method: {}", other)),
                )
            }
        };
        match encoded {
            Ok(bytes) => Outcome::Value(bytes),
            Err(e) => Outcome::failure(FailureKind::Serialization, ProxyError::capture(&e)),
        }
    }

    /// Tear the channel down; only the first cause is kept
    pub(crate) fn terminate(&self, cause: ChannelError) {
        {
            let mut stored = self.inner.cause.lock();
            if stored.is_some() {
                return;
            }
            *stored = Some(cause.clone());
        }
        match &cause {
            ChannelError::Closed { .. } => info!("Channel {} closed: {}", self.inner.name, cause),
            _ => error!("Channel {} terminated: {}", self.inner.name, cause),
        }

        self.inner.out_closed.store(true, Ordering::Release);
        self.inner.state.send_replace(ChannelState::Closed);

        let closed = self.closed_error();
        let pending = self.inner.pending.lock().take().unwrap_or_default();
        for (_, waiter) in pending {
            let _ = waiter.send(Err(closed.clone()));
        }
        self.inner.pending_changed.notify_waiters();

        let executing: Vec<_> = self.inner.executing.lock().drain().map(|(_, task)| task).collect();
        for task in executing {
            task.abort();
        }
        self.inner.workers.close();
        self.inner.pipes.abort(&closed.to_string());
        drop(self.inner.exports.close());
        self.inner.loaders.clear();
        self.inner.imports.clear();
        let _ = self.inner.outbound.send(Outgoing::Shutdown);
        if let Some(reader) = self.inner.reader_task.lock().take() {
            reader.abort();
        }

        let listeners = self.inner.listeners.lock().clone();
        for listener in listeners {
            listener.on_closed(self, &cause);
        }
    }

    fn send_close(&self, created_at: Option<String>, cause: Option<String>) -> Result<(), ChannelError> {
        if self.inner.out_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.enqueue(Command::Close { created_at, cause })
    }

    /// Stop accepting calls and announce shutdown to the peer.
    ///
    /// The channel terminates once the peer acknowledges. With a drain
    /// timeout configured, outstanding calls get that long to resolve first.
    #[track_caller]
    pub fn close(&self) -> impl Future<Output = Result<(), ChannelError>> + Send + '_ {
        let site = Location::caller();
        async move {
            let started = self.inner.state.send_if_modified(|state| {
                if *state == ChannelState::Active {
                    *state = ChannelState::Closing;
                    true
                } else {
                    false
                }
            });
            if !started {
                return Ok(());
            }
            info!("Closing channel {}", self.inner.name);

            if let Some(limit) = self.inner.config.close_drain_timeout {
                if tokio::time::timeout(limit, self.drain()).await.is_err() {
                    warn!("{} calls still outstanding on {} after {:?}", self.pending_count(), self.inner.name, limit);
                }
            }
            self.send_close(Some(site.to_string()), None)
        }
    }

    async fn drain(&self) {
        loop {
            let changed = self.inner.pending_changed.notified();
            if self.pending_count() == 0 {
                return;
            }
            changed.await;
        }
    }

    /// Wait until the channel has terminated
    pub async fn join(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ChannelState::Closed).await;
    }

    /// Wait at most `limit` for the channel to terminate
    pub async fn join_timeout(&self, limit: Duration) -> Result<(), ChannelError> {
        tokio::time::timeout(limit, self.join())
            .await
            .map_err(|_| ChannelError::Timeout { duration: limit })
    }

    /// Set a property the peer can read
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.properties.lock().insert(key.into(), value.into());
        self.inner.properties_changed.send_modify(|version| *version += 1);
    }

    /// Read a local property
    pub fn get_property(&self, key: &str) -> Option<Value> {
        self.inner.properties.lock().get(key).cloned()
    }

    /// Wait until a local property is set
    pub async fn wait_for_property(&self, key: &str) -> Result<Value, ChannelError> {
        let mut version = self.inner.properties_changed.subscribe();
        let mut state = self.inner.state.subscribe();
        loop {
            if let Some(value) = self.get_property(key) {
                return Ok(value);
            }
            if self.is_closed() {
                return Err(self.closed_error());
            }
            tokio::select! {
                _ = version.changed() => {}
                _ = state.changed() => {}
            }
        }
    }

    /// Read a property of the peer
    #[track_caller]
    pub fn get_remote_property(&self, key: &str) -> RemoteFuture<Option<Value>> {
        self.invoke_remote(CHANNEL_OID, "get_property", key, Location::caller())
    }

    /// Wait until the peer sets a property
    #[track_caller]
    pub fn wait_for_remote_property(&self, key: &str) -> RemoteFuture<Value> {
        self.invoke_remote(CHANNEL_OID, "wait_for_property", key, Location::caller())
    }

    /// Get notified when the channel terminates; fires at once if it already has
    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) {
        let mut listeners = self.inner.listeners.lock();
        let cause = self.inner.cause.lock().clone();
        match cause {
            Some(cause) => {
                drop(listeners);
                listener.on_closed(self, &cause);
            }
            None => listeners.push(listener),
        }
    }

    /// Stop notifying `listener`; `false` if it was not registered
    pub fn remove_listener(&self, listener: &Arc<dyn ChannelListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| Arc::as_ptr(l) as *const () != target);
        listeners.len() != before
    }

    /// Remote loading statistics
    pub fn performance_counters(&self) -> PerformanceCounters {
        self.inner.counters.snapshot()
    }

    /// Zero the remote loading statistics
    pub fn reset_performance_counters(&self) {
        self.inner.counters.reset();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("Panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("Panicked: {}", msg)
    } else {
        "Panicked with a non-string payload".to_string()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("capability", &self.inner.capability)
            .finish()
    }
}
