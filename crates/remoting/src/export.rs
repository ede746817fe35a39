//! Exported objects and remote references
//!
//! Every object a peer can call methods on lives in the export table of the
//! side that owns it. References travel as handles and are counted:
//!
//! * a local object serialized as part of a call's arguments is exported for
//!   the duration of that call only and released by the caller afterwards;
//! * a local object serialized anywhere else, or a stub returned by
//!   [`Channel::export`], stays exported until the peer drops every copy it
//!   received, at which point the peer sends an unexport notice.

use crate::current::{self, Recording};
use crate::{CallError, Channel, ChannelError, RemoteFuture};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use remoting_proto::{FailureKind, ObjectId, ProxyError};
use serde::de::{DeserializeOwned, Error as _};
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::panic::Location;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::debug;

/// Handle reserved for the channel object that serves the property bag
pub const CHANNEL_OID: ObjectId = 1;

const FIRST_OID: ObjectId = 2;

/// An object whose methods can be invoked by the peer
#[async_trait]
pub trait RemoteObject: Send + Sync + 'static {
    /// Dispatch one method call
    async fn invoke(&self, call: MethodCall) -> Result<Bytes, MethodError>;

    /// Name used in diagnostics
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Failure of a method dispatched to a [`RemoteObject`]
#[derive(Debug, Error)]
pub enum MethodError {
    /// The object has no method with that name
    #[error("No such method: {0}")]
    UnknownMethod(String),

    /// The method failed
    #[error(transparent)]
    Failed(#[from] ProxyError),
}

/// One incoming method call
pub struct MethodCall {
    method: String,
    args: Bytes,
    channel: Option<Channel>,
}

impl MethodCall {
    pub(crate) fn new(method: String, args: Bytes, channel: Option<Channel>) -> Self {
        Self { method, args, channel }
    }

    /// Method name
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Channel the call arrived on, `None` for in-process calls
    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    /// Decode the arguments
    pub fn args<A: DeserializeOwned>(&self) -> Result<A, ProxyError> {
        match &self.channel {
            Some(channel) => channel.decode(&self.args).map_err(|e| ProxyError::capture(&e)),
            None => rmp_serde::from_slice(&self.args).map_err(|e| ProxyError::capture(&e)),
        }
    }

    /// Encode a return value
    pub fn reply<R: Serialize + ?Sized>(&self, value: &R) -> Result<Bytes, ProxyError> {
        match &self.channel {
            Some(channel) => channel.encode(value).map_err(|e| ProxyError::capture(&e)),
            None => rmp_serde::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| ProxyError::capture(&e)),
        }
    }

    /// Error for a method name the object does not implement
    pub fn unknown(&self) -> MethodError {
        MethodError::UnknownMethod(self.method.clone())
    }
}

/// A reference to an object that may live on either side of a channel
#[derive(Clone)]
pub struct ObjectRef {
    repr: Repr,
}

#[derive(Clone)]
enum Repr {
    /// A plain local object
    Local(Arc<dyn RemoteObject>),
    /// A local object already exported on a channel
    Stub {
        channel: Channel,
        oid: ObjectId,
        object: Arc<dyn RemoteObject>,
    },
    /// An object owned by the peer
    Remote(Arc<RemoteProxy>),
}

impl ObjectRef {
    /// Wrap a local object
    pub fn new<T: RemoteObject>(object: T) -> Self {
        Self::from_arc(Arc::new(object))
    }

    /// Wrap a shared local object
    pub fn from_arc(object: Arc<dyn RemoteObject>) -> Self {
        Self {
            repr: Repr::Local(object),
        }
    }

    pub(crate) fn stub(channel: Channel, oid: ObjectId, object: Arc<dyn RemoteObject>) -> Self {
        Self {
            repr: Repr::Stub { channel, oid, object },
        }
    }

    /// Whether the object lives in this process
    pub fn is_local(&self) -> bool {
        !matches!(self.repr, Repr::Remote(_))
    }

    /// The local object, if it lives in this process
    pub fn local(&self) -> Option<&Arc<dyn RemoteObject>> {
        match &self.repr {
            Repr::Local(object) | Repr::Stub { object, .. } => Some(object),
            Repr::Remote(_) => None,
        }
    }

    /// Handle of a peer-owned object
    pub fn remote_oid(&self) -> Option<ObjectId> {
        match &self.repr {
            Repr::Remote(proxy) => Some(proxy.oid),
            _ => None,
        }
    }

    /// Invoke `method` with `args`, locally or across the channel.
    ///
    /// Arguments are encoded before this returns.
    #[track_caller]
    pub fn invoke<A, R>(&self, method: &str, args: &A) -> BoxFuture<'static, Result<R, CallError>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        match &self.repr {
            Repr::Remote(proxy) => {
                let future: RemoteFuture<R> =
                    proxy
                        .channel
                        .invoke_remote(proxy.oid, method, args, Location::caller());
                Box::pin(future)
            }
            Repr::Local(object) | Repr::Stub { object, .. } => {
                let object = object.clone();
                let method = method.to_string();
                let args = rmp_serde::to_vec(args).map(Bytes::from);
                Box::pin(async move {
                    let args = args.map_err(ChannelError::from)?;
                    let result = object.invoke(MethodCall::new(method, args, None)).await;
                    let bytes = method_result(result).map_err(|(kind, error)| CallError::Proxy { kind, error })?;
                    Ok(rmp_serde::from_slice(&bytes).map_err(ChannelError::from)?)
                })
            }
        }
    }
}

pub(crate) fn method_result(result: Result<Bytes, MethodError>) -> Result<Bytes, (FailureKind, ProxyError)> {
    match result {
        Ok(bytes) => Ok(bytes),
        Err(MethodError::UnknownMethod(name)) => Err((
            FailureKind::UnknownMethod,
            ProxyError::new(format!("No such method: {}", name)),
        )),
        Err(MethodError::Failed(error)) => Err((FailureKind::Execution, error)),
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Local(object) => write!(f, "ObjectRef(local {})", object.type_name()),
            Repr::Stub { oid, object, .. } => {
                write!(f, "ObjectRef(exported #{} {})", oid, object.type_name())
            }
            Repr::Remote(proxy) => write!(f, "ObjectRef(remote #{} on {})", proxy.oid, proxy.channel.name()),
        }
    }
}

impl<T: RemoteObject> From<Arc<T>> for ObjectRef {
    fn from(object: Arc<T>) -> Self {
        Self::from_arc(object)
    }
}

#[derive(Serialize, Deserialize)]
struct WireRef {
    oid: ObjectId,
    origin: Origin,
    scope: WireScope,
}

/// Which export table the handle belongs to, seen from the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Origin {
    Sender,
    Receiver,
}

/// How the receiver must account for its copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum WireScope {
    /// Released by the sender when the call completes
    CallerAuto,
    /// Counted; the receiver unexports when it drops the copy
    Explicit,
    /// Never released
    Pinned,
}

impl Serialize for ObjectRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let scope = current::current()
            .ok_or_else(|| S::Error::custom("ObjectRef can only be serialized by a channel"))?;
        let exports = &scope.channel.inner().exports;

        let wire = match &self.repr {
            Repr::Local(object) => {
                let (oid, wire_scope) = exports
                    .write_ref(object, scope.recording.as_ref(), scope.created_at.as_deref())
                    .ok_or_else(|| S::Error::custom(scope.channel.closed_error()))?;
                WireRef { oid, origin: Origin::Sender, scope: wire_scope }
            }
            Repr::Stub { channel, oid, .. } => {
                if !channel.same(&scope.channel) {
                    return Err(S::Error::custom(format!(
                        "object #{} is exported on {}, not on {}",
                        oid,
                        channel.name(),
                        scope.channel.name()
                    )));
                }
                let wire_scope = exports
                    .write_stub(*oid)
                    .ok_or_else(|| S::Error::custom(format!("object #{} is no longer exported", oid)))?;
                WireRef { oid: *oid, origin: Origin::Sender, scope: wire_scope }
            }
            Repr::Remote(proxy) => {
                if !proxy.channel.same(&scope.channel) {
                    return Err(S::Error::custom(format!(
                        "remote object #{} belongs to {}, not to {}",
                        proxy.oid,
                        proxy.channel.name(),
                        scope.channel.name()
                    )));
                }
                WireRef { oid: proxy.oid, origin: Origin::Receiver, scope: WireScope::Pinned }
            }
        };
        if wire.scope == WireScope::Explicit {
            current::count(wire.oid);
        }
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ObjectRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireRef::deserialize(deserializer)?;
        let scope = current::current()
            .ok_or_else(|| D::Error::custom("ObjectRef can only be deserialized by a channel"))?;

        match wire.origin {
            // the peer is handing back one of our own objects
            Origin::Receiver => scope
                .channel
                .inner()
                .exports
                .lookup(wire.oid)
                .map(ObjectRef::from_arc)
                .ok_or_else(|| D::Error::custom(format!("object #{} is no longer exported", wire.oid))),
            Origin::Sender => {
                let proxy = scope.channel.inner().imports.import(&scope.channel, wire.oid, wire.scope);
                if wire.scope == WireScope::Explicit {
                    current::count(wire.oid);
                }
                Ok(Self {
                    repr: Repr::Remote(proxy),
                })
            }
        }
    }
}

/// Local stand-in for an object owned by the peer
pub(crate) struct RemoteProxy {
    channel: Channel,
    oid: ObjectId,
    /// Counted copies received; reported back when the proxy goes away
    copies: AtomicU32,
}

impl Drop for RemoteProxy {
    fn drop(&mut self) {
        self.channel.inner().imports.forget(self.oid);
        let count = self.copies.load(Ordering::Acquire);
        if count > 0 && !self.channel.is_closed() {
            debug!("Unexporting remote object #{} ({} references)", self.oid, count);
            let _ = self.channel.send(remoting_proto::Command::Unexport { oid: self.oid, count });
        }
    }
}

/// Proxies for peer-owned objects, one per handle while any copy is alive
#[derive(Default)]
pub(crate) struct ImportTable {
    proxies: Mutex<HashMap<ObjectId, Weak<RemoteProxy>>>,
}

impl ImportTable {
    pub(crate) fn import(&self, channel: &Channel, oid: ObjectId, scope: WireScope) -> Arc<RemoteProxy> {
        let counted = u32::from(scope == WireScope::Explicit);
        let mut proxies = self.proxies.lock();
        if let Some(proxy) = proxies.get(&oid).and_then(Weak::upgrade) {
            proxy.copies.fetch_add(counted, Ordering::AcqRel);
            return proxy;
        }
        let proxy = Arc::new(RemoteProxy {
            channel: channel.clone(),
            oid,
            copies: AtomicU32::new(counted),
        });
        proxies.insert(oid, Arc::downgrade(&proxy));
        proxy
    }

    fn forget(&self, oid: ObjectId) {
        let mut proxies = self.proxies.lock();
        if proxies.get(&oid).is_some_and(|weak| weak.strong_count() == 0) {
            proxies.remove(&oid);
        }
    }

    pub(crate) fn clear(&self) {
        self.proxies.lock().clear();
    }
}

/// Lifetime policy of an export record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportScope {
    /// Exported as a call argument, released when that call completes
    CallerAuto,
    /// Exported until the peer drops every reference
    Explicit,
}

struct Record {
    object: Arc<dyn RemoteObject>,
    refcount: u32,
    /// References counted by `export()` that no wire copy has claimed yet
    reserved: u32,
    scope: ExportScope,
    pinned: bool,
    created_at: Option<String>,
}

#[derive(Default)]
struct TableState {
    next_oid: ObjectId,
    records: HashMap<ObjectId, Record>,
    by_ptr: HashMap<usize, ObjectId>,
    closed: bool,
}

impl TableState {
    fn entry(
        &mut self,
        object: &Arc<dyn RemoteObject>,
        scope: ExportScope,
        created_at: Option<&str>,
    ) -> Option<(ObjectId, &mut Record)> {
        if self.closed {
            return None;
        }
        let ptr = ptr_of(object);
        let oid = match self.by_ptr.get(&ptr) {
            Some(oid) => *oid,
            None => {
                let oid = self.next_oid;
                self.next_oid += 1;
                self.by_ptr.insert(ptr, oid);
                self.records.insert(
                    oid,
                    Record {
                        object: object.clone(),
                        refcount: 0,
                        reserved: 0,
                        scope,
                        pinned: false,
                        created_at: created_at.map(str::to_string),
                    },
                );
                oid
            }
        };
        self.records.get_mut(&oid).map(|record| (oid, record))
    }
}

fn ptr_of(object: &Arc<dyn RemoteObject>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

/// Reference-counted registry of local objects visible to the peer
pub(crate) struct ExportTable {
    state: Mutex<TableState>,
}

impl ExportTable {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                next_oid: FIRST_OID,
                ..TableState::default()
            }),
        }
    }

    /// Count one reference for `export()`, claimed by the first wire copy of the stub
    pub(crate) fn export_explicit(&self, object: &Arc<dyn RemoteObject>, created_at: Option<&str>) -> Option<ObjectId> {
        let mut state = self.state.lock();
        let (oid, record) = state.entry(object, ExportScope::Explicit, created_at)?;
        record.refcount += 1;
        record.reserved += 1;
        record.scope = ExportScope::Explicit;
        Some(oid)
    }

    /// Export for the lifetime of the channel
    pub(crate) fn pin(&self, object: &Arc<dyn RemoteObject>, created_at: Option<&str>) -> Option<ObjectId> {
        let mut state = self.state.lock();
        let (oid, record) = state.entry(object, ExportScope::Explicit, created_at)?;
        record.pinned = true;
        Some(oid)
    }

    pub(crate) fn write_ref(
        &self,
        object: &Arc<dyn RemoteObject>,
        recording: Option<&Recording>,
        created_at: Option<&str>,
    ) -> Option<(ObjectId, WireScope)> {
        let mut state = self.state.lock();
        let scope = if recording.is_some() {
            ExportScope::CallerAuto
        } else {
            ExportScope::Explicit
        };
        let (oid, record) = state.entry(object, scope, created_at)?;
        if record.pinned {
            return Some((oid, WireScope::Pinned));
        }
        record.refcount += 1;
        match recording {
            Some(recording) => {
                recording.borrow_mut().push(oid);
                Some((oid, WireScope::CallerAuto))
            }
            None => {
                record.scope = ExportScope::Explicit;
                Some((oid, WireScope::Explicit))
            }
        }
    }

    pub(crate) fn write_stub(&self, oid: ObjectId) -> Option<WireScope> {
        let mut state = self.state.lock();
        let record = state.records.get_mut(&oid)?;
        if record.pinned {
            return Some(WireScope::Pinned);
        }
        if record.reserved > 0 {
            record.reserved -= 1;
        } else {
            record.refcount += 1;
        }
        Some(WireScope::Explicit)
    }

    /// Drop `count` references; the record goes away when none remain
    pub(crate) fn release(&self, oid: ObjectId, count: u32) {
        let removed = {
            let mut state = self.state.lock();
            let Some(record) = state.records.get_mut(&oid) else {
                debug!("Ignoring release of unknown object #{}", oid);
                return;
            };
            if record.pinned {
                return;
            }
            record.refcount = record.refcount.saturating_sub(count);
            if record.refcount > 0 {
                return;
            }
            let record = state.records.remove(&oid);
            if let Some(record) = &record {
                state.by_ptr.remove(&ptr_of(&record.object));
            }
            record
        };
        // dropped outside the lock, the object may hold references of its own
        if let Some(record) = removed {
            debug!("Unexported object #{} ({})", oid, record.object.type_name());
        }
    }

    pub(crate) fn lookup(&self, oid: ObjectId) -> Option<Arc<dyn RemoteObject>> {
        self.state.lock().records.get(&oid).map(|r| r.object.clone())
    }

    pub(crate) fn contains(&self, object: &Arc<dyn RemoteObject>) -> bool {
        self.state.lock().by_ptr.contains_key(&ptr_of(object))
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub(crate) fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        let lines: Vec<String> = {
            let state = self.state.lock();
            let mut oids: Vec<_> = state.records.keys().copied().collect();
            oids.sort_unstable();
            oids.iter()
                .filter_map(|oid| state.records.get(oid).map(|r| (oid, r)))
                .map(|(oid, r)| {
                    format!(
                        "#{} {:?}{} refcount={} type={} created at {}",
                        oid,
                        r.scope,
                        if r.pinned { " pinned" } else { "" },
                        r.refcount,
                        r.object.type_name(),
                        r.created_at.as_deref().unwrap_or("unknown")
                    )
                })
                .collect()
        };
        for line in lines {
            writeln!(out, "{}", line)?;
        }
        Ok(())
    }

    /// Refuse further exports and hand back everything that was exported
    pub(crate) fn close(&self) -> Vec<Arc<dyn RemoteObject>> {
        let mut state = self.state.lock();
        state.closed = true;
        state.by_ptr.clear();
        state.records.drain().map(|(_, r)| r.object).collect()
    }
}

/// Records every object exported on this thread until stopped.
///
/// Obtained from [`Channel::start_export_recording`] for callers that encode
/// values themselves with [`Channel::encode`]. The recording is bound to the
/// current thread and must not be held across an `.await`.
pub struct ExportRecording {
    channel: Channel,
    list: Recording,
    _guard: current::ScopeGuard,
}

impl ExportRecording {
    pub(crate) fn start(channel: &Channel) -> Self {
        let list = Recording::default();
        let guard = current::enter(current::Scope {
            channel: channel.clone(),
            recording: Some(list.clone()),
            counted: None,
            created_at: None,
        });
        Self {
            channel: channel.clone(),
            list,
            _guard: guard,
        }
    }

    /// Stop recording and collect the exports made so far
    pub fn stop(self) -> ExportList {
        let ExportRecording { channel, list, _guard } = self;
        drop(_guard);
        let oids = list.borrow_mut().drain(..).collect();
        ExportList::new(channel, oids)
    }
}

/// Exports made during one recording, released as a unit
pub struct ExportList {
    channel: Channel,
    oids: Vec<ObjectId>,
}

impl ExportList {
    pub(crate) fn new(channel: Channel, oids: Vec<ObjectId>) -> Self {
        Self { channel, oids }
    }

    /// Handles recorded, in export order
    pub fn oids(&self) -> &[ObjectId] {
        &self.oids
    }

    /// Number of recorded exports
    pub fn len(&self) -> usize {
        self.oids.len()
    }

    /// Whether nothing was exported
    pub fn is_empty(&self) -> bool {
        self.oids.is_empty()
    }

    /// Release one reference per recorded export
    pub fn release(mut self) {
        self.release_all();
    }

    pub(crate) fn release_all(&mut self) {
        for oid in self.oids.drain(..) {
            self.channel.inner().exports.release(oid, 1);
        }
    }
}

impl Channel {
    /// Export `object` until the peer drops every reference to the returned stub
    #[track_caller]
    pub fn export(&self, object: impl Into<ObjectRef>) -> Result<ObjectRef, ChannelError> {
        let site = Location::caller().to_string();
        let object = object.into();
        let local = object.local().ok_or_else(|| {
            ChannelError::InvalidArgument("only local objects can be exported".to_string())
        })?;
        let oid = self
            .inner()
            .exports
            .export_explicit(local, Some(&site))
            .ok_or_else(|| self.closed_error())?;
        debug!("Exported {} as #{} on {}", local.type_name(), oid, self.name());
        Ok(ObjectRef::stub(self.clone(), oid, local.clone()))
    }

    /// Whether a live export record exists for `object`
    pub fn is_exported(&self, object: &ObjectRef) -> bool {
        object
            .local()
            .is_some_and(|local| self.inner().exports.contains(local))
    }

    /// Number of live export records
    pub fn exported_count(&self) -> usize {
        self.inner().exports.len()
    }

    /// Write every live export record, one per line
    pub fn dump_export_table(&self, out: &mut dyn Write) -> io::Result<()> {
        self.inner().exports.dump(out)
    }

    /// Record exports made by [`Channel::encode`] on this thread
    pub fn start_export_recording(&self) -> ExportRecording {
        ExportRecording::start(self)
    }
}
