//! Work units, call futures and the unit registry

use crate::current;
use crate::export::ExportList;
use crate::loader::RemoteLoader;
use crate::{CallError, Channel, ChannelError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use remoting_proto::{CallId, Failure, FailureKind, ObjectId, Outcome, ProxyError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Sleep;

/// A unit of work shipped to the peer and executed there.
///
/// The unit's state travels as its serialized form; the peer must have the
/// same type registered under [`Callable::NAME`] (see
/// [`ChannelBuilder::register`](crate::ChannelBuilder::register)).
#[async_trait]
pub trait Callable: Serialize + DeserializeOwned + Send + 'static {
    /// Wire name of the unit, unique per channel
    const NAME: &'static str;

    /// Whether a restricted channel may execute this unit
    const RESTRICTED_SAFE: bool = false;

    /// Value returned to the caller
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Error returned to the caller
    type Error: UnitError;

    /// Execute on the receiving side
    async fn call(self, ctx: CallContext) -> Result<Self::Output, Self::Error>;
}

/// Errors a work unit may fail with.
///
/// The default implementation is not transportable: the caller receives a
/// [`ProxyError`] carrying the message and cause chain. Use
/// [`transportable_error!`](crate::transportable_error) for error types that
/// implement serde and should be rebuilt as themselves on the calling side.
pub trait UnitError: std::error::Error + Send + Sync + 'static {
    /// Encoded form of the error, if it can travel
    fn to_wire(&self) -> Option<Vec<u8>> {
        None
    }

    /// Rebuild the error from its encoded form
    fn from_wire(_bytes: &[u8]) -> Option<Self>
    where
        Self: Sized,
    {
        None
    }
}

/// Implement [`UnitError`] for serde-capable error types so they travel as themselves
#[macro_export]
macro_rules! transportable_error {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::UnitError for $ty {
                fn to_wire(&self) -> ::std::option::Option<::std::vec::Vec<u8>> {
                    $crate::__private::rmp_serde::to_vec(self).ok()
                }

                fn from_wire(bytes: &[u8]) -> ::std::option::Option<Self> {
                    $crate::__private::rmp_serde::from_slice(bytes).ok()
                }
            }
        )+
    };
}

transportable_error!(ProxyError);

impl UnitError for Infallible {}

impl UnitError for std::io::Error {}

/// What a unit sees of the channel it runs on
#[derive(Clone)]
pub struct CallContext {
    channel: Channel,
    loader: Option<Arc<RemoteLoader>>,
}

impl CallContext {
    pub(crate) fn new(channel: Channel, loader: Option<Arc<RemoteLoader>>) -> Self {
        Self { channel, loader }
    }

    /// Channel the request arrived on
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Loader for the caller's code base, if the caller sent one
    pub fn loader(&self) -> Option<&Arc<RemoteLoader>> {
        self.loader.as_ref()
    }
}

pub(crate) trait ErasedUnit: Send + Sync {
    fn restricted_safe(&self) -> bool;

    /// `refs` lists the counted references the caller wrote into `payload`
    fn run(&self, ctx: CallContext, payload: Bytes, refs: Vec<ObjectId>) -> BoxFuture<'static, Outcome>;
}

struct UnitHandler<U>(PhantomData<fn() -> U>);

impl<U: Callable> ErasedUnit for UnitHandler<U> {
    fn restricted_safe(&self) -> bool {
        U::RESTRICTED_SAFE
    }

    fn run(&self, ctx: CallContext, payload: Bytes, refs: Vec<ObjectId>) -> BoxFuture<'static, Outcome> {
        Box::pin(async move {
            let unit: U = match ctx.channel.decode_counted(&payload) {
                (Ok(unit), _) => unit,
                (Err(e), claimed) => {
                    ctx.channel.return_refs(refs, &claimed);
                    return Outcome::failure(
                        FailureKind::Deserialization,
                        ProxyError::new(format!("Failed to deserialize {}", U::NAME))
                            .with_cause(ProxyError::capture(&e)),
                    )
                }
            };

            match unit.call(ctx.clone()).await {
                Ok(value) => match ctx.channel.encode(&value) {
                    Ok(bytes) => Outcome::Value(bytes),
                    Err(e) => Outcome::failure(FailureKind::Serialization, ProxyError::capture(&e)),
                },
                Err(err) => Outcome::Failure(Failure {
                    kind: FailureKind::Execution,
                    typed: err.to_wire().map(Bytes::from),
                    error: ProxyError::capture(&err),
                }),
            }
        })
    }
}

/// Units this side is able to execute, keyed by wire name
#[derive(Clone)]
pub struct UnitRegistry {
    units: HashMap<&'static str, Arc<dyn ErasedUnit>>,
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitRegistry {
    /// Registry holding the built-in units
    pub fn new() -> Self {
        let mut registry = Self {
            units: HashMap::new(),
        };
        registry.register::<Ping>();
        registry.register::<PreloadArchives>();
        registry
    }

    /// Make `U` executable on this side
    pub fn register<U: Callable>(&mut self) {
        self.units
            .insert(U::NAME, Arc::new(UnitHandler::<U>(PhantomData)));
    }

    /// Whether a unit with this wire name is known
    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn ErasedUnit>> {
        self.units.get(name).cloned()
    }
}

impl fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.units.keys().collect();
        names.sort();
        f.debug_set().entries(names).finish()
    }
}

/// Round trip with no effect, used to check that the peer is responsive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping;

#[async_trait]
impl Callable for Ping {
    const NAME: &'static str = "remoting.Ping";
    const RESTRICTED_SAFE: bool = true;
    type Output = ();
    type Error = Infallible;

    async fn call(self, _ctx: CallContext) -> Result<(), Infallible> {
        Ok(())
    }
}

/// Fetch whole archives of the caller's code base ahead of use
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PreloadArchives {
    pub archives: Vec<String>,
}

#[async_trait]
impl Callable for PreloadArchives {
    const NAME: &'static str = "remoting.PreloadArchives";
    type Output = bool;
    type Error = ProxyError;

    async fn call(self, ctx: CallContext) -> Result<bool, ProxyError> {
        let loader = ctx
            .loader()
            .ok_or_else(|| ProxyError::new("Preload request arrived without a code base"))?;
        let mut fetched = false;
        for archive in &self.archives {
            if loader.prefetch(archive).await.map_err(|e| ProxyError::capture(&e))? {
                fetched = true;
            }
        }
        Ok(fetched)
    }
}

enum State<E> {
    Failed(CallError<E>),
    Waiting(oneshot::Receiver<Result<Outcome, ChannelError>>),
    Done,
}

/// Eventual result of a request sent to the peer.
///
/// The request is on the wire as soon as the future exists. Dropping the
/// future before it resolves abandons the result but does not interrupt the
/// remote execution.
pub struct RemoteFuture<T, E = Infallible> {
    channel: Channel,
    id: CallId,
    state: State<E>,
    exports: Option<ExportList>,
    deadline: Option<(Duration, Pin<Box<Sleep>>)>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, E> Unpin for RemoteFuture<T, E> {}

impl<T, E> RemoteFuture<T, E> {
    pub(crate) fn failed(channel: Channel, error: CallError<E>) -> Self {
        Self {
            channel,
            id: 0,
            state: State::Failed(error),
            exports: None,
            deadline: None,
            _marker: PhantomData,
        }
    }

    pub(crate) fn waiting(
        channel: Channel,
        id: CallId,
        rx: oneshot::Receiver<Result<Outcome, ChannelError>>,
        exports: ExportList,
        timeout: Option<Duration>,
    ) -> Self {
        let deadline = timeout.map(|d| (d, channel.sleep(d)));
        Self {
            channel,
            id,
            state: State::Waiting(rx),
            exports: Some(exports),
            deadline,
            _marker: PhantomData,
        }
    }

    /// Call identifier, zero if the request never left
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Whether the result has been taken
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    fn release(&mut self) {
        if let Some(mut exports) = self.exports.take() {
            exports.release_all();
        }
    }
}

impl<T, E> RemoteFuture<T, E>
where
    T: DeserializeOwned,
    E: UnitError,
{
    /// Wait at most `limit` for the result; an earlier call timeout still applies
    pub async fn get_timeout(mut self, limit: Duration) -> Result<T, CallError<E>> {
        if matches!(self.state, State::Waiting(_)) {
            let sleep = self.channel.sleep(limit);
            let sooner = match &self.deadline {
                Some((_, current)) => sleep.deadline() < current.deadline(),
                None => true,
            };
            if sooner {
                self.deadline = Some((limit, sleep));
            }
        }
        self.await
    }

    fn resolve(&self, outcome: Outcome) -> Result<T, CallError<E>> {
        match outcome {
            Outcome::Value(bytes) => self.channel.decode(&bytes).map_err(CallError::Channel),
            Outcome::Failure(failure) => {
                if failure.kind == FailureKind::Execution {
                    if let Some(typed) = &failure.typed {
                        let rebuilt = current::with_scope(self.channel.scope(None), || E::from_wire(typed));
                        if let Some(err) = rebuilt {
                            return Err(CallError::Remote(err));
                        }
                    }
                }
                Err(CallError::Proxy {
                    kind: failure.kind,
                    error: failure.error,
                })
            }
        }
    }
}

impl<T, E> Future for RemoteFuture<T, E>
where
    T: DeserializeOwned,
    E: UnitError,
{
    type Output = Result<T, CallError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = match std::mem::replace(&mut this.state, State::Done) {
            State::Done => {
                return Poll::Ready(Err(CallError::Channel(ChannelError::InvalidArgument(
                    "RemoteFuture polled after completion".to_string(),
                ))))
            }
            State::Failed(err) => {
                this.release();
                return Poll::Ready(Err(err));
            }
            State::Waiting(mut rx) => {
                if let Some((duration, sleep)) = this.deadline.as_mut() {
                    if sleep.as_mut().poll(cx).is_ready() {
                        let duration = *duration;
                        this.channel.forget_call(this.id);
                        this.release();
                        return Poll::Ready(Err(CallError::Channel(ChannelError::Timeout { duration })));
                    }
                }
                match Pin::new(&mut rx).poll(cx) {
                    Poll::Pending => {
                        this.state = State::Waiting(rx);
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(Ok(outcome))) => outcome,
                    Poll::Ready(Ok(Err(err))) => {
                        this.release();
                        return Poll::Ready(Err(CallError::Channel(err)));
                    }
                    Poll::Ready(Err(_)) => {
                        this.release();
                        return Poll::Ready(Err(CallError::Channel(this.channel.closed_error())));
                    }
                }
            }
        };

        let result = this.resolve(outcome);
        this.release();
        Poll::Ready(result)
    }
}

impl<T, E> Drop for RemoteFuture<T, E> {
    fn drop(&mut self) {
        if matches!(self.state, State::Waiting(_)) {
            self.channel.forget_call(self.id);
        }
        self.release();
    }
}

impl<T, E> fmt::Debug for RemoteFuture<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFuture")
            .field("channel", &self.channel.name())
            .field("id", &self.id)
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq)]
    #[error("quota exceeded: {0}")]
    struct QuotaExceeded(u32);

    transportable_error!(QuotaExceeded);

    #[test]
    fn test_transportable_error_roundtrip() {
        let bytes = QuotaExceeded(7).to_wire().unwrap();
        assert_eq!(QuotaExceeded::from_wire(&bytes), Some(QuotaExceeded(7)));
    }

    #[test]
    fn test_plain_errors_do_not_travel() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "nope");
        assert!(err.to_wire().is_none());
        assert!(<std::io::Error as UnitError>::from_wire(&[0x90]).is_none());
    }

    #[test]
    fn test_registry_has_builtins() {
        let registry = UnitRegistry::new();
        assert!(registry.contains(Ping::NAME));
        assert!(registry.contains(PreloadArchives::NAME));
        assert!(!registry.contains("example.Missing"));
        assert!(registry.get(Ping::NAME).unwrap().restricted_safe());
        assert!(!registry.get(PreloadArchives::NAME).unwrap().restricted_safe());
    }
}
