//! Shared helpers for channel integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use remoting::{CallContext, Callable, Channel, ChannelBuilder, MethodCall, MethodError, ObjectRef, RemoteObject};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Connect two channels over an in-memory duplex
pub async fn pair(left: ChannelBuilder, right: ChannelBuilder) -> (Channel, Channel) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    let (left, right) = tokio::join!(left.build(ar, aw), right.build(br, bw));
    (left.expect("left channel"), right.expect("right channel"))
}

/// Connect two channels, with `banner` written on the left stream before its preamble
pub async fn pair_with_banner(left: ChannelBuilder, right: ChannelBuilder, banner: &[u8]) -> (Channel, Channel) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let (ar, mut aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    aw.write_all(banner).await.expect("banner");
    let (left, right) = tokio::join!(left.build(ar, aw), right.build(br, bw));
    (left.expect("left channel"), right.expect("right channel"))
}

/// Builder with every test unit registered
pub fn builder(name: &str) -> ChannelBuilder {
    ChannelBuilder::new(name)
        .register::<Add>()
        .register::<Fail>()
        .register::<Quota>()
        .register::<Explode>()
        .register::<Sleep>()
        .register::<UseCounter>()
        .register::<SlowUseCounter>()
        .register::<MakeCounter>()
        .register::<Bounce>()
        .register::<WhoAmI>()
}

/// Poll `check` until it holds or a second passes
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Add(pub u32, pub u32);

#[async_trait]
impl Callable for Add {
    const NAME: &'static str = "test.Add";
    type Output = u32;
    type Error = Infallible;

    async fn call(self, _ctx: CallContext) -> Result<u32, Infallible> {
        Ok(self.0 + self.1)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("disk unavailable")]
pub struct DiskError;

#[derive(Debug, thiserror::Error)]
#[error("backup failed")]
pub struct BackupError {
    #[source]
    pub source: DiskError,
}

/// Fails with a two-level error that cannot travel as itself
#[derive(Debug, Serialize, Deserialize)]
pub struct Fail;

#[async_trait]
impl Callable for Fail {
    const NAME: &'static str = "test.Fail";
    type Output = ();
    type Error = BackupError;

    async fn call(self, _ctx: CallContext) -> Result<(), BackupError> {
        Err(BackupError { source: DiskError })
    }
}

impl remoting::UnitError for BackupError {}

#[derive(Debug, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("quota of {limit} exceeded")]
pub struct QuotaExceeded {
    pub limit: u32,
}

remoting::transportable_error!(QuotaExceeded);

/// Fails with an error that travels as itself
#[derive(Debug, Serialize, Deserialize)]
pub struct Quota(pub u32);

#[async_trait]
impl Callable for Quota {
    const NAME: &'static str = "test.Quota";
    type Output = ();
    type Error = QuotaExceeded;

    async fn call(self, _ctx: CallContext) -> Result<(), QuotaExceeded> {
        Err(QuotaExceeded { limit: self.0 })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Explode;

#[async_trait]
impl Callable for Explode {
    const NAME: &'static str = "test.Explode";
    type Output = ();
    type Error = Infallible;

    async fn call(self, _ctx: CallContext) -> Result<(), Infallible> {
        panic!("kaboom");
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Sleep(pub u64);

#[async_trait]
impl Callable for Sleep {
    const NAME: &'static str = "test.Sleep";
    type Output = ();
    type Error = Infallible;

    async fn call(self, _ctx: CallContext) -> Result<(), Infallible> {
        tokio::time::sleep(Duration::from_millis(self.0)).await;
        Ok(())
    }
}

/// Whether `Channel::current()` names the channel the unit runs on
#[derive(Debug, Serialize, Deserialize)]
pub struct WhoAmI;

#[async_trait]
impl Callable for WhoAmI {
    const NAME: &'static str = "test.WhoAmI";
    type Output = bool;
    type Error = Infallible;

    async fn call(self, ctx: CallContext) -> Result<bool, Infallible> {
        Ok(Channel::current().is_some_and(|c| c.same(ctx.channel())))
    }
}

/// Exportable counter
#[derive(Debug, Default)]
pub struct Counter {
    pub value: AtomicU32,
}

#[async_trait]
impl RemoteObject for Counter {
    async fn invoke(&self, call: MethodCall) -> Result<Bytes, MethodError> {
        match call.method() {
            "increment" => {
                let by: u32 = call.args()?;
                let value = self.value.fetch_add(by, Ordering::SeqCst) + by;
                Ok(call.reply(&value)?)
            }
            "get" => Ok(call.reply(&self.value.load(Ordering::SeqCst))?),
            _ => Err(call.unknown()),
        }
    }

    fn type_name(&self) -> &'static str {
        "Counter"
    }
}

/// Increments a counter owned by the caller
#[derive(Debug, Serialize, Deserialize)]
pub struct UseCounter {
    pub counter: ObjectRef,
    pub times: u32,
}

#[async_trait]
impl Callable for UseCounter {
    const NAME: &'static str = "test.UseCounter";
    type Output = u32;
    type Error = remoting::ProxyError;

    async fn call(self, _ctx: CallContext) -> Result<u32, remoting::ProxyError> {
        let mut last = 0;
        for _ in 0..self.times {
            last = self
                .counter
                .invoke::<_, u32>("increment", &1u32)
                .await
                .map_err(|e| remoting::ProxyError::capture(&e))?;
        }
        Ok(last)
    }
}

/// Waits, then increments a counter owned by the caller once
#[derive(Debug, Serialize, Deserialize)]
pub struct SlowUseCounter {
    pub counter: ObjectRef,
    pub millis: u64,
}

#[async_trait]
impl Callable for SlowUseCounter {
    const NAME: &'static str = "test.SlowUseCounter";
    type Output = u32;
    type Error = remoting::ProxyError;

    async fn call(self, _ctx: CallContext) -> Result<u32, remoting::ProxyError> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        self.counter
            .invoke::<_, u32>("increment", &1u32)
            .await
            .map_err(|e| remoting::ProxyError::capture(&e))
    }
}

/// Hands a fresh counter back to the caller
#[derive(Debug, Serialize, Deserialize)]
pub struct MakeCounter(pub u32);

#[async_trait]
impl Callable for MakeCounter {
    const NAME: &'static str = "test.MakeCounter";
    type Output = ObjectRef;
    type Error = Infallible;

    async fn call(self, _ctx: CallContext) -> Result<ObjectRef, Infallible> {
        Ok(ObjectRef::new(Counter {
            value: AtomicU32::new(self.0),
        }))
    }
}

/// Returns the reference it was given
#[derive(Debug, Serialize, Deserialize)]
pub struct Bounce(pub ObjectRef);

#[async_trait]
impl Callable for Bounce {
    const NAME: &'static str = "test.Bounce";
    type Output = ObjectRef;
    type Error = Infallible;

    async fn call(self, _ctx: CallContext) -> Result<ObjectRef, Infallible> {
        Ok(self.0)
    }
}
