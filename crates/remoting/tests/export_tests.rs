//! Exported objects, remote references and their reference counting

mod common;

use async_trait::async_trait;
use common::*;
use remoting::{CallContext, Callable, ChannelBuilder, ChannelError, FailureKind, ObjectRef};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[tokio::test]
async fn test_explicit_export_is_callable_by_peer() -> anyhow::Result<()> {
    let (a, b) = pair(builder("a"), builder("b")).await;
    let counter = Arc::new(Counter::default());

    let stub = a.export(counter.clone())?;
    assert!(a.is_exported(&stub));
    assert_eq!(a.exported_count(), 1);

    let last = a.call(UseCounter { counter: stub, times: 3 }).await?;
    assert_eq!(last, 3);
    assert_eq!(counter.value.load(Ordering::SeqCst), 3);

    // the peer dropped its only copy, so the record goes away
    assert!(eventually(|| async { a.exported_count() == 0 }).await);
    drop(b);
    Ok(())
}

#[tokio::test]
async fn test_argument_export_lasts_for_the_call() -> anyhow::Result<()> {
    let (a, _b) = pair(builder("a"), builder("b")).await;
    let counter = Arc::new(Counter::default());

    let last = a
        .call(UseCounter {
            counter: ObjectRef::from(counter.clone()),
            times: 2,
        })
        .await?;
    assert_eq!(last, 2);
    assert_eq!(a.exported_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_argument_is_exported_while_the_call_runs() -> anyhow::Result<()> {
    let (a, _b) = pair(builder("a"), builder("b")).await;
    let counter = ObjectRef::from(Arc::new(Counter::default()));

    let pending = a.call_async(SlowUseCounter {
        counter: counter.clone(),
        millis: 100,
    });
    assert!(a.is_exported(&counter));
    assert_eq!(a.exported_count(), 1);

    assert_eq!(pending.await?, 1);
    assert!(!a.is_exported(&counter));
    assert_eq!(a.exported_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_unknown_unit_returns_explicit_references() -> anyhow::Result<()> {
    let (a, _b) = pair(builder("a"), ChannelBuilder::new("bare")).await;

    let stub = a.export(Arc::new(Counter::default()))?;
    let err = a.call(UseCounter { counter: stub, times: 1 }).await.unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::UnknownUnit));
    assert!(eventually(|| async { a.exported_count() == 0 }).await);
    Ok(())
}

/// Registered under the name of `UseCounter` with an incompatible layout
#[derive(Debug, Serialize, Deserialize)]
struct MisreadCounter(String);

#[async_trait]
impl Callable for MisreadCounter {
    const NAME: &'static str = "test.UseCounter";
    type Output = u32;
    type Error = Infallible;

    async fn call(self, _ctx: CallContext) -> Result<u32, Infallible> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_undecodable_payload_returns_explicit_references() -> anyhow::Result<()> {
    let (a, _b) = pair(builder("a"), ChannelBuilder::new("b").register::<MisreadCounter>()).await;

    let stub = a.export(Arc::new(Counter::default()))?;
    let err = a.call(UseCounter { counter: stub, times: 1 }).await.unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Deserialization));
    assert!(eventually(|| async { a.exported_count() == 0 }).await);
    Ok(())
}

#[tokio::test]
async fn test_returned_object_lives_until_dropped() -> anyhow::Result<()> {
    let (a, b) = pair(builder("a"), builder("b")).await;

    let remote = a.call(MakeCounter(10)).await?;
    assert!(!remote.is_local());
    assert!(remote.remote_oid().is_some());
    assert_eq!(b.exported_count(), 1);

    let value: u32 = remote.invoke("increment", &5u32).await?;
    assert_eq!(value, 15);
    let value: u32 = remote.invoke("get", &()).await?;
    assert_eq!(value, 15);

    drop(remote);
    assert!(eventually(|| async { b.exported_count() == 0 }).await);
    Ok(())
}

#[tokio::test]
async fn test_reference_returns_home_as_local() -> anyhow::Result<()> {
    let (a, _b) = pair(builder("a"), builder("b")).await;
    let counter = Arc::new(Counter::default());

    let back = a.call(Bounce(ObjectRef::from(counter.clone()))).await?;
    assert!(back.is_local());

    let value: u32 = back.invoke("increment", &4u32).await?;
    assert_eq!(value, 4);
    assert_eq!(counter.value.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test]
async fn test_unknown_method() -> anyhow::Result<()> {
    let (a, _b) = pair(builder("a"), builder("b")).await;

    let remote = a.call(MakeCounter(0)).await?;
    let err = remote.invoke::<_, u32>("reset", &()).await.unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::UnknownMethod));
    Ok(())
}

#[tokio::test]
async fn test_only_local_objects_can_be_exported() -> anyhow::Result<()> {
    let (a, _b) = pair(builder("a"), builder("b")).await;

    let remote = a.call(MakeCounter(0)).await?;
    assert!(matches!(a.export(remote), Err(ChannelError::InvalidArgument(_))));
    Ok(())
}

#[tokio::test]
async fn test_dump_export_table() -> anyhow::Result<()> {
    let (a, _b) = pair(builder("a"), builder("b")).await;

    let _stub = a.export(Arc::new(Counter::default()))?;
    let mut out = Vec::new();
    a.dump_export_table(&mut out)?;
    let dump = String::from_utf8(out)?;

    assert_eq!(dump.lines().count(), 1);
    assert!(dump.contains("type=Counter"));
    assert!(dump.contains("refcount=1"));
    assert!(dump.contains("export_tests.rs"));
    Ok(())
}

#[tokio::test]
async fn test_export_recording() -> anyhow::Result<()> {
    let (a, _b) = pair(builder("a"), builder("b")).await;

    let recording = a.start_export_recording();
    let encoded = a.encode(&ObjectRef::from(Arc::new(Counter::default())))?;
    let exports = recording.stop();

    assert!(!encoded.is_empty());
    assert_eq!(exports.len(), 1);
    assert_eq!(a.exported_count(), 1);
    exports.release();
    assert_eq!(a.exported_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_recordings_stopped_out_of_order() -> anyhow::Result<()> {
    let (a, _b) = pair(builder("a"), builder("b")).await;

    let outer = a.start_export_recording();
    let inner = a.start_export_recording();
    a.encode(&ObjectRef::from(Arc::new(Counter::default())))?;
    let outer_exports = outer.stop();
    a.encode(&ObjectRef::from(Arc::new(Counter::default())))?;
    let inner_exports = inner.stop();

    assert!(outer_exports.is_empty());
    assert_eq!(inner_exports.len(), 2);
    inner_exports.release();
    assert_eq!(a.exported_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_close_clears_exports() -> anyhow::Result<()> {
    let (a, _b) = pair(builder("a"), builder("b")).await;

    let _stub = a.export(Arc::new(Counter::default()))?;
    a.close().await?;
    a.join().await;

    assert_eq!(a.exported_count(), 0);
    assert!(a.export(Arc::new(Counter::default())).is_err());
    Ok(())
}
