//! On-demand class and resource loading through the peer's code base

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::pair;
use remoting::{
    Archive, CallContext, CallError, Callable, Capability, ChannelBuilder, ChannelError, CodeBase, ProxyError,
};
use serde::{Deserialize, Serialize};

fn tools() -> CodeBase {
    CodeBase::new(
        "tools",
        vec![
            Archive::new("tools.jar")
                .with_class("tools.Hammer", &b"hammer image"[..])
                .with_class("tools.Saw", &b"saw image"[..])
                .with_resource("tools/config.txt", &b"sharp=true"[..]),
            Archive::new("extras.jar").with_class("extras.Level", &b"level image"[..]),
        ],
    )
}

fn plugin() -> CodeBase {
    let core = CodeBase::new(
        "core",
        vec![Archive::new("core.jar")
            .with_class("core.Base", &b"base image"[..])
            .with_resource("plugin.properties", &b"core"[..])],
    );
    CodeBase::with_parent(
        "plugin",
        core,
        vec![Archive::new("plugin.jar")
            .with_class("plugin.Main", &b"main image"[..])
            .with_resource("plugin.properties", &b"plugin"[..])],
    )
}

fn loader_side(name: &str) -> ChannelBuilder {
    ChannelBuilder::new(name).register::<Inspect>().register::<ResolveDefiner>()
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Report {
    class: Option<Bytes>,
    class_again: Option<Bytes>,
    resource_url: Option<String>,
    resource_stable: bool,
    resource_count: usize,
    classes_loaded: u64,
    resources_loaded: u64,
}

/// Looks things up twice through the caller's code base
#[derive(Debug, Serialize, Deserialize)]
struct Inspect {
    class: String,
    resource: String,
}

#[async_trait]
impl Callable for Inspect {
    const NAME: &'static str = "test.Inspect";
    const RESTRICTED_SAFE: bool = true;
    type Output = Report;
    type Error = ProxyError;

    async fn call(self, ctx: CallContext) -> Result<Report, ProxyError> {
        let loader = ctx.loader().ok_or_else(|| ProxyError::new("no code base"))?;
        let wrap = |e: CallError| ProxyError::capture(&e);

        let first = loader.load_class(&self.class).await.map_err(wrap)?;
        let second = loader.load_class(&self.class).await.map_err(wrap)?;
        let resource = loader.get_resource(&self.resource).await.map_err(wrap)?;
        let again = loader.get_resource(&self.resource).await.map_err(wrap)?;
        let all = loader.get_resources(&self.resource).await.map_err(wrap)?;
        let counters = ctx.channel().performance_counters();

        Ok(Report {
            class: first.map(|c| c.bytes),
            class_again: second.map(|c| c.bytes),
            resource_url: resource.as_ref().map(|r| r.url.clone()),
            resource_stable: resource == again,
            resource_count: all.len(),
            classes_loaded: counters.classes_loaded,
            resources_loaded: counters.resources_loaded,
        })
    }
}

/// Whether the class is cached in a loader other than the requesting one
#[derive(Debug, Serialize, Deserialize)]
struct ResolveDefiner(String);

#[async_trait]
impl Callable for ResolveDefiner {
    const NAME: &'static str = "test.ResolveDefiner";
    type Output = (bool, u64);
    type Error = ProxyError;

    async fn call(self, ctx: CallContext) -> Result<(bool, u64), ProxyError> {
        let loader = ctx.loader().ok_or_else(|| ProxyError::new("no code base"))?;
        let class = loader
            .load_class(&self.0)
            .await
            .map_err(|e| ProxyError::capture(&e))?
            .ok_or_else(|| ProxyError::new("class not found"))?;
        let delegated = class.definer != loader.oid();

        // the defining loader already holds the image
        let definer = ctx.channel().remote_loader(class.definer);
        let cached = definer.load_class(&self.0).await.map_err(|e| ProxyError::capture(&e))?;
        if cached.map(|c| c.bytes) != Some(class.bytes) {
            return Err(ProxyError::new("definer cache mismatch"));
        }
        Ok((delegated, ctx.channel().performance_counters().classes_loaded))
    }
}

#[tokio::test]
async fn test_lookups_are_cached() -> anyhow::Result<()> {
    let (a, b) = pair(ChannelBuilder::new("a"), loader_side("b")).await;

    let report = a
        .call_with(
            &tools(),
            Inspect {
                class: "tools.Hammer".to_string(),
                resource: "tools/config.txt".to_string(),
            },
        )
        .await?;

    assert_eq!(report.class.as_deref(), Some(&b"hammer image"[..]));
    assert_eq!(report.class, report.class_again);
    assert!(report.resource_stable);
    assert!(report.resource_url.unwrap().starts_with("remote://b/"));
    assert_eq!(report.resource_count, 1);
    assert_eq!(report.classes_loaded, 1);
    assert_eq!(report.resources_loaded, 2);

    b.reset_performance_counters();
    assert_eq!(b.performance_counters().classes_loaded, 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_names_resolve_to_none() -> anyhow::Result<()> {
    let (a, _b) = pair(ChannelBuilder::new("a"), loader_side("b")).await;

    let report = a
        .call_with(
            &tools(),
            Inspect {
                class: "tools.Wrench".to_string(),
                resource: "missing.txt".to_string(),
            },
        )
        .await?;

    assert!(report.class.is_none());
    assert!(report.resource_url.is_none());
    assert_eq!(report.resource_count, 0);
    assert_eq!(report.classes_loaded, 1);
    Ok(())
}

#[tokio::test]
async fn test_default_code_base_is_sent() -> anyhow::Result<()> {
    let (a, _b) = pair(ChannelBuilder::new("a").with_code_base(tools()), loader_side("b")).await;

    let report = a
        .call(Inspect {
            class: "tools.Saw".to_string(),
            resource: "tools/config.txt".to_string(),
        })
        .await?;
    assert_eq!(report.class.as_deref(), Some(&b"saw image"[..]));
    Ok(())
}

#[tokio::test]
async fn test_resources_along_delegation_chain() -> anyhow::Result<()> {
    let (a, _b) = pair(ChannelBuilder::new("a"), loader_side("b")).await;

    let report = a
        .call_with(
            &plugin(),
            Inspect {
                class: "plugin.Main".to_string(),
                resource: "plugin.properties".to_string(),
            },
        )
        .await?;
    assert_eq!(report.resource_count, 2);
    Ok(())
}

#[tokio::test]
async fn test_multi_loader_caches_in_definer() -> anyhow::Result<()> {
    let (a, _b) = pair(ChannelBuilder::new("a"), loader_side("b")).await;

    let (delegated, loaded) = a.call_with(&plugin(), ResolveDefiner("core.Base".to_string())).await?;
    assert!(delegated);
    assert_eq!(loaded, 1);
    Ok(())
}

#[tokio::test]
async fn test_single_loader_without_capability() -> anyhow::Result<()> {
    let (a, _b) = pair(
        ChannelBuilder::new("a").with_capability(Capability::NONE),
        loader_side("b"),
    )
    .await;

    let (delegated, loaded) = a.call_with(&plugin(), ResolveDefiner("core.Base".to_string())).await?;
    assert!(!delegated);
    assert_eq!(loaded, 1);
    Ok(())
}

#[tokio::test]
async fn test_preload_jar_is_idempotent() -> anyhow::Result<()> {
    let (a, _b) = pair(ChannelBuilder::new("a"), loader_side("b")).await;
    let code_base = tools();

    assert!(a.preload_jar(&code_base, "tools.Hammer").await?);
    assert!(!a.preload_jar(&code_base, "tools.Saw").await?);
    assert!(a.preload_jar(&code_base, "extras.Level").await?);

    // served from the prefetched archive without another fetch
    let report = a
        .call_with(
            &code_base,
            Inspect {
                class: "tools.Saw".to_string(),
                resource: "tools/config.txt".to_string(),
            },
        )
        .await?;
    assert_eq!(report.class.as_deref(), Some(&b"saw image"[..]));
    assert_eq!(report.resources_loaded, 1);
    Ok(())
}

#[tokio::test]
async fn test_preload_jar_needs_a_supplying_archive() {
    let (a, _b) = pair(ChannelBuilder::new("a"), loader_side("b")).await;

    let err = a.preload_jar(&tools(), "nowhere.Missing").await.unwrap_err();
    assert!(matches!(err, CallError::Channel(ChannelError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_restricted_side_loads_nothing() {
    let (a, _b) = pair(ChannelBuilder::new("a"), loader_side("b").with_restricted(true)).await;

    let result = a
        .call_with(
            &tools(),
            Inspect {
                class: "tools.Hammer".to_string(),
                resource: "tools/config.txt".to_string(),
            },
        )
        .await;
    match result {
        Err(CallError::Remote(err)) => assert!(err.trace().contains("does not load code")),
        other => panic!("expected refusal, got {:?}", other),
    }

    let err = a.preload_jar(&tools(), "tools.Hammer").await.unwrap_err();
    assert_eq!(err.kind(), Some(remoting::FailureKind::Refused));
}
