//! Code bases and the remote loader bridge
//!
//! A [`CodeBase`] is a named set of archives holding class images and
//! resources, optionally delegating to a parent first. When a request is sent
//! with a code base, the code base is exported for the lifetime of the
//! channel and the receiving side gets a [`RemoteLoader`] bound to it. The
//! loader fetches images on demand and caches every answer, negative ones
//! included, so a name costs at most one round trip per loader.

use crate::export::{MethodCall, MethodError, ObjectRef, RemoteObject};
use crate::{CallError, Channel, ChannelError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use remoting_proto::{ObjectId, ProxyError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// A named bundle of class images and resources
#[derive(Debug, Clone, Default)]
pub struct Archive {
    name: String,
    classes: BTreeMap<String, Bytes>,
    resources: BTreeMap<String, Bytes>,
}

impl Archive {
    /// Create an empty archive
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a class image
    pub fn with_class(mut self, name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        self.classes.insert(name.into(), bytes.into());
        self
    }

    /// Add a resource
    pub fn with_resource(mut self, name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        self.resources.insert(name.into(), bytes.into());
        self
    }

    /// Archive name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image of a class in this archive
    pub fn class(&self, name: &str) -> Option<&Bytes> {
        self.classes.get(name)
    }

    /// Resource in this archive
    pub fn resource(&self, name: &str) -> Option<&Bytes> {
        self.resources.get(name)
    }
}

struct CodeBaseInner {
    name: String,
    parent: Option<CodeBase>,
    archives: Vec<Archive>,
}

/// Archives searched parent first, the unit of code shipped with a request
#[derive(Clone)]
pub struct CodeBase {
    inner: Arc<CodeBaseInner>,
}

impl CodeBase {
    /// Root code base
    pub fn new(name: impl Into<String>, archives: Vec<Archive>) -> Self {
        Self {
            inner: Arc::new(CodeBaseInner {
                name: name.into(),
                parent: None,
                archives,
            }),
        }
    }

    /// Code base that consults `parent` before its own archives
    pub fn with_parent(name: impl Into<String>, parent: CodeBase, archives: Vec<Archive>) -> Self {
        Self {
            inner: Arc::new(CodeBaseInner {
                name: name.into(),
                parent: Some(parent),
                archives,
            }),
        }
    }

    /// Code base name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Delegation parent
    pub fn parent(&self) -> Option<&CodeBase> {
        self.inner.parent.as_ref()
    }

    /// Find a class image and the code base that defines it
    pub fn find_class(&self, name: &str) -> Option<(CodeBase, Bytes)> {
        if let Some(found) = self.parent().and_then(|p| p.find_class(name)) {
            return Some(found);
        }
        self.inner
            .archives
            .iter()
            .find_map(|a| a.class(name))
            .map(|bytes| (self.clone(), bytes.clone()))
    }

    /// First resource with this name along the delegation chain
    pub fn find_resource(&self, name: &str) -> Option<Bytes> {
        self.parent()
            .and_then(|p| p.find_resource(name))
            .or_else(|| self.inner.archives.iter().find_map(|a| a.resource(name)).cloned())
    }

    /// Every resource with this name, parent matches first
    pub fn find_resources(&self, name: &str) -> Vec<Bytes> {
        let mut found = self.parent().map(|p| p.find_resources(name)).unwrap_or_default();
        found.extend(self.inner.archives.iter().filter_map(|a| a.resource(name)).cloned());
        found
    }

    /// Archive that supplies `class` when resolved through this code base
    pub fn archive_containing(&self, class: &str) -> Option<&Archive> {
        if let Some(archive) = self.parent().and_then(|p| p.archive_containing(class)) {
            return Some(archive);
        }
        self.inner.archives.iter().find(|a| a.class(class).is_some())
    }

    /// Archive by name along the delegation chain
    pub fn find_archive(&self, name: &str) -> Option<&Archive> {
        self.parent()
            .and_then(|p| p.find_archive(name))
            .or_else(|| self.inner.archives.iter().find(|a| a.name == name))
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl fmt::Debug for CodeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBase")
            .field("name", &self.inner.name)
            .field("parent", &self.parent().map(CodeBase::name))
            .field("archives", &self.inner.archives.iter().map(Archive::name).collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct ClassImage {
    bytes: Bytes,
    definer: ObjectRef,
}

#[derive(Serialize, Deserialize)]
struct ArchiveImage {
    classes: BTreeMap<String, Bytes>,
    resources: BTreeMap<String, Bytes>,
}

/// Serves a [`CodeBase`] to the peer
struct CodeBaseObject {
    code_base: CodeBase,
}

#[async_trait]
impl RemoteObject for CodeBaseObject {
    async fn invoke(&self, call: MethodCall) -> Result<Bytes, MethodError> {
        match call.method() {
            "fetch" => {
                let name: String = call.args()?;
                let image = self.code_base.find_class(&name).map(|(_, bytes)| bytes);
                Ok(call.reply(&image)?)
            }
            "fetch2" => {
                let name: String = call.args()?;
                let channel = call
                    .channel()
                    .ok_or_else(|| ProxyError::new("fetch2 needs a channel to name the definer"))?;
                let image = match self.code_base.find_class(&name) {
                    Some((definer, bytes)) => {
                        let (_, definer) = channel
                            .code_base_ref(&definer)
                            .map_err(|e| ProxyError::capture(&e))?;
                        Some(ClassImage { bytes, definer })
                    }
                    None => None,
                };
                Ok(call.reply(&image)?)
            }
            "fetch_archive" => {
                let name: String = call.args()?;
                let image = self.code_base.find_archive(&name).map(|a| ArchiveImage {
                    classes: a.classes.clone(),
                    resources: a.resources.clone(),
                });
                Ok(call.reply(&image)?)
            }
            "get_resource" => {
                let name: String = call.args()?;
                Ok(call.reply(&self.code_base.find_resource(&name))?)
            }
            "get_resources" => {
                let name: String = call.args()?;
                Ok(call.reply(&self.code_base.find_resources(&name))?)
            }
            _ => Err(call.unknown()),
        }
    }

    fn type_name(&self) -> &'static str {
        "CodeBase"
    }
}

/// A class image resolved through a [`RemoteLoader`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedClass {
    /// Class name
    pub name: String,
    /// Class image
    pub bytes: Bytes,
    /// Handle of the remote code base that defines the class
    pub definer: ObjectId,
}

/// A resource resolved through a [`RemoteLoader`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Resource name
    pub name: String,
    /// Stable locator of the resource, identical across lookups
    pub url: String,
    /// Resource content
    pub bytes: Bytes,
}

/// Caching view of a code base exported by the peer
pub struct RemoteLoader {
    channel: Channel,
    oid: ObjectId,
    classes: Mutex<HashMap<String, Option<LoadedClass>>>,
    resources: Mutex<HashMap<String, Option<Resource>>>,
    resource_lists: Mutex<HashMap<String, Vec<Resource>>>,
    prefetched: Mutex<HashSet<String>>,
}

impl RemoteLoader {
    fn new(channel: Channel, oid: ObjectId) -> Self {
        Self {
            channel,
            oid,
            classes: Mutex::new(HashMap::new()),
            resources: Mutex::new(HashMap::new()),
            resource_lists: Mutex::new(HashMap::new()),
            prefetched: Mutex::new(HashSet::new()),
        }
    }

    /// Handle of the remote code base
    pub fn oid(&self) -> ObjectId {
        self.oid
    }

    fn check_allowed(&self) -> Result<(), CallError> {
        if self.channel.is_restricted() {
            return Err(ChannelError::Restricted(format!(
                "{} does not load code from its peer",
                self.channel.name()
            ))
            .into());
        }
        Ok(())
    }

    fn resource(&self, name: &str, bytes: Bytes) -> Resource {
        Resource {
            name: name.to_string(),
            url: format!("remote://{}/{}/{}", self.channel.name(), self.oid, name),
            bytes,
        }
    }

    /// Resolve a class image, fetching it from the peer at most once
    #[track_caller]
    pub fn load_class(&self, name: &str) -> impl std::future::Future<Output = Result<Option<LoadedClass>, CallError>> + '_ {
        let site = Location::caller();
        let name = name.to_string();
        async move {
            self.check_allowed()?;
            if let Some(cached) = self.classes.lock().get(&name) {
                return Ok(cached.clone());
            }

            let started = Instant::now();
            let loaded = if self.channel.remote_capability().supports_multi_loader_rpc()
                && self.channel.capability().supports_multi_loader_rpc()
            {
                let image: Option<ClassImage> = self.channel.invoke_remote(self.oid, "fetch2", &name, site).await?;
                match image {
                    Some(image) => {
                        let definer = image.definer.remote_oid().unwrap_or(self.oid);
                        let loaded = LoadedClass {
                            name: name.clone(),
                            bytes: image.bytes,
                            definer,
                        };
                        if definer != self.oid {
                            self.channel
                                .remote_loader(definer)
                                .classes
                                .lock()
                                .entry(name.clone())
                                .or_insert_with(|| Some(loaded.clone()));
                        }
                        Some(loaded)
                    }
                    None => None,
                }
            } else {
                let image: Option<Bytes> = self.channel.invoke_remote(self.oid, "fetch", &name, site).await?;
                image.map(|bytes| LoadedClass {
                    name: name.clone(),
                    bytes,
                    definer: self.oid,
                })
            };
            self.channel.inner().counters.class_loaded(started.elapsed());
            debug!("Loaded class {} through #{} on {}", name, self.oid, self.channel.name());

            Ok(self.classes.lock().entry(name).or_insert(loaded).clone())
        }
    }

    /// Resolve a resource, fetching it from the peer at most once
    #[track_caller]
    pub fn get_resource(&self, name: &str) -> impl std::future::Future<Output = Result<Option<Resource>, CallError>> + '_ {
        let site = Location::caller();
        let name = name.to_string();
        async move {
            self.check_allowed()?;
            if let Some(cached) = self.resources.lock().get(&name) {
                return Ok(cached.clone());
            }

            let started = Instant::now();
            let bytes: Option<Bytes> = self.channel.invoke_remote(self.oid, "get_resource", &name, site).await?;
            self.channel.inner().counters.resource_loaded(started.elapsed());

            let resource = bytes.map(|bytes| self.resource(&name, bytes));
            Ok(self.resources.lock().entry(name).or_insert(resource).clone())
        }
    }

    /// Every resource with this name along the peer's delegation chain
    #[track_caller]
    pub fn get_resources(&self, name: &str) -> impl std::future::Future<Output = Result<Vec<Resource>, CallError>> + '_ {
        let site = Location::caller();
        let name = name.to_string();
        async move {
            self.check_allowed()?;
            if let Some(cached) = self.resource_lists.lock().get(&name) {
                return Ok(cached.clone());
            }

            let started = Instant::now();
            let found: Vec<Bytes> = self.channel.invoke_remote(self.oid, "get_resources", &name, site).await?;
            self.channel.inner().counters.resource_loaded(started.elapsed());

            let resources = found
                .into_iter()
                .enumerate()
                .map(|(i, bytes)| Resource {
                    url: format!("remote://{}/{}/{}#{}", self.channel.name(), self.oid, name, i),
                    ..self.resource(&name, bytes)
                })
                .collect();
            Ok(self.resource_lists.lock().entry(name).or_insert(resources).clone())
        }
    }

    /// Fetch a whole archive into the caches; `false` if it was already fetched
    pub async fn prefetch(&self, archive: &str) -> Result<bool, CallError> {
        self.check_allowed()?;
        if !self.prefetched.lock().insert(archive.to_string()) {
            return Ok(false);
        }

        let started = Instant::now();
        let image: Result<Option<ArchiveImage>, CallError> = self
            .channel
            .invoke_remote(self.oid, "fetch_archive", archive, Location::caller())
            .await;
        let image = match image {
            Ok(Some(image)) => image,
            Ok(None) => {
                self.prefetched.lock().remove(archive);
                return Ok(false);
            }
            Err(e) => {
                self.prefetched.lock().remove(archive);
                return Err(e);
            }
        };

        let class_count = image.classes.len();
        {
            let mut classes = self.classes.lock();
            for (name, bytes) in image.classes {
                let loaded = LoadedClass {
                    name: name.clone(),
                    bytes,
                    definer: self.oid,
                };
                classes.entry(name).or_insert(Some(loaded));
            }
        }
        {
            let mut resources = self.resources.lock();
            for (name, bytes) in image.resources {
                let resource = self.resource(&name, bytes);
                resources.entry(name).or_insert(Some(resource));
            }
        }
        self.channel.inner().counters.class_loaded(started.elapsed());
        debug!("Prefetched archive {} ({} classes) through #{}", archive, class_count, self.oid);
        Ok(true)
    }
}

impl fmt::Debug for RemoteLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteLoader")
            .field("channel", &self.channel.name())
            .field("oid", &self.oid)
            .field("classes", &self.classes.lock().len())
            .field("resources", &self.resources.lock().len())
            .finish()
    }
}

/// Code bases exported to and imported from the peer
#[derive(Default)]
pub(crate) struct LoaderTable {
    exported: Mutex<HashMap<usize, Arc<dyn RemoteObject>>>,
    imported: Mutex<HashMap<ObjectId, Arc<RemoteLoader>>>,
}

impl LoaderTable {
    pub(crate) fn clear(&self) {
        self.exported.lock().clear();
        self.imported.lock().clear();
    }
}

impl Channel {
    /// Export `code_base` for the lifetime of the channel
    pub(crate) fn code_base_ref(&self, code_base: &CodeBase) -> Result<(ObjectId, ObjectRef), ChannelError> {
        let object = self
            .inner()
            .loaders
            .exported
            .lock()
            .entry(code_base.key())
            .or_insert_with(|| {
                Arc::new(CodeBaseObject {
                    code_base: code_base.clone(),
                })
            })
            .clone();
        let oid = self
            .inner()
            .exports
            .pin(&object, Some(code_base.name()))
            .ok_or_else(|| self.closed_error())?;
        Ok((oid, ObjectRef::from_arc(object)))
    }

    /// Loader bound to the code base the peer exported as `oid`
    pub fn remote_loader(&self, oid: ObjectId) -> Arc<RemoteLoader> {
        self.inner()
            .loaders
            .imported
            .lock()
            .entry(oid)
            .or_insert_with(|| Arc::new(RemoteLoader::new(self.clone(), oid)))
            .clone()
    }

    /// Have the peer fetch the archive of `code_base` that supplies `class`.
    ///
    /// Returns `true` when the peer fetched it, `false` when the archive was
    /// already cached there.
    #[track_caller]
    pub fn preload_jar(
        &self,
        code_base: &CodeBase,
        class: &str,
    ) -> impl std::future::Future<Output = Result<bool, CallError<ProxyError>>> + Send + 'static {
        let archives = match code_base.archive_containing(class) {
            Some(archive) => vec![archive.name().to_string()],
            None => Vec::new(),
        };
        let class = class.to_string();
        let call = if archives.is_empty() {
            None
        } else {
            Some(self.call_with_async(code_base, crate::call::PreloadArchives { archives }))
        };
        async move {
            match call {
                Some(call) => call.await,
                None => Err(ChannelError::InvalidArgument(format!("no archive supplies {}", class)).into()),
            }
        }
    }

    /// Have the peer fetch the named archives of `code_base`
    #[track_caller]
    pub fn preload_archives(
        &self,
        code_base: &CodeBase,
        archives: Vec<String>,
    ) -> crate::RemoteFuture<bool, ProxyError> {
        self.call_with_async(code_base, crate::call::PreloadArchives { archives })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> CodeBase {
        let core = CodeBase::new(
            "core",
            vec![Archive::new("core.jar")
                .with_class("a.Shared", &b"parent"[..])
                .with_resource("config.toml", &b"core"[..])],
        );
        CodeBase::with_parent(
            "plugin",
            core,
            vec![Archive::new("plugin.jar")
                .with_class("a.Shared", &b"child"[..])
                .with_class("b.Own", &b"own"[..])
                .with_resource("config.toml", &b"plugin"[..])],
        )
    }

    #[test]
    fn test_parent_first_class_lookup() {
        let plugin = tree();
        let (definer, bytes) = plugin.find_class("a.Shared").unwrap();
        assert_eq!(definer.name(), "core");
        assert_eq!(&bytes[..], b"parent");

        let (definer, _) = plugin.find_class("b.Own").unwrap();
        assert_eq!(definer.name(), "plugin");
        assert!(plugin.find_class("c.Missing").is_none());
    }

    #[test]
    fn test_resources_along_chain() {
        let plugin = tree();
        assert_eq!(plugin.find_resource("config.toml").as_deref(), Some(&b"core"[..]));
        let all = plugin.find_resources("config.toml");
        assert_eq!(all.len(), 2);
        assert_eq!(&all[1][..], b"plugin");
    }

    #[test]
    fn test_archive_lookup() {
        let plugin = tree();
        assert_eq!(plugin.archive_containing("b.Own").map(Archive::name), Some("plugin.jar"));
        assert_eq!(plugin.archive_containing("a.Shared").map(Archive::name), Some("core.jar"));
        assert!(plugin.find_archive("core.jar").is_some());
        assert!(plugin.find_archive("other.jar").is_none());
    }
}
