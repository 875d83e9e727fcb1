//! Watch-driven local caches of the four resource kinds the translator reads.
//!
//! Each [`Informer`] wraps a kube reflector [`Store`] and keeps secondary
//! indexes next to it. The matching [`InformerWriter`] is the only mutator: it
//! applies watcher events to the store and recomputes every index entry of the
//! touched object from scratch.

use std::{
    any::Any,
    collections::{BTreeSet, HashMap},
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use futures::StreamExt as _;
use k8s_openapi::api::{
    core::v1::{Endpoints, Secret, Service},
    networking::v1::{HTTPIngressRuleValue, Ingress},
};
use kube::{
    runtime::{
        reflector::{self, store::Writer, ObjectRef, Store},
        watcher::{self, watcher},
        WatchStreamExt as _,
    },
    Api, Client, Resource as KubeResource, ResourceExt as _,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Resource;
use crate::{Error, Result};

pub const NAMESPACE_INDEX: &str = "namespace";
pub const SECRET_KIND: &str = "secret";
pub const SERVICE_KIND: &str = "service";

/// Anything an index function may be handed.
pub trait Indexable: Any + Send + Sync {
    fn type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> Indexable for T {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type IndexFunc = Arc<dyn Fn(Option<&dyn Indexable>) -> Result<Vec<String>> + Send + Sync>;

pub fn item_key_func(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn object_key<K: KubeResource>(obj: &K) -> String {
    item_key_func(
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default(),
    )
}

fn as_ingress(obj: Option<&dyn Indexable>) -> Result<&Ingress> {
    obj.and_then(|o| o.as_any().downcast_ref::<Ingress>())
        .ok_or_else(|| Error::index_unexpected_type(obj.map_or("<nil>", |o| o.type_name())))
}

/// Rules that route HTTP traffic for a named host, in declaration order.
pub(super) fn routed_rules(ing: &Ingress) -> impl Iterator<Item = (&str, &HTTPIngressRuleValue)> {
    ing.spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|rule| match (rule.host.as_deref(), rule.http.as_ref()) {
            (Some(host), Some(http)) if !host.is_empty() => Some((host, http)),
            _ => None,
        })
}

/// Indexes an ingress by the `namespace/name` of the secret backing each routed
/// host. Hosts without a TLS entry fall back to `default_secret` when given.
pub fn ingress_secret_index_func(default_secret: Option<Resource>) -> IndexFunc {
    Arc::new(move |obj: Option<&dyn Indexable>| -> Result<Vec<String>> {
        let ing = as_ingress(obj)?;
        let namespace = ing.namespace().unwrap_or_default();
        let mut host_secret = HashMap::new();
        for tls in ing
            .spec
            .as_ref()
            .and_then(|s| s.tls.as_ref())
            .into_iter()
            .flatten()
        {
            let Some(secret_name) = tls.secret_name.as_deref().filter(|n| !n.is_empty()) else {
                continue;
            };
            for host in tls.hosts.iter().flatten() {
                host_secret.insert(host.as_str(), Resource::new(&namespace, secret_name));
            }
        }

        Ok(routed_rules(ing)
            .filter_map(|(host, _)| host_secret.get(host).or(default_secret.as_ref()))
            .map(Resource::key)
            .collect())
    })
}

/// Indexes an ingress by the `namespace/name` of every backend service.
pub fn ingress_service_index_func() -> IndexFunc {
    Arc::new(|obj: Option<&dyn Indexable>| -> Result<Vec<String>> {
        let ing = as_ingress(obj)?;
        let namespace = ing.namespace().unwrap_or_default();
        Ok(routed_rules(ing)
            .flat_map(|(_, http)| http.paths.iter())
            .filter_map(|path| path.backend.service.as_ref())
            .filter(|svc| !svc.name.is_empty())
            .map(|svc| item_key_func(&namespace, &svc.name))
            .collect())
    })
}

type IndexEntries = HashMap<&'static str, Vec<String>>;

#[derive(Default)]
struct Indices {
    indexers: HashMap<&'static str, IndexFunc>,
    by_value: HashMap<&'static str, HashMap<String, BTreeSet<String>>>,
    by_object: HashMap<String, IndexEntries>,
}

impl Indices {
    fn update<K>(&mut self, key: &str, obj: Option<&K>)
    where
        K: KubeResource + Send + Sync + 'static,
    {
        self.remove(key);
        let Some(obj) = obj else {
            return;
        };

        let mut entries = IndexEntries::new();
        entries.insert(
            NAMESPACE_INDEX,
            vec![obj.meta().namespace.clone().unwrap_or_default()],
        );
        for (&name, func) in self.indexers.iter() {
            match func(Some(obj as &dyn Indexable)) {
                Ok(values) => {
                    entries.insert(name, values);
                }
                Err(e) => warn!(index = name, key, "dropping index entry: {e}"),
            }
        }

        for (&name, values) in entries.iter() {
            let index = self.by_value.entry(name).or_default();
            for value in values {
                index
                    .entry(value.clone())
                    .or_default()
                    .insert(key.to_string());
            }
        }
        self.by_object.insert(key.to_string(), entries);
    }

    fn remove(&mut self, key: &str) {
        let Some(entries) = self.by_object.remove(key) else {
            return;
        };
        for (name, values) in entries {
            let Some(index) = self.by_value.get_mut(name) else {
                continue;
            };
            for value in values {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }

    fn clear(&mut self) {
        self.by_value.clear();
        self.by_object.clear();
    }

    fn keys(&self, index: &str, value: &str) -> Vec<String> {
        self.by_value
            .get(index)
            .and_then(|idx| idx.get(value))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Change observed by an [`InformerWriter`].
#[derive(Debug, Clone)]
pub enum Notification<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> Notification<K> {
    pub fn dispatch<H: ResourceEventHandler<K> + ?Sized>(&self, handler: &H) {
        match self {
            Self::Added(obj) => handler.on_add(obj),
            Self::Updated { old, new } => handler.on_update(old, new),
            Self::Deleted(obj) => handler.on_delete(obj),
        }
    }
}

pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &K);
}

/// Read side of one cache.
pub struct Informer<K>
where
    K: KubeResource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    indices: Arc<RwLock<Indices>>,
}

impl<K> Clone for Informer<K>
where
    K: KubeResource<DynamicType = ()> + Clone + 'static,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            indices: self.indices.clone(),
        }
    }
}

impl<K> Informer<K>
where
    K: KubeResource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new(indexers: Vec<(&'static str, IndexFunc)>) -> (Self, InformerWriter<K>) {
        let (store, writer) = reflector::store();
        let indices = Arc::new(RwLock::new(Indices {
            indexers: indexers.into_iter().collect(),
            ..Default::default()
        }));
        let informer = Self {
            store: store.clone(),
            indices: indices.clone(),
        };
        let writer = InformerWriter {
            writer,
            store,
            indices,
            pending: Vec::new(),
        };
        (informer, writer)
    }

    /// Looks up `namespace/name`; cluster scoped objects use an empty namespace.
    pub fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        let obj_ref = match key.split_once('/') {
            Some(("", name)) => ObjectRef::new(name),
            Some((namespace, name)) => ObjectRef::new(name).within(namespace),
            None => ObjectRef::new(key),
        };
        self.store.get(&obj_ref)
    }

    pub fn index_keys(&self, index: &str, value: &str) -> Vec<String> {
        self.indices.read().keys(index, value)
    }

    pub fn by_index(&self, index: &str, value: &str) -> Vec<Arc<K>> {
        self.index_keys(index, value)
            .iter()
            .filter_map(|key| self.get_by_key(key))
            .collect()
    }

    pub fn state(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    pub async fn wait_until_ready(&self) -> Result<()> {
        Ok(self.store.wait_until_ready().await?)
    }
}

/// Write side of one cache, fed by a watcher.
pub struct InformerWriter<K>
where
    K: KubeResource<DynamicType = ()> + Clone + 'static,
{
    writer: Writer<K>,
    store: Store<K>,
    indices: Arc<RwLock<Indices>>,
    pending: Vec<K>,
}

impl<K> InformerWriter<K>
where
    K: KubeResource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn apply(&mut self, event: &watcher::Event<K>) -> Vec<Notification<K>> {
        match event {
            watcher::Event::Apply(obj) => {
                let old = self.store.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(event);
                self.indices.write().update(&object_key(obj), Some(obj));
                let new = Arc::new(obj.clone());
                vec![match old {
                    Some(old) => Notification::Updated { old, new },
                    None => Notification::Added(new),
                }]
            }
            watcher::Event::Delete(obj) => {
                self.writer.apply_watcher_event(event);
                self.indices.write().update::<K>(&object_key(obj), None);
                vec![Notification::Deleted(Arc::new(obj.clone()))]
            }
            watcher::Event::Init => {
                self.pending.clear();
                self.writer.apply_watcher_event(event);
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                self.pending.push(obj.clone());
                self.writer.apply_watcher_event(event);
                Vec::new()
            }
            watcher::Event::InitDone => {
                let mut old: HashMap<_, _> = self
                    .store
                    .state()
                    .into_iter()
                    .map(|obj| (object_key(obj.as_ref()), obj))
                    .collect();
                self.writer.apply_watcher_event(event);

                let mut indices = self.indices.write();
                indices.clear();
                let mut notifications = Vec::new();
                for obj in std::mem::take(&mut self.pending) {
                    let key = object_key(&obj);
                    indices.update(&key, Some(&obj));
                    let new = Arc::new(obj);
                    notifications.push(match old.remove(&key) {
                        Some(old) => Notification::Updated { old, new },
                        None => Notification::Added(new),
                    });
                }
                notifications.extend(old.into_values().map(Notification::Deleted));
                notifications
            }
        }
    }
}

/// Drives `writer` from a cluster wide watch until `shutdown` fires.
async fn run_informer<K, H>(
    api: Api<K>,
    mut writer: InformerWriter<K>,
    handler: Arc<H>,
    shutdown: CancellationToken,
) where
    K: KubeResource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    H: ResourceEventHandler<K> + 'static,
{
    let kind = K::kind(&()).to_string();
    info!("Starting informer for {kind}");
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                for notification in writer.apply(&event) {
                    notification.dispatch(handler.as_ref());
                }
            }
            Some(Err(e)) => warn!(kind = %kind, "watch failed: {}", Error::from(e)),
            None => break,
        }
    }
    info!("informer for {kind} shutdown");
}

/// The four caches the translator joins over.
#[derive(Clone)]
pub struct InformerSet {
    pub endpoint: Informer<Endpoints>,
    pub ingress: Informer<Ingress>,
    pub secret: Informer<Secret>,
    pub service: Informer<Service>,
}

pub struct InformerSetWriters {
    pub endpoint: InformerWriter<Endpoints>,
    pub ingress: InformerWriter<Ingress>,
    pub secret: InformerWriter<Secret>,
    pub service: InformerWriter<Service>,
}

impl InformerSet {
    pub fn new(default_secret: Option<Resource>) -> (Self, InformerSetWriters) {
        let (endpoint, endpoint_writer) = Informer::new(Vec::new());
        let (ingress, ingress_writer) = Informer::new(vec![
            (SECRET_KIND, ingress_secret_index_func(default_secret)),
            (SERVICE_KIND, ingress_service_index_func()),
        ]);
        let (secret, secret_writer) = Informer::new(Vec::new());
        let (service, service_writer) = Informer::new(Vec::new());
        (
            Self {
                endpoint,
                ingress,
                secret,
                service,
            },
            InformerSetWriters {
                endpoint: endpoint_writer,
                ingress: ingress_writer,
                secret: secret_writer,
                service: service_writer,
            },
        )
    }

    /// Resolves once every cache completed its initial list.
    pub async fn wait_for_cache_sync(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(
            timeout,
            futures::future::try_join4(
                self.endpoint.wait_until_ready(),
                self.ingress.wait_until_ready(),
                self.secret.wait_until_ready(),
                self.service.wait_until_ready(),
            ),
        )
        .await??;
        debug!("informer caches synced");
        Ok(())
    }
}

impl InformerSetWriters {
    pub async fn run<H>(self, client: Client, handler: Arc<H>, shutdown: CancellationToken)
    where
        H: ResourceEventHandler<Endpoints>
            + ResourceEventHandler<Ingress>
            + ResourceEventHandler<Secret>
            + ResourceEventHandler<Service>
            + 'static,
    {
        tokio::join!(
            run_informer(
                Api::<Endpoints>::all(client.clone()),
                self.endpoint,
                handler.clone(),
                shutdown.clone(),
            ),
            run_informer(
                Api::<Ingress>::all(client.clone()),
                self.ingress,
                handler.clone(),
                shutdown.clone(),
            ),
            run_informer(
                Api::<Secret>::all(client.clone()),
                self.secret,
                handler.clone(),
                shutdown.clone(),
            ),
            run_informer(Api::<Service>::all(client), self.service, handler, shutdown),
        );
    }
}
