//! Watch-backed local caches and change notifications
//!
//! Each watched kind is mirrored into a kube-rs reflector [`Store`]. The
//! informer loop feeding a store also turns raw watch events into
//! add/update/delete notifications, reading the previous object from the
//! store before the event is applied so update handlers see both versions.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::NetworkAttachmentDefinition;
use crate::error::{Error, Result};

/// Change notification delivered to a [`ResourceEventHandler`]
#[derive(Debug, Clone)]
pub enum Notification<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

/// Capability set of a watched-object handler
#[async_trait]
pub trait ResourceEventHandler<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn on_add(&self, _obj: &K) {}

    async fn on_update(&self, _old: &K, _new: &K) {}

    async fn on_delete(&self, _obj: &K) {}

    async fn handle(&self, notification: Notification<K>) {
        match notification {
            Notification::Added(obj) => self.on_add(&obj).await,
            Notification::Updated { old, new } => self.on_update(&old, &new).await,
            Notification::Deleted(obj) => self.on_delete(&obj).await,
        }
    }
}

/// Read-only snapshots of every watched kind
#[derive(Clone)]
pub struct Cache {
    pub services: Store<Service>,
    pub pods: Store<Pod>,
    pub endpoints: Store<Endpoints>,
    pub network_attachments: Store<NetworkAttachmentDefinition>,
}

/// Write halves of the caches, consumed by the informer loops
pub struct CacheWriters {
    pub services: reflector::store::Writer<Service>,
    pub pods: reflector::store::Writer<Pod>,
    pub endpoints: reflector::store::Writer<Endpoints>,
    pub network_attachments: reflector::store::Writer<NetworkAttachmentDefinition>,
}

impl Cache {
    /// Create empty caches together with their writers
    pub fn new() -> (Self, CacheWriters) {
        let (services, services_writer) = reflector::store();
        let (pods, pods_writer) = reflector::store();
        let (endpoints, endpoints_writer) = reflector::store();
        let (network_attachments, nads_writer) = reflector::store();
        (
            Self {
                services,
                pods,
                endpoints,
                network_attachments,
            },
            CacheWriters {
                services: services_writer,
                pods: pods_writer,
                endpoints: endpoints_writer,
                network_attachments: nads_writer,
            },
        )
    }

    /// Block until every store has received its initial list
    pub async fn wait_until_synced(&self, timeout: Duration) -> Result<()> {
        let synced = async {
            futures::try_join!(
                self.services.wait_until_ready(),
                self.pods.wait_until_ready(),
                self.endpoints.wait_until_ready(),
                self.network_attachments.wait_until_ready(),
            )
        };
        match tokio::time::timeout(timeout, synced).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::ConfigError(format!("cache writer dropped: {}", e))),
            Err(_) => Err(Error::CacheSyncTimeout(timeout)),
        }
    }

    pub fn get_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services
            .get(&ObjectRef::new(name).within(namespace))
    }

    pub fn get_endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>> {
        self.endpoints
            .get(&ObjectRef::new(name).within(namespace))
    }

    /// Pods in `namespace` whose labels satisfy `selector`
    pub fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Vec<Arc<Pod>> {
        let mut pods: Vec<_> = self
            .pods
            .state()
            .into_iter()
            .filter(|pod| pod.namespace().as_deref() == Some(namespace))
            .filter(|pod| selector_matches(selector, pod.labels()))
            .collect();
        pods.sort_by_key(|pod| pod.name_any());
        pods
    }

    /// Pods in every namespace
    pub fn list_all_pods(&self) -> Vec<Arc<Pod>> {
        self.pods.state()
    }

    /// Services in the pod's namespace whose selector matches the pod's labels
    pub fn pod_services(&self, pod: &Pod) -> Vec<Arc<Service>> {
        let namespace = pod.namespace();
        self.services
            .state()
            .into_iter()
            .filter(|svc| svc.namespace() == namespace)
            .filter(|svc| {
                service_selector(svc)
                    .map(|selector| selector_matches(selector, pod.labels()))
                    .unwrap_or(false)
            })
            .collect()
    }
}

/// The Service's pod selector, if it has a non-empty one
pub fn service_selector(svc: &Service) -> Option<&BTreeMap<String, String>> {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.selector.as_ref())
        .filter(|selector| !selector.is_empty())
}

/// Equality-based label selector match
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Store key for a namespaced object
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => {
            format!("{}/{}", namespace, obj.meta().name.as_deref().unwrap_or_default())
        }
        _ => obj.meta().name.clone().unwrap_or_default(),
    }
}

/// Split a `namespace/name` store key
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split('/').collect::<Vec<_>>().as_slice() {
        [name] if !name.is_empty() => Ok(("", name)),
        [namespace, name] if !name.is_empty() => Ok((namespace, name)),
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}

/// Translates watch events into notifications while keeping the store current
struct NotificationTracker<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    relist: Option<Relist<K>>,
}

struct Relist<K>
where
    K: Resource + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    seen: HashSet<ObjectRef<K>>,
    pending: Vec<Notification<K>>,
}

impl<K> NotificationTracker<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    fn new() -> Self {
        Self { relist: None }
    }

    /// Apply `event` to the store and return the notifications it produced
    fn apply(
        &mut self,
        store: &Store<K>,
        writer: &mut reflector::store::Writer<K>,
        event: watcher::Event<K>,
    ) -> Vec<Notification<K>> {
        let notifications = match &event {
            watcher::Event::Apply(obj) => vec![diff(store, obj)],
            watcher::Event::Delete(obj) => vec![Notification::Deleted(Arc::new(obj.clone()))],
            watcher::Event::Init => {
                self.relist = Some(Relist {
                    seen: HashSet::new(),
                    pending: Vec::new(),
                });
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                if let Some(relist) = self.relist.as_mut() {
                    relist.seen.insert(ObjectRef::from_obj(obj));
                    relist.pending.push(diff(store, obj));
                }
                Vec::new()
            }
            watcher::Event::InitDone => match self.relist.take() {
                Some(relist) => {
                    let mut notifications: Vec<_> = store
                        .state()
                        .into_iter()
                        .filter(|obj| !relist.seen.contains(&ObjectRef::from_obj(obj.as_ref())))
                        .map(Notification::Deleted)
                        .collect();
                    notifications.extend(relist.pending);
                    notifications
                }
                None => Vec::new(),
            },
        };
        writer.apply_watcher_event(&event);
        notifications
    }
}

fn diff<K>(store: &Store<K>, obj: &K) -> Notification<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    let new = Arc::new(obj.clone());
    match store.get(&ObjectRef::from_obj(obj)) {
        Some(old) => Notification::Updated { old, new },
        None => Notification::Added(new),
    }
}

/// Run one watch stream until cancelled, keeping `writer` current and
/// delivering notifications to `handler` in order.
pub async fn run_informer<K, H>(
    api: Api<K>,
    store: Store<K>,
    mut writer: reflector::store::Writer<K>,
    handler: H,
    shutdown: CancellationToken,
) where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
    H: ResourceEventHandler<K>,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let mut tracker = NotificationTracker::new();
    let mut events = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    info!("Starting informer for {}", kind);
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                for notification in tracker.apply(&store, &mut writer, event) {
                    handler.handle(notification).await;
                }
            }
            Some(Err(e)) => warn!("Watch error for {}: {}", kind, e),
            None => break,
        }
    }
    debug!("Informer for {} stopped", kind);
}

/// Spawn the informers for every watched kind
pub fn spawn_informers<S, P, E, N>(
    client: &Client,
    cache: &Cache,
    writers: CacheWriters,
    handlers: (S, P, E, N),
    shutdown: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>>
where
    S: ResourceEventHandler<Service> + 'static,
    P: ResourceEventHandler<Pod> + 'static,
    E: ResourceEventHandler<Endpoints> + 'static,
    N: ResourceEventHandler<NetworkAttachmentDefinition> + 'static,
{
    let (services, pods, endpoints, nads) = handlers;
    vec![
        tokio::spawn(run_informer(
            Api::all(client.clone()),
            cache.services.clone(),
            writers.services,
            services,
            shutdown.clone(),
        )),
        tokio::spawn(run_informer(
            Api::all(client.clone()),
            cache.pods.clone(),
            writers.pods,
            pods,
            shutdown.clone(),
        )),
        tokio::spawn(run_informer(
            Api::all(client.clone()),
            cache.endpoints.clone(),
            writers.endpoints,
            endpoints,
            shutdown.clone(),
        )),
        tokio::spawn(run_informer(
            Api::all(client.clone()),
            cache.network_attachments.clone(),
            writers.network_attachments,
            nads,
            shutdown.clone(),
        )),
    ]
}

/// Helpers for populating caches without an API server
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn apply<K>(writer: &mut reflector::store::Writer<K>, obj: K)
    where
        K: Resource + Clone + 'static,
        K::DynamicType: Eq + Hash + Clone,
    {
        writer.apply_watcher_event(&watcher::Event::Apply(obj));
    }

    pub fn delete<K>(writer: &mut reflector::store::Writer<K>, obj: K)
    where
        K: Resource + Clone + 'static,
        K::DynamicType: Eq + Hash + Clone,
    {
        writer.apply_watcher_event(&watcher::Event::Delete(obj));
    }
}
