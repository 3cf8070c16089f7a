//! Cache-backed watchers for a single resource kind
//!
//! A [`TypedInformer`] lists a resource kind once, then follows its watch
//! stream, keeping a [`Store`] current and fanning every change out to the
//! registered handlers as Added / Updated / Deleted events.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::reflector::{self, ObjectRef, Store, store::Writer};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Resource, ResourceExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use promwatch_types::ResourceDescriptor;

use crate::error::{Error, Result};

/// Bounds every informer-backed resource kind satisfies
pub trait InformerResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> InformerResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

/// A change to the cached collection
#[derive(Clone, Debug)]
pub enum InformerEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> InformerEvent<K> {
    /// The object as it is after the event (last known state for deletes)
    pub fn object(&self) -> &Arc<K> {
        match self {
            Self::Added(obj) | Self::Deleted(obj) => obj,
            Self::Updated { new, .. } => new,
        }
    }

    /// Convert the carried objects; `None` if any conversion fails
    pub fn try_map<U>(&self, mut f: impl FnMut(&K) -> Option<U>) -> Option<InformerEvent<U>> {
        Some(match self {
            Self::Added(obj) => InformerEvent::Added(Arc::new(f(obj)?)),
            Self::Updated { old, new } => InformerEvent::Updated {
                old: Arc::new(f(old)?),
                new: Arc::new(f(new)?),
            },
            Self::Deleted(obj) => InformerEvent::Deleted(Arc::new(f(obj)?)),
        })
    }
}

/// Receives change notifications from an informer
///
/// Handlers run on the informer's watch task, in the order the API emitted
/// the changes. They must not block and must not register further handlers
/// on the same informer.
pub trait EventHandler<K>: Send + Sync {
    fn on_event(&self, event: &InformerEvent<K>);
}

impl<K, F> EventHandler<K> for F
where
    F: Fn(&InformerEvent<K>) + Send + Sync,
{
    fn on_event(&self, event: &InformerEvent<K>) {
        self(event)
    }
}

/// Derives informer events from watcher events by comparing them with the
/// cache contents before the event is applied
pub(crate) struct DeltaTracker<K: Resource<DynamicType = ()>> {
    /// Objects seen during the relist in progress
    relisted: HashSet<ObjectRef<K>>,
}

impl<K: Resource<DynamicType = ()>> Default for DeltaTracker<K> {
    fn default() -> Self {
        Self {
            relisted: HashSet::new(),
        }
    }
}

impl<K> DeltaTracker<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub(crate) fn deltas(
        &mut self,
        cache: &Store<K>,
        event: &watcher::Event<K>,
    ) -> Vec<InformerEvent<K>> {
        match event {
            watcher::Event::Apply(obj) => Self::applied(cache, obj, false).into_iter().collect(),
            watcher::Event::Delete(obj) => vec![InformerEvent::Deleted(Arc::new(obj.clone()))],
            watcher::Event::Init => {
                self.relisted.clear();
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                self.relisted.insert(ObjectRef::from_obj(obj));
                Self::applied(cache, obj, true).into_iter().collect()
            }
            watcher::Event::InitDone => {
                let relisted = std::mem::take(&mut self.relisted);
                cache
                    .state()
                    .into_iter()
                    .filter(|obj| !relisted.contains(&ObjectRef::from_obj(obj.as_ref())))
                    .map(InformerEvent::Deleted)
                    .collect()
            }
        }
    }

    /// Added if new to the cache, Updated otherwise. A relisted object whose
    /// resourceVersion is unchanged produces nothing.
    fn applied(cache: &Store<K>, obj: &K, relist: bool) -> Option<InformerEvent<K>> {
        let new = Arc::new(obj.clone());
        match cache.get(&ObjectRef::from_obj(obj)) {
            None => Some(InformerEvent::Added(new)),
            Some(old) if relist && old.resource_version() == obj.resource_version() => None,
            Some(old) => Some(InformerEvent::Updated { old, new }),
        }
    }
}

struct Shared<K> {
    handlers: Mutex<Vec<Box<dyn EventHandler<K>>>>,
    synced: AtomicBool,
}

/// Watch-backed cache of one resource kind
pub struct TypedInformer<K: InformerResource> {
    resource: ResourceDescriptor,
    store: Store<K>,
    shared: Arc<Shared<K>>,
    task: JoinHandle<()>,
}

impl<K: InformerResource> TypedInformer<K> {
    /// Start listing and watching `api` on `runtime` until `cancel` fires
    pub(crate) fn spawn(api: Api<K>, cancel: CancellationToken, runtime: &Handle) -> Self {
        let resource = ResourceDescriptor::of::<K>();
        let (store, writer) = reflector::store();
        let shared = Arc::new(Shared {
            handlers: Mutex::new(Vec::new()),
            synced: AtomicBool::new(false),
        });

        let task = runtime.spawn(watch_loop(
            api,
            writer,
            store.clone(),
            Arc::clone(&shared),
            resource.clone(),
            cancel,
        ));
        info!(resource = %resource, "started informer");

        Self {
            resource,
            store,
            shared,
            task,
        }
    }

    pub fn resource(&self) -> &ResourceDescriptor {
        &self.resource
    }

    /// Typed, cache-only reader
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Every cached object
    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectRef::new(name).within(namespace))
    }

    /// Register a handler. It first receives an Added event for every cached
    /// object, then every later change.
    pub fn add_event_handler<H>(&self, handler: H)
    where
        H: EventHandler<K> + 'static,
    {
        let mut handlers = self.shared.handlers.lock();
        for obj in self.store.state() {
            handler.on_event(&InformerEvent::Added(obj));
        }
        handlers.push(Box::new(handler));
    }

    /// Whether the initial listing has completed
    pub fn has_synced(&self) -> bool {
        self.shared.synced.load(Ordering::SeqCst)
    }

    /// Wait for the initial listing to complete
    pub async fn wait_for_sync(&self) -> Result<()> {
        self.store
            .wait_until_ready()
            .await
            .map_err(|_| Error::InformerStopped(self.resource.clone()))
    }

    /// Whether the watch loop is still alive
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl<K: InformerResource> Drop for TypedInformer<K> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_loop<K: InformerResource>(
    api: Api<K>,
    mut writer: Writer<K>,
    cache: Store<K>,
    shared: Arc<Shared<K>>,
    resource: ResourceDescriptor,
    cancel: CancellationToken,
) {
    let mut tracker = DeltaTracker::default();
    let mut events = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = events.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                // Held across apply and dispatch so a handler registering
                // concurrently sees each change exactly once
                let handlers = shared.handlers.lock();
                let deltas = tracker.deltas(&cache, &event);
                writer.apply_watcher_event(&event);

                if matches!(event, watcher::Event::InitDone)
                    && !shared.synced.swap(true, Ordering::SeqCst)
                {
                    info!(resource = %resource, objects = cache.state().len(), "informer synced");
                }

                for delta in &deltas {
                    debug!(
                        resource = %resource,
                        object = %delta.object().name_any(),
                        "dispatching event"
                    );
                    for handler in handlers.iter() {
                        handler.on_event(delta);
                    }
                }
            }
            Some(Err(err)) => {
                warn!(resource = %resource, error = %err, "watch failed, retrying");
            }
            None => break,
        }
    }

    debug!(resource = %resource, "informer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use promwatch_types::ServiceMonitor;

    fn monitor(name: &str, version: &str) -> ServiceMonitor {
        let mut sm = ServiceMonitor::new(name, Default::default());
        sm.metadata.namespace = Some("ns1".to_string());
        sm.metadata.resource_version = Some(version.to_string());
        sm
    }

    fn describe(event: &InformerEvent<ServiceMonitor>) -> String {
        match event {
            InformerEvent::Added(obj) => format!("added {}", obj.name_any()),
            InformerEvent::Updated { old, new } => format!(
                "updated {} {}->{}",
                new.name_any(),
                old.resource_version().unwrap_or_default(),
                new.resource_version().unwrap_or_default()
            ),
            InformerEvent::Deleted(obj) => format!("deleted {}", obj.name_any()),
        }
    }

    struct Harness {
        tracker: DeltaTracker<ServiceMonitor>,
        store: Store<ServiceMonitor>,
        writer: Writer<ServiceMonitor>,
    }

    impl Harness {
        fn new() -> Self {
            let (store, writer) = reflector::store();
            Self {
                tracker: DeltaTracker::default(),
                store,
                writer,
            }
        }

        fn apply(&mut self, event: watcher::Event<ServiceMonitor>) -> Vec<String> {
            let deltas = self.tracker.deltas(&self.store, &event);
            self.writer.apply_watcher_event(&event);
            let mut described: Vec<String> = deltas.iter().map(describe).collect();
            described.sort();
            described
        }

        fn relist(&mut self, objects: Vec<ServiceMonitor>) -> Vec<String> {
            let mut out = self.apply(watcher::Event::Init);
            for obj in objects {
                out.extend(self.apply(watcher::Event::InitApply(obj)));
            }
            out.extend(self.apply(watcher::Event::InitDone));
            out
        }
    }

    #[test]
    fn test_initial_list_adds_everything() {
        let mut h = Harness::new();
        let events = h.relist(vec![monitor("a", "1"), monitor("b", "1")]);

        assert_eq!(events, vec!["added a", "added b"]);
        assert_eq!(h.store.state().len(), 2);
    }

    #[test]
    fn test_live_changes() {
        let mut h = Harness::new();
        h.relist(vec![monitor("a", "1"), monitor("b", "1")]);

        assert_eq!(h.apply(watcher::Event::Apply(monitor("a", "2"))), vec!["updated a 1->2"]);
        assert_eq!(h.apply(watcher::Event::Delete(monitor("b", "3"))), vec!["deleted b"]);
        assert_eq!(h.apply(watcher::Event::Apply(monitor("c", "4"))), vec!["added c"]);
        assert_eq!(h.store.state().len(), 2);
    }

    #[test]
    fn test_relist_reports_only_differences() {
        let mut h = Harness::new();
        h.relist(vec![monitor("a", "1"), monitor("b", "1"), monitor("c", "1")]);

        let events = h.relist(vec![monitor("a", "1"), monitor("b", "5")]);

        assert_eq!(events, vec!["deleted c", "updated b 1->5"]);
        assert!(h.store.get(&ObjectRef::new("c").within("ns1")).is_none());
    }

    #[test]
    fn test_same_name_in_other_namespace_is_distinct() {
        let mut h = Harness::new();
        h.relist(vec![monitor("a", "1")]);

        let mut other = monitor("a", "1");
        other.metadata.namespace = Some("ns2".to_string());
        assert_eq!(h.apply(watcher::Event::Apply(other)), vec!["added a"]);
    }

    #[test]
    fn test_event_try_map() {
        let event = InformerEvent::Updated {
            old: Arc::new(monitor("a", "1")),
            new: Arc::new(monitor("a", "2")),
        };

        let versions = event
            .try_map(|sm| sm.resource_version())
            .expect("both objects carry a version");
        match versions {
            InformerEvent::Updated { old, new } => {
                assert_eq!(old.as_str(), "1");
                assert_eq!(new.as_str(), "2");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let mut unversioned = monitor("b", "1");
        unversioned.metadata.resource_version = None;
        let event = InformerEvent::Added(Arc::new(unversioned));
        assert!(event.try_map(|sm| sm.resource_version()).is_none());
    }
}
