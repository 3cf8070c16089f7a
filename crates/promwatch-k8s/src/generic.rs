//! Type-erased access to typed informers
//!
//! An [`InformerHandle`] hides which resource type backs an informer. Objects
//! come out as [`DynamicObject`], so callers that only know a
//! [`ResourceDescriptor`] at runtime can still read the cache and subscribe to
//! changes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use kube::api::DynamicObject;
use serde::Serialize;
use tracing::warn;

use promwatch_types::ResourceDescriptor;

use crate::error::Result;
use crate::informer::{EventHandler, InformerEvent, InformerResource, TypedInformer};

/// Object-safe view of a [`TypedInformer`]
trait ErasedInformer: Send + Sync {
    fn resource(&self) -> &ResourceDescriptor;
    fn list(&self) -> Vec<DynamicObject>;
    fn get(&self, namespace: &str, name: &str) -> Option<DynamicObject>;
    fn add_handler(&self, handler: Box<dyn EventHandler<DynamicObject>>);
    fn has_synced(&self) -> bool;
    fn wait_for_sync(&self) -> BoxFuture<'_, Result<()>>;
}

/// Re-encode a typed object as a dynamic one. Objects that fail to convert
/// are logged and skipped.
fn to_dynamic<K: Serialize>(obj: &K, resource: &ResourceDescriptor) -> Option<DynamicObject> {
    match serde_json::to_value(obj).and_then(serde_json::from_value) {
        Ok(dynamic) => Some(dynamic),
        Err(err) => {
            warn!(resource = %resource, error = %err, "failed to convert cached object");
            None
        }
    }
}

impl<K: InformerResource> ErasedInformer for TypedInformer<K> {
    fn resource(&self) -> &ResourceDescriptor {
        TypedInformer::resource(self)
    }

    fn list(&self) -> Vec<DynamicObject> {
        let resource = TypedInformer::resource(self);
        TypedInformer::list(self)
            .iter()
            .filter_map(|obj| to_dynamic(obj.as_ref(), resource))
            .collect()
    }

    fn get(&self, namespace: &str, name: &str) -> Option<DynamicObject> {
        TypedInformer::get(self, namespace, name)
            .and_then(|obj| to_dynamic(obj.as_ref(), TypedInformer::resource(self)))
    }

    fn add_handler(&self, handler: Box<dyn EventHandler<DynamicObject>>) {
        let resource = TypedInformer::resource(self).clone();
        self.add_event_handler(move |event: &InformerEvent<K>| {
            if let Some(event) = event.try_map(|obj| to_dynamic(obj, &resource)) {
                handler.on_event(&event);
            }
        });
    }

    fn has_synced(&self) -> bool {
        TypedInformer::has_synced(self)
    }

    fn wait_for_sync(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(TypedInformer::wait_for_sync(self))
    }
}

/// Shared informer for one resource kind, independent of its concrete type
#[derive(Clone)]
pub struct InformerHandle {
    informer: Arc<dyn ErasedInformer>,
}

impl InformerHandle {
    pub(crate) fn new<K: InformerResource>(informer: Arc<TypedInformer<K>>) -> Self {
        Self { informer }
    }

    pub fn resource(&self) -> &ResourceDescriptor {
        self.informer.resource()
    }

    /// Cache-only reader; never touches the network
    pub fn lister(&self) -> GenericLister {
        GenericLister {
            informer: Arc::clone(&self.informer),
        }
    }

    /// Subscribe to changes. Existing objects are replayed as Added first.
    pub fn add_event_handler<H>(&self, handler: H)
    where
        H: EventHandler<DynamicObject> + 'static,
    {
        self.informer.add_handler(Box::new(handler));
    }

    pub fn has_synced(&self) -> bool {
        self.informer.has_synced()
    }

    pub async fn wait_for_sync(&self) -> Result<()> {
        self.informer.wait_for_sync().await
    }

    /// Whether both handles are backed by the same informer and cache
    pub fn same_informer(&self, other: &InformerHandle) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.informer), Arc::as_ptr(&other.informer))
    }
}

impl fmt::Debug for InformerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InformerHandle")
            .field("resource", self.resource())
            .field("synced", &self.has_synced())
            .finish()
    }
}

/// Point-in-time reads from an informer cache
#[derive(Clone)]
pub struct GenericLister {
    informer: Arc<dyn ErasedInformer>,
}

impl GenericLister {
    /// Every cached object
    pub fn list(&self) -> Vec<DynamicObject> {
        self.informer.list()
    }

    /// Cached objects in one namespace
    pub fn list_namespaced(&self, namespace: &str) -> Vec<DynamicObject> {
        self.list()
            .into_iter()
            .filter(|obj| obj.metadata.namespace.as_deref() == Some(namespace))
            .collect()
    }

    /// Cached objects carrying every label in `selector`
    pub fn list_labelled(&self, selector: &BTreeMap<String, String>) -> Vec<DynamicObject> {
        self.list()
            .into_iter()
            .filter(|obj| {
                let labels = obj.metadata.labels.as_ref();
                selector
                    .iter()
                    .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
            })
            .collect()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.informer.get(namespace, name)
    }
}
