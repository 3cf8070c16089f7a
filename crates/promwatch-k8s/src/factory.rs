//! Lazily started, per-kind shared informers
//!
//! [`SharedInformerFactory`] owns at most one [`TypedInformer`] per
//! registered kind. The first request for a kind starts its watch; every
//! later request gets the same informer back.

use std::sync::Arc;

use kube::Api;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use promwatch_types::{
    Alertmanager, MonitoringKind, Prometheus, PrometheusRule, ResourceDescriptor, ServiceMonitor,
};

use crate::error::{Error, Result};
use crate::generic::InformerHandle;
use crate::informer::{InformerResource, TypedInformer};

/// Construct-once slot holding the informer for one kind
type Slot<K> = Mutex<Option<Arc<TypedInformer<K>>>>;

/// Registry of shared informers for the prometheus-operator kinds
pub struct SharedInformerFactory {
    client: kube::Client,
    namespace: Option<String>,
    cancel: CancellationToken,
    runtime: Handle,

    alertmanagers: Slot<Alertmanager>,
    prometheuses: Slot<Prometheus>,
    prometheus_rules: Slot<PrometheusRule>,
    service_monitors: Slot<ServiceMonitor>,
}

impl SharedInformerFactory {
    /// Create a factory watching all namespaces
    ///
    /// Must be called from within a Tokio runtime; informer watch loops are
    /// spawned onto it.
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            namespace: None,
            cancel: CancellationToken::new(),
            runtime: Handle::current(),
            alertmanagers: Mutex::new(None),
            prometheuses: Mutex::new(None),
            prometheus_rules: Mutex::new(None),
            service_monitors: Mutex::new(None),
        }
    }

    /// Restrict every informer to a single namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Stop watch loops when `shutdown` is cancelled, in addition to
    /// [`SharedInformerFactory::shutdown`] and drop
    pub fn with_shutdown(mut self, shutdown: &CancellationToken) -> Self {
        let cancel = shutdown.child_token();
        let previous = std::mem::replace(&mut self.cancel, cancel.clone());

        // Informers started before this call watch children of `previous`
        self.runtime.spawn(async move {
            cancel.cancelled().await;
            previous.cancel();
        });
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Resolve a descriptor to the shared informer of its kind
    ///
    /// Only exact matches of the four registered descriptors resolve;
    /// anything else is `UnknownResource`. Never blocks on the network.
    pub fn for_resource(&self, descriptor: &ResourceDescriptor) -> Result<InformerHandle> {
        let kind = MonitoringKind::from_descriptor(descriptor)
            .ok_or_else(|| Error::UnknownResource(descriptor.clone()))?;
        Ok(self.for_kind(kind))
    }

    pub fn for_kind(&self, kind: MonitoringKind) -> InformerHandle {
        match kind {
            MonitoringKind::Alertmanagers => InformerHandle::new(self.alertmanagers()),
            MonitoringKind::Prometheuses => InformerHandle::new(self.prometheuses()),
            MonitoringKind::PrometheusRules => InformerHandle::new(self.prometheus_rules()),
            MonitoringKind::ServiceMonitors => InformerHandle::new(self.service_monitors()),
        }
    }

    pub fn alertmanagers(&self) -> Arc<TypedInformer<Alertmanager>> {
        self.informer(&self.alertmanagers)
    }

    pub fn prometheuses(&self) -> Arc<TypedInformer<Prometheus>> {
        self.informer(&self.prometheuses)
    }

    pub fn prometheus_rules(&self) -> Arc<TypedInformer<PrometheusRule>> {
        self.informer(&self.prometheus_rules)
    }

    pub fn service_monitors(&self) -> Arc<TypedInformer<ServiceMonitor>> {
        self.informer(&self.service_monitors)
    }

    /// Kinds whose informers have been started
    pub fn started(&self) -> Vec<ResourceDescriptor> {
        let started = [
            self.alertmanagers.lock().is_some(),
            self.prometheuses.lock().is_some(),
            self.prometheus_rules.lock().is_some(),
            self.service_monitors.lock().is_some(),
        ];

        MonitoringKind::ALL
            .into_iter()
            .zip(started)
            .filter(|(_, started)| *started)
            .map(|(kind, _)| kind.descriptor())
            .collect()
    }

    /// Stop every watch loop started by this factory
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// The slot lock is held through construction, so concurrent first
    /// requests start a single watch
    fn informer<K: InformerResource>(&self, slot: &Slot<K>) -> Arc<TypedInformer<K>> {
        let mut slot = slot.lock();
        let informer = slot.get_or_insert_with(|| {
            Arc::new(TypedInformer::spawn(
                self.api(),
                self.cancel.child_token(),
                &self.runtime,
            ))
        });
        Arc::clone(informer)
    }

    fn api<K: InformerResource>(&self) -> Api<K> {
        match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }
}

impl Drop for SharedInformerFactory {
    fn drop(&mut self) {
        debug!("shutting down informers");
        self.cancel.cancel();
    }
}
