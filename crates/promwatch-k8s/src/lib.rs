//! Kubernetes client for promwatch
//!
//! This crate provides direct ServiceMonitor operations and shared,
//! cache-backed informers for the prometheus-operator resource kinds.

mod client;
mod error;
mod factory;
mod generic;
mod informer;

pub use client::{
    APP_LABEL, DEFAULT_PORT_SUFFIX, DEFAULT_TIMEOUT, ENDPOINT_INTERVAL, MonitoringClient,
    service_monitor_for,
};
pub use error::{Error, Operation, Result};
pub use factory::SharedInformerFactory;
pub use generic::{GenericLister, InformerHandle};
pub use informer::{EventHandler, InformerEvent, InformerResource, TypedInformer};

// Re-export types that are used in our public API
pub use promwatch_types::{
    Alertmanager, MonitoringKind, Prometheus, PrometheusRule, ResourceDescriptor, ServiceMonitor,
};
