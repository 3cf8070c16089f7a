//! Shared types for promwatch
//!
//! This crate contains the prometheus-operator custom resources served by
//! promwatch and the descriptor type used to look resource kinds up.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, Resource};
use serde::{Deserialize, Serialize};

/// API group of every resource kind promwatch knows about
pub const MONITORING_GROUP: &str = "monitoring.coreos.com";

/// API version of every resource kind promwatch knows about
pub const MONITORING_VERSION: &str = "v1";

// ============================================================================
// Resource Descriptors
// ============================================================================

/// Identifies a resource kind by (group, version, plural resource name)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl ResourceDescriptor {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// Descriptor of a statically typed resource
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self::new(K::group(&()), K::version(&()), K::plural(&()))
    }

    /// The `apiVersion` string objects of this kind carry
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Formats as `resource.version.group`, the form kubectl accepts
impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}.{}", self.resource, self.version)
        } else {
            write!(f, "{}.{}.{}", self.resource, self.version, self.group)
        }
    }
}

/// Error returned when a descriptor string is not `resource.version[.group]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseDescriptorError(String);

impl fmt::Display for ParseDescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid resource descriptor '{}', expected resource.version.group",
            self.0
        )
    }
}

impl std::error::Error for ParseDescriptorError {}

impl FromStr for ResourceDescriptor {
    type Err = ParseDescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let resource = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default();
        // "pods.v1." names an empty group, not the core group
        let group = parts.next();

        if resource.is_empty() || version.is_empty() || group == Some("") {
            return Err(ParseDescriptorError(s.to_string()));
        }

        Ok(Self::new(group.unwrap_or_default(), version, resource))
    }
}

/// The closed set of resource kinds promwatch can build informers for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MonitoringKind {
    Alertmanagers,
    Prometheuses,
    PrometheusRules,
    ServiceMonitors,
}

impl MonitoringKind {
    pub const ALL: [MonitoringKind; 4] = [
        MonitoringKind::Alertmanagers,
        MonitoringKind::Prometheuses,
        MonitoringKind::PrometheusRules,
        MonitoringKind::ServiceMonitors,
    ];

    /// Plural resource name as served by the API
    pub fn plural(self) -> &'static str {
        match self {
            Self::Alertmanagers => "alertmanagers",
            Self::Prometheuses => "prometheuses",
            Self::PrometheusRules => "prometheusrules",
            Self::ServiceMonitors => "servicemonitors",
        }
    }

    pub fn descriptor(self) -> ResourceDescriptor {
        ResourceDescriptor::new(MONITORING_GROUP, MONITORING_VERSION, self.plural())
    }

    /// Exact match on group, version and resource. No partial matching.
    pub fn from_descriptor(descriptor: &ResourceDescriptor) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.descriptor() == *descriptor)
    }
}

impl fmt::Display for MonitoringKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plural())
    }
}

// ============================================================================
// ServiceMonitor
// ============================================================================

/// Which services to scrape and how
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "ServiceMonitor",
    plural = "servicemonitors",
    namespaced,
    derive = "PartialEq",
    derive = "Default",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMonitorSpec {
    /// Service label whose value becomes the `job` label of scraped series
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_label: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_labels: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_target_labels: Vec<String>,

    #[serde(default)]
    pub endpoints: Vec<Endpoint>,

    /// Selects the services to scrape
    #[serde(default)]
    pub selector: LabelSelector,

    #[serde(default)]
    pub namespace_selector: NamespaceSelector,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_limit: Option<u64>,
}

/// A single scrapeable endpoint of a service
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Name of the service port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,

    /// Scrape interval, e.g. "30s"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrape_timeout: Option<String>,

    #[serde(default)]
    pub honor_labels: bool,
}

/// Namespaces a monitor selects services from
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub any: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_names: Vec<String>,
}

impl NamespaceSelector {
    /// Whether services in `namespace` are selected
    pub fn matches(&self, namespace: &str) -> bool {
        self.any || self.match_names.iter().any(|n| n == namespace)
    }
}

// ============================================================================
// Prometheus / Alertmanager
// ============================================================================

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "Prometheus",
    plural = "prometheuses",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_monitor_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_monitor_namespace_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<String>,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "Alertmanager",
    plural = "alertmanagers",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<String>,
}

// ============================================================================
// PrometheusRule
// ============================================================================

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "PrometheusRule",
    plural = "prometheusrules",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusRuleSpec {
    #[serde(default)]
    pub groups: Vec<RuleGroup>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleGroup {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Either a recording rule (`record`) or an alerting rule (`alert`)
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,

    pub expr: IntOrString,

    #[serde(default, rename = "for", skip_serializing_if = "Option::is_none")]
    pub for_: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}
