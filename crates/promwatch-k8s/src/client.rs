//! ServiceMonitor client for promwatch

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{DeleteParams, PostParams};
use kube::{Api, ResourceExt};
use tracing::{debug, info};

use promwatch_types::{Endpoint, NamespaceSelector, ServiceMonitor, ServiceMonitorSpec};

use crate::error::{Operation, Result, Target};

/// Applied to every client call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Appended to the target name to form the endpoint port name
pub const DEFAULT_PORT_SUFFIX: &str = "-18888k";

/// Scrape interval of synthesized endpoints
pub const ENDPOINT_INTERVAL: &str = "30s";

/// Label key that ties a monitor to its application
pub const APP_LABEL: &str = "kubeapp";

const KIND: &str = "ServiceMonitor";

/// Build the ServiceMonitor `create` submits for (namespace, name)
///
/// One endpoint on port `{name}{port_suffix}` every 30s with source labels
/// honored, selecting services labelled `kubeapp={name}` in `namespace` only.
pub fn service_monitor_for(namespace: &str, name: &str, port_suffix: &str) -> ServiceMonitor {
    let labels = BTreeMap::from([
        ("prometheus".to_string(), "k8s".to_string()),
        (APP_LABEL.to_string(), name.to_string()),
    ]);

    let spec = ServiceMonitorSpec {
        job_label: Some(APP_LABEL.to_string()),
        selector: LabelSelector {
            match_labels: Some(BTreeMap::from([(
                APP_LABEL.to_string(),
                name.to_string(),
            )])),
            ..Default::default()
        },
        namespace_selector: NamespaceSelector {
            any: false,
            match_names: vec![namespace.to_string()],
        },
        endpoints: vec![Endpoint {
            port: Some(format!("{}{}", name, port_suffix)),
            interval: Some(ENDPOINT_INTERVAL.to_string()),
            honor_labels: true,
            ..Default::default()
        }],
        ..Default::default()
    };

    ServiceMonitor {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec,
    }
}

/// Direct, uncached operations on ServiceMonitors
#[derive(Clone)]
pub struct MonitoringClient {
    client: kube::Client,
    timeout: Duration,
    port_suffix: String,
}

impl MonitoringClient {
    /// Create a client on top of an already authenticated kube client
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_TIMEOUT,
            port_suffix: DEFAULT_PORT_SUFFIX.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the suffix used to derive endpoint port names on create
    pub fn with_port_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.port_suffix = suffix.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn port_suffix(&self) -> &str {
        &self.port_suffix
    }

    fn api(&self, namespace: &str) -> Api<ServiceMonitor> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Run one request under the client timeout, wrapping failures with the
    /// operation and object identity
    async fn call<T, F>(&self, target: Target<'_>, request: F) -> Result<T>
    where
        F: Future<Output = kube::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(|e| target.wrap(e)),
            Err(_) => Err(target.timeout(self.timeout)),
        }
    }

    /// Fetch a ServiceMonitor
    pub async fn get(&self, namespace: &str, name: &str) -> Result<ServiceMonitor> {
        let target = Target {
            operation: Operation::Get,
            kind: KIND,
            namespace,
            name,
        };
        debug!(namespace, name, "getting servicemonitor");
        self.call(target, self.api(namespace).get(name)).await
    }

    /// Create the ServiceMonitor synthesized by [`service_monitor_for`]
    ///
    /// Fails with `AlreadyExists` rather than updating an existing object.
    pub async fn create(&self, namespace: &str, name: &str) -> Result<ServiceMonitor> {
        let target = Target {
            operation: Operation::Create,
            kind: KIND,
            namespace,
            name,
        };
        let monitor = service_monitor_for(namespace, name, &self.port_suffix);
        let created = self
            .call(
                target,
                self.api(namespace).create(&PostParams::default(), &monitor),
            )
            .await?;
        info!(namespace, name, "created servicemonitor");
        Ok(created)
    }

    /// Replace an existing ServiceMonitor with `monitor` as a whole
    pub async fn replace(&self, monitor: &ServiceMonitor) -> Result<ServiceMonitor> {
        let namespace = monitor.namespace().unwrap_or_default();
        let name = monitor.name_any();
        let target = Target {
            operation: Operation::Replace,
            kind: KIND,
            namespace: &namespace,
            name: &name,
        };
        let replaced = self
            .call(
                target,
                self.api(&namespace)
                    .replace(&name, &PostParams::default(), monitor),
            )
            .await?;
        info!(namespace = %namespace, name = %name, "replaced servicemonitor");
        Ok(replaced)
    }

    /// Delete a ServiceMonitor. Not retried; a second delete is NotFound.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let target = Target {
            operation: Operation::Delete,
            kind: KIND,
            namespace,
            name,
        };
        self.call(
            target,
            self.api(namespace).delete(name, &DeleteParams::default()),
        )
        .await?;
        info!(namespace, name, "deleted servicemonitor");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use wiremock::matchers::path_regex;
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// In-memory stand-in for the servicemonitors endpoint of an API server
    #[derive(Clone, Default)]
    struct FakeApiServer {
        objects: Arc<Mutex<HashMap<(String, String), Value>>>,
    }

    fn status(code: u16, reason: &str) -> ResponseTemplate {
        ResponseTemplate::new(code).set_body_json(json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": format!("servicemonitors {}", reason),
            "reason": reason,
            "code": code,
        }))
    }

    impl Respond for FakeApiServer {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            // /apis/monitoring.coreos.com/v1/namespaces/{ns}/servicemonitors[/{name}]
            let segments: Vec<&str> = request.url.path().split('/').collect();
            let namespace = segments[5].to_string();
            let name = segments.get(7).map(|s| s.to_string());
            let mut objects = self.objects.lock();

            match (request.method.as_str(), name) {
                ("GET", Some(name)) => match objects.get(&(namespace, name)) {
                    Some(obj) => ResponseTemplate::new(200).set_body_json(obj.clone()),
                    None => status(404, "NotFound"),
                },
                ("POST", None) => {
                    let mut obj: Value = serde_json::from_slice(&request.body).unwrap();
                    let name = obj["metadata"]["name"].as_str().unwrap().to_string();
                    let key = (namespace, name);
                    if objects.contains_key(&key) {
                        return status(409, "AlreadyExists");
                    }
                    obj["metadata"]["resourceVersion"] = json!("1");
                    objects.insert(key, obj.clone());
                    ResponseTemplate::new(201).set_body_json(obj)
                }
                ("PUT", Some(name)) => {
                    let key = (namespace, name);
                    if !objects.contains_key(&key) {
                        return status(404, "NotFound");
                    }
                    let obj: Value = serde_json::from_slice(&request.body).unwrap();
                    objects.insert(key, obj.clone());
                    ResponseTemplate::new(200).set_body_json(obj)
                }
                ("DELETE", Some(name)) => match objects.remove(&(namespace, name)) {
                    Some(obj) => ResponseTemplate::new(200).set_body_json(obj),
                    None => status(404, "NotFound"),
                },
                _ => status(405, "MethodNotAllowed"),
            }
        }
    }

    async fn fake_cluster() -> (MockServer, MonitoringClient) {
        let server = MockServer::start().await;
        Mock::given(path_regex(
            r"^/apis/monitoring\.coreos\.com/v1/namespaces/[^/]+/servicemonitors(/[^/]+)?$",
        ))
        .respond_with(FakeApiServer::default())
        .mount(&server)
        .await;

        let config = kube::Config::new(server.uri().parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        (server, MonitoringClient::new(client))
    }

    #[test]
    fn test_synthesis_policy() {
        let sm = service_monitor_for("ns1", "app1", DEFAULT_PORT_SUFFIX);

        assert_eq!(sm.spec.endpoints.len(), 1);
        let endpoint = &sm.spec.endpoints[0];
        assert_eq!(endpoint.interval.as_deref(), Some("30s"));
        assert!(endpoint.honor_labels);
        assert!(endpoint.port.as_deref().unwrap().contains("app1"));
        assert_eq!(endpoint.port.as_deref(), Some("app1-18888k"));

        let labels = sm.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["prometheus"], "k8s");
        assert_eq!(labels["kubeapp"], "app1");

        assert_eq!(sm.spec.namespace_selector.match_names, vec!["ns1"]);
        assert_eq!(sm.spec.job_label.as_deref(), Some("kubeapp"));
        assert_eq!(
            sm.spec.selector.match_labels,
            Some(BTreeMap::from([("kubeapp".to_string(), "app1".to_string())]))
        );
    }

    #[test]
    fn test_synthesized_wire_shape() {
        let value = serde_json::to_value(service_monitor_for("ns1", "app1", "-metrics")).unwrap();

        assert_eq!(value["kind"], "ServiceMonitor");
        assert_eq!(value["apiVersion"], "monitoring.coreos.com/v1");
        assert_eq!(value["metadata"]["namespace"], "ns1");
        assert_eq!(value["spec"]["jobLabel"], "kubeapp");
        assert_eq!(value["spec"]["selector"]["matchLabels"]["kubeapp"], "app1");
        assert_eq!(value["spec"]["namespaceSelector"]["matchNames"], json!(["ns1"]));
        assert_eq!(
            value["spec"]["endpoints"],
            json!([{ "port": "app1-metrics", "interval": "30s", "honorLabels": true }])
        );
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let (_server, client) = fake_cluster().await;

        let created = client.create("ns1", "app1").await.unwrap();
        let fetched = client.get("ns1", "app1").await.unwrap();

        assert_eq!(fetched.spec, service_monitor_for("ns1", "app1", DEFAULT_PORT_SUFFIX).spec);
        assert_eq!(fetched.metadata.labels, created.metadata.labels);
        assert_eq!(fetched.spec.endpoints[0].port.as_deref(), Some("app1-18888k"));
    }

    #[tokio::test]
    async fn test_create_existing_fails_and_keeps_object() {
        let (_server, client) = fake_cluster().await;
        client.create("ns1", "app1").await.unwrap();

        let other = client.clone().with_port_suffix("-other");
        let err = other.create("ns1", "app1").await.unwrap_err();
        assert!(err.is_already_exists());

        let fetched = client.get("ns1", "app1").await.unwrap();
        assert_eq!(fetched.spec.endpoints[0].port.as_deref(), Some("app1-18888k"));
    }

    #[tokio::test]
    async fn test_same_name_in_other_namespace() {
        let (_server, client) = fake_cluster().await;
        client.create("ns1", "app1").await.unwrap();
        let second = client.create("ns2", "app1").await.unwrap();

        assert_eq!(second.spec.namespace_selector.match_names, vec!["ns2"]);
    }

    #[tokio::test]
    async fn test_delete_then_get_is_not_found() {
        let (_server, client) = fake_cluster().await;
        client.create("ns1", "app1").await.unwrap();

        client.delete("ns1", "app1").await.unwrap();
        assert!(client.get("ns1", "app1").await.unwrap_err().is_not_found());
        assert!(client.delete("ns1", "app1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_replace_swaps_whole_object() {
        let (_server, client) = fake_cluster().await;
        let mut monitor = client.create("ns1", "app1").await.unwrap();

        monitor.spec.endpoints.clear();
        client.replace(&monitor).await.unwrap();

        let fetched = client.get("ns1", "app1").await.unwrap();
        assert!(fetched.spec.endpoints.is_empty());

        let missing = service_monitor_for("ns1", "ghost", DEFAULT_PORT_SUFFIX);
        assert!(client.replace(&missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_server_error_is_transport() {
        let server = MockServer::start().await;
        Mock::given(path_regex(".*"))
            .respond_with(status(500, "InternalError"))
            .mount(&server)
            .await;
        let config = kube::Config::new(server.uri().parse().unwrap());
        let client = MonitoringClient::new(kube::Client::try_from(config).unwrap());

        let err = client.get("ns1", "app1").await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Transport {
                operation: Operation::Get,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(path_regex(".*"))
            .respond_with(status(404, "NotFound").set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;
        let config = kube::Config::new(server.uri().parse().unwrap());
        let client = MonitoringClient::new(kube::Client::try_from(config).unwrap())
            .with_timeout(Duration::from_millis(100));

        let err = client.get("ns1", "app1").await.unwrap_err();
        assert!(matches!(err, crate::Error::Timeout { .. }));
    }
}
