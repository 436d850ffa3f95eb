//! Kubernetes API client over plain HTTPS.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Certificate, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{
    split_lines, watch_events_from_lines, ClusterApi, ClusterError, DeploymentSummary,
    EventSummary, LineStream, PodSummary, ReplicaSetSummary,
};
use crate::config::ServerConfig;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    uid: String,
    generation: Option<i64>,
    creation_timestamp: Option<String>,
    #[serde(default)]
    owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Deserialize)]
struct OwnerReference {
    uid: String,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: ObjectMeta,
    spec: Option<PodSpec>,
}

#[derive(Debug, Deserialize)]
struct Namespace {
    #[serde(default)]
    metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Event {
    #[serde(rename = "type")]
    kind: Option<String>,
    reason: Option<String>,
    source: Option<EventSource>,
    last_timestamp: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventSource {
    component: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Deployment {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ReplicaSet {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: ReplicaSetStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplicaSetStatus {
    replicas: Option<i64>,
    ready_replicas: Option<i64>,
    available_replicas: Option<i64>,
}

/// Cluster client speaking to the API server directly.
pub struct KubeClient {
    base_url: String,
    http: Client,
    token: Option<String>,
    /// Budget for one-shot reads; follow and watch streams are unbounded
    request_timeout: Duration,
}

impl KubeClient {
    /// Client for an explicit API server, e.g. a local `kubectl proxy`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClusterError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            token: None,
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build the client from configuration, falling back to the pod's
    /// service account when no API server is configured.
    pub fn from_config(cfg: &ServerConfig) -> Result<Self, ClusterError> {
        match &cfg.kube_api {
            Some(api) => Self::new(api.as_str()),
            None => Self::in_cluster(),
        }
    }

    fn in_cluster() -> Result<Self, ClusterError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| ClusterError::Config("KUBERNETES_SERVICE_HOST is not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());

        let token = std::fs::read_to_string(format!("{}/token", SERVICE_ACCOUNT_DIR))
            .map_err(|e| ClusterError::Config(format!("reading service account token: {}", e)))?;
        let ca = std::fs::read(format!("{}/ca.crt", SERVICE_ACCOUNT_DIR))
            .map_err(|e| ClusterError::Config(format!("reading cluster CA: {}", e)))?;
        let ca = Certificate::from_pem(&ca).map_err(|e| ClusterError::Config(e.to_string()))?;

        let http = Client::builder()
            .add_root_certificate(ca)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        // IPv6 service hosts need brackets in the authority.
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host
        };

        Ok(Self {
            base_url: format!("https://{}:{}", host, port),
            http,
            token: Some(token.trim().to_string()),
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let req = self.http.get(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder, what: &str) -> Result<Response, ClusterError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ClusterError::NotFound(what.to_string()));
        }
        let message = resp.text().await.unwrap_or_default();
        Err(ClusterError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        what: &str,
    ) -> Result<T, ClusterError> {
        let resp = self.send(req.timeout(self.request_timeout), what).await?;
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ClusterError::Decode(e.to_string()))
    }
}

fn log_query(container: Option<&str>, tail_lines: u32) -> Vec<(&'static str, String)> {
    let mut query = vec![("tailLines", tail_lines.to_string())];
    if let Some(c) = container.filter(|c| !c.is_empty()) {
        query.push(("container", c.to_string()));
    }
    query
}

/// Short age like `kubectl` shows: `45s`, `12m`, `3h`, `2d`.
fn age_since(timestamp: &str, now: DateTime<Utc>) -> Option<String> {
    let then = DateTime::parse_from_rfc3339(timestamp).ok()?;
    let secs = (now - then.with_timezone(&Utc)).num_seconds().max(0);
    Some(match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86400),
    })
}

fn summarize_pods(pods: Vec<Pod>) -> BTreeMap<String, PodSummary> {
    pods.into_iter()
        .map(|pod| {
            let containers = pod
                .spec
                .map(|s| s.containers.into_iter().map(|c| c.name).collect())
                .unwrap_or_default();
            (
                pod.metadata.name,
                PodSummary {
                    namespace: pod.metadata.namespace,
                    containers,
                },
            )
        })
        .collect()
}

fn summarize_event(event: Event, now: DateTime<Utc>) -> EventSummary {
    EventSummary {
        kind: event.kind,
        reason: event.reason,
        from: event.source.and_then(|s| s.component),
        age: event
            .last_timestamp
            .as_deref()
            .and_then(|ts| age_since(ts, now)),
        message: event.message,
    }
}

fn summarize_deployment(deployment: Deployment) -> DeploymentSummary {
    DeploymentSummary {
        name: deployment.metadata.name,
        namespace: deployment.metadata.namespace,
        revision: deployment.metadata.generation,
        date: deployment.metadata.creation_timestamp,
        status: deployment.status,
    }
}

fn summarize_replica_set(rs: ReplicaSet) -> ReplicaSetSummary {
    ReplicaSetSummary {
        name: rs.metadata.name,
        owner_uids: rs
            .metadata
            .owner_references
            .into_iter()
            .map(|r| r.uid)
            .collect(),
        replicas: rs.status.replicas,
        ready_replicas: rs.status.ready_replicas,
        available_replicas: rs.status.available_replicas,
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        let list: List<Namespace> = self
            .get_json(self.get("/api/v1/namespaces"), "namespaces")
            .await?;
        Ok(list.items.into_iter().map(|ns| ns.metadata.name).collect())
    }

    async fn list_pods(
        &self,
        namespace: Option<&str>,
    ) -> Result<BTreeMap<String, PodSummary>, ClusterError> {
        let path = match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) => format!("/api/v1/namespaces/{}/pods", ns),
            None => "/api/v1/pods".to_string(),
        };
        let list: List<Pod> = self.get_json(self.get(&path), "pods").await?;
        Ok(summarize_pods(list.items))
    }

    async fn pods_with_label(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, ClusterError> {
        let req = self
            .get(&format!("/api/v1/namespaces/{}/pods", namespace))
            .query(&[("labelSelector", selector)]);
        let list: List<Pod> = self
            .get_json(req, &format!("namespace {}", namespace))
            .await?;
        Ok(list.items.into_iter().map(|p| p.metadata.name).collect())
    }

    async fn pod_log(
        &self,
        pod: &str,
        namespace: &str,
        container: Option<&str>,
        tail_lines: u32,
    ) -> Result<String, ClusterError> {
        let req = self
            .get(&format!("/api/v1/namespaces/{}/pods/{}/log", namespace, pod))
            .query(&log_query(container, tail_lines))
            .timeout(self.request_timeout);
        let resp = self.send(req, &format!("pod {}", pod)).await?;
        Ok(resp.text().await?)
    }

    async fn describe_pod(
        &self,
        pod: &str,
        namespace: &str,
    ) -> Result<serde_json::Value, ClusterError> {
        let req = self.get(&format!("/api/v1/namespaces/{}/pods/{}", namespace, pod));
        self.get_json(req, &format!("pod {}", pod)).await
    }

    async fn pod_events(
        &self,
        pod: &str,
        namespace: &str,
    ) -> Result<Vec<EventSummary>, ClusterError> {
        let req = self
            .get(&format!("/api/v1/namespaces/{}/events", namespace))
            .query(&[("fieldSelector", format!("involvedObject.name={}", pod))]);
        let list: List<Event> = self
            .get_json(req, &format!("namespace {}", namespace))
            .await?;
        let now = Utc::now();
        Ok(list
            .items
            .into_iter()
            .map(|e| summarize_event(e, now))
            .collect())
    }

    async fn list_deployments(
        &self,
        namespace: &str,
    ) -> Result<Vec<DeploymentSummary>, ClusterError> {
        let req = self.get(&format!("/apis/apps/v1/namespaces/{}/deployments", namespace));
        let list: List<Deployment> = self
            .get_json(req, &format!("namespace {}", namespace))
            .await?;
        Ok(list.items.into_iter().map(summarize_deployment).collect())
    }

    async fn read_deployment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<serde_json::Value, ClusterError> {
        let req = self.get(&format!(
            "/apis/apps/v1/namespaces/{}/deployments/{}",
            namespace, name
        ));
        self.get_json(req, &format!("deployment {}", name)).await
    }

    async fn list_replica_sets(
        &self,
        namespace: &str,
    ) -> Result<Vec<ReplicaSetSummary>, ClusterError> {
        let req = self.get(&format!("/apis/apps/v1/namespaces/{}/replicasets", namespace));
        let list: List<ReplicaSet> = self
            .get_json(req, &format!("namespace {}", namespace))
            .await?;
        Ok(list.items.into_iter().map(summarize_replica_set).collect())
    }

    async fn follow_pod_log(
        &self,
        pod: &str,
        namespace: &str,
        container: Option<&str>,
        tail_lines: u32,
    ) -> Result<LineStream, ClusterError> {
        let mut query = log_query(container, tail_lines);
        query.push(("follow", "true".to_string()));
        let req = self
            .get(&format!("/api/v1/namespaces/{}/pods/{}/log", namespace, pod))
            .query(&query);
        let resp = self.send(req, &format!("pod {}", pod)).await?;
        tracing::debug!(pod = %pod, namespace = %namespace, "Following pod log");
        Ok(split_lines(resp.bytes_stream()))
    }

    async fn watch_events(
        &self,
        namespace: &str,
        field_selector: Option<&str>,
    ) -> Result<LineStream, ClusterError> {
        let mut query = vec![("watch", "true")];
        if let Some(selector) = field_selector {
            query.push(("fieldSelector", selector));
        }
        let req = self
            .get(&format!("/api/v1/namespaces/{}/events", namespace))
            .query(&query);
        let resp = self.send(req, &format!("namespace {}", namespace)).await?;
        tracing::debug!(namespace = %namespace, "Watching events");
        Ok(watch_events_from_lines(split_lines(resp.bytes_stream())))
    }
}
