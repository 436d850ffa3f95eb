//! Kubernetes cluster access.
//!
//! The rest of the service talks to the cluster only through [`ClusterApi`].

mod kube;
mod lines;

pub use kube::*;
pub use lines::*;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Cluster error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ClusterError {
    fn from(e: reqwest::Error) -> Self {
        ClusterError::Transport(e.to_string())
    }
}

/// Lines (or normalized events) read from a long-lived cluster stream.
pub type LineStream = BoxStream<'static, Result<String, ClusterError>>;

/// A pod and the containers it runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PodSummary {
    pub namespace: String,
    pub containers: Vec<String>,
}

/// An event attached to a pod, as shown on the describe page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventSummary {
    #[serde(rename = "Type")]
    pub kind: Option<String>,
    #[serde(rename = "Reason")]
    pub reason: Option<String>,
    #[serde(rename = "From")]
    pub from: Option<String>,
    #[serde(rename = "Age")]
    pub age: Option<String>,
    #[serde(rename = "Message")]
    pub message: Option<String>,
}

/// The fixed shape every watched event is normalized to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Message")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentSummary {
    pub name: String,
    pub namespace: String,
    pub revision: Option<i64>,
    pub date: Option<String>,
    pub status: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaSetSummary {
    pub name: String,
    /// Uids of the objects owning this replica set
    pub owner_uids: Vec<String>,
    pub replicas: Option<i64>,
    pub ready_replicas: Option<i64>,
    pub available_replicas: Option<i64>,
}

impl ReplicaSetSummary {
    /// Has replicas, and every ready replica is also available.
    fn is_serving(&self) -> bool {
        self.replicas.unwrap_or(0) != 0 && self.ready_replicas == self.available_replicas
    }
}

/// A deployment with the pods of its serving replica sets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentDetails {
    pub deployment: serde_json::Value,
    pub replica_sets: Vec<String>,
    pub pods: BTreeMap<String, PodSummary>,
}

/// Read access to the cluster plus the two streaming sources.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError>;

    /// Pods in `namespace`, or in every namespace when `None`.
    async fn list_pods(
        &self,
        namespace: Option<&str>,
    ) -> Result<BTreeMap<String, PodSummary>, ClusterError>;

    /// Names of pods in `namespace` matching a label selector.
    async fn pods_with_label(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, ClusterError>;

    async fn pod_log(
        &self,
        pod: &str,
        namespace: &str,
        container: Option<&str>,
        tail_lines: u32,
    ) -> Result<String, ClusterError>;

    async fn describe_pod(&self, pod: &str, namespace: &str)
        -> Result<serde_json::Value, ClusterError>;

    async fn pod_events(&self, pod: &str, namespace: &str)
        -> Result<Vec<EventSummary>, ClusterError>;

    async fn list_deployments(&self, namespace: &str)
        -> Result<Vec<DeploymentSummary>, ClusterError>;

    /// The deployment object as returned by the API server.
    async fn read_deployment(&self, name: &str, namespace: &str)
        -> Result<serde_json::Value, ClusterError>;

    async fn list_replica_sets(&self, namespace: &str)
        -> Result<Vec<ReplicaSetSummary>, ClusterError>;

    /// Follow a pod's log, starting `tail_lines` back.
    async fn follow_pod_log(
        &self,
        pod: &str,
        namespace: &str,
        container: Option<&str>,
        tail_lines: u32,
    ) -> Result<LineStream, ClusterError>;

    /// Watch events in `namespace`, each normalized to an [`EventMessage`]
    /// JSON document.
    async fn watch_events(
        &self,
        namespace: &str,
        field_selector: Option<&str>,
    ) -> Result<LineStream, ClusterError>;
}

/// Map the event-stream filter to a field selector.
///
/// `pod` limits the stream to pod events; anything else streams all events.
pub fn event_field_selector(filter: &str) -> Option<&'static str> {
    match filter {
        "pod" => Some("involvedObject.kind=Pod"),
        "all" => None,
        other => {
            tracing::info!(filter = %other, "event-stream filter is defaulting to all events");
            None
        }
    }
}

/// Concatenated logs of every pod released as `name`, each preceded by
/// the pod name on its own line.
///
/// A failing lookup or log read is logged and ends the collection with
/// whatever was gathered so far.
pub async fn deployment_logs(
    api: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    tail_lines: u32,
) -> String {
    let pods = match api
        .pods_with_label(namespace, &format!("release={}", name))
        .await
    {
        Ok(pods) => pods,
        Err(e) => {
            tracing::error!(namespace = %namespace, name = %name, error = %e, "Failed to list release pods");
            Vec::new()
        }
    };

    let mut logs = String::new();
    for pod in pods {
        logs.push_str(&pod);
        logs.push('\n');
        match api.pod_log(&pod, namespace, None, tail_lines).await {
            Ok(text) => logs.push_str(&text),
            Err(e) => {
                tracing::error!(pod = %pod, error = %e, "Failed to read pod log");
                break;
            }
        }
    }
    logs
}

/// Resolve deployment `name` to its serving replica sets and their pods.
///
/// Replica sets count when owned by the deployment's uid and serving. Pods
/// are matched by name prefix against the deployment and a kept replica
/// set; a failing pod listing is logged and leaves the pod map empty.
pub async fn deployment_details(
    api: &dyn ClusterApi,
    namespace: &str,
    name: &str,
) -> Result<DeploymentDetails, ClusterError> {
    let deployment = api.read_deployment(name, namespace).await?;
    let uid = deployment["metadata"]["uid"].as_str().unwrap_or_default();

    let replica_sets: Vec<String> = api
        .list_replica_sets(namespace)
        .await?
        .into_iter()
        .filter(|rs| rs.is_serving() && rs.owner_uids.iter().any(|owner| owner == uid))
        .map(|rs| rs.name)
        .collect();

    let pods = match api.list_pods(Some(namespace)).await {
        Ok(pods) => pods
            .into_iter()
            .filter(|(pod, _)| {
                pod.starts_with(name) && replica_sets.iter().any(|rs| pod.starts_with(rs.as_str()))
            })
            .collect(),
        Err(e) => {
            tracing::error!(namespace = %namespace, error = %e, "Failed to list pods");
            BTreeMap::new()
        }
    };

    Ok(DeploymentDetails {
        deployment,
        replica_sets,
        pods,
    })
}

/// Pods in `namespace` whose name contains `name_filter`.
pub async fn filtered_pods(
    api: &dyn ClusterApi,
    namespace: &str,
    name_filter: Option<&str>,
) -> Result<BTreeMap<String, PodSummary>, ClusterError> {
    let pods = api.list_pods(Some(namespace)).await?;
    Ok(match name_filter {
        Some(filter) => pods
            .into_iter()
            .filter(|(pod, _)| pod.contains(filter))
            .collect(),
        None => pods,
    })
}

/// First `max_chars` characters of `logs`.
pub fn preview(logs: &str, max_chars: usize) -> &str {
    match logs.char_indices().nth(max_chars) {
        Some((idx, _)) => &logs[..idx],
        None => logs,
    }
}

/// Deployments across `namespaces`, optionally skipping system namespaces
/// and keeping only names containing `name_filter`.
pub async fn collect_deployments(
    api: &dyn ClusterApi,
    namespaces: &[String],
    workloads_only: bool,
    name_filter: Option<&str>,
) -> Result<Vec<DeploymentSummary>, ClusterError> {
    let mut deployments = Vec::new();
    for namespace in namespaces {
        if workloads_only && (namespace.starts_with("kube") || namespace.starts_with("docker")) {
            continue;
        }
        for deployment in api.list_deployments(namespace).await? {
            if let Some(filter) = name_filter {
                if !deployment.name.contains(filter) {
                    continue;
                }
            }
            deployments.push(deployment);
        }
    }
    Ok(deployments)
}
