//! Cluster read routes. Thin pass-through to [`ClusterApi`].

use super::{default_namespace, AppState};
use crate::cluster::{
    collect_deployments, deployment_details, deployment_logs, filtered_pods, preview, ClusterApi,
    ClusterError,
};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let status = match &self {
            ClusterError::NotFound(_) => StatusCode::NOT_FOUND,
            ClusterError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };
        tracing::warn!(error = %self, "Cluster request failed");
        (status, self.to_string()).into_response()
    }
}

pub(crate) fn unconfigured() -> ClusterError {
    ClusterError::Config("cluster access is not configured".to_string())
}

fn cluster(state: &AppState) -> Result<Arc<dyn ClusterApi>, ClusterError> {
    state.cluster.clone().ok_or_else(unconfigured)
}

/// Query flags count as set when present with any value but `false`/`0`.
fn flag(value: &Option<String>) -> bool {
    match value.as_deref() {
        Some(v) => !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0"),
        None => false,
    }
}

#[derive(Debug, Deserialize)]
pub struct NamespaceQuery {
    pub namespace: Option<String>,
}

pub async fn handle_list_pods(
    State(state): State<AppState>,
    Query(query): Query<NamespaceQuery>,
) -> Result<impl IntoResponse, ClusterError> {
    let namespace = query.namespace.as_deref().filter(|ns| !ns.is_empty());
    let pods = cluster(&state)?.list_pods(namespace).await?;
    Ok(Json(serde_json::json!({ "pods": pods })))
}

pub async fn handle_namespaces(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ClusterError> {
    let namespaces = cluster(&state)?.list_namespaces().await?;
    Ok(Json(serde_json::json!({ "namespaces": namespaces })))
}

#[derive(Debug, Deserialize)]
pub struct PodLogsQuery {
    pub pod: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub container: Option<String>,
    pub tail_lines: Option<u32>,
}

pub async fn handle_pod_logs(
    State(state): State<AppState>,
    Query(query): Query<PodLogsQuery>,
) -> Result<impl IntoResponse, ClusterError> {
    let tail_lines = query.tail_lines.unwrap_or(state.config.tail_lines);
    let container = query.container.as_deref().filter(|c| !c.is_empty());
    let logs = cluster(&state)?
        .pod_log(&query.pod, &query.namespace, container, tail_lines)
        .await?;
    Ok(logs)
}

#[derive(Debug, Deserialize)]
pub struct PodQuery {
    pub pod: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

pub async fn handle_pod_describe(
    State(state): State<AppState>,
    Query(query): Query<PodQuery>,
) -> Result<impl IntoResponse, ClusterError> {
    let pod = cluster(&state)?
        .describe_pod(&query.pod, &query.namespace)
        .await?;
    Ok(Json(pod))
}

pub async fn handle_pod_events(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
) -> Result<impl IntoResponse, ClusterError> {
    let events: BTreeMap<usize, _> = cluster(&state)?
        .pod_events(&pod, &namespace)
        .await?
        .into_iter()
        .enumerate()
        .collect();
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
pub struct DeploymentLogsQuery {
    pub json: Option<String>,
    pub preview: Option<String>,
}

pub async fn handle_deployment_logs(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<DeploymentLogsQuery>,
) -> Result<Response, ClusterError> {
    let api = cluster(&state)?;
    let logs = deployment_logs(api.as_ref(), &namespace, &name, state.config.tail_lines).await;
    let logs = if flag(&query.preview) {
        preview(&logs, state.config.logs_preview_length).to_string()
    } else {
        logs
    };

    if flag(&query.json) {
        Ok(Json(serde_json::json!({ "logs": logs })).into_response())
    } else {
        Ok(logs.into_response())
    }
}

#[derive(Debug, Deserialize)]
pub struct DeploymentDetailsQuery {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub tail_lines: Option<u32>,
}

pub async fn handle_deployment_details(
    State(state): State<AppState>,
    Query(query): Query<DeploymentDetailsQuery>,
) -> Result<impl IntoResponse, ClusterError> {
    let api = cluster(&state)?;
    let details = deployment_details(api.as_ref(), &query.namespace, &query.name).await?;
    Ok(Json(serde_json::json!({
        "deployment": details.deployment,
        "replica_sets": details.replica_sets,
        "pods": details.pods,
        "tail_lines": query.tail_lines.unwrap_or(state.config.tail_lines),
    })))
}

#[derive(Debug, Deserialize)]
pub struct PodDetailsQuery {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub filter: Option<String>,
    pub tail_lines: Option<u32>,
}

pub async fn handle_pod_details(
    State(state): State<AppState>,
    Query(query): Query<PodDetailsQuery>,
) -> Result<impl IntoResponse, ClusterError> {
    let api = cluster(&state)?;
    let filter = query.filter.as_deref().filter(|f| !f.is_empty());
    let pods = filtered_pods(api.as_ref(), &query.namespace, filter).await?;
    Ok(Json(serde_json::json!({
        "pods": pods,
        "tail_lines": query.tail_lines.unwrap_or(state.config.tail_lines),
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeploymentsQuery {
    pub namespace: Option<String>,
    pub workloads: Option<String>,
    pub filter: Option<String>,
}

pub async fn handle_deployments(
    State(state): State<AppState>,
    Query(query): Query<DeploymentsQuery>,
) -> Result<impl IntoResponse, ClusterError> {
    let api = cluster(&state)?;
    let namespaces = match query.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        Some(ns) => vec![ns.to_string()],
        None => api.list_namespaces().await?,
    };
    let filter = query.filter.as_deref().filter(|f| !f.is_empty());

    let deployments =
        collect_deployments(api.as_ref(), &namespaces, flag(&query.workloads), filter).await?;
    Ok(Json(serde_json::json!({ "deployments": deployments })))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{spawn, state};
    use super::*;
    use crate::cluster::testing::{deployment, web_deployment, FakeCluster};
    use crate::cluster::PodSummary;

    fn fake() -> Arc<dyn ClusterApi> {
        let mut cluster = FakeCluster {
            namespaces: vec!["default".into(), "kube-system".into()],
            labelled: vec!["api-1".into()],
            ..Default::default()
        };
        cluster.pods.insert(
            "api-1".into(),
            PodSummary {
                namespace: "default".into(),
                containers: vec!["app".into()],
            },
        );
        cluster.logs.insert("api-1".into(), "x".repeat(2000));
        cluster
            .deployments
            .insert("default".into(), vec![deployment("api", "default")]);
        cluster
            .deployments
            .insert("kube-system".into(), vec![deployment("coredns", "kube-system")]);
        Arc::new(cluster)
    }

    async fn get_json(url: String) -> serde_json::Value {
        reqwest::get(url).await.unwrap().json().await.unwrap()
    }

    #[test]
    fn test_flag() {
        assert!(flag(&Some(String::new())));
        assert!(flag(&Some("true".into())));
        assert!(!flag(&Some("false".into())));
        assert!(!flag(&None));
    }

    #[tokio::test]
    async fn test_without_cluster_is_unavailable() {
        let base = spawn(state(None)).await;
        let resp = reqwest::get(format!("{}/get/namespaces", base)).await.unwrap();
        assert_eq!(resp.status(), 503);
    }

    #[tokio::test]
    async fn test_pods_and_namespaces() {
        let base = spawn(state(Some(fake()))).await;

        let namespaces = get_json(format!("{}/get/namespaces", base)).await;
        assert_eq!(namespaces["namespaces"], serde_json::json!(["default", "kube-system"]));

        let pods = get_json(format!("{}/list-pods?namespace=default", base)).await;
        assert_eq!(pods["pods"]["api-1"]["containers"], serde_json::json!(["app"]));

        let describe = get_json(format!("{}/pod-describe?pod=api-1", base)).await;
        assert_eq!(describe["metadata"]["namespace"], "default");

        let missing = reqwest::get(format!("{}/pod-describe?pod=ghost", base))
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn test_pod_events_keyed_by_index() {
        let base = spawn(state(Some(fake()))).await;
        let events = get_json(format!("{}/api/pod-events/default/api-1", base)).await;
        assert_eq!(events["0"]["Reason"], "Pulled");
        assert_eq!(events["0"]["From"], "kubelet");
    }

    #[tokio::test]
    async fn test_deployment_logs_preview_and_json() {
        let base = spawn(state(Some(fake()))).await;

        let full = reqwest::get(format!("{}/deployment-logs/default/api", base))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(full.starts_with("api-1\n"));
        assert_eq!(full.len(), "api-1\n".len() + 2000);

        let preview = get_json(format!("{}/deployment-logs/default/api?json&preview", base)).await;
        assert_eq!(preview["logs"].as_str().unwrap().chars().count(), 1000);
    }

    #[tokio::test]
    async fn test_deployment_details() {
        let base = spawn(state(Some(Arc::new(web_deployment())))).await;

        let details = get_json(format!(
            "{}/get/deployment-details?name=web&namespace=default&tail_lines=20",
            base
        ))
        .await;
        assert_eq!(details["deployment"]["metadata"]["name"], "web");
        assert_eq!(details["replica_sets"], serde_json::json!(["web-5d8f"]));
        let pods: Vec<&String> = details["pods"].as_object().unwrap().keys().collect();
        assert_eq!(pods, vec!["web-5d8f-abc", "web-5d8f-def"]);
        assert_eq!(details["tail_lines"], 20);

        let missing = reqwest::get(format!("{}/get/deployment-details?name=ghost", base))
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn test_pod_details_filter() {
        let base = spawn(state(Some(Arc::new(web_deployment())))).await;

        let filtered = get_json(format!("{}/get/pod-details?filter=other", base)).await;
        let pods: Vec<&String> = filtered["pods"].as_object().unwrap().keys().collect();
        assert_eq!(pods, vec!["web-other-xyz"]);
        assert_eq!(filtered["tail_lines"], 100);

        let all = get_json(format!("{}/get/pod-details?namespace=default", base)).await;
        assert_eq!(all["pods"].as_object().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_deployments_filters() {
        let base = spawn(state(Some(fake()))).await;

        let all = get_json(format!("{}/get/deployments", base)).await;
        assert_eq!(all["deployments"].as_array().unwrap().len(), 2);

        let workloads = get_json(format!("{}/get/deployments?workloads=true", base)).await;
        assert_eq!(workloads["deployments"][0]["name"], "api");
        assert_eq!(workloads["deployments"].as_array().unwrap().len(), 1);

        let filtered = get_json(format!("{}/get/deployments?filter=dns", base)).await;
        assert_eq!(filtered["deployments"][0]["name"], "coredns");
    }
}
