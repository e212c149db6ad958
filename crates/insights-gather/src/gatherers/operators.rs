// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cluster operators, the operator resources they point at, and the pods,
//! events and logs of the ones that are unhealthy.

use super::pods::{
    container_names, gather_namespace_events, gather_pod_containers_logs, is_healthy_pod,
    log_buffer_size, pod_record,
};
use super::{list_all, output, GatherContext};
use crate::anonymize::resources::anonymize_operator_resource;
use crate::cluster::{ApiResource, ClusterClient, ListOptions, CLUSTER_OPERATORS, PODS};
use crate::error::GatherError;
use crate::record::{AnonymizedItem, Record, ResourceItem};
use crate::registry::GatherOutput;
use crate::tree;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OPERATOR_GROUP: &str = "operator.openshift.io";

pub async fn gather_cluster_operators(
    ctx: Arc<GatherContext>,
    _token: CancellationToken,
) -> GatherOutput {
    output(cluster_operators(ctx.client()).await)
}

async fn cluster_operators(client: &dyn ClusterClient) -> Result<Vec<Record>, GatherError> {
    let operators = list_all(client, &CLUSTER_OPERATORS, None, ListOptions::default()).await?;
    let versions = match preferred_operator_versions(client).await {
        Ok(versions) => Some(versions),
        Err(e) => {
            warn!("unable to discover operator resource versions: {}", e);
            None
        }
    };

    let mut records = Vec::with_capacity(operators.len());
    for operator in &operators {
        records.push(Record::new(
            format!("config/clusteroperator/{}", tree::name(operator)),
            ResourceItem(operator.clone()),
        ));
        let Some(versions) = &versions else {
            continue;
        };
        for resource in related_operator_resources(client, operator, versions).await {
            let api_version = tree::str_at(&resource, &["apiVersion"]).unwrap_or_default();
            if api_version.contains("imageregistry") {
                continue;
            }
            let (group, kind) = super::group_and_kind(&resource);
            let name = format!(
                "config/clusteroperator/{}/{}/{}",
                group,
                kind,
                tree::str_at(&resource, &["name"]).unwrap_or_default()
            );
            records.push(Record::new(
                name,
                AnonymizedItem::new(resource, anonymize_operator_resource),
            ));
        }
    }
    Ok(records)
}

/// Preferred version of every API group that serves operator resources.
async fn preferred_operator_versions(
    client: &dyn ClusterClient,
) -> Result<HashMap<String, String>, GatherError> {
    let body = client.raw_get("/apis", &[]).await?;
    let groups: Value = serde_json::from_slice(&body)?;
    Ok(tree::array_at(&groups, &["groups"])
        .iter()
        .filter_map(|group| {
            let name = tree::str_at(group, &["name"])?;
            let version = tree::str_at(group, &["preferredVersion", "version"])?;
            name.contains(OPERATOR_GROUP)
                .then(|| (name.to_string(), version.to_string()))
        })
        .collect())
}

/// The `{apiVersion, kind, name, spec}` view of each operator owned object
/// listed in the operator's related objects.
async fn related_operator_resources(
    client: &dyn ClusterClient,
    operator: &Value,
    versions: &HashMap<String, String>,
) -> Vec<Value> {
    let mut resources = Vec::new();
    for related in tree::array_at(operator, &["status", "relatedObjects"]) {
        let group = tree::str_at(related, &["group"]).unwrap_or_default();
        if !group.contains(OPERATOR_GROUP) {
            continue;
        }
        let Some(version) = versions.get(group) else {
            continue;
        };
        let plural = tree::str_at(related, &["resource"])
            .unwrap_or_default()
            .to_lowercase();
        let name = tree::str_at(related, &["name"]).unwrap_or_default();
        let resource = ApiResource::dynamic(group.to_string(), version.clone(), plural, false);

        let object = match client.get(&resource, None, name).await {
            Ok(object) => object,
            Err(e) => {
                debug!("unable to get {} {}: {}", resource, name, e);
                continue;
            }
        };
        let (Some(kind), Some(api_version), Some(name)) = (
            tree::str_at(&object, &["kind"]),
            tree::str_at(&object, &["apiVersion"]),
            tree::str_at(&object, &["metadata", "name"]),
        ) else {
            continue;
        };
        if object.get("spec").is_none() {
            warn!("can't find spec for cluster operator resource {}", name);
        }
        resources.push(json!({
            "apiVersion": api_version,
            "kind": kind,
            "name": name,
            "spec": object.get("spec").cloned().unwrap_or(Value::Null),
        }));
    }
    resources
}

/// Degraded or unavailable operators are unhealthy.
pub fn is_healthy_operator(operator: &Value) -> bool {
    !tree::array_at(operator, &["status", "conditions"])
        .iter()
        .any(|condition| {
            matches!(
                (
                    tree::str_at(condition, &["type"]),
                    tree::str_at(condition, &["status"])
                ),
                (Some("Degraded"), Some("True")) | (Some("Available"), Some("False"))
            )
        })
}

pub fn namespaces_for_operator(operator: &Value) -> Vec<&str> {
    tree::array_at(operator, &["status", "relatedObjects"])
        .iter()
        .filter(|related| tree::str_at(related, &["resource"]) == Some("namespaces"))
        .filter_map(|related| tree::str_at(related, &["name"]))
        .collect()
}

pub async fn gather_cluster_operator_pods_and_events(
    ctx: Arc<GatherContext>,
    token: CancellationToken,
) -> GatherOutput {
    output(operator_pods_and_events(ctx.client(), &token).await)
}

async fn operator_pods_and_events(
    client: &dyn ClusterClient,
    token: &CancellationToken,
) -> Result<Vec<Record>, GatherError> {
    let operators = list_all(client, &CLUSTER_OPERATORS, None, ListOptions::default()).await?;
    let now = Utc::now();

    let mut records = Vec::new();
    let mut unhealthy_pods: Vec<Value> = Vec::new();
    let mut events_collected: HashSet<String> = HashSet::new();

    for operator in operators.iter().filter(|o| !is_healthy_operator(o)) {
        for namespace in namespaces_for_operator(operator) {
            let pods = match list_all(client, &PODS, Some(namespace), ListOptions::default()).await
            {
                Ok(pods) => pods,
                Err(e) => {
                    debug!(
                        "unable to find pods in namespace {} for failing operator {}: {}",
                        namespace,
                        tree::name(operator),
                        e
                    );
                    continue;
                }
            };
            for pod in pods.into_iter().filter(|pod| !is_healthy_pod(pod, now)) {
                records.push(pod_record(&pod));
                unhealthy_pods.push(pod);
            }

            if events_collected.contains(namespace) {
                continue;
            }
            match gather_namespace_events(client, namespace, now).await {
                Ok(events) => {
                    records.extend(events);
                    events_collected.insert(namespace.to_string());
                }
                Err(e) => debug!("unable to collect events for namespace {}: {}", namespace, e),
            }
        }
    }

    let total_containers: usize = unhealthy_pods
        .iter()
        .map(|pod| container_names(pod).len())
        .sum();
    info!(
        "found {} unhealthy pods with {} containers",
        unhealthy_pods.len(),
        total_containers
    );
    let Some(buffer_size) = log_buffer_size(total_containers) else {
        return Ok(records);
    };
    let pods: Vec<&Value> = unhealthy_pods.iter().collect();
    records.extend(gather_pod_containers_logs(client, &pods, buffer_size, token).await?);
    Ok(records)
}
