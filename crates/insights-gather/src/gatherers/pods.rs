// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pod health checks, namespace events and container logs shared by the
//! operator and version tasks.

use crate::cluster::{ClusterClient, ListOptions, EVENTS};
use crate::error::{ClusterError, GatherError};
use crate::logs::PodLogOptions;
use crate::record::{JsonItem, Raw, Record, ResourceItem};
use crate::recorder::MAX_LOG_SIZE;
use crate::tree;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const LOG_TAIL_LINES: i64 = 100;
const LOG_COMPRESSION_RATIO: usize = 2;
const PENDING_GRACE_MINUTES: i64 = 2;
const MAX_EVENT_AGE_HOURS: i64 = 1;

fn container_statuses(pod: &Value) -> impl Iterator<Item = &Value> {
    tree::array_at(pod, &["status", "initContainerStatuses"])
        .iter()
        .chain(tree::array_at(pod, &["status", "containerStatuses"]))
}

fn exited_with_error(state: &Value) -> bool {
    tree::i64_at(state, &["terminated", "exitCode"]).is_some_and(|code| code != 0)
}

fn restart_count(status: &Value) -> i64 {
    tree::i64_at(status, &["restartCount"]).unwrap_or(0)
}

/// A pod is unhealthy when it is stuck pending, a container exited with an
/// error, or any container restarted.
pub fn is_healthy_pod(pod: &Value, now: DateTime<Utc>) -> bool {
    if tree::str_at(pod, &["status", "phase"]) == Some("Pending") {
        let created = tree::time_at(pod, &["metadata", "creationTimestamp"]);
        if created.is_some_and(|created| now - created > TimeDelta::minutes(PENDING_GRACE_MINUTES))
        {
            return false;
        }
    }
    container_statuses(pod).all(|status| {
        let last_failed = status
            .get("lastState")
            .is_some_and(exited_with_error);
        let failed = status.get("state").is_some_and(exited_with_error);
        !last_failed && !failed && restart_count(status) == 0
    })
}

pub fn is_container_in_crashloop(status: &Value) -> bool {
    let last_state = status.get("lastState");
    restart_count(status) > 0
        && (last_state.is_some_and(exited_with_error)
            || last_state.is_some_and(|state| state.get("waiting").is_some()))
}

pub fn has_container_in_crashloop(pod: &Value) -> bool {
    container_statuses(pod).any(is_container_in_crashloop)
}

pub fn is_pod_restarted(pod: &Value) -> bool {
    container_statuses(pod).any(|status| restart_count(status) > 0)
}

/// Names of the init containers followed by the regular ones.
pub fn container_names(pod: &Value) -> Vec<&str> {
    ["initContainers", "containers"]
        .iter()
        .flat_map(|kind| tree::array_at(pod, &["spec", *kind]))
        .filter_map(|container| tree::str_at(container, &["name"]))
        .collect()
}

pub fn pod_record(pod: &Value) -> Record {
    Record::new(
        format!(
            "config/pod/{}/{}",
            tree::namespace(pod),
            tree::name(pod)
        ),
        ResourceItem(pod.clone()),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompactedEvent {
    pub namespace: String,
    #[serde(rename = "lastTimestamp")]
    pub last_timestamp: DateTime<Utc>,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompactedEventList {
    pub items: Vec<CompactedEvent>,
}

/// Events of the last hour in an `openshift-` namespace, oldest first.
pub async fn gather_namespace_events(
    client: &dyn ClusterClient,
    namespace: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Record>, ClusterError> {
    if !namespace.starts_with("openshift-") {
        return Ok(Vec::new());
    }
    let events = client
        .list(&EVENTS, Some(namespace), &ListOptions::default())
        .await?
        .items;

    let oldest = now - TimeDelta::hours(MAX_EVENT_AGE_HOURS);
    let mut items: Vec<CompactedEvent> = events
        .iter()
        .filter_map(|event| {
            let last_timestamp = tree::time_at(event, &["lastTimestamp"])?;
            (last_timestamp >= oldest).then(|| CompactedEvent {
                namespace: tree::namespace(event).to_string(),
                last_timestamp,
                reason: tree::str_at(event, &["reason"]).unwrap_or_default().to_string(),
                message: tree::str_at(event, &["message"]).unwrap_or_default().to_string(),
            })
        })
        .collect();
    items.sort_by_key(|event| event.last_timestamp);

    Ok(vec![Record::new(
        format!("events/{namespace}"),
        JsonItem(CompactedEventList { items }),
    )])
}

/// Bytes each container log may use so that all of them fit in one archive.
///
/// `None` when there is nothing to read.
pub fn log_buffer_size(total_containers: usize) -> Option<usize> {
    if total_containers == 0 {
        return None;
    }
    let size = MAX_LOG_SIZE * LOG_COMPRESSION_RATIO / total_containers / 2;
    (size > 0).then_some(size)
}

/// Tail of the previous and current logs of every container of `pods`.
///
/// Previous logs are only read for pods that restarted. Containers whose logs
/// cannot be read or are empty are skipped.
pub async fn gather_pod_containers_logs(
    client: &dyn ClusterClient,
    pods: &[&Value],
    buffer_size: usize,
    token: &CancellationToken,
) -> Result<Vec<Record>, GatherError> {
    debug!("maximum buffer size: {} bytes", buffer_size);
    let mut records = Vec::new();
    let mut buffer = Vec::with_capacity(buffer_size);

    for previous in [true, false] {
        for pod in pods {
            if previous && !is_pod_restarted(pod) {
                continue;
            }
            let (namespace, pod_name) = (tree::namespace(pod), tree::name(pod));
            for container in container_names(pod) {
                let options = PodLogOptions {
                    container: container.to_string(),
                    limit_bytes: i64::try_from(buffer_size).unwrap_or(i64::MAX),
                    tail_lines: LOG_TAIL_LINES,
                    previous,
                    ..PodLogOptions::default()
                };
                debug!(
                    "fetching logs for {} container {} pod in namespace {} (previous: {})",
                    container, pod_name, namespace, previous
                );
                let stream = match client.pod_logs(namespace, pod_name, &options).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!("unable to fetch log of {}/{}: {}", pod_name, container, e);
                        continue;
                    }
                };

                buffer.clear();
                let mut limited = stream.take(buffer_size as u64);
                let read = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(GatherError::ContextCancelled),
                    read = limited.read_to_end(&mut buffer) => read,
                };
                if let Err(e) = read {
                    debug!("unable to read log of {}/{}: {}", pod_name, container, e);
                    continue;
                }
                if buffer.is_empty() {
                    continue;
                }

                let suffix = if previous { "previous" } else { "current" };
                records.push(Record::new(
                    format!("config/pod/{namespace}/logs/{pod_name}/{container}_{suffix}.log"),
                    Raw(String::from_utf8_lossy(&buffer).into_owned()),
                ));
            }
        }
    }
    Ok(records)
}
