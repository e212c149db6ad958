// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cluster scoped configuration objects that exist once per cluster.

use super::pods::{gather_namespace_events, is_healthy_pod, pod_record};
use super::{list_all, output, GatherContext};
use crate::anonymize::resources::{
    anonymize_cluster_version, anonymize_image_registry, anonymize_infrastructure,
    anonymize_ingress, anonymize_proxy,
};
use crate::cluster::{
    get_optional, ApiResource, ClusterClient, ListOptions, AUTHENTICATIONS, CLUSTER_VERSIONS,
    FEATURE_GATES, IMAGE_PRUNERS, IMAGE_REGISTRY_CONFIGS, INFRASTRUCTURES, INGRESSES, NETWORKS,
    OAUTHS, PODS, PROXIES,
};
use crate::error::GatherError;
use crate::record::{AnonymizeFn, AnonymizedItem, Raw, Record, ResourceItem};
use crate::registry::GatherOutput;
use crate::tree;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SINGLETON_NAME: &str = "cluster";
const CLUSTER_VERSION_NAME: &str = "version";
const CLUSTER_VERSION_NAMESPACE: &str = "openshift-cluster-version";

/// Records the object named `cluster` of `resource`, if there is one.
async fn singleton(
    client: &dyn ClusterClient,
    resource: &ApiResource,
    record_name: &str,
    anonymize: Option<AnonymizeFn>,
) -> Result<Vec<Record>, GatherError> {
    let Some(object) = get_optional(client, resource, None, SINGLETON_NAME).await? else {
        debug!("{} {} not found", resource, SINGLETON_NAME);
        return Ok(Vec::new());
    };
    let record = match anonymize {
        Some(anonymize) => Record::new(record_name, AnonymizedItem::new(object, anonymize)),
        None => Record::new(record_name, ResourceItem(object)),
    };
    Ok(vec![record])
}

pub async fn gather_infrastructure(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(
        singleton(
            ctx.client(),
            &INFRASTRUCTURES,
            "config/infrastructure",
            Some(anonymize_infrastructure),
        )
        .await,
    )
}

pub async fn gather_network(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(singleton(ctx.client(), &NETWORKS, "config/network", None).await)
}

pub async fn gather_authentication(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(singleton(ctx.client(), &AUTHENTICATIONS, "config/authentication", None).await)
}

pub async fn gather_oauth(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(singleton(ctx.client(), &OAUTHS, "config/oauth", None).await)
}

pub async fn gather_ingress(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(
        singleton(
            ctx.client(),
            &INGRESSES,
            "config/ingress",
            Some(anonymize_ingress),
        )
        .await,
    )
}

pub async fn gather_proxy(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(singleton(ctx.client(), &PROXIES, "config/proxy", Some(anonymize_proxy)).await)
}

pub async fn gather_feature_gates(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(singleton(ctx.client(), &FEATURE_GATES, "config/featuregate", None).await)
}

pub async fn gather_image_registry(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(
        singleton(
            ctx.client(),
            &IMAGE_REGISTRY_CONFIGS,
            "config/clusteroperator/imageregistry.operator.openshift.io/config/cluster",
            Some(anonymize_image_registry),
        )
        .await,
    )
}

pub async fn gather_image_pruner(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(
        singleton(
            ctx.client(),
            &IMAGE_PRUNERS,
            "config/clusteroperator/imageregistry.operator.openshift.io/imagepruner/cluster",
            None,
        )
        .await,
    )
}

/// The cluster version, the cluster id and the state of the cluster version
/// operator pods.
pub async fn gather_cluster_version(
    ctx: Arc<GatherContext>,
    _: CancellationToken,
) -> GatherOutput {
    output(cluster_version(ctx.client()).await)
}

async fn cluster_version(client: &dyn ClusterClient) -> Result<Vec<Record>, GatherError> {
    let Some(version) = get_optional(client, &CLUSTER_VERSIONS, None, CLUSTER_VERSION_NAME).await?
    else {
        return Ok(Vec::new());
    };

    let mut records = Vec::new();
    let cluster_id = tree::str_at(&version, &["spec", "clusterID"])
        .unwrap_or_default()
        .to_string();
    records.push(Record::new(
        "config/version",
        AnonymizedItem::new(version, anonymize_cluster_version),
    ));
    if !cluster_id.is_empty() {
        records.push(Record::new("config/id", Raw(cluster_id)));
    }

    let pods = match list_all(
        client,
        &PODS,
        Some(CLUSTER_VERSION_NAMESPACE),
        ListOptions::default(),
    )
    .await
    {
        Ok(pods) => pods,
        Err(e) => {
            debug!("unable to list cluster version pods: {}", e);
            return Ok(records);
        }
    };

    let now = Utc::now();
    let mut unhealthy = false;
    for pod in &pods {
        unhealthy |= !is_healthy_pod(pod, now);
        records.push(pod_record(pod));
    }
    if unhealthy {
        match gather_namespace_events(client, CLUSTER_VERSION_NAMESPACE, now).await {
            Ok(events) => records.extend(events),
            Err(e) => debug!("unable to collect cluster version events: {}", e),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeClusterClient;
    use crate::error::ClusterError;
    use serde_json::{json, Value};

    fn context(client: FakeClusterClient) -> Arc<GatherContext> {
        Arc::new(GatherContext::new(
            Arc::new(client),
            Arc::new(super::super::ImageCache::new(1)),
        ))
    }

    fn names(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_missing_singleton_is_skipped() {
        let (records, errors) =
            gather_network(context(FakeClusterClient::new()), CancellationToken::new()).await;
        assert!(records.is_empty());
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_singleton_errors_are_returned() {
        let client = FakeClusterClient::new().failing(
            &OAUTHS,
            ClusterError::Permanent {
                status: 403,
                message: "forbidden".into(),
            },
        );
        let (records, errors) = gather_oauth(context(client), CancellationToken::new()).await;
        assert!(records.is_empty());
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_proxy_is_anonymized() {
        let client = FakeClusterClient::new().with_objects(
            &PROXIES,
            vec![json!({
                "metadata": {"name": "cluster"},
                "spec": {"httpProxy": "http://proxy.example.com:3128"},
                "status": {}
            })],
        );
        let (records, errors) = gather_proxy(context(client), CancellationToken::new()).await;
        assert!(errors.is_empty());
        assert_eq!(names(&records), vec!["config/proxy"]);
        let (data, _) = records[0].marshal().expect("marshal");
        let proxy: Value = serde_json::from_slice(&data).expect("json");
        assert_ne!(proxy["spec"]["httpProxy"], "http://proxy.example.com:3128");
    }

    #[tokio::test]
    async fn test_image_registry_record_name() {
        let client = FakeClusterClient::new().with_objects(
            &IMAGE_PRUNERS,
            vec![json!({"metadata": {"name": "cluster"}, "spec": {"schedule": "0 0 * * *"}})],
        );
        let (records, _) = gather_image_pruner(context(client), CancellationToken::new()).await;
        assert_eq!(
            names(&records),
            vec!["config/clusteroperator/imageregistry.operator.openshift.io/imagepruner/cluster"]
        );
    }

    fn version(cluster_id: &str) -> Value {
        json!({
            "metadata": {"name": "version"},
            "spec": {"clusterID": cluster_id, "upstream": "https://api.openshift.com/api/upgrades_info"}
        })
    }

    #[tokio::test]
    async fn test_cluster_version_with_healthy_pods() {
        let client = FakeClusterClient::new()
            .with_objects(&CLUSTER_VERSIONS, vec![version("0a1b2c")])
            .with_objects(
                &PODS,
                vec![json!({
                    "metadata": {"name": "cvo-1", "namespace": CLUSTER_VERSION_NAMESPACE},
                    "status": {"phase": "Running", "containerStatuses": [{"restartCount": 0}]}
                })],
            );
        let records = cluster_version(&client).await.expect("gathered");
        assert_eq!(
            names(&records),
            vec![
                "config/version",
                "config/id",
                "config/pod/openshift-cluster-version/cvo-1"
            ]
        );
        let (id, _) = records[1].marshal().expect("marshal");
        assert_eq!(id, b"0a1b2c");
        let (data, _) = records[0].marshal().expect("marshal");
        let anonymized: Value = serde_json::from_slice(&data).expect("json");
        assert_eq!(
            anonymized["spec"]["upstream"],
            "xxxxx://xxx.xxxxxxxxx.xxx/xxx/xxxxxxxxxxxxx"
        );
    }

    #[tokio::test]
    async fn test_cluster_version_collects_events_for_unhealthy_pods() {
        let client = FakeClusterClient::new()
            .with_objects(&CLUSTER_VERSIONS, vec![version("")])
            .with_objects(
                &PODS,
                vec![json!({
                    "metadata": {"name": "cvo-1", "namespace": CLUSTER_VERSION_NAMESPACE},
                    "status": {"phase": "Running", "containerStatuses": [{"restartCount": 3}]}
                })],
            );
        let records = cluster_version(&client).await.expect("gathered");
        assert_eq!(
            names(&records),
            vec![
                "config/version",
                "config/pod/openshift-cluster-version/cvo-1",
                "events/openshift-cluster-version"
            ]
        );
    }

    #[tokio::test]
    async fn test_cluster_version_pod_errors_keep_the_version() {
        let client = FakeClusterClient::new()
            .with_objects(&CLUSTER_VERSIONS, vec![version("id")])
            .failing(
                &PODS,
                ClusterError::Transient {
                    status: 500,
                    message: "boom".into(),
                },
            );
        let records = cluster_version(&client).await.expect("pod errors are not fatal");
        assert_eq!(names(&records), vec!["config/version", "config/id"]);
    }
}
