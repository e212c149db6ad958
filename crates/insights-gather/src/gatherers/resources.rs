// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tasks that record each item of one resource kind, or a summary of them.

use super::{list_all, output, GatherContext};
use crate::anonymize::resources::{anonymize_mutating_webhook, anonymize_node};
use crate::cluster::{
    get_optional, ApiResource, ClusterClient, ListOptions, CONTAINER_RUNTIME_CONFIGS,
    CUSTOM_RESOURCE_DEFINITIONS, HOST_SUBNETS, MACHINE_CONFIG_POOLS, MACHINE_SETS,
    MUTATING_WEBHOOK_CONFIGURATIONS, NET_NAMESPACES, NODES, POD_DISRUPTION_BUDGETS,
    POD_NETWORK_CONNECTIVITY_CHECKS, POD_SECURITY_POLICIES,
};
use crate::error::{ClusterError, GatherError};
use crate::pager::Pager;
use crate::record::{AnonymizedItem, JsonItem, Record, ResourceItem};
use crate::registry::GatherOutput;
use crate::tree;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const PDB_LIMIT: u32 = 5000;

/// Volume snapshot CRDs, the only definitions worth recording.
pub const CUSTOM_RESOURCE_DEFINITION_NAMES: [&str; 2] = [
    "volumesnapshots.snapshot.storage.k8s.io",
    "volumesnapshotcontents.snapshot.storage.k8s.io",
];

/// One record per listed item, named by `name`.
async fn each_item<F>(
    client: &dyn ClusterClient,
    resource: &ApiResource,
    name: F,
) -> Result<Vec<Record>, GatherError>
where
    F: Fn(&Value) -> String,
{
    let items = list_all(client, resource, None, ListOptions::default()).await?;
    Ok(items
        .into_iter()
        .map(|item| Record::new(name(&item), ResourceItem(item)))
        .collect())
}

pub async fn gather_pod_disruption_budgets(
    ctx: Arc<GatherContext>,
    _: CancellationToken,
) -> GatherOutput {
    output(pod_disruption_budgets(ctx.client()).await)
}

async fn pod_disruption_budgets(client: &dyn ClusterClient) -> Result<Vec<Record>, GatherError> {
    let pdbs = match Pager::new(client, &POD_DISRUPTION_BUDGETS)
        .limit(PDB_LIMIT)
        .cap(PDB_LIMIT as usize)
        .collect()
        .await
    {
        Ok(paged) => paged.items,
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(pdbs
        .into_iter()
        .map(|pdb| {
            let name = match tree::namespace(&pdb) {
                "" => format!("config/pdbs/{}", tree::name(&pdb)),
                namespace => format!("config/pdbs/{}/{}", namespace, tree::name(&pdb)),
            };
            Record::new(name, ResourceItem(pdb))
        })
        .collect())
}

pub async fn gather_nodes(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    let nodes = list_all(ctx.client(), &NODES, None, ListOptions::default()).await;
    output(nodes.map_err(GatherError::from).map(|nodes| {
        nodes
            .into_iter()
            .map(|node| {
                Record::new(
                    format!("config/node/{}", tree::name(&node)),
                    AnonymizedItem::new(node, anonymize_node),
                )
            })
            .collect()
    }))
}

pub async fn gather_custom_resource_definitions(
    ctx: Arc<GatherContext>,
    _: CancellationToken,
) -> GatherOutput {
    let mut records = Vec::new();
    let mut errors = Vec::new();
    for name in CUSTOM_RESOURCE_DEFINITION_NAMES {
        match get_optional(ctx.client(), &CUSTOM_RESOURCE_DEFINITIONS, None, name).await {
            Ok(Some(crd)) => records.push(Record::new(
                format!("config/crd/{name}"),
                ResourceItem(crd),
            )),
            Ok(None) => {}
            Err(e) => errors.push(e.into()),
        }
    }
    (records, errors)
}

pub async fn gather_host_subnets(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(
        each_item(ctx.client(), &HOST_SUBNETS, |subnet| {
            format!(
                "config/hostsubnet/{}",
                tree::str_at(subnet, &["host"]).unwrap_or_default()
            )
        })
        .await,
    )
}

#[derive(Debug, Serialize)]
struct NetNamespace {
    name: String,
    #[serde(rename = "egressIPs")]
    egress_ips: Value,
    #[serde(rename = "netID")]
    net_id: i64,
}

pub async fn gather_net_namespaces(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(net_namespaces(ctx.client()).await)
}

async fn net_namespaces(client: &dyn ClusterClient) -> Result<Vec<Record>, GatherError> {
    let namespaces = match client
        .list(&NET_NAMESPACES, None, &ListOptions::default())
        .await
    {
        Ok(list) => list.items,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let summary: Vec<NetNamespace> = namespaces
        .iter()
        .map(|namespace| NetNamespace {
            name: tree::name(namespace).to_string(),
            egress_ips: namespace
                .get("egressIPs")
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new())),
            net_id: tree::i64_at(namespace, &["netid"])
                .or_else(|| tree::i64_at(namespace, &["netID"]))
                .unwrap_or(0),
        })
        .collect();
    Ok(vec![Record::new("config/netnamespaces", JsonItem(summary))])
}

pub async fn gather_machine_sets(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(
        each_item(ctx.client(), &MACHINE_SETS, |set| {
            format!(
                "machinesets/{}/{}",
                tree::namespace(set),
                tree::name(set)
            )
        })
        .await,
    )
}

pub async fn gather_machine_config_pools(
    ctx: Arc<GatherContext>,
    _: CancellationToken,
) -> GatherOutput {
    output(
        each_item(ctx.client(), &MACHINE_CONFIG_POOLS, |pool| {
            format!("config/machineconfigpools/{}", tree::name(pool))
        })
        .await,
    )
}

pub async fn gather_container_runtime_configs(
    ctx: Arc<GatherContext>,
    _: CancellationToken,
) -> GatherOutput {
    output(
        each_item(ctx.client(), &CONTAINER_RUNTIME_CONFIGS, |config| {
            format!("config/containerruntimeconfigs/{}", tree::name(config))
        })
        .await,
    )
}

pub async fn gather_mutating_webhook_configurations(
    ctx: Arc<GatherContext>,
    _: CancellationToken,
) -> GatherOutput {
    let configurations = list_all(
        ctx.client(),
        &MUTATING_WEBHOOK_CONFIGURATIONS,
        None,
        ListOptions::default(),
    )
    .await;
    output(configurations.map_err(GatherError::from).map(|items| {
        items
            .into_iter()
            .map(|item| {
                Record::new(
                    format!("config/mutatingwebhookconfigurations/{}", tree::name(&item)),
                    AnonymizedItem::new(item, anonymize_mutating_webhook),
                )
            })
            .collect()
    }))
}

/// Only the names of the pod security policies are recorded.
pub async fn gather_pod_security_policies(
    ctx: Arc<GatherContext>,
    _: CancellationToken,
) -> GatherOutput {
    let policies = match ctx
        .client()
        .list(&POD_SECURITY_POLICIES, None, &ListOptions::default())
        .await
    {
        Ok(list) => list.items,
        Err(e) if e.is_not_found() => return (Vec::new(), Vec::new()),
        Err(e) => return (Vec::new(), vec![e.into()]),
    };
    let names: Vec<String> = policies
        .iter()
        .map(|policy| tree::name(policy).to_string())
        .collect();
    (
        vec![Record::new("config/psp_names", JsonItem(names))],
        Vec::new(),
    )
}

/// Latest start of each unsuccessful connectivity check, keyed by reason and message.
pub type ConnectivityReasons = BTreeMap<String, BTreeMap<String, DateTime<Utc>>>;

fn unsuccessful_entries(entries: &[Value]) -> impl Iterator<Item = &Value> {
    entries
        .iter()
        .filter(|entry| !entry.get("success").and_then(Value::as_bool).unwrap_or(false))
}

pub fn connectivity_failure_reasons(checks: &[Value]) -> ConnectivityReasons {
    let mut reasons = ConnectivityReasons::new();
    for check in checks {
        let failures = unsuccessful_entries(tree::array_at(check, &["status", "failures"]));
        let outages = tree::array_at(check, &["status", "outages"])
            .iter()
            .flat_map(|outage| {
                unsuccessful_entries(tree::array_at(outage, &["startLogs"]))
                    .chain(unsuccessful_entries(tree::array_at(outage, &["endLogs"])))
            });
        for entry in failures.chain(outages) {
            let reason = tree::str_at(entry, &["reason"]).unwrap_or_default();
            let message = tree::str_at(entry, &["message"]).unwrap_or_default();
            let Some(start) = tree::time_at(entry, &["time"]) else {
                continue;
            };
            let latest = reasons
                .entry(reason.to_string())
                .or_default()
                .entry(message.to_string())
                .or_insert(start);
            if start > *latest {
                *latest = start;
            }
        }
    }
    reasons
}

pub async fn gather_pod_network_connectivity_checks(
    ctx: Arc<GatherContext>,
    _: CancellationToken,
) -> GatherOutput {
    let checks: Result<Vec<Value>, ClusterError> = ctx
        .client()
        .list(&POD_NETWORK_CONNECTIVITY_CHECKS, None, &ListOptions::default())
        .await
        .map(|list| list.items);
    output(checks.map_err(GatherError::from).map(|checks| {
        vec![Record::new(
            "config/podnetworkconnectivitychecks",
            JsonItem(connectivity_failure_reasons(&checks)),
        )]
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeClusterClient;
    use serde_json::json;

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
    async fn test_pdb_names() {
        let client = FakeClusterClient::new().with_objects(
            &POD_DISRUPTION_BUDGETS,
            vec![
                json!({"metadata": {"name": "etcd-quorum", "namespace": "openshift-etcd"}}),
                json!({"metadata": {"name": "orphan"}}),
            ],
        );
        let records = pod_disruption_budgets(&client).await.expect("gathered");
        assert_eq!(
            names(&records),
            vec!["config/pdbs/openshift-etcd/etcd-quorum", "config/pdbs/orphan"]
        );
    }

    #[tokio::test]
    async fn test_crds_are_fetched_by_name() {
        let client = FakeClusterClient::new().with_objects(
            &CUSTOM_RESOURCE_DEFINITIONS,
            vec![
                json!({"metadata": {"name": "volumesnapshots.snapshot.storage.k8s.io"}}),
                json!({"metadata": {"name": "widgets.example.com"}}),
            ],
        );
        let (records, errors) =
            gather_custom_resource_definitions(context(client), CancellationToken::new()).await;
        assert!(errors.is_empty());
        assert_eq!(
            names(&records),
            vec!["config/crd/volumesnapshots.snapshot.storage.k8s.io"]
        );
    }

    #[tokio::test]
    async fn test_host_subnets_and_machine_sets() {
        let client = FakeClusterClient::new()
            .with_objects(
                &HOST_SUBNETS,
                vec![json!({"metadata": {"name": "worker-0"}, "host": "worker-0.example"})],
            )
            .with_objects(
                &MACHINE_SETS,
                vec![json!({"metadata": {"name": "workers", "namespace": "openshift-machine-api"}})],
            );
        let ctx = context(client);
        let (subnets, _) = gather_host_subnets(Arc::clone(&ctx), CancellationToken::new()).await;
        assert_eq!(names(&subnets), vec!["config/hostsubnet/worker-0.example"]);
        let (sets, _) = gather_machine_sets(ctx, CancellationToken::new()).await;
        assert_eq!(names(&sets), vec!["machinesets/openshift-machine-api/workers"]);
    }

    #[tokio::test]
    async fn test_net_namespaces_summary() {
        let client = FakeClusterClient::new().with_objects(
            &NET_NAMESPACES,
            vec![json!({
                "metadata": {"name": "default"},
                "netname": "default",
                "netid": 0,
                "egressIPs": ["10.0.0.5"]
            })],
        );
        let records = net_namespaces(&client).await.expect("gathered");
        let (data, _) = records[0].marshal().expect("marshal");
        let summary: Value = serde_json::from_slice(&data).expect("json");
        assert_eq!(
            summary,
            json!([{"name": "default", "egressIPs": ["10.0.0.5"], "netID": 0}])
        );
    }

    #[tokio::test]
    async fn test_missing_net_namespaces_is_not_an_error() {
        let client = FakeClusterClient::new().failing(
            &NET_NAMESPACES,
            ClusterError::NotFound("netnamespaces".into()),
        );
        assert!(net_namespaces(&client).await.expect("ok").is_empty());
    }

    #[tokio::test]
    async fn test_psp_names() {
        let client = FakeClusterClient::new().with_objects(
            &POD_SECURITY_POLICIES,
            vec![
                json!({"metadata": {"name": "restricted"}}),
                json!({"metadata": {"name": "privileged"}}),
            ],
        );
        let (records, _) =
            gather_pod_security_policies(context(client), CancellationToken::new()).await;
        let (data, _) = records[0].marshal().expect("marshal");
        assert_eq!(data, br#"["restricted","privileged"]"#);
    }

    #[test]
    fn test_connectivity_failure_reasons_keep_latest() {
        let checks = vec![json!({
            "status": {
                "failures": [
                    {"success": false, "reason": "TCPConnectError", "message": "dial timeout", "time": "2021-01-01T10:00:00Z"},
                    {"success": false, "reason": "TCPConnectError", "message": "dial timeout", "time": "2021-01-01T11:00:00Z"},
                    {"success": true, "reason": "TCPConnect", "message": "ok", "time": "2021-01-01T12:00:00Z"}
                ],
                "outages": [{
                    "startLogs": [{"success": false, "reason": "DNSError", "message": "no such host", "time": "2021-01-01T09:00:00Z"}],
                    "endLogs": [{"success": true, "reason": "TCPConnect", "message": "ok", "time": "2021-01-01T09:30:00Z"}]
                }]
            }
        })];
        let reasons = connectivity_failure_reasons(&checks);
        assert_eq!(reasons.len(), 2);
        assert_eq!(
            reasons["TCPConnectError"]["dial timeout"].to_rfc3339(),
            "2021-01-01T11:00:00+00:00"
        );
        assert!(reasons.contains_key("DNSError"));
        assert!(!reasons.contains_key("TCPConnect"));
    }
}
