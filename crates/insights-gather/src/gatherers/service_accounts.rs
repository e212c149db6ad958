// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{openshift_namespaces, output, GatherContext};
use crate::cluster::{ClusterClient, ListOptions, SERVICE_ACCOUNTS};
use crate::error::GatherError;
use crate::record::{JsonItem, Record};
use crate::registry::GatherOutput;
use crate::tree;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_SERVICE_ACCOUNTS: usize = 1000;
const DEFAULT_NAMESPACES: [&str; 3] = ["default", "kube-system", "kube-public"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceAccount {
    pub name: String,
    pub secrets: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct ServiceAccountsSummary {
    #[serde(rename = "TOTAL_COUNT")]
    pub total_count: usize,
    /// Last service account seen in each namespace.
    pub namespaces: BTreeMap<String, NamespaceAccount>,
}

#[derive(Debug, Serialize)]
struct ServiceAccountsReport {
    #[serde(rename = "serviceAccounts")]
    service_accounts: ServiceAccountsSummary,
}

pub async fn gather_service_accounts(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(service_accounts(ctx.client()).await)
}

async fn service_accounts(client: &dyn ClusterClient) -> Result<Vec<Record>, GatherError> {
    let openshift = match openshift_namespaces(client).await {
        Ok(namespaces) => namespaces,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut summary = ServiceAccountsSummary::default();
    let mut kept = 0usize;
    let options = ListOptions {
        limit: Some(MAX_SERVICE_ACCOUNTS as u32),
        ..ListOptions::default()
    };
    let namespaces = DEFAULT_NAMESPACES
        .iter()
        .map(|ns| ns.to_string())
        .chain(openshift);
    for namespace in namespaces {
        let accounts: Vec<Value> = match client
            .list(&SERVICE_ACCOUNTS, Some(&namespace), &options)
            .await
        {
            Ok(list) => list.items,
            Err(e) => {
                debug!("unable to read service accounts in namespace {}: {}", namespace, e);
                continue;
            }
        };
        summary.total_count += accounts.len();
        for account in &accounts {
            if kept >= MAX_SERVICE_ACCOUNTS {
                break;
            }
            kept += 1;
            summary.namespaces.insert(
                tree::namespace(account).to_string(),
                NamespaceAccount {
                    name: tree::name(account).to_string(),
                    secrets: tree::array_at(account, &["secrets"]).len(),
                },
            );
        }
    }

    Ok(vec![Record::new(
        "config/serviceaccounts",
        JsonItem(ServiceAccountsReport {
            service_accounts: summary,
        }),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeClusterClient;
    use crate::cluster::NAMESPACES;
    use serde_json::json;

    #[tokio::test]
    async fn test_service_accounts_summary() {
        let client = FakeClusterClient::new()
            .with_objects(
                &NAMESPACES,
                vec![
                    json!({"metadata": {"name": "openshift-etcd"}}),
                    json!({"metadata": {"name": "customer"}}),
                ],
            )
            .with_objects(
                &SERVICE_ACCOUNTS,
                vec![
                    json!({"metadata": {"name": "default", "namespace": "default"}, "secrets": [{"name": "a"}, {"name": "b"}]}),
                    json!({"metadata": {"name": "etcd", "namespace": "openshift-etcd"}, "secrets": [{"name": "c"}]}),
                    json!({"metadata": {"name": "app", "namespace": "customer"}}),
                ],
            );

        let records = service_accounts(&client).await.expect("gathered");
        assert_eq!(records[0].name, "config/serviceaccounts");
        let (data, _) = records[0].marshal().expect("marshal");
        let report: Value = serde_json::from_slice(&data).expect("json");
        assert_eq!(
            report,
            json!({"serviceAccounts": {
                "TOTAL_COUNT": 2,
                "namespaces": {
                    "default": {"name": "default", "secrets": 2},
                    "openshift-etcd": {"name": "etcd", "secrets": 1}
                }
            }})
        );
    }
}
