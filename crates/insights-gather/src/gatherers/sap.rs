// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SAP Data Hub installations.
//!
//! Every task here starts from the `datahubs` custom resources and records
//! nothing on clusters without them.

use super::pod_logs::{LOGS_LIMIT_BYTES, LOGS_SINCE_SECONDS};
use super::pods::pod_record;
use super::{list_all, output, GatherContext};
use crate::cluster::{
    get_optional, ClusterClient, ListOptions, CLUSTER_ROLE_BINDINGS, JOBS, PODS,
    SAP_DATAHUBS, SECURITY_CONTEXT_CONSTRAINTS,
};
use crate::error::{ClusterError, GatherError};
use crate::logs::{
    collect_logs_from_containers, errors_log_name, LogContainersFilter, LogMessagesFilter,
};
use crate::record::{Record, ResourceItem};
use crate::registry::GatherOutput;
use crate::tree;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SCC_NAMES: [&str; 2] = ["anyuid", "privileged"];
const CRB_NAMES: [&str; 2] = [
    "system:openshift:scc:anyuid",
    "system:openshift:scc:privileged",
];
const LICENSE_MANAGEMENT_MESSAGES: [&str; 1] = ["can't initialize iptables table"];

fn iptables_container_regex() -> &'static Regex {
    static IPTABLES: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    IPTABLES.get_or_init(|| Regex::new("^vsystem-iptables$").expect("valid container regex"))
}

async fn datahubs(client: &dyn ClusterClient) -> Result<Vec<Value>, ClusterError> {
    list_all(client, &SAP_DATAHUBS, None, ListOptions::default()).await
}

/// Namespaces holding at least one datahub, each once and in order.
fn datahub_namespaces(datahubs: &[Value]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    datahubs
        .iter()
        .map(tree::namespace)
        .filter(|namespace| seen.insert(namespace.to_string()))
        .map(String::from)
        .collect()
}

pub async fn gather_sap_config(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(sap_config(ctx.client()).await)
}

/// Security context constraints and their role bindings SAP installs rely on.
async fn sap_config(client: &dyn ClusterClient) -> Result<Vec<Record>, GatherError> {
    if datahubs(client).await?.is_empty() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for name in SCC_NAMES {
        if let Some(scc) = get_optional(client, &SECURITY_CONTEXT_CONSTRAINTS, None, name).await? {
            records.push(Record::new(
                format!("config/securitycontextconstraint/{}", tree::name(&scc)),
                ResourceItem(scc),
            ));
        }
    }
    for name in CRB_NAMES {
        if let Some(crb) = get_optional(client, &CLUSTER_ROLE_BINDINGS, None, name).await? {
            records.push(Record::new(
                format!(
                    "config/clusterrolebinding/{}",
                    tree::name(&crb).replace(':', "_")
                ),
                ResourceItem(crb),
            ));
        }
    }
    Ok(records)
}

pub async fn gather_sap_pods(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(sap_pods(ctx.client()).await)
}

/// Pods of datahub namespaces that are neither running nor done.
///
/// Pods owned by a job that already succeeded once are left out.
async fn sap_pods(client: &dyn ClusterClient) -> Result<Vec<Record>, GatherError> {
    let datahubs = datahubs(client).await?;

    let mut records = Vec::new();
    for namespace in datahub_namespaces(&datahubs) {
        let pods = list_all(client, &PODS, Some(&namespace), ListOptions::default()).await?;
        for pod in &pods {
            if matches!(
                tree::str_at(pod, &["status", "phase"]),
                Some("Running") | Some("Succeeded")
            ) {
                continue;
            }
            if owned_by_successful_job(client, pod).await? {
                continue;
            }
            records.push(pod_record(pod));
        }
    }
    Ok(records)
}

async fn owned_by_successful_job(
    client: &dyn ClusterClient,
    pod: &Value,
) -> Result<bool, ClusterError> {
    let owners = tree::array_at(pod, &["metadata", "ownerReferences"])
        .iter()
        .filter(|owner| tree::str_at(owner, &["kind"]) == Some("Job"))
        .filter_map(|owner| tree::str_at(owner, &["name"]));
    for owner in owners {
        let job = client.get(&JOBS, Some(tree::namespace(pod)), owner).await?;
        if tree::i64_at(&job, &["status", "succeeded"]).unwrap_or(0) > 0 {
            debug!("pod {} belongs to the successful job {}", tree::name(pod), owner);
            return Ok(true);
        }
    }
    Ok(false)
}

pub async fn gather_sap_datahubs(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(sap_datahubs(ctx.client()).await)
}

async fn sap_datahubs(client: &dyn ClusterClient) -> Result<Vec<Record>, GatherError> {
    Ok(datahubs(client)
        .await?
        .into_iter()
        .map(|datahub| {
            let name = format!(
                "customresources/{}/{}/{}/{}",
                SAP_DATAHUBS.group,
                SAP_DATAHUBS.plural,
                tree::namespace(&datahub),
                tree::name(&datahub)
            );
            Record::new(name, ResourceItem(datahub))
        })
        .collect())
}

/// iptables failures of the license management containers.
pub async fn gather_sap_license_management_logs(
    ctx: Arc<GatherContext>,
    token: CancellationToken,
) -> GatherOutput {
    let client = ctx.client();
    let datahubs = match datahubs(client).await {
        Ok(datahubs) => datahubs,
        Err(e) => return (Vec::new(), vec![e.into()]),
    };

    let messages = LogMessagesFilter::substrings(LICENSE_MANAGEMENT_MESSAGES)
        .since_seconds(LOGS_SINCE_SECONDS)
        .limit_bytes(LOGS_LIMIT_BYTES);
    let mut records = Vec::new();
    let mut errors = Vec::new();
    for datahub in &datahubs {
        let containers = LogContainersFilter::namespace(tree::namespace(datahub))
            .container_name_regex(iptables_container_regex().clone());
        match collect_logs_from_containers(client, &token, &containers, &messages, errors_log_name)
            .await
        {
            Ok((found, warnings)) => {
                records.extend(found);
                errors.extend(warnings);
            }
            Err(e) => errors.push(e),
        }
    }
    (records, errors)
}
