// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Operator Lifecycle Manager install plans and operators.

use super::{openshift_namespaces, output, GatherContext};
use crate::cluster::{ClusterClient, ListOptions, INSTALL_PLANS, OLM_OPERATORS};
use crate::error::GatherError;
use crate::pager::Pager;
use crate::record::{JsonItem, Record};
use crate::registry::GatherOutput;
use crate::tree;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

const INSTALL_PLANS_PAGE_SIZE: u32 = 500;
pub const INSTALL_PLANS_TOP_X: usize = 100;
const NO_CSV: &str = "[NONE]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectedPlan {
    pub ns: String,
    pub name: String,
    pub csv: String,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct InstallPlanStats {
    #[serde(rename = "TOTAL_COUNT")]
    pub total_count: usize,
    #[serde(rename = "TOTAL_NONUNIQ_COUNT")]
    pub unique_count: usize,
}

#[derive(Debug, Serialize)]
pub struct InstallPlansReport {
    pub stats: InstallPlanStats,
    pub items: Vec<CollectedPlan>,
}

/// Install plans grouped by namespace, generate name and first CSV.
#[derive(Debug, Default)]
pub struct InstallPlanCounter {
    plans: BTreeMap<String, CollectedPlan>,
    total: usize,
}

impl InstallPlanCounter {
    pub fn add(&mut self, plan: &Value) {
        self.total += 1;
        let ns = tree::namespace(plan);
        let name = tree::str_at(plan, &["metadata", "generateName"]).unwrap_or_default();
        let csv = tree::array_at(plan, &["spec", "clusterServiceVersionNames"])
            .first()
            .and_then(Value::as_str)
            .unwrap_or(NO_CSV);
        self.plans
            .entry(format!("{ns}.{name}.{csv}"))
            .and_modify(|collected| collected.count += 1)
            .or_insert_with(|| CollectedPlan {
                ns: ns.to_string(),
                name: name.to_string(),
                csv: csv.to_string(),
                count: 1,
            });
    }

    /// The `limit` most frequent plans, most frequent first.
    pub fn report(&self, limit: usize) -> InstallPlansReport {
        let mut counts: Vec<usize> = self.plans.values().map(|plan| plan.count).collect();
        counts.sort_unstable_by(|a, b| b.cmp(a));
        let threshold = match counts.get(limit.saturating_sub(1)) {
            Some(count) if counts.len() > limit => *count,
            _ => 0,
        };

        let mut items: Vec<CollectedPlan> = self
            .plans
            .values()
            .filter(|plan| plan.count >= threshold)
            .take(limit)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.count.cmp(&a.count));

        InstallPlansReport {
            stats: InstallPlanStats {
                total_count: self.total,
                unique_count: self.plans.len(),
            },
            items,
        }
    }
}

pub async fn gather_install_plans(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    output(install_plans(ctx.client()).await)
}

async fn install_plans(client: &dyn ClusterClient) -> Result<Vec<Record>, GatherError> {
    let namespaces = match openshift_namespaces(client).await {
        Ok(namespaces) => namespaces,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut counter = InstallPlanCounter::default();
    for namespace in &namespaces {
        let mut pager = Pager::new(client, &INSTALL_PLANS)
            .namespace(namespace)
            .limit(INSTALL_PLANS_PAGE_SIZE);
        loop {
            match pager.next_page().await {
                Ok(Some(plans)) => plans.iter().for_each(|plan| counter.add(plan)),
                Ok(None) => break,
                Err(e) if e.is_not_found() => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(vec![Record::new(
        "config/installplans",
        JsonItem(counter.report(INSTALL_PLANS_TOP_X)),
    )])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OlmOperator {
    pub name: String,
    pub version: String,
}

/// Version part of a `ClusterServiceVersion` reference name such as `etcd.v0.9.4`.
fn version_from_ref(reference: &Value) -> Option<&str> {
    if tree::str_at(reference, &["kind"]) != Some("ClusterServiceVersion") {
        return None;
    }
    let (_, version) = tree::str_at(reference, &["name"])?.split_once('.')?;
    (!version.is_empty()).then_some(version)
}

pub fn olm_operators_from(operators: &[Value]) -> Vec<OlmOperator> {
    let mut found: Vec<OlmOperator> = Vec::new();
    for operator in operators {
        let Some(refs) = tree::walk(operator, &["status", "components", "refs"])
            .ok()
            .and_then(Value::as_array)
        else {
            error!(
                "cannot find \"status.components.refs\" in {} definition",
                tree::name(operator)
            );
            continue;
        };
        for version in refs.iter().filter_map(version_from_ref) {
            let olm = OlmOperator {
                name: tree::name(operator).to_string(),
                version: version.to_string(),
            };
            if !found.contains(&olm) {
                found.push(olm);
            }
        }
    }
    found
}

pub async fn gather_olm_operators(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    let operators = match ctx
        .client()
        .list(&OLM_OPERATORS, None, &ListOptions::default())
        .await
    {
        Ok(list) => list.items,
        Err(e) if e.is_not_found() => return (Vec::new(), Vec::new()),
        Err(e) => return (Vec::new(), vec![e.into()]),
    };
    let found = olm_operators_from(&operators);
    if found.is_empty() {
        return (Vec::new(), Vec::new());
    }
    (
        vec![Record::new("config/olm_operators", JsonItem(found))],
        Vec::new(),
    )
}
