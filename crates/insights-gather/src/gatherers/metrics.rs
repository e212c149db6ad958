// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{output, GatherContext};
use crate::cluster::ClusterClient;
use crate::error::GatherError;
use crate::logs::{count_lines, LineLimitedReader};
use crate::record::{RawBytes, Record};
use crate::registry::GatherOutput;
use std::io::{Cursor, Read};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub const ALERTS_LINES_LIMIT: usize = 1000;

/// Series federated from Prometheus besides the alerts.
const FEDERATED_SERIES: [&str; 5] = [
    "etcd_object_counts",
    "cluster_installer",
    "namespace:container_cpu_usage_seconds_total:sum_rate",
    "namespace:container_memory_usage_bytes:sum",
    "vsphere_node_hw_version_total",
];

fn matches<'a>(series: impl IntoIterator<Item = &'a str>) -> Vec<(String, String)> {
    series
        .into_iter()
        .map(|name| ("match[]".to_string(), name.to_string()))
        .collect()
}

/// Selected series and at most [`ALERTS_LINES_LIMIT`] lines of firing alerts.
pub async fn gather_most_recent_metrics(
    ctx: Arc<GatherContext>,
    _: CancellationToken,
) -> GatherOutput {
    let Some(url) = ctx.metrics_url.as_deref() else {
        debug!("no metrics endpoint configured, no metrics will be collected");
        return (Vec::new(), Vec::new());
    };
    output(most_recent_metrics(ctx.client(), url).await)
}

async fn most_recent_metrics(
    client: &dyn ClusterClient,
    base_url: &str,
) -> Result<Vec<Record>, GatherError> {
    let federate = format!("{}/federate", base_url.trim_end_matches('/'));

    let mut data = client
        .raw_get(&federate, &matches(FEDERATED_SERIES))
        .await
        .inspect_err(|e| error!("unable to retrieve most recent metrics: {}", e))?;

    let alerts = client
        .raw_get(&federate, &matches(["ALERTS"]))
        .await
        .inspect_err(|e| error!("unable to retrieve most recent alerts from metrics: {}", e))?;

    let mut reader = LineLimitedReader::new(Cursor::new(alerts), ALERTS_LINES_LIMIT);
    let mut kept = Vec::new();
    reader.read_to_end(&mut kept)?;
    let read = reader.total_lines_read();
    let remaining = count_lines(reader.into_inner())?;
    let total = read + remaining;

    data.extend_from_slice(format!("# ALERTS {total}/{ALERTS_LINES_LIMIT}\n").as_bytes());
    data.extend_from_slice(&kept);
    Ok(vec![Record::new("config/metrics", RawBytes(data))])
}
