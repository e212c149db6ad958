// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Known error messages of the last day from platform component logs.

use super::GatherContext;
use crate::logs::{
    collect_logs_from_containers, errors_log_name, LogContainersFilter, LogMessagesFilter,
};
use crate::registry::GatherOutput;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One day.
pub const LOGS_SINCE_SECONDS: i64 = 86400;
pub const LOGS_LIMIT_BYTES: i64 = 64 * 1024;

async fn errors_logs(
    ctx: &GatherContext,
    token: &CancellationToken,
    containers: LogContainersFilter,
    messages: LogMessagesFilter,
) -> GatherOutput {
    let messages = messages
        .since_seconds(LOGS_SINCE_SECONDS)
        .limit_bytes(LOGS_LIMIT_BYTES);
    match collect_logs_from_containers(ctx.client(), token, &containers, &messages, errors_log_name)
        .await
    {
        Ok((records, warnings)) => (records, warnings),
        Err(e) => (Vec::new(), vec![e]),
    }
}

pub async fn gather_openshift_apiserver_operator_logs(
    ctx: Arc<GatherContext>,
    token: CancellationToken,
) -> GatherOutput {
    errors_logs(
        &ctx,
        &token,
        LogContainersFilter::namespace("openshift-apiserver-operator"),
        LogMessagesFilter::substrings([
            "the server has received too many requests and has asked us",
            "because serving request timed out and response had been started",
        ]),
    )
    .await
}

pub async fn gather_openshift_sdn_logs(
    ctx: Arc<GatherContext>,
    token: CancellationToken,
) -> GatherOutput {
    errors_logs(
        &ctx,
        &token,
        LogContainersFilter::namespace("openshift-sdn").label_selector("app=sdn"),
        LogMessagesFilter::substrings([
            "Got OnEndpointsUpdate for unknown Endpoints",
            "Got OnEndpointsDelete for unknown Endpoints",
            "Unable to update proxy firewall for policy",
            "Failed to update proxy firewall for policy",
        ]),
    )
    .await
}

pub async fn gather_openshift_sdn_controller_logs(
    ctx: Arc<GatherContext>,
    token: CancellationToken,
) -> GatherOutput {
    errors_logs(
        &ctx,
        &token,
        LogContainersFilter::namespace("openshift-sdn").label_selector("app=sdn-controller"),
        LogMessagesFilter::regex([
            r"Node.+is not Ready",
            r"Node.+may be offline\.\.\. retrying",
            r"Node.+is offline",
            r"Node.+is back online",
        ]),
    )
    .await
}

pub async fn gather_openshift_authentication_logs(
    ctx: Arc<GatherContext>,
    token: CancellationToken,
) -> GatherOutput {
    errors_logs(
        &ctx,
        &token,
        LogContainersFilter::namespace("openshift-authentication")
            .label_selector("app=oauth-openshift"),
        LogMessagesFilter::substrings(["AuthenticationError: invalid resource name"]),
    )
    .await
}
