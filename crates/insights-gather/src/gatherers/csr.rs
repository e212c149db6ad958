// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{output, GatherContext};
use crate::anonymize::csr::{anonymize_csr, include_csr};
use crate::cluster::{ClusterClient, CERTIFICATE_SIGNING_REQUESTS};
use crate::error::GatherError;
use crate::pager::Pager;
use crate::record::{JsonItem, Record};
use crate::registry::GatherOutput;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const CSR_LIMIT: u32 = 5000;

/// Redacted features of the certificate signing requests that are pending,
/// failed verification or carry a certificate outside its validity window.
pub async fn gather_certificate_signing_requests(
    ctx: Arc<GatherContext>,
    _: CancellationToken,
) -> GatherOutput {
    output(certificate_signing_requests(ctx.client(), Utc::now()).await)
}

async fn certificate_signing_requests(
    client: &dyn ClusterClient,
    now: DateTime<Utc>,
) -> Result<Vec<Record>, GatherError> {
    let requests = match Pager::new(client, &CERTIFICATE_SIGNING_REQUESTS)
        .limit(CSR_LIMIT)
        .cap(CSR_LIMIT as usize)
        .collect()
        .await
    {
        Ok(paged) => paged.items,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    Ok(requests
        .iter()
        .map(anonymize_csr)
        .filter(|features| include_csr(features, now))
        .map(|features| {
            let name = crate::tree::str_at(&features.object_meta, &["name"])
                .unwrap_or_default()
                .to_string();
            Record::new(
                format!("config/certificatesigningrequests/{name}"),
                JsonItem(features),
            )
        })
        .collect())
}
