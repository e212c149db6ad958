// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Red Hat images run by the cluster, counted by the month the pods started.

use super::pods::has_container_in_crashloop;
use super::{output, GatherContext};
use crate::anonymize::resources::anonymize_pod;
use crate::cluster::{ClusterClient, PODS};
use crate::error::GatherError;
use crate::pager::Pager;
use crate::record::{AnonymizedItem, JsonItem, Record};
use crate::registry::GatherOutput;
use crate::tree;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const IMAGE_GATHER_POD_LIMIT: u32 = 200;

fn image_host_regex() -> &'static Regex {
    static HOST: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    HOST.get_or_init(|| {
        Regex::new(r"(^|\.)(openshift\.org|registry\.redhat\.io|registry\.access\.redhat\.com)$")
            .expect("valid image host regex")
    })
}

/// Host part of an image reference, which usually lacks a scheme.
pub fn image_host(image: &str) -> Option<&str> {
    let rest = match image.split_once("://") {
        Some((_, rest)) => rest,
        None => image,
    };
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let host = match host_port.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => host_port,
    };
    (!host.is_empty()).then_some(host)
}

pub fn is_red_hat_image(image: &str) -> bool {
    image_host(image).is_some_and(|host| image_host_regex().is_match(host))
}

/// Images and how many containers ran them, per month of pod creation.
#[derive(Debug, Default, Serialize)]
pub struct ContainerInfo {
    pub images: BTreeMap<usize, String>,
    pub containers: BTreeMap<String, BTreeMap<usize, u64>>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl ContainerInfo {
    pub fn add(&mut self, image: &str, month: String) {
        let index = match self.index.get(image) {
            Some(index) => *index,
            None => {
                let index = self.images.len();
                self.images.insert(index, image.to_string());
                self.index.insert(image.to_string(), index);
                index
            }
        };
        *self
            .containers
            .entry(month)
            .or_default()
            .entry(index)
            .or_default() += 1;
    }
}

pub async fn gather_container_images(
    ctx: Arc<GatherContext>,
    _: CancellationToken,
) -> GatherOutput {
    output(container_images(ctx.client()).await)
}

async fn container_images(client: &dyn ClusterClient) -> Result<Vec<Record>, GatherError> {
    let mut records = Vec::new();
    let mut info = ContainerInfo::default();
    let mut pager = Pager::new(client, &PODS).limit(IMAGE_GATHER_POD_LIMIT);

    while let Some(pods) = pager.next_page().await? {
        for pod in pods {
            let namespace = tree::namespace(&pod);
            if namespace.starts_with("openshift") && has_container_in_crashloop(&pod) {
                records.push(Record::new(
                    format!("config/pod/{}/{}", namespace, tree::name(&pod)),
                    AnonymizedItem::new(pod, anonymize_pod),
                ));
                continue;
            }
            if tree::str_at(&pod, &["status", "phase"]) != Some("Running") {
                continue;
            }
            let month = tree::time_at(&pod, &["metadata", "creationTimestamp"])
                .map(|created| created.format("%Y-%m").to_string())
                .unwrap_or_default();
            for container in tree::array_at(&pod, &["spec", "containers"]) {
                let image = tree::str_at(container, &["image"]).unwrap_or_default();
                if image_host(image).is_none() {
                    debug!("unable to parse container image reference {:?}", image);
                    continue;
                }
                if is_red_hat_image(image) {
                    info.add(image, month.clone());
                }
            }
        }
    }

    records.push(Record::new("config/running_containers", JsonItem(info)));
    Ok(records)
}
