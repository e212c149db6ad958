// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Anonymous fingerprint of the workloads running on the cluster.
//!
//! Namespaces, commands and arguments are hashed. Pods of a namespace are
//! reduced to the distinct "shapes" of their containers and the images those
//! containers run are described by their layer ids.

use super::GatherContext;
use crate::cluster::{ClusterClient, IMAGES, PODS};
use crate::engine::SharedLru;
use crate::error::{ClusterError, GatherError};
use crate::pager::Pager;
use crate::record::{JsonItem, Record};
use crate::registry::GatherOutput;
use crate::tree;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const WORKLOAD_PAGE_SIZE: u32 = 500;
const PODS_LIMIT: usize = 3000;
const HASH_LENGTH: usize = 12;

/// Image descriptions kept across gathers, keyed by image id.
pub type ImageCache = SharedLru<String, WorkloadImage>;

#[derive(Debug, Default, Serialize)]
pub struct WorkloadPods {
    #[serde(rename = "pods")]
    pub pod_count: usize,
    #[serde(rename = "imageCount")]
    pub image_count: usize,
    pub images: BTreeMap<String, WorkloadImage>,
    pub namespaces: BTreeMap<String, NamespacePods>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkloadImage {
    #[serde(rename = "layerIDs")]
    pub layer_ids: Vec<String>,
    #[serde(rename = "firstCommand", skip_serializing_if = "String::is_empty")]
    pub first_command: String,
    #[serde(rename = "firstArg", skip_serializing_if = "String::is_empty")]
    pub first_arg: String,
}

impl WorkloadImage {
    pub fn is_empty(&self) -> bool {
        self.layer_ids.is_empty()
    }
}

#[derive(Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespacePods {
    pub count: usize,
    #[serde(skip_serializing_if = "is_zero")]
    pub terminal_count: usize,
    #[serde(skip_serializing_if = "is_zero")]
    pub ignored_count: usize,
    #[serde(skip_serializing_if = "is_zero")]
    pub invalid_count: usize,
    pub shapes: Vec<PodShape>,
}

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct PodShape {
    #[serde(skip_serializing_if = "is_zero")]
    pub duplicates: usize,
    #[serde(rename = "restartAlways")]
    pub restart_always: bool,
    #[serde(rename = "initContainers", skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<ContainerShape>,
    pub containers: Vec<ContainerShape>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerShape {
    #[serde(rename = "imageID")]
    pub image_id: String,
    #[serde(rename = "firstCommand", skip_serializing_if = "String::is_empty")]
    pub first_command: String,
    #[serde(rename = "firstArg", skip_serializing_if = "String::is_empty")]
    pub first_arg: String,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// First twelve characters of the unpadded URL safe base64 SHA-256 of `s`.
pub fn workload_hash(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(HASH_LENGTH);
    encoded
}

/// Reduces a command or argument to the part that identifies the program:
/// the first word, without its directory, and without the value of a flag.
pub fn workload_argument(s: &str) -> &str {
    let mut s = s.trim();
    if let Some(space) = s.find(' ') {
        s = &s[..space];
    }
    if s.starts_with('-') {
        match s.find('=') {
            Some(eq) => s = &s[..eq],
            None => return "",
        }
    }
    s = s.trim_matches(|c| c == '/' || c == '\\');
    if let Some(slash) = s.rfind('/') {
        s = &s[slash + 1..];
    } else if let Some(backslash) = s.rfind('\\') {
        s = &s[backslash + 1..];
    }
    s
}

fn hashed_first(values: &[Value]) -> String {
    values
        .first()
        .and_then(Value::as_str)
        .map(|first| workload_hash(workload_argument(first)))
        .unwrap_or_default()
}

/// Digest part of an image reference, empty when it has none.
pub fn image_id_from_reference(reference: &str) -> &str {
    match reference.rsplit_once('@') {
        Some((name, digest)) if !name.is_empty() && digest.contains(':') => digest,
        _ => "",
    }
}

fn matching_spec<'a>(name: &str, spec: &'a [Value], hint: usize) -> Option<&'a Value> {
    spec.get(hint)
        .filter(|container| tree::str_at(container, &["name"]) == Some(name))
        .or_else(|| {
            spec.iter()
                .find(|container| tree::str_at(container, &["name"]) == Some(name))
        })
}

/// Shapes of the containers listed in `statuses`, `None` when a status does
/// not match a spec or no image id can be found.
fn container_shapes(spec: &[Value], statuses: &[Value]) -> Option<Vec<ContainerShape>> {
    statuses
        .iter()
        .enumerate()
        .map(|(i, status)| {
            let name = tree::str_at(status, &["name"]).unwrap_or_default();
            let Some(container) = matching_spec(name, spec, i) else {
                debug!("unable to match {} to a container spec", name);
                return None;
            };
            let status_image = tree::str_at(status, &["imageID"]).unwrap_or_default();
            let mut image_id =
                image_id_from_reference(status_image.trim_start_matches("docker-pullable://"));
            if image_id.is_empty() {
                image_id =
                    image_id_from_reference(tree::str_at(container, &["image"]).unwrap_or_default());
            }
            if image_id.is_empty() {
                return None;
            }
            Some(ContainerShape {
                image_id: image_id.to_string(),
                first_command: hashed_first(tree::array_at(container, &["command"])),
                first_arg: hashed_first(tree::array_at(container, &["args"])),
            })
        })
        .collect()
}

/// Outcome of classifying a single pod.
enum PodClass {
    Terminal,
    Ignored,
    Invalid,
    Shaped(PodShape),
}

fn classify_pod(pod: &Value) -> PodClass {
    let phase = tree::str_at(pod, &["status", "phase"]).unwrap_or_default();
    if phase == "Succeeded" || phase == "Failed" {
        return PodClass::Terminal;
    }
    if phase != "Running" && phase != "Pending" {
        return PodClass::Ignored;
    }
    let init_spec = tree::array_at(pod, &["spec", "initContainers"]);
    let init_status = tree::array_at(pod, &["status", "initContainerStatuses"]);
    let spec = tree::array_at(pod, &["spec", "containers"]);
    let status = tree::array_at(pod, &["status", "containerStatuses"]);
    if init_spec.len() != init_status.len() || spec.len() != status.len() {
        return PodClass::Ignored;
    }

    let (Some(init_containers), Some(containers)) = (
        container_shapes(init_spec, init_status),
        container_shapes(spec, status),
    ) else {
        return PodClass::Invalid;
    };
    PodClass::Shaped(PodShape {
        duplicates: 0,
        restart_always: tree::str_at(pod, &["spec", "restartPolicy"]) == Some("Always"),
        init_containers,
        containers,
    })
}

impl NamespacePods {
    /// Counts `pod` and returns the image ids of a shape seen for the first time.
    fn add(&mut self, pod: &Value) -> Vec<String> {
        self.count += 1;
        let shape = match classify_pod(pod) {
            PodClass::Terminal => {
                self.terminal_count += 1;
                return Vec::new();
            }
            PodClass::Ignored => {
                self.ignored_count += 1;
                return Vec::new();
            }
            PodClass::Invalid => {
                self.invalid_count += 1;
                return Vec::new();
            }
            PodClass::Shaped(shape) => shape,
        };

        // Only the previous shape is compared; pods are listed grouped by owner.
        if let Some(last) = self.shapes.last_mut() {
            if last.init_containers == shape.init_containers && last.containers == shape.containers
            {
                last.duplicates += 1;
                return Vec::new();
            }
        }
        let images = shape
            .init_containers
            .iter()
            .chain(&shape.containers)
            .map(|container| container.image_id.clone())
            .collect();
        self.shapes.push(shape);
        images
    }
}

/// Layer ids and hashed entrypoint of an image object.
pub fn workload_image(image: &Value) -> WorkloadImage {
    let layer_ids = tree::array_at(image, &["dockerImageLayers"])
        .iter()
        .filter_map(|layer| tree::str_at(layer, &["name"]))
        .map(String::from)
        .collect();
    let config = ["dockerImageMetadata", "ContainerConfig"];
    WorkloadImage {
        layer_ids,
        first_command: hashed_first(tree::array_at(image, &[config[0], config[1], "Entrypoint"])),
        first_arg: hashed_first(tree::array_at(image, &[config[0], config[1], "Cmd"])),
    }
}

pub async fn gather_workload_info(ctx: Arc<GatherContext>, token: CancellationToken) -> GatherOutput {
    match workload_info(ctx.client(), &ctx.image_cache, &token).await {
        Ok((info, limit_reached)) => {
            let records = vec![Record::new("config/workload_info", JsonItem(info))];
            let errors = if limit_reached {
                vec![GatherError::Warning(format!(
                    "The {PODS_LIMIT} limit for number of pods gathered was reached"
                ))]
            } else {
                Vec::new()
            };
            (records, errors)
        }
        Err(e) => (Vec::new(), vec![e]),
    }
}

async fn workload_info(
    client: &dyn ClusterClient,
    cache: &ImageCache,
    token: &CancellationToken,
) -> Result<(WorkloadPods, bool), GatherError> {
    let start = Instant::now();
    let mut info = WorkloadPods::default();
    let mut current: Option<(String, NamespacePods)> = None;
    let mut image_ids: Vec<String> = Vec::new();
    let mut seen_images: HashSet<String> = HashSet::new();
    let mut limit_reached = false;

    let mut pager = Pager::new(client, &PODS).limit(WORKLOAD_PAGE_SIZE);
    'pages: while let Some(pods) = pager.next_page().await? {
        for pod in &pods {
            let namespace = tree::namespace(pod);
            if current.as_ref().map(|(name, _)| name.as_str()) != Some(namespace) {
                if let Some((name, pods)) = current.take() {
                    info.pod_count += pods.count;
                    info.namespaces.insert(workload_hash(&name), pods);
                }
                current = Some((namespace.to_string(), NamespacePods::default()));
            }
            let Some((_, namespace_pods)) = current.as_mut() else {
                continue;
            };
            if info.pod_count + namespace_pods.count >= PODS_LIMIT {
                limit_reached = true;
                break 'pages;
            }
            for image_id in namespace_pods.add(pod) {
                if seen_images.insert(image_id.clone()) {
                    image_ids.push(image_id);
                }
            }
        }
    }
    if let Some((name, pods)) = current.take() {
        info.pod_count += pods.count;
        info.namespaces.insert(workload_hash(&name), pods);
    }

    cache.resize_for(info.pod_count);

    let wait = Duration::from_millis(info.pod_count as u64 * 100) + Duration::from_secs(15);
    debug!(
        "loaded {} pods in {:?}, will wait {:?} for image data",
        info.pod_count,
        start.elapsed(),
        wait
    );
    let mut images = BTreeMap::new();
    let fetch = fetch_images(client, cache, &image_ids, &mut images);
    tokio::select! {
        _ = token.cancelled() => debug!("image lookup cancelled"),
        _ = tokio::time::timeout(wait, fetch) => {}
    }

    info.image_count = images.len();
    images.retain(|_, image: &mut WorkloadImage| !image.is_empty());
    info.images = images;
    Ok((info, limit_reached))
}

/// Describes each image id, from the cache when possible.
///
/// Images that cannot be found are recorded as empty so they are not asked for twice.
async fn fetch_images(
    client: &dyn ClusterClient,
    cache: &ImageCache,
    image_ids: &[String],
    images: &mut BTreeMap<String, WorkloadImage>,
) {
    for image_id in image_ids {
        if let Some(image) = cache.get(image_id) {
            images.insert(image_id.clone(), image);
            continue;
        }
        images.insert(image_id.clone(), WorkloadImage::default());
        let start = Instant::now();
        match client.get(&IMAGES, None, image_id).await {
            Ok(image) => {
                debug!("found image {} ({:?})", image_id, start.elapsed());
                let image = workload_image(&image);
                cache.put(image_id.clone(), image.clone());
                images.insert(image_id.clone(), image);
            }
            Err(ClusterError::NotFound(_)) => {
                debug!("no image {} ({:?})", image_id, start.elapsed());
            }
            Err(e) => error!("unable to retrieve image {}: {}", image_id, e),
        }
    }
}
