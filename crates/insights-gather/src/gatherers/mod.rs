// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The concrete gathering tasks.
//!
//! Every task is an async function taking the shared [`GatherContext`] and the
//! run token and returning its records together with the problems it hit.
//! [`register_all`] builds the registry the agent runs.

pub mod config_maps;
pub mod csr;
pub mod images;
pub mod metrics;
pub mod olm;
pub mod operators;
pub mod pod_logs;
pub mod pods;
pub mod resources;
pub mod sap;
pub mod service_accounts;
pub mod singletons;
pub mod workload;

use crate::cluster::{ApiResource, ClusterClient, ListOptions, NAMESPACES};
use crate::error::{ClusterError, GatherError};
use crate::pager::Pager;
use crate::record::Record;
use crate::registry::{GatherOutput, GatheringFunction, Registry};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use workload::ImageCache;

/// Page size of list calls that do not need a specific one.
pub(crate) const DEFAULT_PAGE_SIZE: u32 = 500;
const MAX_NAMESPACES: u32 = 1000;

/// State every task can reach.
pub struct GatherContext {
    pub client: Arc<dyn ClusterClient>,
    /// Base URL of the Prometheus federation endpoint. Metrics are skipped when unset.
    pub metrics_url: Option<String>,
    pub image_cache: Arc<ImageCache>,
}

impl GatherContext {
    pub fn new(client: Arc<dyn ClusterClient>, image_cache: Arc<ImageCache>) -> Self {
        GatherContext {
            client,
            metrics_url: None,
            image_cache,
        }
    }

    pub fn with_metrics_url(mut self, url: impl Into<String>) -> Self {
        self.metrics_url = Some(url.into());
        self
    }

    pub fn client(&self) -> &dyn ClusterClient {
        self.client.as_ref()
    }
}

/// Registers task functions bound to one shared context.
struct Catalog {
    registry: Registry,
    context: Arc<GatherContext>,
}

impl Catalog {
    fn bind<F, Fut>(&self, task: F) -> impl Fn(CancellationToken) -> Fut + Send + Sync + 'static
    where
        F: Fn(Arc<GatherContext>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GatherOutput> + Send + 'static,
    {
        let context = Arc::clone(&self.context);
        move |token| task(Arc::clone(&context), token)
    }

    fn important<F, Fut>(&mut self, name: &str, task: F) -> &mut Self
    where
        F: Fn(Arc<GatherContext>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GatherOutput> + Send + 'static,
    {
        let function = GatheringFunction::important(name, self.bind(task));
        self.registry.register(function);
        self
    }

    fn failable<F, Fut>(&mut self, name: &str, task: F) -> &mut Self
    where
        F: Fn(Arc<GatherContext>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GatherOutput> + Send + 'static,
    {
        let function = GatheringFunction::failable(name, self.bind(task));
        self.registry.register(function);
        self
    }
}

/// Registry with every task of the agent.
pub fn register_all(context: GatherContext) -> Registry {
    let mut catalog = Catalog {
        registry: Registry::new(),
        context: Arc::new(context),
    };

    catalog
        .important("pdbs", resources::gather_pod_disruption_budgets)
        .important("nodes", resources::gather_nodes)
        .important("crds", resources::gather_custom_resource_definitions)
        .important("host_subnets", resources::gather_host_subnets)
        .important("netnamespaces", resources::gather_net_namespaces)
        .important("machine_sets", resources::gather_machine_sets)
        .important("machine_config_pools", resources::gather_machine_config_pools)
        .important(
            "container_runtime_configs",
            resources::gather_container_runtime_configs,
        )
        .important(
            "mutating_webhook_configurations",
            resources::gather_mutating_webhook_configurations,
        )
        .important("psps", resources::gather_pod_security_policies)
        .failable(
            "pod_network_connectivity_checks",
            resources::gather_pod_network_connectivity_checks,
        );

    catalog
        .important("infrastructures", singletons::gather_infrastructure)
        .important("networks", singletons::gather_network)
        .important("authentication", singletons::gather_authentication)
        .important("oauths", singletons::gather_oauth)
        .important("ingress", singletons::gather_ingress)
        .important("proxies", singletons::gather_proxy)
        .important("feature_gates", singletons::gather_feature_gates)
        .important("image_registries", singletons::gather_image_registry)
        .important("image_pruners", singletons::gather_image_pruner)
        .important("version", singletons::gather_cluster_version);

    catalog
        .important("operators", operators::gather_cluster_operators)
        .important(
            "operators_pods_and_events",
            operators::gather_cluster_operator_pods_and_events,
        )
        .important("container_images", images::gather_container_images)
        .important("workload_info", workload::gather_workload_info)
        .important(
            "certificate_signing_requests",
            csr::gather_certificate_signing_requests,
        )
        .important("install_plans", olm::gather_install_plans)
        .important("service_accounts", service_accounts::gather_service_accounts)
        .failable("olm_operators", olm::gather_olm_operators)
        .failable("metrics", metrics::gather_most_recent_metrics)
        .failable("config_maps", config_maps::gather_config_maps);

    catalog
        .failable(
            "openshift_apiserver_operator_logs",
            pod_logs::gather_openshift_apiserver_operator_logs,
        )
        .failable("openshift_sdn_logs", pod_logs::gather_openshift_sdn_logs)
        .failable(
            "openshift_sdn_controller_logs",
            pod_logs::gather_openshift_sdn_controller_logs,
        )
        .failable(
            "openshift_authentication_logs",
            pod_logs::gather_openshift_authentication_logs,
        );

    catalog
        .failable("sap_config", sap::gather_sap_config)
        .failable("sap_pods", sap::gather_sap_pods)
        .failable("sap_datahubs", sap::gather_sap_datahubs)
        .failable(
            "sap_license_management_logs",
            sap::gather_sap_license_management_logs,
        );

    debug!("registered {} gathering functions", catalog.registry.len());
    catalog.registry
}

/// Turns a fallible task body into the `(records, errors)` pair.
pub(crate) fn output(result: Result<Vec<Record>, GatherError>) -> GatherOutput {
    match result {
        Ok(records) => (records, Vec::new()),
        Err(error) => (Vec::new(), vec![error]),
    }
}

/// Lists every item of `resource`, following continuation tokens.
///
/// A resource kind the cluster does not serve lists as empty.
pub(crate) async fn list_all(
    client: &dyn ClusterClient,
    resource: &ApiResource,
    namespace: Option<&str>,
    options: ListOptions,
) -> Result<Vec<Value>, ClusterError> {
    let mut pager = Pager::new(client, resource)
        .limit(DEFAULT_PAGE_SIZE)
        .options(options);
    if let Some(namespace) = namespace {
        pager = pager.namespace(namespace);
    }
    match pager.collect().await {
        Ok(paged) => Ok(paged.items),
        Err(e) if e.is_not_found() => {
            debug!("{} is not served by the cluster", resource);
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

/// Names of the first thousand namespaces starting with `openshift`.
pub(crate) async fn openshift_namespaces(
    client: &dyn ClusterClient,
) -> Result<Vec<String>, ClusterError> {
    let namespaces = Pager::new(client, &NAMESPACES)
        .limit(MAX_NAMESPACES)
        .cap(MAX_NAMESPACES as usize)
        .collect()
        .await?
        .items;
    Ok(namespaces
        .iter()
        .map(crate::tree::name)
        .filter(|name| name.starts_with("openshift"))
        .map(String::from)
        .collect())
}

/// Lower cased kind and group of a resource tree, as used in operator record names.
pub(crate) fn group_and_kind(resource: &Value) -> (String, String) {
    let group = crate::tree::str_at(resource, &["apiVersion"])
        .and_then(|api_version| api_version.rsplit_once('/'))
        .map(|(group, _)| group.to_string())
        .unwrap_or_default();
    let kind = crate::tree::str_at(resource, &["kind"])
        .unwrap_or_default()
        .to_lowercase();
    (group, kind)
}
