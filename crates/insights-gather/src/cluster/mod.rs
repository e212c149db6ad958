// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Access to the cluster API.
//!
//! Gathering tasks only see the [`ClusterClient`] trait and handle resources
//! as untyped JSON trees. [`http::KubeClient`] talks to a real API server.

pub mod http;

#[cfg(test)]
pub(crate) mod fake;

use crate::error::ClusterError;
use crate::logs::PodLogOptions;
use async_trait::async_trait;
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::pin::Pin;
use tokio::io::AsyncBufRead;

/// Group, version and plural name of a resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApiResource {
    pub group: Cow<'static, str>,
    pub version: Cow<'static, str>,
    pub plural: Cow<'static, str>,
    pub namespaced: bool,
}

impl ApiResource {
    pub const fn new(
        group: &'static str,
        version: &'static str,
        plural: &'static str,
        namespaced: bool,
    ) -> Self {
        ApiResource {
            group: Cow::Borrowed(group),
            version: Cow::Borrowed(version),
            plural: Cow::Borrowed(plural),
            namespaced,
        }
    }

    /// A resource discovered at runtime.
    pub fn dynamic(group: String, version: String, plural: String, namespaced: bool) -> Self {
        ApiResource {
            group: Cow::Owned(group),
            version: Cow::Owned(version),
            plural: Cow::Owned(plural),
            namespaced,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// REST path of the collection, or of one object when `name` is given.
    pub fn path(&self, namespace: Option<&str>, name: Option<&str>) -> String {
        let mut path = if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        };
        if let Some(namespace) = namespace.filter(|ns| self.namespaced && !ns.is_empty()) {
            path.push_str("/namespaces/");
            path.push_str(namespace);
        }
        path.push('/');
        path.push_str(&self.plural);
        if let Some(name) = name {
            path.push('/');
            path.push_str(name);
        }
        path
    }
}

impl fmt::Display for ApiResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.plural)
        } else {
            write!(f, "{}.{}", self.plural, self.group)
        }
    }
}

pub static PODS: ApiResource = ApiResource::new("", "v1", "pods", true);
pub static EVENTS: ApiResource = ApiResource::new("", "v1", "events", true);
pub static NODES: ApiResource = ApiResource::new("", "v1", "nodes", false);
pub static CONFIG_MAPS: ApiResource = ApiResource::new("", "v1", "configmaps", true);
pub static NAMESPACES: ApiResource = ApiResource::new("", "v1", "namespaces", false);
pub static SERVICE_ACCOUNTS: ApiResource = ApiResource::new("", "v1", "serviceaccounts", true);

pub static CLUSTER_OPERATORS: ApiResource =
    ApiResource::new("config.openshift.io", "v1", "clusteroperators", false);
pub static CLUSTER_VERSIONS: ApiResource =
    ApiResource::new("config.openshift.io", "v1", "clusterversions", false);
pub static INFRASTRUCTURES: ApiResource =
    ApiResource::new("config.openshift.io", "v1", "infrastructures", false);
pub static NETWORKS: ApiResource = ApiResource::new("config.openshift.io", "v1", "networks", false);
pub static AUTHENTICATIONS: ApiResource =
    ApiResource::new("config.openshift.io", "v1", "authentications", false);
pub static OAUTHS: ApiResource = ApiResource::new("config.openshift.io", "v1", "oauths", false);
pub static INGRESSES: ApiResource =
    ApiResource::new("config.openshift.io", "v1", "ingresses", false);
pub static PROXIES: ApiResource = ApiResource::new("config.openshift.io", "v1", "proxies", false);
pub static FEATURE_GATES: ApiResource =
    ApiResource::new("config.openshift.io", "v1", "featuregates", false);

pub static IMAGE_REGISTRY_CONFIGS: ApiResource =
    ApiResource::new("imageregistry.operator.openshift.io", "v1", "configs", false);
pub static IMAGE_PRUNERS: ApiResource =
    ApiResource::new("imageregistry.operator.openshift.io", "v1", "imagepruners", false);
pub static IMAGES: ApiResource = ApiResource::new("image.openshift.io", "v1", "images", false);

pub static CERTIFICATE_SIGNING_REQUESTS: ApiResource =
    ApiResource::new("certificates.k8s.io", "v1", "certificatesigningrequests", false);
pub static CUSTOM_RESOURCE_DEFINITIONS: ApiResource =
    ApiResource::new("apiextensions.k8s.io", "v1", "customresourcedefinitions", false);
pub static MUTATING_WEBHOOK_CONFIGURATIONS: ApiResource = ApiResource::new(
    "admissionregistration.k8s.io",
    "v1",
    "mutatingwebhookconfigurations",
    false,
);
pub static POD_DISRUPTION_BUDGETS: ApiResource =
    ApiResource::new("policy", "v1", "poddisruptionbudgets", true);
pub static POD_SECURITY_POLICIES: ApiResource =
    ApiResource::new("policy", "v1beta1", "podsecuritypolicies", false);
pub static JOBS: ApiResource = ApiResource::new("batch", "v1", "jobs", true);
pub static CLUSTER_ROLE_BINDINGS: ApiResource = ApiResource::new(
    "rbac.authorization.k8s.io",
    "v1",
    "clusterrolebindings",
    false,
);

pub static HOST_SUBNETS: ApiResource =
    ApiResource::new("network.openshift.io", "v1", "hostsubnets", false);
pub static NET_NAMESPACES: ApiResource =
    ApiResource::new("network.openshift.io", "v1", "netnamespaces", false);
pub static MACHINE_SETS: ApiResource =
    ApiResource::new("machine.openshift.io", "v1beta1", "machinesets", true);
pub static MACHINE_CONFIG_POOLS: ApiResource =
    ApiResource::new("machineconfiguration.openshift.io", "v1", "machineconfigpools", false);
pub static CONTAINER_RUNTIME_CONFIGS: ApiResource = ApiResource::new(
    "machineconfiguration.openshift.io",
    "v1",
    "containerruntimeconfigs",
    false,
);
pub static SECURITY_CONTEXT_CONSTRAINTS: ApiResource =
    ApiResource::new("security.openshift.io", "v1", "securitycontextconstraints", false);
pub static POD_NETWORK_CONNECTIVITY_CHECKS: ApiResource = ApiResource::new(
    "controlplane.operator.openshift.io",
    "v1alpha1",
    "podnetworkconnectivitychecks",
    true,
);

pub static INSTALL_PLANS: ApiResource =
    ApiResource::new("operators.coreos.com", "v1alpha1", "installplans", true);
pub static OLM_OPERATORS: ApiResource =
    ApiResource::new("operators.coreos.com", "v1", "operators", false);
pub static SAP_DATAHUBS: ApiResource =
    ApiResource::new("installers.datahub.sap.com", "v1alpha1", "datahubs", true);

/// Query parameters of a list call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub limit: Option<u32>,
    pub continue_token: Option<String>,
}

impl ListOptions {
    pub fn labels(selector: impl Into<String>) -> Self {
        ListOptions {
            label_selector: Some(selector.into()),
            ..ListOptions::default()
        }
    }

    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(selector) = &self.label_selector {
            query.push(("labelSelector", selector.clone()));
        }
        if let Some(selector) = &self.field_selector {
            query.push(("fieldSelector", selector.clone()));
        }
        if let Some(limit) = self.limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(token) = self.continue_token.as_ref().filter(|t| !t.is_empty()) {
            query.push(("continue", token.clone()));
        }
        query
    }
}

/// One page of a list call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceList {
    pub items: Vec<Value>,
    /// Set when the server has more items.
    pub continue_token: Option<String>,
}

/// A pod log body, read line by line.
pub type LogStream = Pin<Box<dyn AsyncBufRead + Send>>;

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Lists `resource`, in every namespace when `namespace` is `None`.
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        options: &ListOptions,
    ) -> Result<ResourceList, ClusterError>;

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value, ClusterError>;

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: &PodLogOptions,
    ) -> Result<LogStream, ClusterError>;

    /// GET of an arbitrary path on the API server, or of an absolute URL.
    async fn raw_get(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Vec<u8>, ClusterError>;
}

/// Returns `None` instead of an error when the object does not exist.
pub async fn get_optional(
    client: &dyn ClusterClient,
    resource: &ApiResource,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<Value>, ClusterError> {
    match client.get(resource, namespace, name).await {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
