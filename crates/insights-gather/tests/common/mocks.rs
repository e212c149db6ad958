// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock implementation of the cluster API for testing

use async_trait::async_trait;
use insights_gather::cluster::{ApiResource, ClusterClient, ListOptions, LogStream, ResourceList};
use insights_gather::error::ClusterError;
use insights_gather::logs::PodLogOptions;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};

fn object_name(object: &Value) -> &str {
    object["metadata"]["name"].as_str().unwrap_or_default()
}

fn object_namespace(object: &Value) -> &str {
    object["metadata"]["namespace"].as_str().unwrap_or_default()
}

/// Cluster holding a fixed set of objects. Kinds it knows nothing about are
/// not served, like a CRD that is not installed.
#[derive(Default)]
pub struct MockClusterClient {
    objects: HashMap<String, Vec<Value>>,
    logs: HashMap<String, String>,
    requests: AtomicUsize,
}

#[allow(dead_code)]
impl MockClusterClient {
    pub fn new() -> Self {
        MockClusterClient::default()
    }

    pub fn with(mut self, resource: &ApiResource, objects: Vec<Value>) -> Self {
        self.objects
            .entry(resource.to_string())
            .or_default()
            .extend(objects);
        self
    }

    pub fn with_logs(mut self, namespace: &str, pod: &str, container: &str, body: &str) -> Self {
        self.logs
            .insert(format!("{namespace}/{pod}/{container}"), body.to_string());
        self
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn served(&self, resource: &ApiResource) -> Result<&Vec<Value>, ClusterError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.objects
            .get(&resource.to_string())
            .ok_or_else(|| ClusterError::NotFound(resource.to_string()))
    }
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        _options: &ListOptions,
    ) -> Result<ResourceList, ClusterError> {
        let items = self
            .served(resource)?
            .iter()
            .filter(|object| match namespace {
                Some(ns) if resource.namespaced => object_namespace(object) == ns,
                _ => true,
            })
            .cloned()
            .collect();
        Ok(ResourceList {
            items,
            continue_token: None,
        })
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value, ClusterError> {
        self.served(resource)?
            .iter()
            .find(|object| {
                object_name(object) == name
                    && namespace.map_or(true, |ns| object_namespace(object) == ns)
            })
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("{resource} {name}")))
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: &PodLogOptions,
    ) -> Result<LogStream, ClusterError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let key = format!("{namespace}/{pod}/{}", options.container);
        match self.logs.get(&key) {
            Some(body) => Ok(Box::pin(Cursor::new(body.clone().into_bytes()))),
            None => Err(ClusterError::NotFound(format!("logs of {key}"))),
        }
    }

    async fn raw_get(
        &self,
        path: &str,
        _query: &[(String, String)],
    ) -> Result<Vec<u8>, ClusterError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Err(ClusterError::NotFound(path.to_string()))
    }
}
