// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{ApiResource, ClusterClient, ListOptions, LogStream, ResourceList};
use crate::error::ClusterError;
use crate::logs::PodLogOptions;
use crate::tree;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory cluster used by unit tests.
#[derive(Default)]
pub(crate) struct FakeClusterClient {
    objects: HashMap<String, Vec<Value>>,
    logs: HashMap<String, String>,
    raw: HashMap<String, Vec<u8>>,
    failures: HashMap<String, ClusterError>,
    list_calls: AtomicUsize,
}

fn logs_key(namespace: &str, pod: &str, container: &str, previous: bool) -> String {
    format!("{namespace}/{pod}/{container}/{previous}")
}

pub(crate) fn raw_key(path: &str, query: &[(String, String)]) -> String {
    let query: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{path}?{}", query.join("&"))
}

fn labels_match(object: &Value, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => {
                tree::str_at(object, &["metadata", "labels", key]) == Some(value)
            }
            None => true,
        })
}

impl FakeClusterClient {
    pub(crate) fn new() -> Self {
        FakeClusterClient::default()
    }

    pub(crate) fn with_objects(mut self, resource: &ApiResource, objects: Vec<Value>) -> Self {
        self.objects
            .entry(resource.to_string())
            .or_default()
            .extend(objects);
        self
    }

    pub(crate) fn with_logs(
        mut self,
        namespace: &str,
        pod: &str,
        container: &str,
        previous: bool,
        body: &str,
    ) -> Self {
        self.logs.insert(
            logs_key(namespace, pod, container, previous),
            body.to_string(),
        );
        self
    }

    pub(crate) fn with_raw(mut self, key: String, body: &[u8]) -> Self {
        self.raw.insert(key, body.to_vec());
        self
    }

    pub(crate) fn failing(mut self, resource: &ApiResource, error: ClusterError) -> Self {
        self.failures.insert(resource.to_string(), error);
        self
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self, resource: &ApiResource) -> Result<(), ClusterError> {
        match self.failures.get(&resource.to_string()) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn in_namespace<'a>(
        &'a self,
        resource: &ApiResource,
        namespace: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Value> + 'a {
        let namespaced = resource.namespaced;
        self.objects
            .get(&resource.to_string())
            .into_iter()
            .flatten()
            .filter(move |object| match namespace {
                Some(ns) if namespaced && !ns.is_empty() => tree::namespace(object) == ns,
                _ => true,
            })
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        options: &ListOptions,
    ) -> Result<ResourceList, ClusterError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure(resource)?;

        let matching: Vec<Value> = self
            .in_namespace(resource, namespace)
            .filter(|object| {
                options
                    .label_selector
                    .as_deref()
                    .map_or(true, |selector| labels_match(object, selector))
            })
            .cloned()
            .collect();

        let offset: usize = options
            .continue_token
            .as_deref()
            .and_then(|token| token.parse().ok())
            .unwrap_or(0);
        let limit = options.limit.map_or(usize::MAX, |limit| limit as usize);
        let end = offset.saturating_add(limit).min(matching.len());
        let items = matching.get(offset..end).unwrap_or_default().to_vec();
        let continue_token = (end < matching.len()).then(|| end.to_string());

        Ok(ResourceList {
            items,
            continue_token,
        })
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value, ClusterError> {
        self.check_failure(resource)?;
        self.in_namespace(resource, namespace)
            .find(|object| tree::name(object) == name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("{resource} {name}")))
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: &PodLogOptions,
    ) -> Result<LogStream, ClusterError> {
        let key = logs_key(namespace, pod, &options.container, options.previous);
        match self.logs.get(&key) {
            Some(body) => Ok(Box::pin(Cursor::new(body.clone().into_bytes()))),
            None => Err(ClusterError::NotFound(format!("logs {key}"))),
        }
    }

    async fn raw_get(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Vec<u8>, ClusterError> {
        let key = raw_key(path, query);
        self.raw
            .get(&key)
            .cloned()
            .ok_or(ClusterError::NotFound(key))
    }
}
