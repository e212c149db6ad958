// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Continuation token paging over list calls.

use crate::cluster::{ApiResource, ClusterClient, ListOptions};
use crate::error::ClusterError;
use serde_json::Value;
use tracing::debug;

/// Items collected by [`Pager::collect`].
#[derive(Debug, Default)]
pub struct Paged {
    pub items: Vec<Value>,
    /// Set when the cap stopped paging before the server ran out of items.
    pub truncated: bool,
}

pub struct Pager<'a> {
    client: &'a dyn ClusterClient,
    resource: &'a ApiResource,
    namespace: Option<&'a str>,
    options: ListOptions,
    cap: Option<usize>,
    fetched: usize,
    done: bool,
}

impl<'a> Pager<'a> {
    pub fn new(client: &'a dyn ClusterClient, resource: &'a ApiResource) -> Self {
        Pager {
            client,
            resource,
            namespace: None,
            options: ListOptions::default(),
            cap: None,
            fetched: 0,
            done: false,
        }
    }

    pub fn namespace(mut self, namespace: &'a str) -> Self {
        self.namespace = Some(namespace);
        self
    }

    /// Selectors of the list call. The continuation token is managed by the pager.
    pub fn options(mut self, options: ListOptions) -> Self {
        let limit = self.options.limit;
        self.options = ListOptions {
            limit: options.limit.or(limit),
            continue_token: None,
            ..options
        };
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.options.limit = Some(limit);
        self
    }

    /// Stops paging once `cap` items were returned.
    pub fn cap(mut self, cap: usize) -> Self {
        self.cap = Some(cap);
        self
    }

    fn cap_reached(&self) -> bool {
        self.cap.is_some_and(|cap| self.fetched >= cap)
    }

    /// Fetches the next page, `None` once the listing is exhausted or capped.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, ClusterError> {
        if self.done || self.cap_reached() {
            return Ok(None);
        }
        let page = self
            .client
            .list(self.resource, self.namespace, &self.options)
            .await?;

        let mut items = page.items;
        if let Some(cap) = self.cap {
            items.truncate(cap.saturating_sub(self.fetched));
        }
        self.fetched += items.len();

        match page.continue_token {
            Some(token) => self.options.continue_token = Some(token),
            None => self.done = true,
        }
        Ok(Some(items))
    }

    /// Whether the cap ended paging while the server still had items.
    pub fn truncated(&self) -> bool {
        !self.done && self.cap_reached()
    }

    pub async fn collect(mut self) -> Result<Paged, ClusterError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        let truncated = self.truncated();
        if truncated {
            debug!("stopped listing {} after {} items", self.resource, all.len());
        }
        Ok(Paged {
            items: all,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeClusterClient;
    use crate::cluster::PODS;
    use serde_json::json;

    fn pods(count: usize) -> Vec<Value> {
        (0..count)
            .map(|i| json!({"metadata": {"name": format!("pod-{i}"), "namespace": "ns"}}))
            .collect()
    }

    #[tokio::test]
    async fn test_collects_every_page() {
        let client = FakeClusterClient::new().with_objects(&PODS, pods(7));
        let paged = Pager::new(&client, &PODS)
            .namespace("ns")
            .limit(3)
            .collect()
            .await
            .expect("listing succeeds");
        assert_eq!(paged.items.len(), 7);
        assert!(!paged.truncated);
        assert_eq!(client.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_cap_stops_paging() {
        let client = FakeClusterClient::new().with_objects(&PODS, pods(10));
        let paged = Pager::new(&client, &PODS)
            .limit(4)
            .cap(5)
            .collect()
            .await
            .expect("listing succeeds");
        assert_eq!(paged.items.len(), 5);
        assert!(paged.truncated);
        assert_eq!(client.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_cap_equal_to_total_is_not_truncated() {
        let client = FakeClusterClient::new().with_objects(&PODS, pods(4));
        let paged = Pager::new(&client, &PODS)
            .limit(4)
            .cap(4)
            .collect()
            .await
            .expect("listing succeeds");
        assert_eq!(paged.items.len(), 4);
        assert!(!paged.truncated);
    }

    #[tokio::test]
    async fn test_errors_are_returned() {
        let client = FakeClusterClient::new().failing(
            &PODS,
            ClusterError::Transient {
                status: 503,
                message: "unavailable".into(),
            },
        );
        let result = Pager::new(&client, &PODS).limit(10).collect().await;
        assert!(matches!(result, Err(ClusterError::Transient { .. })));
    }
}
