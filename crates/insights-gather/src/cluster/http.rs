// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{ApiResource, ClusterClient, ListOptions, LogStream, ResourceList};
use crate::error::ClusterError;
use crate::logs::PodLogOptions;
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Response};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::debug;

/// Connection settings of the API server.
#[derive(Debug, Clone)]
pub struct KubeClientConfig {
    pub api_url: String,
    pub token_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub request_timeout: Duration,
}

/// [`ClusterClient`] backed by the Kubernetes REST API.
#[derive(Debug, Clone)]
pub struct KubeClient {
    client: Client,
    /// Client without a request timeout, used for streamed pod logs.
    stream_client: Client,
    base_url: String,
}

impl KubeClient {
    pub fn new(config: &KubeClientConfig) -> Result<Self, ClusterError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = read_token(config.token_path.as_ref()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ClusterError::Decode(format!("invalid bearer token: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = Client::builder()
            .use_rustls_tls()
            .default_headers(headers.clone());
        let mut stream_builder = Client::builder().use_rustls_tls().default_headers(headers);
        if let Some(ca_path) = &config.ca_path {
            match std::fs::read(ca_path) {
                Ok(pem) => {
                    let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                        ClusterError::Decode(format!("invalid CA bundle {}: {e}", ca_path.display()))
                    })?;
                    builder = builder.add_root_certificate(certificate.clone());
                    stream_builder = stream_builder.add_root_certificate(certificate);
                }
                Err(e) => debug!("CA bundle {} not loaded: {}", ca_path.display(), e),
            }
        }

        let client = builder
            .timeout(config.request_timeout)
            .build()
            .map_err(transport_error)?;
        let stream_client = stream_builder
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(transport_error)?;

        Ok(KubeClient {
            client,
            stream_client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    async fn send(
        &self,
        client: &Client,
        path: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<Response, ClusterError> {
        let url = self.url(path);
        debug!("GET {}", url);
        let response = client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ClusterError::from_status(
            status.as_u16(),
            what,
            status_message(&body),
        ))
    }

    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<Value, ClusterError> {
        let response = self.send(&self.client, path, query, what).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| ClusterError::Decode(e.to_string()))
    }
}

fn read_token(path: Option<&PathBuf>) -> Option<String> {
    let path = path?;
    match std::fs::read_to_string(path) {
        Ok(token) => Some(token.trim().to_string()).filter(|t| !t.is_empty()),
        Err(e) => {
            debug!("bearer token {} not loaded: {}", path.display(), e);
            None
        }
    }
}

fn transport_error(error: reqwest::Error) -> ClusterError {
    if error.is_timeout() || error.is_connect() {
        ClusterError::Transient {
            status: 0,
            message: error.to_string(),
        }
    } else {
        ClusterError::Permanent {
            status: 0,
            message: error.to_string(),
        }
    }
}

/// Extracts the `message` of a Kubernetes `Status` body, or returns the body.
fn status_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|status| {
            status
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// List items carry no type information; restore it from the list kind.
fn fill_type_meta(list: &Value, resource: &ApiResource, items: &mut [Value]) {
    let Some(kind) = list
        .get("kind")
        .and_then(Value::as_str)
        .and_then(|kind| kind.strip_suffix("List"))
    else {
        return;
    };
    let api_version = resource.api_version();
    for item in items.iter_mut() {
        let Some(object) = item.as_object_mut() else {
            continue;
        };
        object
            .entry("kind")
            .or_insert_with(|| Value::String(kind.to_string()));
        object
            .entry("apiVersion")
            .or_insert_with(|| Value::String(api_version.clone()));
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        options: &ListOptions,
    ) -> Result<ResourceList, ClusterError> {
        let path = resource.path(namespace, None);
        let mut list = self
            .get_json(&path, &options.query(), &resource.to_string())
            .await?;

        let mut items = match list.get_mut("items").map(Value::take) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(ClusterError::Decode(format!(
                    "{resource} list has no items array"
                )))
            }
        };
        fill_type_meta(&list, resource, &mut items);
        let continue_token = list
            .pointer("/metadata/continue")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .map(str::to_string);

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
        let path = resource.path(namespace, Some(name));
        self.get_json(&path, &[], &format!("{resource} {name}"))
            .await
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: &PodLogOptions,
    ) -> Result<LogStream, ClusterError> {
        let path = format!("/api/v1/namespaces/{namespace}/pods/{pod}/log");
        let response = self
            .send(
                &self.stream_client,
                &path,
                &options.query(),
                &format!("logs of pod {namespace}/{pod}"),
            )
            .await?;
        let body = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::pin(StreamReader::new(body)))
    }

    async fn raw_get(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Vec<u8>, ClusterError> {
        let query: Vec<(&str, String)> = query
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect();
        let response = self.send(&self.client, path, &query, path).await?;
        let body = response.bytes().await.map_err(transport_error)?;
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{CLUSTER_VERSIONS, PODS};
    use mockito::{Matcher, Server};
    use std::io::Write;
    use tokio::io::AsyncReadExt;

    fn client(server: &Server, token_path: Option<PathBuf>) -> KubeClient {
        KubeClient::new(&KubeClientConfig {
            api_url: server.url(),
            token_path,
            ca_path: None,
            request_timeout: Duration::from_secs(5),
        })
        .expect("client builds")
    }

    #[tokio::test]
    async fn test_list_pages_and_type_meta() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/namespaces/openshift-sdn/pods")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("labelSelector".into(), "app=sdn".into()),
                Matcher::UrlEncoded("limit".into(), "2".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"kind":"PodList","metadata":{"continue":"next"},"items":[{"metadata":{"name":"a"}}]}"#,
            )
            .create_async()
            .await;

        let options = ListOptions {
            label_selector: Some("app=sdn".into()),
            limit: Some(2),
            ..ListOptions::default()
        };
        let list = client(&server, None)
            .list(&PODS, Some("openshift-sdn"), &options)
            .await
            .expect("list succeeds");

        mock.assert_async().await;
        assert_eq!(list.continue_token.as_deref(), Some("next"));
        assert_eq!(list.items[0]["kind"], "Pod");
        assert_eq!(list.items[0]["apiVersion"], "v1");
    }

    #[tokio::test]
    async fn test_status_codes_are_classified() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/apis/config.openshift.io/v1/clusterversions/version")
            .with_status(404)
            .with_body(r#"{"kind":"Status","message":"not there"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/apis/config.openshift.io/v1/clusterversions/busy")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;
        server
            .mock("GET", "/apis/config.openshift.io/v1/clusterversions/denied")
            .with_status(403)
            .with_body(r#"{"kind":"Status","message":"forbidden"}"#)
            .create_async()
            .await;

        let client = client(&server, None);
        let err = client
            .get(&CLUSTER_VERSIONS, None, "version")
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = client.get(&CLUSTER_VERSIONS, None, "busy").await.unwrap_err();
        assert_eq!(
            err,
            ClusterError::Transient {
                status: 503,
                message: "overloaded".into()
            }
        );

        let err = client
            .get(&CLUSTER_VERSIONS, None, "denied")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ClusterError::Permanent {
                status: 403,
                message: "forbidden".into()
            }
        );
    }

    #[tokio::test]
    async fn test_bearer_token_is_sent() {
        let mut token_file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(token_file, "s3cr3t").expect("token written");

        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/nodes/n1")
            .match_header("authorization", "Bearer s3cr3t")
            .with_status(200)
            .with_body(r#"{"metadata":{"name":"n1"}}"#)
            .create_async()
            .await;

        let node = client(&server, Some(token_file.path().to_path_buf()))
            .get(&crate::cluster::NODES, None, "n1")
            .await
            .expect("get succeeds");
        mock.assert_async().await;
        assert_eq!(node["metadata"]["name"], "n1");
    }

    #[tokio::test]
    async fn test_pod_logs_stream() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/namespaces/ns/pods/p1/log")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("container".into(), "c1".into()),
                Matcher::UrlEncoded("tailLines".into(), "100".into()),
                Matcher::UrlEncoded("timestamps".into(), "true".into()),
            ]))
            .with_status(200)
            .with_body("line one\nline two\n")
            .create_async()
            .await;

        let options = PodLogOptions {
            container: "c1".into(),
            tail_lines: 100,
            ..PodLogOptions::default()
        };
        let mut stream = client(&server, None)
            .pod_logs("ns", "p1", &options)
            .await
            .expect("logs requested");
        let mut body = String::new();
        stream.read_to_string(&mut body).await.expect("body read");
        assert_eq!(body, "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_raw_get_with_repeated_query() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/federate")
            .match_query(Matcher::Regex("match%5B%5D=ALERTS".into()))
            .with_status(200)
            .with_body("ALERTS{} 1\n")
            .create_async()
            .await;

        let url = format!("{}/federate", server.url());
        let body = client(&server, None)
            .raw_get(&url, &[("match[]".to_string(), "ALERTS".to_string())])
            .await
            .expect("raw get succeeds");
        assert_eq!(body, b"ALERTS{} 1\n");
    }
}
