// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::cluster::http::KubeClientConfig;
use crate::recorder::MAX_LOG_SIZE;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_STORAGE_PATH: &str = "/var/lib/insights-operator";
const DEFAULT_GATHER_INTERVAL_SECS: u64 = 2 * 60 * 60;
const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const DEFAULT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const DEFAULT_METRICS_URL: &str = "https://prometheus-k8s.openshift-monitoring.svc:9091";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the archives are written to.
    pub storage_path: PathBuf,
    /// How often a gather runs. Also the deadline of a single run.
    pub gather_interval: Duration,
    /// Task names to run, or `all`.
    pub gatherers: Vec<String>,
    /// Buffered size that triggers an early flush, in bytes.
    pub flush_size: usize,
    pub api_url: String,
    pub token_path: PathBuf,
    pub ca_path: PathBuf,
    /// Base URL of the Prometheus federation endpoint.
    pub metrics_url: String,
    pub request_timeout: Duration,
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

fn parse_gatherers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    pub fn new() -> Result<Config, Box<dyn std::error::Error>> {
        let api_url = match env::var("INSIGHTS_API_URL") {
            Ok(url) if !url.trim().is_empty() => url.trim().trim_end_matches('/').to_string(),
            _ => {
                let host = env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
                    anyhow::anyhow!(
                        "KUBERNETES_SERVICE_HOST environment variable is not set and INSIGHTS_API_URL is not provided"
                    )
                })?;
                let port = env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
                if host.contains(':') {
                    format!("https://[{host}]:{port}")
                } else {
                    format!("https://{host}:{port}")
                }
            }
        };

        let gather_interval_secs = parse_env::<u64>("INSIGHTS_GATHER_INTERVAL_SECS")
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_GATHER_INTERVAL_SECS);

        let gatherers = env::var("INSIGHTS_GATHERERS")
            .map(|value| parse_gatherers(&value))
            .ok()
            .filter(|names| !names.is_empty())
            .unwrap_or_else(|| vec![crate::registry::ALL_TASKS.to_string()]);

        let request_timeout_secs = parse_env::<u64>("INSIGHTS_REQUEST_TIMEOUT_SECS")
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        Ok(Config {
            storage_path: env::var("INSIGHTS_STORAGE_PATH")
                .unwrap_or_else(|_| DEFAULT_STORAGE_PATH.to_string())
                .into(),
            gather_interval: Duration::from_secs(gather_interval_secs),
            gatherers,
            flush_size: parse_env("INSIGHTS_FLUSH_SIZE_BYTES").unwrap_or(MAX_LOG_SIZE),
            api_url,
            token_path: env::var("INSIGHTS_TOKEN_PATH")
                .unwrap_or_else(|_| DEFAULT_TOKEN_PATH.to_string())
                .into(),
            ca_path: env::var("INSIGHTS_CA_PATH")
                .unwrap_or_else(|_| DEFAULT_CA_PATH.to_string())
                .into(),
            metrics_url: env::var("INSIGHTS_METRICS_URL")
                .unwrap_or_else(|_| DEFAULT_METRICS_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }

    pub fn kube_client_config(&self) -> KubeClientConfig {
        KubeClientConfig {
            api_url: self.api_url.clone(),
            token_path: Some(self.token_path.clone()),
            ca_path: Some(self.ca_path.clone()),
            request_timeout: self.request_timeout,
        }
    }
}
