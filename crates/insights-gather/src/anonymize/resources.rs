// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-kind redaction rules applied by [`crate::record::AnonymizedItem`].

use super::{
    anonymize_env_vars, anonymize_string, anonymize_url, anonymize_url_csv,
    is_product_namespaced_key,
};
use crate::error::GatherError;
use crate::tree;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

pub fn anonymize_node(node: &mut Value) -> Result<(), GatherError> {
    if let Some(annotations) = node
        .pointer_mut("/metadata/annotations")
        .and_then(Value::as_object_mut)
    {
        for (key, value) in annotations.iter_mut() {
            if !is_product_namespaced_key(key) {
                *value = Value::String(String::new());
            }
        }
    }
    if let Some(labels) = node
        .pointer_mut("/metadata/labels")
        .and_then(Value::as_object_mut)
    {
        for (key, value) in labels.iter_mut() {
            if is_product_namespaced_key(key) {
                continue;
            }
            if let Some(current) = value.as_str() {
                *value = Value::String(anonymize_string(current));
            }
        }
    }
    if let Some(addresses) = node
        .pointer_mut("/status/addresses")
        .and_then(Value::as_array_mut)
    {
        for address in addresses.iter_mut() {
            tree::replace_string_if_present(address, &["address"], anonymize_url);
        }
    }
    for field in ["bootID", "systemUUID", "machineID"] {
        tree::replace_string_if_present(node, &["status", "nodeInfo", field], anonymize_string);
    }
    if let Some(status) = node.get_mut("status").and_then(Value::as_object_mut) {
        status.remove("images");
    }
    Ok(())
}

pub fn anonymize_infrastructure(infrastructure: &mut Value) -> Result<(), GatherError> {
    for field in [
        "apiServerURL",
        "etcdDiscoveryDomain",
        "infrastructureName",
        "apiServerInternalURI",
    ] {
        tree::replace_string_if_present(infrastructure, &["status", field], anonymize_url);
    }
    Ok(())
}

pub fn anonymize_ingress(ingress: &mut Value) -> Result<(), GatherError> {
    tree::replace_string_if_present(ingress, &["spec", "domain"], anonymize_url);
    Ok(())
}

pub fn anonymize_cluster_version(version: &mut Value) -> Result<(), GatherError> {
    tree::replace_string_if_present(version, &["spec", "upstream"], anonymize_url);
    Ok(())
}

pub fn anonymize_proxy(proxy: &mut Value) -> Result<(), GatherError> {
    for section in ["spec", "status"] {
        for field in ["httpProxy", "httpsProxy", "noProxy"] {
            tree::replace_string_if_present(proxy, &[section, field], anonymize_url_csv);
        }
    }
    if let Some(endpoints) = proxy
        .pointer_mut("/spec/readinessEndpoints")
        .and_then(Value::as_array_mut)
    {
        for endpoint in endpoints.iter_mut() {
            if let Some(current) = endpoint.as_str() {
                *endpoint = Value::String(anonymize_url(current));
            }
        }
    }
    Ok(())
}

const IMAGE_REGISTRY_STORAGE_FIELDS: [(&str, &[&str]); 4] = [
    ("s3", &["bucket", "keyID", "regionEndpoint", "region"]),
    ("azure", &["accountName", "container"]),
    ("gcs", &["bucket", "projectID", "keyID"]),
    (
        "swift",
        &[
            "authURL",
            "container",
            "domain",
            "domainID",
            "tenant",
            "tenantID",
            "regionName",
        ],
    ),
];

pub fn anonymize_image_registry(config: &mut Value) -> Result<(), GatherError> {
    tree::replace_string_if_present(config, &["spec", "httpSecret"], anonymize_string);
    for (backend, fields) in IMAGE_REGISTRY_STORAGE_FIELDS {
        for field in fields {
            tree::replace_string_if_present(
                config,
                &["spec", "storage", backend, field],
                anonymize_string,
            );
        }
    }
    Ok(())
}

/// Replaces each webhook CA bundle with the same number of `x` bytes.
pub fn anonymize_mutating_webhook(configuration: &mut Value) -> Result<(), GatherError> {
    let Some(webhooks) = configuration
        .get_mut("webhooks")
        .and_then(Value::as_array_mut)
    else {
        return Ok(());
    };
    for webhook in webhooks.iter_mut() {
        let Ok(bundle) = tree::walk_mut(webhook, &["clientConfig", "caBundle"]) else {
            continue;
        };
        let Some(encoded) = bundle.as_str() else {
            continue;
        };
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| GatherError::Anonymization(format!("invalid caBundle: {e}")))?;
        let redacted = vec![b'x'; decoded.len()];
        *bundle = Value::String(STANDARD.encode(redacted));
    }
    Ok(())
}

/// Redacts proxy credentials passed to the pod's containers.
pub fn anonymize_pod(pod: &mut Value) -> Result<(), GatherError> {
    for containers in ["containers", "initContainers"] {
        if let Some(list) = pod
            .get_mut("spec")
            .and_then(|spec| spec.get_mut(containers))
            .and_then(Value::as_array_mut)
        {
            anonymize_env_vars(list);
        }
    }
    Ok(())
}

fn url_regex() -> &'static Regex {
    static URL: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    URL.get_or_init(|| Regex::new(r"(https|http)://\S*").expect("valid url regex"))
}

fn ipv4_regex() -> &'static Regex {
    static IPV4: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    IPV4.get_or_init(|| {
        Regex::new(
            r"(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)(\.(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)){3}",
        )
        .expect("valid ipv4 regex")
    })
}

fn redact_urls_and_addresses(value: &str) -> String {
    let without_urls = url_regex().replace_all(value, |caps: &regex::Captures<'_>| {
        anonymize_string(&caps[0])
    });
    ipv4_regex()
        .replace_all(&without_urls, |caps: &regex::Captures<'_>| {
            anonymize_string(&caps[0])
        })
        .into_owned()
}

fn redact_strings(value: &mut Value) {
    match value {
        Value::String(s) => *s = redact_urls_and_addresses(s),
        Value::Array(items) => items.iter_mut().for_each(redact_strings),
        Value::Object(map) => map.values_mut().for_each(redact_strings),
        _ => {}
    }
}

/// Redacts URLs and IPv4 addresses anywhere in an operator owned resource.
pub fn anonymize_operator_resource(resource: &mut Value) -> Result<(), GatherError> {
    redact_strings(resource);
    Ok(())
}
