// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Redaction helpers.
//!
//! All functions here are pure. String redaction keeps the byte length of the
//! input, URL redaction keeps the separators `.`, `-`, `/` and `:` in place so
//! the result is still recognizable as a host or URL.

pub mod csr;
pub mod resources;

use crate::error::GatherError;
use crate::tree;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use x509_parser::pem::parse_x509_pem;

/// Replacement emitted for every PEM block found in a config map value.
pub const ANONYMIZED_PEM_BLOCK: &str =
    "-----BEGIN CERTIFICATE-----\nANONYMIZED\n-----END CERTIFICATE-----\n";

const PRODUCT_KEY_MARKERS: [&str; 3] = ["openshift.io/", "k8s.io/", "kubernetes.io/"];

/// Returns a string of `x` with the same length as `s`.
///
/// # Examples
///
/// ```
/// use insights_gather::anonymize::anonymize_string;
///
/// assert_eq!(anonymize_string("secret"), "xxxxxx");
/// assert_eq!(anonymize_string(""), "");
/// ```
pub fn anonymize_string(s: &str) -> String {
    "x".repeat(s.len())
}

/// Replaces every character except `.`, `-`, `/` and `:` with `x`.
///
/// # Examples
///
/// ```
/// use insights_gather::anonymize::anonymize_url;
///
/// assert_eq!(
///     anonymize_url("https://api.example.com:6443/foo-bar"),
///     "xxxxx://xxx.xxxxxxx.xxx:xxxx/xxx-xxx"
/// );
/// ```
pub fn anonymize_url(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '.' | '-' | '/' | ':' => c,
            _ => 'x',
        })
        .collect()
}

/// Anonymizes each element of a comma separated list of URLs.
pub fn anonymize_url_csv(s: &str) -> String {
    s.split(',').map(anonymize_url).collect::<Vec<_>>().join(",")
}

pub fn anonymize_url_slice(urls: &[String]) -> Vec<String> {
    urls.iter().map(|url| anonymize_url(url)).collect()
}

/// Replaces the string at `path` with [`anonymize_string`]. The field must exist.
pub fn anonymize_nested_field(resource: &mut Value, path: &[&str]) -> Result<(), GatherError> {
    tree::replace_string(resource, path, anonymize_string)
}

/// Whether a label or annotation key belongs to the platform itself.
pub fn is_product_namespaced_key(key: &str) -> bool {
    PRODUCT_KEY_MARKERS.iter().any(|marker| key.contains(marker))
}

fn proxy_env_regex() -> &'static Regex {
    static PROXY_ENV: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PROXY_ENV.get_or_init(|| Regex::new("HTTP_PROXY|HTTPS_PROXY").expect("valid proxy env regex"))
}

/// Redacts the value of proxy environment variables in a list of container specs.
pub fn anonymize_env_vars(containers: &mut [Value]) {
    let matcher = proxy_env_regex();
    for container in containers.iter_mut() {
        let Some(env) = container.get_mut("env").and_then(Value::as_array_mut) else {
            continue;
        };
        for variable in env.iter_mut() {
            let is_proxy = variable
                .get("name")
                .and_then(Value::as_str)
                .is_some_and(|name| matcher.is_match(name));
            if is_proxy {
                tree::replace_string_if_present(variable, &["value"], anonymize_string);
            }
        }
    }
}

/// Replaces every PEM block in `data` with [`ANONYMIZED_PEM_BLOCK`], whatever
/// its label.
///
/// Blocks are decoded one after another until the input is consumed. When any
/// remaining part fails to decode as a block, including trailing text after
/// the last one, the input is returned unchanged: it is not PEM data.
pub fn anonymize_pem(data: &[u8]) -> Vec<u8> {
    let mut anonymized = String::new();
    let mut rest = data;
    loop {
        match parse_x509_pem(rest) {
            Ok((remaining, _)) => {
                anonymized.push_str(ANONYMIZED_PEM_BLOCK);
                rest = remaining;
            }
            Err(_) => return data.to_vec(),
        }
        if rest.is_empty() {
            return anonymized.into_bytes();
        }
    }
}
