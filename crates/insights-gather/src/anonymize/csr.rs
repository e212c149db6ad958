// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Redacted features of certificate signing requests.
//!
//! Only the first PEM block of the request and of the issued certificate is
//! inspected. A request whose signature does not verify keeps its metadata but
//! carries no request features.

use super::{anonymize_string, anonymize_url};
use crate::record::strip_managed_fields;
use crate::tree;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::debug;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

/// Subject or issuer name with every attribute redacted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PkixName {
    pub country: Vec<String>,
    pub organization: Vec<String>,
    pub organizational_unit: Vec<String>,
    pub locality: Vec<String>,
    pub province: Vec<String>,
    pub street_address: Vec<String>,
    pub postal_code: Vec<String>,
    pub serial_number: String,
    pub common_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeMeta {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(rename = "apiVersion", skip_serializing_if = "String::is_empty")]
    pub api_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CsrFeatures {
    pub valid_signature: bool,
    pub signature_algorithm: String,
    pub public_key_algorithm: String,
    #[serde(rename = "DNSNames")]
    pub dns_names: Vec<String>,
    pub email_addresses: Vec<String>,
    #[serde(rename = "IPAddresses")]
    pub ip_addresses: Vec<String>,
    #[serde(rename = "URIs")]
    pub uris: Vec<String>,
    pub subject: PkixName,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateFeatures {
    pub username: String,
    pub groups: Value,
    pub usages: Value,
    pub request: Option<CsrFeatures>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertFeatures {
    pub verified: bool,
    pub issuer: PkixName,
    pub subject: PkixName,
    pub not_before: String,
    pub not_after: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusFeatures {
    pub conditions: Value,
    pub cert: Option<CertFeatures>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CsrAnonymizedFeatures {
    pub type_meta: TypeMeta,
    pub object_meta: Value,
    pub spec: Option<StateFeatures>,
    pub status: Option<StatusFeatures>,
}

/// Builds the redacted features of a `CertificateSigningRequest` resource.
pub fn anonymize_csr(resource: &Value) -> CsrAnonymizedFeatures {
    let mut metadata = resource.clone();
    strip_managed_fields(&mut metadata);
    let object_meta = metadata.get("metadata").cloned().unwrap_or(Value::Null);
    let name = tree::name(resource);

    let spec = resource.get("spec").map(|spec| StateFeatures {
        username: tree::str_at(spec, &["username"])
            .unwrap_or_default()
            .to_string(),
        groups: spec.get("groups").cloned().unwrap_or(Value::Null),
        usages: spec.get("usages").cloned().unwrap_or(Value::Null),
        request: decode_pem_field(spec, "request")
            .and_then(|der| request_features(name, &der)),
    });

    let status = resource.get("status").map(|status| StatusFeatures {
        conditions: status.get("conditions").cloned().unwrap_or(Value::Null),
        cert: decode_pem_field(status, "certificate").and_then(|der| cert_features(&der)),
    });

    CsrAnonymizedFeatures {
        type_meta: TypeMeta {
            kind: tree::str_at(resource, &["kind"])
                .unwrap_or_default()
                .to_string(),
            api_version: tree::str_at(resource, &["apiVersion"])
                .unwrap_or_default()
                .to_string(),
        },
        object_meta,
        spec,
        status,
    }
}

/// Whether a request is worth reporting at `now`.
///
/// Requests without an issued certificate are always included. With a
/// certificate, only unverified ones or ones outside their validity window are.
pub fn include_csr(features: &CsrAnonymizedFeatures, now: DateTime<Utc>) -> bool {
    let Some(cert) = features.status.as_ref().and_then(|s| s.cert.as_ref()) else {
        return true;
    };
    if !cert.verified {
        return true;
    }
    if parse_rfc3339(&cert.not_before).is_some_and(|not_before| now < not_before) {
        return true;
    }
    if parse_rfc3339(&cert.not_after).is_some_and(|not_after| now > not_after) {
        return true;
    }
    false
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

/// The field holds base64 encoded PEM. Returns the DER body of its first block.
fn decode_pem_field(section: &Value, field: &str) -> Option<Vec<u8>> {
    let encoded = section.get(field).and_then(Value::as_str)?;
    let pem = STANDARD.decode(encoded).ok()?;
    match parse_x509_pem(&pem) {
        Ok((_, block)) => Some(block.contents),
        Err(_) => None,
    }
}

fn request_features(name: &str, der: &[u8]) -> Option<CsrFeatures> {
    let request = match X509CertificationRequest::from_der(der) {
        Ok((_, request)) => request,
        Err(e) => {
            debug!("Unable to parse certificate request {}: {}", name, e);
            return None;
        }
    };
    if let Err(e) = request.verify_signature() {
        debug!("Invalid certificate signature in request {}: {}", name, e);
        return None;
    }

    let info = &request.certification_request_info;
    let mut features = CsrFeatures {
        valid_signature: true,
        signature_algorithm: signature_algorithm_name(
            &request.signature_algorithm.algorithm.to_id_string(),
        ),
        public_key_algorithm: public_key_algorithm_name(
            &info.subject_pki.algorithm.algorithm.to_id_string(),
        ),
        subject: anonymize_name(&info.subject),
        ..CsrFeatures::default()
    };

    if let Some(extensions) = request.requested_extensions() {
        for extension in extensions {
            let ParsedExtension::SubjectAlternativeName(san) = extension else {
                continue;
            };
            for general_name in &san.general_names {
                match general_name {
                    GeneralName::DNSName(dns) => features.dns_names.push(anonymize_url(dns)),
                    GeneralName::RFC822Name(email) => {
                        features.email_addresses.push(anonymize_url(email))
                    }
                    GeneralName::URI(uri) => features.uris.push(anonymize_url(uri)),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = format_ip(bytes) {
                            features.ip_addresses.push(anonymize_url(&ip));
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    Some(features)
}

fn cert_features(der: &[u8]) -> Option<CertFeatures> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let validity = cert.validity();
    Some(CertFeatures {
        // no trust chain is available in cluster, so nothing is verified
        verified: false,
        issuer: anonymize_name(cert.issuer()),
        subject: anonymize_name(cert.subject()),
        not_before: format_time(validity.not_before.timestamp()),
        not_after: format_time(validity.not_after.timestamp()),
    })
}

fn format_time(timestamp: i64) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .map(|time| time.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

fn format_ip(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

fn anonymize_name(name: &X509Name<'_>) -> PkixName {
    let mut anonymized = PkixName::default();
    for attribute in name.iter_attributes() {
        let Ok(value) = attribute.as_str() else {
            continue;
        };
        let value = anonymize_string(value);
        match attribute.attr_type().to_id_string().as_str() {
            "2.5.4.3" => anonymized.common_name = value,
            "2.5.4.5" => anonymized.serial_number = value,
            "2.5.4.6" => anonymized.country.push(value),
            "2.5.4.7" => anonymized.locality.push(value),
            "2.5.4.8" => anonymized.province.push(value),
            "2.5.4.9" => anonymized.street_address.push(value),
            "2.5.4.10" => anonymized.organization.push(value),
            "2.5.4.11" => anonymized.organizational_unit.push(value),
            "2.5.4.17" => anonymized.postal_code.push(value),
            _ => {}
        }
    }
    anonymized
}

fn signature_algorithm_name(oid: &str) -> String {
    match oid {
        "1.2.840.113549.1.1.4" => "MD5-RSA",
        "1.2.840.113549.1.1.5" => "SHA1-RSA",
        "1.2.840.113549.1.1.11" => "SHA256-RSA",
        "1.2.840.113549.1.1.12" => "SHA384-RSA",
        "1.2.840.113549.1.1.13" => "SHA512-RSA",
        "1.2.840.113549.1.1.10" => "SHA256-RSAPSS",
        "1.2.840.10045.4.1" => "ECDSA-SHA1",
        "1.2.840.10045.4.3.2" => "ECDSA-SHA256",
        "1.2.840.10045.4.3.3" => "ECDSA-SHA384",
        "1.2.840.10045.4.3.4" => "ECDSA-SHA512",
        "1.3.101.112" => "Ed25519",
        other => other,
    }
    .to_string()
}

fn public_key_algorithm_name(oid: &str) -> String {
    match oid {
        "1.2.840.113549.1.1.1" => "RSA",
        "1.2.840.10040.4.1" => "DSA",
        "1.2.840.10045.2.1" => "ECDSA",
        "1.3.101.112" => "Ed25519",
        other => other,
    }
    .to_string()
}
