// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::GatherError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Payload of a [`Record`].
pub trait Marshalable: Send + Sync {
    fn marshal(&self) -> Result<Vec<u8>, GatherError>;

    /// File extension appended to the record name, empty for none.
    fn extension(&self) -> &str;
}

/// Signature of the in-place redaction applied by [`AnonymizedItem`].
pub type AnonymizeFn = fn(&mut Value) -> Result<(), GatherError>;

/// A named, timestamped piece of gathered data.
#[derive(Clone)]
pub struct Record {
    pub name: String,
    /// `None` means the time the record reaches the recorder.
    pub captured_at: Option<DateTime<Utc>>,
    pub item: Arc<dyn Marshalable>,
    /// Optional precomputed fingerprint. When empty the fingerprint is computed
    /// from the marshaled bytes.
    pub fingerprint: String,
}

impl Record {
    pub fn new(name: impl Into<String>, item: impl Marshalable + 'static) -> Self {
        Record {
            name: name.into(),
            captured_at: None,
            item: Arc::new(item),
            fingerprint: String::new(),
        }
    }

    pub fn captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = Some(at);
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    /// Archive path of the record: `name` or `name.extension`.
    pub fn filename(&self) -> String {
        let extension = self.item.extension();
        if extension.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, extension)
        }
    }

    /// Serializes the payload and returns it together with its fingerprint.
    pub fn marshal(&self) -> Result<(Vec<u8>, String), GatherError> {
        let data = self.item.marshal()?;
        let fingerprint = if self.fingerprint.is_empty() {
            fingerprint(&data)
        } else {
            self.fingerprint.clone()
        };
        Ok((data, fingerprint))
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("name", &self.name)
            .field("captured_at", &self.captured_at)
            .field("extension", &self.item.extension())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Lowercase hex SHA-256 of `data`.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// A string stored verbatim.
#[derive(Debug, Clone)]
pub struct Raw(pub String);

impl Marshalable for Raw {
    fn marshal(&self) -> Result<Vec<u8>, GatherError> {
        Ok(self.0.as_bytes().to_vec())
    }

    fn extension(&self) -> &str {
        ""
    }
}

/// Bytes stored verbatim.
#[derive(Debug, Clone)]
pub struct RawBytes(pub Vec<u8>);

impl Marshalable for RawBytes {
    fn marshal(&self) -> Result<Vec<u8>, GatherError> {
        Ok(self.0.clone())
    }

    fn extension(&self) -> &str {
        ""
    }
}

/// Any serializable value, stored as JSON.
#[derive(Debug, Clone)]
pub struct JsonItem<T>(pub T);

impl<T> Marshalable for JsonItem<T>
where
    T: Serialize + Send + Sync,
{
    fn marshal(&self) -> Result<Vec<u8>, GatherError> {
        serde_json::to_vec(&self.0).map_err(|e| GatherError::Marshal(e.to_string()))
    }

    fn extension(&self) -> &str {
        "json"
    }
}

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Removes server managed bookkeeping from a resource tree.
pub fn strip_managed_fields(resource: &mut Value) {
    if let Some(metadata) = resource.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("managedFields");
        if let Some(annotations) = metadata
            .get_mut("annotations")
            .and_then(Value::as_object_mut)
        {
            annotations.remove(LAST_APPLIED_ANNOTATION);
        }
    }
}

/// A cluster resource stored as JSON without its server managed fields.
#[derive(Debug, Clone)]
pub struct ResourceItem(pub Value);

impl Marshalable for ResourceItem {
    fn marshal(&self) -> Result<Vec<u8>, GatherError> {
        let mut resource = self.0.clone();
        strip_managed_fields(&mut resource);
        Ok(serde_json::to_vec(&resource)?)
    }

    fn extension(&self) -> &str {
        "json"
    }
}

/// A cluster resource that is redacted when marshaled.
///
/// The wrapped tree is never modified; redaction runs on a copy.
#[derive(Clone)]
pub struct AnonymizedItem {
    resource: Arc<Value>,
    anonymize: AnonymizeFn,
}

impl AnonymizedItem {
    pub fn new(resource: impl Into<Arc<Value>>, anonymize: AnonymizeFn) -> Self {
        AnonymizedItem {
            resource: resource.into(),
            anonymize,
        }
    }
}

impl Marshalable for AnonymizedItem {
    fn marshal(&self) -> Result<Vec<u8>, GatherError> {
        let mut resource = (*self.resource).clone();
        strip_managed_fields(&mut resource);
        (self.anonymize)(&mut resource)?;
        Ok(serde_json::to_vec(&resource)?)
    }

    fn extension(&self) -> &str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_filename_with_and_without_extension() {
        let raw = Record::new("config/id", Raw("abc".into()));
        assert_eq!(raw.filename(), "config/id");

        let json = Record::new("config/version", JsonItem(json!({"a": 1})));
        assert_eq!(json.filename(), "config/version.json");
    }

    #[test]
    fn test_fingerprint_is_lowercase_hex_sha256() {
        assert_eq!(
            fingerprint(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_marshal_computes_or_keeps_fingerprint() {
        let record = Record::new("config/x", Raw("hello".into()));
        let (data, fp) = record.marshal().expect("raw marshal");
        assert_eq!(data, b"hello");
        assert_eq!(fp, fingerprint(b"hello"));

        let record = record.with_fingerprint("abc");
        let (_, fp) = record.marshal().expect("raw marshal");
        assert_eq!(fp, "abc");
    }

    #[test]
    fn test_json_marshal_failure() {
        // non string map keys cannot be encoded as JSON object keys
        let mut unencodable = HashMap::new();
        unencodable.insert(vec![1u8], 1);
        let record = Record::new("config/broken", JsonItem(unencodable));
        assert!(matches!(record.marshal(), Err(GatherError::Marshal(_))));
    }

    #[test]
    fn test_resource_item_strips_managed_fields() {
        let resource = json!({
            "metadata": {
                "name": "node-1",
                "managedFields": [{"manager": "kubelet"}],
                "annotations": {
                    "kubectl.kubernetes.io/last-applied-configuration": "{}",
                    "keep": "me"
                }
            }
        });
        let data = ResourceItem(resource).marshal().expect("resource marshal");
        let parsed: Value = serde_json::from_slice(&data).expect("valid json");
        assert_eq!(
            parsed,
            json!({"metadata": {"name": "node-1", "annotations": {"keep": "me"}}})
        );
    }

    #[test]
    fn test_anonymized_item_does_not_mutate_source() {
        fn blank_name(tree: &mut Value) -> Result<(), GatherError> {
            crate::tree::replace_string(tree, &["metadata", "name"], |s| "x".repeat(s.len()))
        }
        let resource = Arc::new(json!({"metadata": {"name": "secret"}}));
        let item = AnonymizedItem::new(Arc::clone(&resource), blank_name);
        let data = item.marshal().expect("anonymized marshal");
        assert_eq!(data, br#"{"metadata":{"name":"xxxxxx"}}"#);
        assert_eq!(resource["metadata"]["name"], "secret");
    }
}
