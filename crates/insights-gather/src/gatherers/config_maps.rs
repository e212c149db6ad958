// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Config maps of `openshift-config` and the cluster monitoring configuration.

use super::{list_all, GatherContext};
use crate::anonymize::anonymize_pem;
use crate::cluster::{get_optional, ClusterClient, ListOptions, CONFIG_MAPS};
use crate::error::GatherError;
use crate::record::{Marshalable, Record};
use crate::registry::GatherOutput;
use crate::tree;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const CONFIG_NAMESPACE: &str = "openshift-config";
const MONITORING_NAMESPACE: &str = "openshift-monitoring";
const MONITORING_CONFIG_MAP: &str = "cluster-monitoring-config";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigMapEncoding {
    /// `data` values, PEM blocks redacted.
    Text,
    /// `binaryData` values, PEM blocks redacted and base64 encoded again.
    Base64,
    /// YAML documents converted to JSON.
    YamlToJson,
}

/// One config map value, encoded when the record is marshaled.
#[derive(Debug, Clone)]
pub struct ConfigMapItem {
    pub value: Vec<u8>,
    pub encoding: ConfigMapEncoding,
}

impl Marshalable for ConfigMapItem {
    fn marshal(&self) -> Result<Vec<u8>, GatherError> {
        match self.encoding {
            ConfigMapEncoding::Text => Ok(anonymize_pem(&self.value)),
            ConfigMapEncoding::Base64 => Ok(STANDARD.encode(anonymize_pem(&self.value)).into_bytes()),
            ConfigMapEncoding::YamlToJson => {
                let document: Value = serde_yaml::from_slice(&self.value)
                    .map_err(|e| GatherError::Marshal(e.to_string()))?;
                Ok(serde_json::to_vec(&document)?)
            }
        }
    }

    fn extension(&self) -> &str {
        match self.encoding {
            ConfigMapEncoding::YamlToJson => "json",
            _ => "",
        }
    }
}

fn config_map_records(config_map: &Value) -> Vec<Record> {
    let (namespace, name) = (tree::namespace(config_map), tree::name(config_map));
    let record_name = |key: &str| format!("config/configmaps/{namespace}/{name}/{key}");

    let data = config_map
        .get("data")
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
        .filter_map(|(key, value)| Some((key, value.as_str()?)))
        .map(|(key, value)| {
            Record::new(
                record_name(key),
                ConfigMapItem {
                    value: value.as_bytes().to_vec(),
                    encoding: ConfigMapEncoding::Text,
                },
            )
        });
    let binary = config_map
        .get("binaryData")
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
        .filter_map(|(key, value)| {
            // binaryData arrives base64 encoded from the API server
            let decoded = STANDARD.decode(value.as_str()?).ok()?;
            Some(Record::new(
                record_name(key),
                ConfigMapItem {
                    value: decoded,
                    encoding: ConfigMapEncoding::Base64,
                },
            ))
        });
    data.chain(binary).collect()
}

pub async fn gather_config_maps(ctx: Arc<GatherContext>, _: CancellationToken) -> GatherOutput {
    let client = ctx.client();
    let (mut records, errors) =
        match list_all(client, &CONFIG_MAPS, Some(CONFIG_NAMESPACE), ListOptions::default()).await
        {
            Ok(config_maps) => (
                config_maps.iter().flat_map(config_map_records).collect(),
                Vec::new(),
            ),
            Err(e) => (Vec::new(), vec![e.into()]),
        };
    records.extend(monitoring_config(client).await);
    (records, errors)
}

async fn monitoring_config(client: &dyn ClusterClient) -> Vec<Record> {
    let config_map = match get_optional(
        client,
        &CONFIG_MAPS,
        Some(MONITORING_NAMESPACE),
        MONITORING_CONFIG_MAP,
    )
    .await
    {
        Ok(Some(config_map)) => config_map,
        Ok(None) => {
            info!("no {} config map in {}", MONITORING_CONFIG_MAP, MONITORING_NAMESPACE);
            return Vec::new();
        }
        Err(e) => {
            info!(
                "couldn't read {} config map in {} namespace: {}",
                MONITORING_CONFIG_MAP, MONITORING_NAMESPACE, e
            );
            return Vec::new();
        }
    };

    config_map
        .get("data")
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
        .filter_map(|(key, value)| {
            Some(Record::new(
                format!(
                    "config/configmaps/{}/{}/{}",
                    MONITORING_NAMESPACE,
                    MONITORING_CONFIG_MAP,
                    key.trim_end_matches(".yaml")
                ),
                ConfigMapItem {
                    value: value.as_str()?.as_bytes().to_vec(),
                    encoding: ConfigMapEncoding::YamlToJson,
                },
            ))
        })
        .collect()
}
