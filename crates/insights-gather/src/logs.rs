// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming pod log filtering.
//!
//! Logs are read line by line from the cluster and only matching lines are
//! kept, so memory stays bounded by the matches rather than the stream.

use crate::cluster::{ClusterClient, ListOptions, PODS};
use crate::error::GatherError;
use crate::pager::Pager;
use crate::record::{Raw, Record};
use crate::tree;
use regex::Regex;
use serde_json::Value;
use std::io::{self, Read};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const LINE_SEPARATOR: u8 = b'\n';
const PODS_PAGE_SIZE: u32 = 500;

/// Upstream options of a single log request. Zero values are left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodLogOptions {
    pub container: String,
    pub since_seconds: i64,
    pub limit_bytes: i64,
    pub tail_lines: i64,
    pub previous: bool,
}

impl PodLogOptions {
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::with_capacity(6);
        if !self.container.is_empty() {
            query.push(("container", self.container.clone()));
        }
        if self.since_seconds > 0 {
            query.push(("sinceSeconds", self.since_seconds.to_string()));
        }
        if self.limit_bytes > 0 {
            query.push(("limitBytes", self.limit_bytes.to_string()));
        }
        if self.tail_lines > 0 {
            query.push(("tailLines", self.tail_lines.to_string()));
        }
        if self.previous {
            query.push(("previous", "true".to_string()));
        }
        query.push(("timestamps", "true".to_string()));
        query
    }
}

/// Which lines to keep and how much of the log to request.
#[derive(Debug, Clone, Default)]
pub struct LogMessagesFilter {
    /// Case-insensitive substrings, or regex patterns when `is_regex` is set.
    /// Empty keeps every line.
    pub messages: Vec<String>,
    pub is_regex: bool,
    pub since_seconds: i64,
    pub limit_bytes: i64,
    pub tail_lines: i64,
    pub previous: bool,
}

impl LogMessagesFilter {
    pub fn substrings<I, S>(messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LogMessagesFilter {
            messages: messages.into_iter().map(Into::into).collect(),
            ..LogMessagesFilter::default()
        }
    }

    pub fn regex<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LogMessagesFilter {
            is_regex: true,
            ..LogMessagesFilter::substrings(patterns)
        }
    }

    pub fn since_seconds(mut self, since_seconds: i64) -> Self {
        self.since_seconds = since_seconds;
        self
    }

    pub fn limit_bytes(mut self, limit_bytes: i64) -> Self {
        self.limit_bytes = limit_bytes;
        self
    }

    pub fn tail_lines(mut self, tail_lines: i64) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    pub fn previous(mut self, previous: bool) -> Self {
        self.previous = previous;
        self
    }

    pub fn pod_log_options(&self, container: &str) -> PodLogOptions {
        PodLogOptions {
            container: container.to_string(),
            since_seconds: self.since_seconds,
            limit_bytes: self.limit_bytes,
            tail_lines: self.tail_lines,
            previous: self.previous,
        }
    }

    fn matcher(&self) -> Result<LineMatcher, GatherError> {
        if self.messages.is_empty() {
            return Ok(LineMatcher::All);
        }
        if self.is_regex {
            let pattern = self.messages.join("|");
            return Regex::new(&pattern)
                .map(LineMatcher::Regex)
                .map_err(|e| GatherError::InvalidFilter(e.to_string()));
        }
        Ok(LineMatcher::Substrings(
            self.messages.iter().map(|m| m.to_lowercase()).collect(),
        ))
    }
}

enum LineMatcher {
    All,
    Substrings(Vec<String>),
    Regex(Regex),
}

impl LineMatcher {
    fn matches(&self, line: &str) -> bool {
        match self {
            LineMatcher::All => true,
            LineMatcher::Substrings(needles) => {
                let line = line.to_lowercase();
                needles.iter().any(|needle| line.contains(needle.as_str()))
            }
            LineMatcher::Regex(regex) => regex.is_match(line),
        }
    }
}

/// Post-processing applied to the matched lines before they are joined.
pub type LinesCallback<'a> = &'a (dyn Fn(Vec<String>) -> Vec<String> + Send + Sync);

/// Reads `stream` to the end and returns the matching lines joined by `\n`.
///
/// Invalid UTF-8 is replaced rather than rejected. Cancellation is checked
/// between lines.
pub async fn filter_logs<R>(
    mut stream: R,
    filter: &LogMessagesFilter,
    callback: Option<LinesCallback<'_>>,
    token: &CancellationToken,
) -> Result<String, GatherError>
where
    R: AsyncBufRead + Unpin,
{
    let matcher = filter.matcher()?;
    let mut kept = Vec::new();
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(GatherError::ContextCancelled),
            read = stream.read_until(LINE_SEPARATOR, &mut buffer) => read?,
        };
        if read == 0 {
            break;
        }
        let line = String::from_utf8_lossy(trim_line_end(&buffer));
        if matcher.matches(&line) {
            kept.push(line.into_owned());
        }
    }

    if let Some(callback) = callback {
        kept = callback(kept);
    }
    Ok(kept.join("\n"))
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Which pods and containers logs are collected from.
#[derive(Debug, Clone, Default)]
pub struct LogContainersFilter {
    pub namespaces: Vec<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub pod_name_regex: Option<Regex>,
    pub container_name_regex: Option<Regex>,
    /// Maximum number of containers read per namespace, zero for no limit.
    pub max_namespace_containers: usize,
}

impl LogContainersFilter {
    pub fn namespace(namespace: impl Into<String>) -> Self {
        LogContainersFilter {
            namespaces: vec![namespace.into()],
            ..LogContainersFilter::default()
        }
    }

    pub fn label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn container_name_regex(mut self, regex: Regex) -> Self {
        self.container_name_regex = Some(regex);
        self
    }

    fn container_names(&self, pod: &Value) -> Vec<String> {
        ["containers", "initContainers"]
            .iter()
            .flat_map(|kind| tree::array_at(pod, &["spec", *kind]))
            .filter_map(|container| container.get("name").and_then(Value::as_str))
            .filter(|name| {
                self.container_name_regex
                    .as_ref()
                    .map_or(true, |regex| regex.is_match(name))
            })
            .map(str::to_string)
            .collect()
    }
}

/// Default archive path of filtered logs.
pub fn errors_log_name(namespace: &str, pod: &str, _container: &str) -> String {
    format!("config/pod/{namespace}/logs/{pod}/errors.log")
}

/// Filtered logs of every selected container, one record per non-empty log.
///
/// Containers above the per-namespace cap are skipped and reported as a
/// warning next to the records.
pub async fn collect_logs_from_containers(
    client: &dyn ClusterClient,
    token: &CancellationToken,
    containers: &LogContainersFilter,
    messages: &LogMessagesFilter,
    file_name: fn(&str, &str, &str) -> String,
) -> Result<(Vec<Record>, Vec<GatherError>), GatherError> {
    let mut records = Vec::new();
    let mut warnings = Vec::new();

    for namespace in &containers.namespaces {
        let options = ListOptions {
            label_selector: containers.label_selector.clone(),
            field_selector: containers.field_selector.clone(),
            ..ListOptions::default()
        };
        let pods = Pager::new(client, &PODS)
            .namespace(namespace)
            .options(options)
            .limit(PODS_PAGE_SIZE)
            .collect()
            .await?
            .items;
        if pods.is_empty() {
            info!("no pods in {} namespace were found", namespace);
            continue;
        }

        let mut read_containers = 0usize;
        let mut skipped_containers = 0usize;
        for pod in &pods {
            let pod_name = tree::name(pod);
            if let Some(regex) = &containers.pod_name_regex {
                if !regex.is_match(pod_name) {
                    continue;
                }
            }
            for container in containers.container_names(pod) {
                if containers.max_namespace_containers > 0
                    && read_containers >= containers.max_namespace_containers
                {
                    skipped_containers += 1;
                    continue;
                }
                read_containers += 1;

                let stream = client
                    .pod_logs(namespace, pod_name, &messages.pod_log_options(&container))
                    .await?;
                let logs = filter_logs(stream, messages, None, token).await?;
                if logs.trim().is_empty() {
                    continue;
                }
                records.push(Record::new(
                    file_name(namespace, pod_name, &container),
                    Raw(logs),
                ));
            }
        }

        if skipped_containers > 0 {
            debug!(
                "skipped {} containers in namespace {}",
                skipped_containers, namespace
            );
            warnings.push(GatherError::Warning(format!(
                "skipping {} containers on namespace {} (max: {})",
                skipped_containers, namespace, containers.max_namespace_containers
            )));
        }
    }

    Ok((records, warnings))
}

/// Reads from an inner reader but stops with EOF once `n` line separators
/// have been returned.
pub struct LineLimitedReader<R> {
    reader: R,
    remaining_lines: usize,
    total_lines_read: usize,
}

impl<R: Read> LineLimitedReader<R> {
    pub fn new(reader: R, max_lines: usize) -> Self {
        LineLimitedReader {
            reader,
            remaining_lines: max_lines,
            total_lines_read: 0,
        }
    }

    /// Separators seen in the underlying reader, including the ones in data
    /// dropped after the limit was reached.
    pub fn total_lines_read(&self) -> usize {
        self.total_lines_read
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Read for LineLimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining_lines == 0 {
            return Ok(0);
        }
        let read = self.reader.read(buf)?;
        let chunk = &buf[..read];
        self.total_lines_read += chunk.iter().filter(|b| **b == LINE_SEPARATOR).count();

        let mut offset = 0;
        while let Some(position) = chunk[offset..].iter().position(|b| *b == LINE_SEPARATOR) {
            offset += position + 1;
            self.remaining_lines -= 1;
            if self.remaining_lines == 0 {
                return Ok(offset);
            }
        }
        Ok(read)
    }
}

/// Counts the lines left in `reader`. Data without any separator is one line.
pub fn count_lines<R: Read>(mut reader: R) -> io::Result<usize> {
    let mut buffer = [0u8; 0x8000];
    let mut lines = 1;
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            return Ok(lines);
        }
        lines += buffer[..read]
            .iter()
            .filter(|b| **b == LINE_SEPARATOR)
            .count();
    }
}
