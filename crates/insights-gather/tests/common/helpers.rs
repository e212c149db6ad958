// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use flate2::read::GzDecoder;
use insights_gather::record::{Raw, Record};
use insights_gather::recorder::DiskRecorder;
use insights_gather::registry::{GatherOutput, GatheringFunction};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Archive entries by path.
pub type ArchiveEntries = BTreeMap<String, Vec<u8>>;

/// A recorder writing to `dir` that never flushes on its own.
pub fn recorder(dir: &Path) -> DiskRecorder {
    DiskRecorder::new(dir, Duration::from_secs(3600), usize::MAX)
}

/// Every `insights-*.tar.gz` file of `dir`, oldest first.
#[allow(dead_code)]
pub fn archives(dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = std::fs::read_dir(dir)
        .expect("read archive directory")
        .map(|entry| entry.expect("directory entry").path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("insights-") && name.ends_with(".tar.gz"))
        })
        .collect();
    found.sort();
    found
}

/// Reads every file entry of a gzipped tar archive.
pub fn read_archive(path: &Path) -> ArchiveEntries {
    let file = File::open(path).expect("open archive");
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut entries = BTreeMap::new();
    for entry in archive.entries().expect("archive entries") {
        let mut entry = entry.expect("archive entry");
        let name = entry
            .path()
            .expect("entry path")
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).expect("entry data");
        entries.insert(name, data);
    }
    entries
}

/// The meta record of an archive, parsed.
pub fn meta(entries: &ArchiveEntries) -> Value {
    let data = entries
        .get("insights-operator/gathers.json")
        .expect("meta record in archive");
    serde_json::from_slice(data).expect("meta record is JSON")
}

/// Status report of task `name` in the meta record.
pub fn task_report<'a>(meta: &'a Value, name: &str) -> &'a Value {
    meta["status_reports"]
        .as_array()
        .expect("status reports")
        .iter()
        .find(|report| report["name"] == name)
        .unwrap_or_else(|| panic!("no status report for {name}"))
}

/// `count` raw records named `<prefix>/<i>`.
pub fn raw_records(prefix: &str, count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| Record::new(format!("{prefix}/{i}"), Raw(format!("{prefix} record {i}"))))
        .collect()
}

/// A task returning `output` every time it runs.
pub fn fixed_task(name: &str, can_fail: bool, output: fn() -> GatherOutput) -> GatheringFunction {
    let run = move |_token: CancellationToken| async move { output() };
    if can_fail {
        GatheringFunction::failable(name, run)
    } else {
        GatheringFunction::important(name, run)
    }
}
