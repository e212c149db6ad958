// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runs the selected gathering tasks concurrently and feeds their records to
//! the recorder.
//!
//! Every task runs in its own tokio task and reports exactly once. When the
//! run token is cancelled the engine stops accepting results, aborts what is
//! still running and reports those tasks as timed out. A summary of the run is
//! recorded as [`META_RECORD_NAME`].

use crate::error::{unique_messages, GatherError};
use crate::record::{JsonItem, Record};
use crate::recorder::{DiskRecorder, META_RECORD_NAME};
use crate::registry::{GatheringFunction, Registry};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use lru::LruCache;
use serde::Serialize;
use std::any::Any;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CGROUP_MEMORY_FILES: [&str; 2] = [
    "/sys/fs/cgroup/memory.current",
    "/sys/fs/cgroup/memory/memory.usage_in_bytes",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    #[serde(rename = "Data Recorded")]
    DataRecorded,
    #[serde(rename = "Data Recorded With Errors")]
    DataRecordedWithErrors,
    #[serde(rename = "No Data")]
    NoData,
    Panic,
    Timeout,
}

/// Outcome of one task, as written to the meta record.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub duration_in_ms: u64,
    pub records_count: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub panic: Option<String>,
    pub status: TaskStatus,
    #[serde(skip)]
    pub can_fail: bool,
}

impl TaskReport {
    fn new(function: &GatheringFunction) -> Self {
        TaskReport {
            name: function.name.clone(),
            started_at: Utc::now(),
            duration_in_ms: 0,
            records_count: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            panic: None,
            status: TaskStatus::Timeout,
            can_fail: function.can_fail,
        }
    }

    fn settle_status(&mut self) {
        self.status = if self.panic.is_some() {
            TaskStatus::Panic
        } else if !self.errors.is_empty() {
            TaskStatus::DataRecordedWithErrors
        } else if self.records_count > 0 {
            TaskStatus::DataRecorded
        } else {
            TaskStatus::NoData
        };
    }

    /// Messages that fail the run when the task is important.
    fn failures(&self) -> impl Iterator<Item = String> + '_ {
        self.panic
            .iter()
            .map(|p| GatherError::Panic(p.clone()).to_string())
            .chain(self.errors.iter().cloned())
    }
}

/// Content of the meta record.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveMetadata {
    pub status_reports: Vec<TaskReport>,
    pub errors: Vec<String>,
    pub uptime_seconds: f64,
    pub container_memory_bytes_usage: u64,
}

impl ArchiveMetadata {
    pub fn report(&self, name: &str) -> Option<&TaskReport> {
        self.status_reports.iter().find(|r| r.name == name)
    }
}

/// Result of [`Engine::run`].
#[derive(Debug)]
pub struct GatherOutcome {
    pub metadata: ArchiveMetadata,
    /// Set when an important task failed or the run could not be recorded.
    pub error: Option<GatherError>,
}

impl GatherOutcome {
    pub fn into_result(self) -> Result<(), GatherError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Mutex protected LRU shared by the tasks of one engine.
pub struct SharedLru<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq, V: Clone> SharedLru<K, V> {
    pub fn new(capacity: usize) -> Self {
        SharedLru {
            inner: Mutex::new(LruCache::new(non_zero(capacity))),
        }
    }

    /// Sizes the cache for `estimate` entries plus a fifth of headroom.
    pub fn resize_for(&self, estimate: usize) {
        let capacity = estimate.saturating_mul(6).div_ceil(5);
        if let Ok(mut cache) = self.inner.lock() {
            cache.resize(non_zero(capacity));
            debug!("image cache resized to {}", capacity);
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().ok()?.get(key).cloned()
    }

    pub fn put(&self, key: K, value: V) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(key, value);
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().map_or(0, |cache| cache.cap().get())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map_or(0, |cache| cache.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

struct Finished {
    index: usize,
    records: Vec<Record>,
    errors: Vec<GatherError>,
    panic: Option<String>,
    elapsed: Duration,
}

pub struct Engine<C = ()> {
    registry: Registry,
    shared: Arc<C>,
    created: Instant,
}

impl<C> Engine<C> {
    /// `shared` is state the registered closures hold on to, such as caches.
    pub fn new(registry: Registry, shared: Arc<C>) -> Self {
        Engine {
            registry,
            shared,
            created: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn shared(&self) -> &Arc<C> {
        &self.shared
    }

    /// Runs the tasks named in `names` and records their results.
    ///
    /// Returns the comma joined errors of the important tasks, if any failed.
    pub async fn gather<S: AsRef<str>>(
        &self,
        token: &CancellationToken,
        names: &[S],
        recorder: &DiskRecorder,
    ) -> Result<(), GatherError> {
        self.run(token, names, recorder).await.into_result()
    }

    pub async fn run<S: AsRef<str>>(
        &self,
        token: &CancellationToken,
        names: &[S],
        recorder: &DiskRecorder,
    ) -> GatherOutcome {
        let (selected, unknown) = self.registry.resolve(names);
        let mut top_errors: Vec<String> = Vec::new();
        for name in unknown {
            let error = GatherError::UnknownTask(name);
            warn!("{}", error);
            top_errors.push(error.to_string());
        }

        let mut reports: Vec<TaskReport> = selected.iter().map(TaskReport::new).collect();
        let mut finished = vec![false; selected.len()];
        let mut tasks = JoinSet::new();
        for (index, function) in selected.iter().enumerate() {
            let run = Arc::clone(&function.run);
            let task_token = token.child_token();
            tasks.spawn(async move {
                let started = Instant::now();
                let outcome = AssertUnwindSafe(async move { run(task_token).await })
                    .catch_unwind()
                    .await;
                let (records, errors, panic) = match outcome {
                    Ok((records, errors)) => (records, errors, None),
                    Err(payload) => (Vec::new(), Vec::new(), Some(panic_message(payload))),
                };
                Finished {
                    index,
                    records,
                    errors,
                    panic,
                    elapsed: started.elapsed(),
                }
            });
        }
        debug!("started {} gathering tasks", selected.len());

        loop {
            let joined = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    warn!("gathering cancelled, {} tasks did not finish", tasks.len());
                    break;
                }
                joined = tasks.join_next() => joined,
            };
            match joined {
                None => break,
                Some(Ok(done)) => {
                    finished[done.index] = true;
                    let report = &mut reports[done.index];
                    collect(report, done, recorder, &mut top_errors);
                }
                Some(Err(e)) => error!("gathering task did not complete: {}", e),
            }
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        let now = Utc::now();
        for (report, done) in reports.iter_mut().zip(&finished) {
            if !done {
                report.status = TaskStatus::Timeout;
                report.duration_in_ms = (now - report.started_at)
                    .to_std()
                    .map_or(0, duration_ms);
                warn!("gathering function {} timed out", report.name);
            }
        }

        let failures = unique_messages(
            reports
                .iter()
                .filter(|r| !r.can_fail)
                .flat_map(TaskReport::failures),
        );

        reports.sort_by(|a, b| a.name.cmp(&b.name));
        let metadata = ArchiveMetadata {
            status_reports: reports,
            errors: unique_messages(top_errors),
            uptime_seconds: self.created.elapsed().as_millis() as f64 / 1000.0,
            container_memory_bytes_usage: container_memory_usage(),
        };

        let mut messages = failures;
        let meta = Record::new(META_RECORD_NAME, JsonItem(metadata.clone()));
        if let Err(e) = recorder.record(meta) {
            error!("unable to record archive metadata: {}", e);
            messages.push(format!("unable to record archive metadata: {e}"));
        }

        let error = if messages.is_empty() {
            None
        } else {
            Some(GatherError::Aggregated(unique_messages(messages).join(", ")))
        };
        GatherOutcome { metadata, error }
    }
}

fn collect(
    report: &mut TaskReport,
    done: Finished,
    recorder: &DiskRecorder,
    top_errors: &mut Vec<String>,
) {
    report.duration_in_ms = duration_ms(done.elapsed);

    if let Some(panic) = done.panic {
        error!("gathering function {} panicked: {}", report.name, panic);
        report.panic = Some(panic);
    }

    for error in done.errors {
        if error.is_warning() {
            warn!("gathering function {} produced a warning: {}", report.name, error);
            report.warnings.push(error.to_string());
        } else {
            error!("gathering function {} failed: {}", report.name, error);
            report.errors.push(error.to_string());
        }
    }

    for record in done.records {
        let filename = record.filename();
        match recorder.record(record) {
            Ok(warnings) => {
                report.records_count += 1;
                for warning in warnings {
                    warn!("recording {} of {}: {}", filename, report.name, warning);
                    report.warnings.push(warning);
                }
            }
            Err(e) => {
                error!("unable to record {} of {}: {}", filename, report.name, e);
                let message = format!("unable to record {filename}: {e}");
                top_errors.push(message.clone());
                report.errors.push(message);
            }
        }
    }

    report.settle_status();
    info!(
        "gathering function {} took {}ms to process {} records",
        report.name, report.duration_in_ms, report.records_count
    );
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn container_memory_usage() -> u64 {
    CGROUP_MEMORY_FILES
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .and_then(|usage| usage.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Raw;
    use crate::registry::GatheringFunction;
    use tempfile::TempDir;

    fn recorder(dir: &TempDir) -> DiskRecorder {
        DiskRecorder::new(
            dir.path(),
            Duration::from_secs(60),
            crate::recorder::MAX_LOG_SIZE,
        )
    }

    fn engine(functions: Vec<GatheringFunction>) -> Engine {
        let mut registry = Registry::new();
        for function in functions {
            registry.register(function);
        }
        Engine::new(registry, Arc::new(()))
    }

    fn raw(name: &str, body: &str) -> Record {
        Record::new(name, Raw(body.to_string()))
    }

    #[tokio::test]
    async fn test_failable_errors_do_not_fail_the_run() {
        let engine = engine(vec![
            GatheringFunction::important("a", |_| async {
                (vec![raw("config/a", "a")], Vec::new())
            }),
            GatheringFunction::failable("b", |_| async {
                (Vec::new(), vec![GatherError::FieldNotFound("spec".into())])
            }),
            GatheringFunction::important("c", |_| async {
                (vec![raw("config/c1", "1"), raw("config/c2", "2")], Vec::new())
            }),
        ]);
        let dir = TempDir::new().expect("temp dir");
        let recorder = recorder(&dir);

        let outcome = engine
            .run(&CancellationToken::new(), &["all"], &recorder)
            .await;
        assert!(outcome.error.is_none());

        let names: Vec<&str> = outcome
            .metadata
            .status_reports
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let b = outcome.metadata.report("b").expect("b report");
        assert_eq!(b.status, TaskStatus::DataRecordedWithErrors);
        assert_eq!(b.errors, vec!["field not found: spec"]);
        let c = outcome.metadata.report("c").expect("c report");
        assert_eq!(c.status, TaskStatus::DataRecorded);
        assert_eq!(c.records_count, 2);
        // three records plus the meta record
        assert_eq!(recorder.pending().0, 4);
    }

    #[tokio::test]
    async fn test_important_errors_are_joined_and_deduplicated() {
        let engine = engine(vec![
            GatheringFunction::important("a", |_| async {
                (
                    Vec::new(),
                    vec![
                        GatherError::FieldNotFound("x".into()),
                        GatherError::FieldNotFound("x".into()),
                    ],
                )
            }),
            GatheringFunction::important("b", |_| async {
                (Vec::new(), vec![GatherError::FieldNotFound("y".into())])
            }),
            GatheringFunction::important("warn", |_| async {
                (Vec::new(), vec![GatherError::Warning("skipped".into())])
            }),
        ]);
        let dir = TempDir::new().expect("temp dir");
        let recorder = recorder(&dir);

        let error = engine
            .gather(&CancellationToken::new(), &["a", "b", "warn"], &recorder)
            .await
            .expect_err("important tasks failed");
        assert_eq!(
            error.to_string(),
            "field not found: x, field not found: y"
        );
    }

    #[tokio::test]
    async fn test_unknown_tasks_are_listed_and_do_not_fail_the_run() {
        let engine = engine(vec![GatheringFunction::important("a", |_| async {
            (Vec::new(), Vec::new())
        })]);
        let dir = TempDir::new().expect("temp dir");
        let recorder = recorder(&dir);

        let outcome = engine
            .run(&CancellationToken::new(), &["a", "missing"], &recorder)
            .await;
        assert!(outcome.error.is_none());
        assert_eq!(
            outcome.metadata.errors,
            vec!["unknown gathering function: missing"]
        );
        let a = outcome.metadata.report("a").expect("a report");
        assert_eq!(a.status, TaskStatus::NoData);
    }

    #[tokio::test]
    async fn test_panics_are_contained() {
        let engine = engine(vec![
            GatheringFunction::failable("boom", |_| async {
                if true {
                    panic!("exploded");
                }
                (Vec::new(), Vec::new())
            }),
            GatheringFunction::important("ok", |_| async {
                (vec![raw("config/ok", "ok")], Vec::new())
            }),
        ]);
        let dir = TempDir::new().expect("temp dir");
        let recorder = recorder(&dir);

        let outcome = engine
            .run(&CancellationToken::new(), &["all"], &recorder)
            .await;
        assert!(outcome.error.is_none());
        let boom = outcome.metadata.report("boom").expect("boom report");
        assert_eq!(boom.status, TaskStatus::Panic);
        assert_eq!(boom.panic.as_deref(), Some("exploded"));
        let ok = outcome.metadata.report("ok").expect("ok report");
        assert_eq!(ok.status, TaskStatus::DataRecorded);
    }

    #[tokio::test]
    async fn test_blocked_task_times_out() {
        let (guard, mut released) = tokio::sync::oneshot::channel::<()>();
        let guard = Arc::new(Mutex::new(Some(guard)));
        let engine = engine(vec![
            GatheringFunction::important("stuck", move |_| {
                let held = guard.lock().ok().and_then(|mut guard| guard.take());
                async move {
                    let _held = held;
                    futures::future::pending::<()>().await;
                    (Vec::new(), Vec::new())
                }
            }),
            GatheringFunction::important("fast", |_| async {
                (vec![raw("config/fast", "fast")], Vec::new())
            }),
        ]);
        let dir = TempDir::new().expect("temp dir");
        let recorder = recorder(&dir);
        let token = CancellationToken::new();
        let deadline = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            deadline.cancel();
        });

        let started = Instant::now();
        let outcome = engine.run(&token, &["all"], &recorder).await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(outcome.error.is_none());
        assert!(
            matches!(
                released.try_recv(),
                Err(tokio::sync::oneshot::error::TryRecvError::Closed)
            ),
            "stuck task still running after the run returned"
        );

        let stuck = outcome.metadata.report("stuck").expect("stuck report");
        assert_eq!(stuck.status, TaskStatus::Timeout);
        assert!(stuck.duration_in_ms >= 100);
        let fast = outcome.metadata.report("fast").expect("fast report");
        assert_eq!(fast.status, TaskStatus::DataRecorded);
    }

    #[tokio::test]
    async fn test_recorder_errors_count_for_the_task() {
        let engine = engine(vec![GatheringFunction::important("big", |_| async {
            (vec![raw("config/big", "0123456789")], Vec::new())
        })]);
        let dir = TempDir::new().expect("temp dir");
        let recorder = recorder(&dir).with_max_archive_size(4);

        let outcome = engine
            .run(&CancellationToken::new(), &["big"], &recorder)
            .await;
        let big = outcome.metadata.report("big").expect("big report");
        assert_eq!(big.records_count, 0);
        assert_eq!(big.status, TaskStatus::DataRecordedWithErrors);
        assert_eq!(outcome.metadata.errors.len(), 1);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&[
            TaskStatus::DataRecorded,
            TaskStatus::DataRecordedWithErrors,
            TaskStatus::NoData,
            TaskStatus::Panic,
            TaskStatus::Timeout,
        ])
        .expect("serializable");
        assert_eq!(
            json,
            r#"["Data Recorded","Data Recorded With Errors","No Data","Panic","Timeout"]"#
        );
    }

    #[test]
    fn test_shared_lru_resize() {
        let cache: SharedLru<String, u32> = SharedLru::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.resize_for(10);
        assert_eq!(cache.capacity(), 12);
        cache.resize_for(3);
        assert_eq!(cache.capacity(), 4);

        for i in 0..6 {
            cache.put(format!("sha256:{i}"), i);
        }
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.get(&"sha256:0".to_string()), None);
        assert_eq!(cache.get(&"sha256:5".to_string()), Some(5));
    }
}
