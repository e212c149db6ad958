// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffers records in memory and writes them out as gzipped tar archives.
//!
//! Archives are named `insights-<UTC timestamp>.tar.gz` after the newest
//! record they contain, so lexicographic order of the names is chronological.
//! The recorder also prunes expired archives and hands the newest one to the
//! uploader through [`DiskRecorder::summary`].

use crate::error::GatherError;
use crate::record::Record;
use chrono::{DateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use rand::Rng;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Soft size of a single log payload, also the maximum buffered archive size.
pub const MAX_LOG_SIZE: usize = 8 * 1024 * 1024;

/// Name of the record describing the gather run itself. It is never rejected
/// for size.
pub const META_RECORD_NAME: &str = "insights-operator/gathers";

const ARCHIVE_PREFIX: &str = "insights-";
const ARCHIVE_SUFFIX: &str = ".tar.gz";
const ARCHIVE_TIME_FORMAT: &str = "%Y-%m-%d-%H%M%S";
const ENTRY_MODE: u32 = 0o640;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_FACTOR: f64 = 1.5;
const BACKOFF_STEPS: usize = 4;
const PRUNE_JITTER: f64 = 0.2;

#[derive(Clone)]
struct Buffered {
    filename: String,
    fingerprint: String,
    captured_at: DateTime<Utc>,
    /// `None` once the record was written to an archive. The entry is kept so
    /// that an unchanged record in a later run is not written again.
    data: Option<Arc<Vec<u8>>>,
}

impl Buffered {
    fn size(&self) -> usize {
        self.data.as_ref().map_or(0, |data| data.len())
    }
}

#[derive(Default)]
struct Archive {
    records: HashMap<String, Buffered>,
    size: usize,
}

/// The newest archive, opened for reading.
#[derive(Debug)]
pub struct Summary {
    pub path: PathBuf,
    pub file: File,
}

pub struct DiskRecorder {
    base_path: PathBuf,
    flush_size: usize,
    max_archive_size: usize,
    interval: Duration,
    archive: Mutex<Archive>,
    flush_tx: mpsc::Sender<()>,
    flush_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl DiskRecorder {
    pub fn new(base_path: impl Into<PathBuf>, interval: Duration, flush_size: usize) -> Self {
        let (flush_tx, flush_rx) = mpsc::channel(1);
        DiskRecorder {
            base_path: base_path.into(),
            flush_size,
            max_archive_size: MAX_LOG_SIZE,
            interval,
            archive: Mutex::new(Archive::default()),
            flush_tx,
            flush_rx: Mutex::new(Some(flush_rx)),
        }
    }

    /// Overrides the buffered size above which records are rejected.
    pub fn with_max_archive_size(mut self, max_archive_size: usize) -> Self {
        self.max_archive_size = max_archive_size;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Archives older than this are pruned even if they were never reported.
    pub fn max_age(&self) -> Duration {
        self.interval * 6 * 24
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Archive>, GatherError> {
        self.archive
            .lock()
            .map_err(|_| GatherError::Recorder("recorder lock poisoned".to_string()))
    }

    /// Buffers `record` for the next flush.
    ///
    /// Returns the warnings raised while storing it. An unchanged record
    /// (same name, same non-empty fingerprint) is ignored.
    pub fn record(&self, record: Record) -> Result<Vec<String>, GatherError> {
        let filename = record.filename();
        let (data, fingerprint) = record.marshal()?;
        debug!("recording {} with fingerprint={}", filename, fingerprint);

        let mut archive = self.lock()?;
        let mut warnings = Vec::new();

        let replaced_size = match archive.records.get(&filename) {
            Some(existing) if !fingerprint.is_empty() && existing.fingerprint == fingerprint => {
                return Ok(warnings);
            }
            Some(existing) => existing.size(),
            None => 0,
        };

        let size = data.len();
        if record.name != META_RECORD_NAME
            && archive.size - replaced_size + size > self.max_archive_size
        {
            drop(archive);
            self.signal_flush();
            return Err(GatherError::Recorder(format!(
                "record {}(size={}) exceeds the archive size limit {} and will not be included in the archive",
                filename, size, self.max_archive_size
            )));
        }

        if let Some(existing) = archive.records.get(&filename).filter(|r| r.data.is_some()) {
            warnings.push(format!(
                "the record with the same name \"{}\" was already recorded and had the fingerprint \"{}\", overwriting with the record having fingerprint \"{}\"",
                filename, existing.fingerprint, fingerprint
            ));
        }
        if let Some(other) = archive
            .records
            .values()
            .find(|r| r.data.is_some() && r.filename != filename && r.fingerprint == fingerprint)
        {
            warnings.push(format!(
                "the record with the same fingerprint \"{}\" was already recorded at path \"{}\", recording another one with a different path \"{}\"",
                fingerprint, other.filename, filename
            ));
        }

        archive.size = archive.size - replaced_size + size;
        archive.records.insert(
            filename.clone(),
            Buffered {
                filename,
                fingerprint,
                captured_at: record.captured_at.unwrap_or_else(Utc::now),
                data: Some(Arc::new(data)),
            },
        );
        let over = archive.size > self.flush_size;
        drop(archive);

        if over {
            self.signal_flush();
        }
        Ok(warnings)
    }

    fn signal_flush(&self) {
        // a pending signal is enough
        let _ = self.flush_tx.try_send(());
    }

    /// Number of records waiting for a flush and their total size.
    pub fn pending(&self) -> (usize, usize) {
        match self.lock() {
            Ok(archive) => (
                archive.records.values().filter(|r| r.data.is_some()).count(),
                archive.size,
            ),
            Err(_) => (0, 0),
        }
    }

    fn snapshot(&self) -> Result<Vec<Buffered>, GatherError> {
        let archive = self.lock()?;
        let mut records: Vec<Buffered> = archive
            .records
            .values()
            .filter(|r| r.data.is_some())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(records)
    }

    fn clear(&self, written: &[Buffered]) -> Result<(), GatherError> {
        let mut archive = self.lock()?;
        let mut freed = 0;
        for record in written {
            let Some(existing) = archive.records.get_mut(&record.filename) else {
                continue;
            };
            if existing.captured_at != record.captured_at
                || existing.fingerprint != record.fingerprint
            {
                continue;
            }
            if let Some(data) = existing.data.take() {
                freed += data.len();
            }
        }
        archive.size = archive.size.saturating_sub(freed);
        Ok(())
    }

    /// Writes every buffered record into a new archive.
    ///
    /// Returns the path of the archive, or `None` when there was nothing to
    /// write or an archive with the same name already exists.
    pub async fn flush(&self, token: &CancellationToken) -> Result<Option<PathBuf>, GatherError> {
        let records = self.snapshot()?;
        let Some(newest) = records.iter().map(|r| r.captured_at).max() else {
            debug!("no records to flush");
            return Ok(None);
        };

        let path = self.base_path.join(archive_name(newest));
        let started = std::time::Instant::now();
        let written = {
            let path = path.clone();
            let records = records.clone();
            let token = token.clone();
            tokio::task::spawn_blocking(move || write_archive(&path, &records, &token))
                .await
                .map_err(|e| GatherError::Recorder(format!("archive writer failed: {e}")))??
        };
        if !written {
            return Ok(None);
        }

        self.clear(&records)?;
        info!(
            "wrote {} records to {} in {}ms",
            records.len(),
            path.display(),
            started.elapsed().as_millis()
        );
        Ok(Some(path))
    }

    /// Deletes archives modified at or before `older_than`.
    pub fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, GatherError> {
        let mut deleted = 0;
        let mut errors = Vec::new();
        for (path, modified) in self.archives()? {
            if modified > older_than {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) => errors.push(format!("{}: {e}", path.display())),
            }
        }
        match errors.len() {
            0 => {
                if deleted > 0 {
                    info!(
                        "deleted {} archives older than {}",
                        deleted,
                        older_than.to_rfc3339()
                    );
                }
                Ok(deleted)
            }
            1 => Err(GatherError::Recorder(format!(
                "failed to delete expired file: {}",
                errors[0]
            ))),
            n => Err(GatherError::Recorder(format!(
                "failed to delete {} expired files: {}",
                n, errors[0]
            ))),
        }
    }

    /// Opens the newest archive modified after `since`.
    pub fn summary(&self, since: DateTime<Utc>) -> Result<Option<Summary>, GatherError> {
        let newest = self
            .archives()?
            .into_iter()
            .filter(|(_, modified)| *modified > since)
            .map(|(path, _)| path)
            .max();
        match newest {
            Some(path) => {
                let file = File::open(&path)?;
                debug!("found archive to upload: {}", path.display());
                Ok(Some(Summary { path, file }))
            }
            None => Ok(None),
        }
    }

    /// Regular files of the base directory named like an archive.
    fn archives(&self) -> Result<Vec<(PathBuf, DateTime<Utc>)>, GatherError> {
        let mut archives = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_archive_name(name) {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            archives.push((entry.path(), DateTime::<Utc>::from(metadata.modified()?)));
        }
        Ok(archives)
    }

    /// Flushes on every interval tick and whenever the buffer grows past the
    /// flush size. Runs a last flush once `token` is cancelled.
    pub async fn periodically_flush(self: Arc<Self>, token: CancellationToken) {
        let receiver = self.flush_rx.lock().ok().and_then(|mut rx| rx.take());
        let Some(mut flush_rx) = receiver else {
            warn!("periodic flush is already running");
            return;
        };

        let mut interval = tokio::time::interval(self.interval);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
                Some(()) = flush_rx.recv() => {}
            }
            let (this, run) = (&self, &token);
            retry_with_backoff(&token, "flush records to disk", || async move {
                this.flush(run).await.map(|_| ())
            })
            .await;
        }

        // the run token is already cancelled, the last flush must not observe it
        if let Err(e) = self.flush(&CancellationToken::new()).await {
            let (pending, _) = self.pending();
            error!(
                "unable to write records on shutdown, exiting with {} records not flushed to disk: {}",
                pending, e
            );
        }
    }

    /// Prunes expired archives every two intervals, with some jitter.
    ///
    /// The cutoff is the last reported time, but never older than
    /// [`DiskRecorder::max_age`].
    pub async fn periodically_prune<F>(self: Arc<Self>, token: CancellationToken, last_reported: F)
    where
        F: Fn() -> DateTime<Utc> + Send + Sync,
    {
        let base = self.interval * 2;
        let period = base.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..=PRUNE_JITTER));
        info!(
            "pruning old reports every {}s, max age is {}s",
            period.as_secs(),
            self.max_age().as_secs()
        );

        let max_age = chrono::Duration::from_std(self.max_age())
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let mut interval = tokio::time::interval(period);
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = interval.tick() => {}
            }
            let (this, last_reported) = (&self, &last_reported);
            retry_with_backoff(&token, "prune older records", || async move {
                let cutoff = last_reported().max(Utc::now() - max_age);
                this.prune(cutoff).map(|_| ())
            })
            .await;
        }
    }
}

fn archive_name(at: DateTime<Utc>) -> String {
    format!(
        "{}{}{}",
        ARCHIVE_PREFIX,
        at.format(ARCHIVE_TIME_FORMAT),
        ARCHIVE_SUFFIX
    )
}

fn is_archive_name(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX) && name.ends_with(ARCHIVE_SUFFIX)
}

async fn retry_with_backoff<F, Fut>(token: &CancellationToken, what: &str, mut attempt: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), GatherError>>,
{
    let mut delay = BACKOFF_INITIAL;
    for step in 1..=BACKOFF_STEPS {
        match attempt().await {
            Ok(()) => return,
            Err(e) => error!("failed to {} (attempt {}/{}): {}", what, step, BACKOFF_STEPS, e),
        }
        if step == BACKOFF_STEPS {
            break;
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = delay.mul_f64(BACKOFF_FACTOR);
    }
}

fn create_exclusive(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(ENTRY_MODE);
    }
    options.open(path)
}

/// Returns `false` when the archive already exists.
fn write_archive(
    path: &Path,
    records: &[Buffered],
    token: &CancellationToken,
) -> Result<bool, GatherError> {
    let file = match create_exclusive(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            error!("tried to copy to {} which already exists", path.display());
            return Ok(false);
        }
        Err(e) => {
            return Err(GatherError::Recorder(format!(
                "unable to create archive: {e}"
            )))
        }
    };

    if let Err(e) = write_entries(file, records, token) {
        // never leave a truncated archive behind for the uploader
        if let Err(remove) = fs::remove_file(path) {
            warn!("unable to remove partial archive {}: {}", path.display(), remove);
        }
        return Err(e);
    }
    Ok(true)
}

fn write_entries(
    file: File,
    records: &[Buffered],
    token: &CancellationToken,
) -> Result<(), GatherError> {
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for record in records {
        if token.is_cancelled() {
            return Err(GatherError::ContextCancelled);
        }
        let Some(data) = record.data.as_deref() else {
            continue;
        };
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(ENTRY_MODE);
        header.set_size(data.len() as u64);
        header.set_mtime(u64::try_from(record.captured_at.timestamp()).unwrap_or(0));
        builder
            .append_data(&mut header, &record.filename, data.as_slice())
            .map_err(|e| GatherError::Recorder(format!("unable to write tar entry: {e}")))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| GatherError::Recorder(format!("unable to close tar writer: {e}")))?;
    let file = encoder
        .finish()
        .map_err(|e| GatherError::Recorder(format!("unable to close gzip writer: {e}")))?;
    file.sync_all()
        .map_err(|e| GatherError::Recorder(format!("unable to close file: {e}")))?;
    Ok(())
}
