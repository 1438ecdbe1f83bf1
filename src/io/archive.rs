//! Hail archive - writes finished hails to file
//!
//! Hails are written in JSONL format (one JSON object per line), each with
//! its full transition log, for the reporting side to pick up.

use crate::domain::hail::Hail;
use crate::infra::clock::Clock;
use crate::infra::metrics::Metrics;
use crate::services::hail_machine::HailMachine;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Serialize)]
struct ArchivedHail<'a> {
    archived_at: String,
    #[serde(flatten)]
    hail: &'a Hail,
}

/// Append-only archive writer
pub struct HailArchive {
    file_path: String,
}

impl HailArchive {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "hail_archive_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Append one hail; false if it could not be written
    pub fn write_hail(&self, hail: &Hail) -> bool {
        let record = ArchivedHail {
            archived_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            hail,
        };
        let result = serde_json::to_string(&record)
            .map_err(std::io::Error::from)
            .and_then(|json| self.append_line(&json));

        match result {
            Ok(()) => {
                debug!(hail_id = %hail.id(), status = %hail.status(), "hail_archived");
                true
            }
            Err(e) => {
                error!(hail_id = %hail.id(), error = %e, "hail_archive_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    pub fn write_hails(&self, hails: &[Hail]) -> usize {
        hails.iter().filter(|hail| self.write_hail(hail)).count()
    }
}

/// Move terminal hails that ended at or before `cutoff_ms` into the archive
pub fn archive_once(machine: &HailMachine, archive: &HailArchive, cutoff_ms: u64, metrics: &Metrics) -> usize {
    let drained = machine.drain_terminal(cutoff_ms);
    if drained.is_empty() {
        return 0;
    }
    let written = archive.write_hails(&drained);
    metrics.record_hails_archived(written as u64);
    info!(drained = %drained.len(), written = %written, "hails_archived");
    written
}

/// Archive on a fixed interval; on shutdown every terminal hail is archived
pub async fn run_archiver(
    machine: Arc<HailMachine>,
    archive: HailArchive,
    clock: Arc<dyn Clock>,
    archive_after_ms: u64,
    interval_secs: u64,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    info!(interval_secs = %interval_secs, archive_after_ms = %archive_after_ms, "hail_archiver_started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let cutoff = clock.now_ms().saturating_sub(archive_after_ms);
                archive_once(&machine, &archive, cutoff, &metrics);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    archive_once(&machine, &archive, u64::MAX, &metrics);
                    info!("hail_archiver_stopped");
                    return;
                }
            }
        }
    }
}
