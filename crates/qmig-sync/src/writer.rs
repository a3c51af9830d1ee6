use std::time::Duration;

use chrono::Utc;
use qmig_core::{CanonicalEntity, EntityType, MappingEntry, TargetRow};
use qmig_storage::{Retried, RetryPolicy, StoreError, TargetStore};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::context::RunContext;

/// Failure samples kept per stage; counts are always exact.
pub const MAX_RECORDED_FAILURES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    pub external_ids: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FailureLog {
    pub count: usize,
    pub samples: Vec<RowFailure>,
}

impl FailureLog {
    pub fn push(&mut self, external_ids: Vec<String>, reason: impl Into<String>) {
        self.count += 1;
        if self.samples.len() < MAX_RECORDED_FAILURES {
            self.samples.push(RowFailure {
                external_ids,
                reason: reason.into(),
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub processed: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub elapsed_secs: f64,
    pub rows_per_sec: f64,
    pub eta_secs: Option<f64>,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.processed as f64 * 100.0 / self.total as f64
        }
    }
}

/// Throughput is processed / elapsed; ETA is remaining / throughput, unknown until
/// something has been processed.
pub fn throughput_and_eta(total: usize, processed: usize, elapsed: Duration) -> (f64, Option<f64>) {
    let secs = elapsed.as_secs_f64();
    if processed == 0 || secs <= 0.0 {
        return (0.0, None);
    }
    let rate = processed as f64 / secs;
    let remaining = total.saturating_sub(processed) as f64;
    (rate, Some(remaining / rate))
}

/// Live stage counters with periodic progress lines.
pub struct ProgressTracker {
    entity: EntityType,
    total: usize,
    every: usize,
    started: Instant,
    chunks: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ProgressTracker {
    pub fn new(entity: EntityType, total: usize, every: usize) -> Self {
        Self {
            entity,
            total,
            every: every.max(1),
            started: Instant::now(),
            chunks: 0,
            migrated: 0,
            skipped: 0,
            failed: 0,
        }
    }

    pub fn set_total(&mut self, total: usize) {
        self.total = total;
    }

    pub fn processed(&self) -> usize {
        self.migrated + self.skipped + self.failed
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let elapsed = self.started.elapsed();
        let processed = self.processed();
        let (rows_per_sec, eta_secs) = throughput_and_eta(self.total, processed, elapsed);
        ProgressSnapshot {
            total: self.total,
            processed,
            migrated: self.migrated,
            skipped: self.skipped,
            failed: self.failed,
            elapsed_secs: elapsed.as_secs_f64(),
            rows_per_sec,
            eta_secs,
        }
    }

    pub fn chunk_done(&mut self) {
        self.chunks += 1;
        if self.chunks % self.every == 0 {
            self.log("progress");
        }
    }

    pub fn finish(&self) -> ProgressSnapshot {
        self.log("stage finished");
        self.snapshot()
    }

    fn log(&self, message: &str) {
        let s = self.snapshot();
        info!(
            entity = %self.entity,
            processed = s.processed,
            total = s.total,
            percent = %format!("{:.1}", s.percent()),
            rows_per_sec = %format!("{:.1}", s.rows_per_sec),
            eta_secs = s.eta_secs.map(|e| e.round() as u64),
            migrated = s.migrated,
            skipped = s.skipped,
            failed = s.failed,
            "{message}"
        );
    }
}

/// Chunked writer with row-by-row fallback. Mappings are recorded only for rows that landed.
pub struct BatchWriter<'a> {
    target: &'a dyn TargetStore,
    ctx: &'a RunContext,
    retry: RetryPolicy,
    batch_size: usize,
}

impl<'a> BatchWriter<'a> {
    pub fn new(
        target: &'a dyn TargetStore,
        ctx: &'a RunContext,
        retry: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            target,
            ctx,
            retry,
            batch_size: batch_size.max(1),
        }
    }

    /// Writes every entity. Only an unavailable store is returned as an error; rejected rows
    /// are counted as failed and logged.
    pub async fn write_all(
        &self,
        entities: &[CanonicalEntity],
        tracker: &mut ProgressTracker,
        failures: &mut FailureLog,
    ) -> Result<(), Retried<StoreError>> {
        for chunk in entities.chunks(self.batch_size) {
            self.write_chunk(chunk, tracker, failures).await?;
            tracker.chunk_done();
        }
        Ok(())
    }

    async fn write_chunk(
        &self,
        chunk: &[CanonicalEntity],
        tracker: &mut ProgressTracker,
        failures: &mut FailureLog,
    ) -> Result<(), Retried<StoreError>> {
        let rows: Vec<TargetRow> = chunk.iter().map(|e| e.row.clone()).collect();

        if self.ctx.dry_run {
            self.ctx.record_dry_run_rows(&rows);
            self.record_mappings(chunk.iter()).await?;
            tracker.migrated += chunk.len();
            return Ok(());
        }

        let err = match self
            .retry
            .run(|_| self.target.write_chunk(&rows), StoreError::disposition)
            .await
        {
            Ok(()) => {
                self.record_mappings(chunk.iter()).await?;
                tracker.migrated += chunk.len();
                return Ok(());
            }
            Err(err) => err,
        };
        if !matches!(err.error, StoreError::Rejected(_)) {
            return Err(err);
        }

        warn!(
            rows = chunk.len(),
            error = %err.error,
            "chunk rejected; retrying row by row"
        );
        let mut written = Vec::with_capacity(chunk.len());
        for entity in chunk {
            match self
                .retry
                .run(|_| self.target.write_row(&entity.row), StoreError::disposition)
                .await
            {
                Ok(()) => written.push(entity),
                Err(Retried {
                    error: StoreError::Rejected(reason),
                    ..
                }) => {
                    warn!(
                        table = entity.row.table_name(),
                        external_ids = ?entity.external_ids,
                        %reason,
                        "row rejected"
                    );
                    tracker.failed += 1;
                    failures.push(entity.external_ids.clone(), reason);
                }
                Err(fatal) => return Err(fatal),
            }
        }
        self.record_mappings(written.iter().copied()).await?;
        tracker.migrated += written.len();
        Ok(())
    }

    async fn record_mappings(
        &self,
        entities: impl Iterator<Item = &CanonicalEntity>,
    ) -> Result<(), Retried<StoreError>> {
        let now = Utc::now();
        let entries: Vec<MappingEntry> = entities.flat_map(|e| e.mapping_entries(now)).collect();
        self.ctx.identity.set_batch(&entries).await
    }
}
