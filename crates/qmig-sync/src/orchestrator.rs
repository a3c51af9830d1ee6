//! Stage sequencing in dependency order.
//!
//! Stages run one after another; a stage only starts once every entity type it resolves
//! foreign keys against has completed. A fatal stage error (fetch exhaustion, store outage)
//! aborts that stage and every later stage that depends on it, directly or transitively.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use qmig_adapters::{parse_records, AnswerSource, SheetSource, SourceRecord, Validated};
use qmig_core::{CanonicalEntity, EntityType, QuestionKind, TargetRow, MIGRATION_ORDER};
use qmig_storage::{
    FetchError, MappingStore, PaginatorError, Retried, RetryPolicy, SourcePaginator, StoreError,
    TargetStore,
};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::context::{DryRunRows, RunContext, RunMode};
use crate::identity::IdentityMap;
use crate::projector::{answer_entity, AnswerProjector, ProjectionStats};
use crate::resolver::{RevisionIndex, RevisionResolver};
use crate::transform::{transform_record, TransformError};
use crate::writer::{BatchWriter, FailureLog, ProgressTracker};

pub const MAX_BATCH_SIZE: usize = 500;

/// Which stages to run and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationPlan {
    pub stages: Vec<EntityType>,
    pub mode: RunMode,
    pub dry_run: bool,
    /// Cap on records fetched per stage.
    pub limit: Option<usize>,
}

impl MigrationPlan {
    pub fn full(mode: RunMode) -> Self {
        Self {
            stages: MIGRATION_ORDER.to_vec(),
            mode,
            dry_run: false,
            limit: None,
        }
    }

    pub fn answers_only() -> Self {
        Self {
            stages: vec![EntityType::Answer],
            ..Self::full(RunMode::Incremental)
        }
    }

    pub fn test_subset(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::full(RunMode::Incremental)
        }
    }

    /// Restricts the plan to `only`; an empty slice keeps every stage.
    pub fn with_only(mut self, only: &[EntityType]) -> Self {
        if !only.is_empty() {
            self.stages.retain(|stage| only.contains(stage));
        }
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        if limit.is_some() {
            self.limit = limit;
        }
        self
    }

    /// Stages in migration order, each once.
    pub fn ordered_stages(&self) -> Vec<EntityType> {
        let mut stages = self.stages.clone();
        stages.sort_by_key(|stage| stage.stage_index());
        stages.dedup();
        stages
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    FetchExhausted(PaginatorError),
    #[error(transparent)]
    FetchFailed(PaginatorError),
    #[error("target store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("dependency {0} did not complete")]
    DependencyFailed(EntityType),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Transform(TransformError),
}

impl From<PaginatorError> for StageError {
    fn from(err: PaginatorError) -> Self {
        match err {
            PaginatorError::Fatal {
                source: FetchError::NotConfigured(entity),
                ..
            } => StageError::Config(format!("no source endpoint configured for {entity}")),
            err @ PaginatorError::FetchExhausted { .. } => StageError::FetchExhausted(err),
            err @ PaginatorError::Fatal { .. } => StageError::FetchFailed(err),
        }
    }
}

impl From<Retried<StoreError>> for StageError {
    fn from(err: Retried<StoreError>) -> Self {
        StageError::StoreUnavailable(err.to_string())
    }
}

impl From<TransformError> for StageError {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::Store(err) => err.into(),
            other => StageError::Transform(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Aborted { reason: String },
    SkippedDependencyFailed { dependency: EntityType },
}

impl StageStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, StageStatus::Completed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageStatus::Completed => "completed",
            StageStatus::Aborted { .. } => "aborted",
            StageStatus::SkippedDependencyFailed { .. } => "skipped (dependency failed)",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub entity: EntityType,
    pub status: StageStatus,
    pub fetched: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub fk_unresolved: usize,
    pub projection: Option<ProjectionStats>,
    pub failures: FailureLog,
    pub duration_ms: u64,
    pub rows_per_sec: f64,
}

impl StageReport {
    pub fn new(entity: EntityType) -> Self {
        Self {
            entity,
            status: StageStatus::Completed,
            fetched: 0,
            migrated: 0,
            skipped: 0,
            failed: 0,
            fk_unresolved: 0,
            projection: None,
            failures: FailureLog::default(),
            duration_ms: 0,
            rows_per_sec: 0.0,
        }
    }

    fn skipped_for(entity: EntityType, dependency: EntityType) -> Self {
        Self {
            status: StageStatus::SkippedDependencyFailed { dependency },
            ..Self::new(entity)
        }
    }

    fn absorb(&mut self, tracker: &ProgressTracker) {
        self.migrated = tracker.migrated;
        self.skipped = tracker.skipped;
        self.failed = tracker.failed;
    }

    fn finish(&mut self, elapsed: Duration) {
        self.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let secs = elapsed.as_secs_f64();
        self.rows_per_sec = if secs > 0.0 {
            self.migrated as f64 / secs
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub dry_run: bool,
    pub limit: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,
}

impl RunSummary {
    /// Whether any stage aborted or was skipped because of an abort.
    pub fn has_fatal(&self) -> bool {
        self.stages.iter().any(|stage| !stage.status.is_completed())
    }

    pub fn exit_code(&self) -> i32 {
        if self.has_fatal() {
            2
        } else {
            0
        }
    }

    pub fn stage(&self, entity: EntityType) -> Option<&StageReport> {
        self.stages.iter().find(|stage| stage.entity == entity)
    }

    pub fn totals(&self) -> (usize, usize, usize) {
        self.stages.iter().fold((0, 0, 0), |(m, s, f), stage| {
            (m + stage.migrated, s + stage.skipped, f + stage.failed)
        })
    }
}

pub struct RunOutcome {
    pub summary: RunSummary,
    /// Would-be rows of a dry run; empty otherwise.
    pub dry_run_rows: DryRunRows,
}

/// First failed entity type that `entity` depends on, directly or transitively.
fn failed_dependency(entity: EntityType, failed: &HashSet<EntityType>) -> Option<EntityType> {
    entity.dependencies().iter().find_map(|dependency| {
        if failed.contains(dependency) {
            Some(*dependency)
        } else {
            failed_dependency(*dependency, failed)
        }
    })
}

fn check_dependencies(entity: EntityType, failed: &HashSet<EntityType>) -> Result<(), StageError> {
    match failed_dependency(entity, failed) {
        Some(dependency) => Err(StageError::DependencyFailed(dependency)),
        None => Ok(()),
    }
}

/// Entity types whose mappings a stage reads.
fn lookup_types(entity: EntityType) -> Vec<EntityType> {
    let mut types = vec![entity];
    types.extend_from_slice(entity.dependencies());
    if entity == EntityType::Answer {
        types.push(EntityType::User);
    }
    types
}

pub struct MigrationOrchestrator {
    paginator: SourcePaginator,
    target: Arc<dyn TargetStore>,
    mappings: Arc<dyn MappingStore>,
    retry: RetryPolicy,
    batch_size: usize,
    progress_every: usize,
}

impl MigrationOrchestrator {
    pub fn new(
        paginator: SourcePaginator,
        target: Arc<dyn TargetStore>,
        mappings: Arc<dyn MappingStore>,
    ) -> Self {
        Self {
            paginator,
            target,
            mappings,
            retry: RetryPolicy::default(),
            batch_size: 250,
            progress_every: 10,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn with_progress_every(mut self, chunks: usize) -> Self {
        self.progress_every = chunks.max(1);
        self
    }

    pub async fn run(&self, plan: &MigrationPlan) -> RunOutcome {
        let identity = if plan.dry_run {
            IdentityMap::cache_only(Arc::clone(&self.mappings), self.retry)
        } else {
            IdentityMap::new(Arc::clone(&self.mappings), self.retry)
        };
        let ctx = RunContext::new(plan.mode, plan.dry_run, identity);
        let stages = plan.ordered_stages();
        info!(
            run_id = %ctx.run_id,
            mode = plan.mode.as_str(),
            dry_run = plan.dry_run,
            limit = plan.limit,
            stages = ?stages,
            "migration run starting"
        );

        let mut failed = HashSet::new();
        let mut reports = Vec::with_capacity(stages.len());
        for entity in stages {
            if let Err(err @ StageError::DependencyFailed(dependency)) =
                check_dependencies(entity, &failed)
            {
                warn!(%entity, %dependency, "skipping stage: {err}");
                failed.insert(entity);
                reports.push(StageReport::skipped_for(entity, dependency));
                continue;
            }
            let span = info_span!("stage", run_id = %ctx.run_id, %entity);
            let report = self.run_stage(&ctx, plan, entity).instrument(span).await;
            if !report.status.is_completed() {
                failed.insert(entity);
            }
            reports.push(report);
        }
        ctx.identity.discard_cache();

        let summary = RunSummary {
            run_id: ctx.run_id,
            mode: plan.mode,
            dry_run: plan.dry_run,
            limit: plan.limit,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            stages: reports,
        };
        let (migrated, skipped, failed_rows) = summary.totals();
        info!(
            run_id = %summary.run_id,
            migrated,
            skipped,
            failed = failed_rows,
            fatal = summary.has_fatal(),
            "migration run finished"
        );
        RunOutcome {
            summary,
            dry_run_rows: ctx.take_dry_run_rows(),
        }
    }

    async fn run_stage(&self, ctx: &RunContext, plan: &MigrationPlan, entity: EntityType) -> StageReport {
        let started = Instant::now();
        let mut report = StageReport::new(entity);
        let mut tracker = ProgressTracker::new(entity, 0, self.progress_every);
        let exclusive = ctx.is_fresh() && !ctx.dry_run;
        let mut locked = false;

        let result = async {
            if exclusive {
                self.target.lock_entity(entity).await.map_err(|err| {
                    StageError::StoreUnavailable(format!("locking {entity}: {err}"))
                })?;
                locked = true;
                self.prepare_fresh(ctx, entity).await?;
            }
            self.execute_stage(ctx, plan, entity, &mut report, &mut tracker).await
        }
        .await;

        if locked {
            if let Err(err) = self.target.unlock_entity(entity).await {
                warn!(%entity, error = %err, "failed to release entity lock");
            }
        }
        report.absorb(&tracker);
        if let Err(err) = result {
            error!(%entity, error = %err, "stage aborted");
            report.status = StageStatus::Aborted {
                reason: err.to_string(),
            };
        }
        tracker.finish();
        report.finish(started.elapsed());
        report
    }

    /// Fresh mode wipes the target tables of the entity and its dependents before loading,
    /// together with their mappings, so no mapping outlives its row.
    async fn prepare_fresh(&self, ctx: &RunContext, entity: EntityType) -> Result<(), StageError> {
        self.retry
            .run(|_| self.target.truncate(entity), StoreError::disposition)
            .await?;
        let dependents = entity.dependents();
        for cleared in std::iter::once(entity).chain(dependents.iter().copied()) {
            ctx.identity.clear(cleared).await?;
        }
        info!(%entity, dependents = ?dependents, "truncated target tables and cleared mappings");
        Ok(())
    }

    async fn execute_stage(
        &self,
        ctx: &RunContext,
        plan: &MigrationPlan,
        entity: EntityType,
        report: &mut StageReport,
        tracker: &mut ProgressTracker,
    ) -> Result<(), StageError> {
        for lookup in lookup_types(entity) {
            if !ctx.identity.is_preloaded(lookup) {
                ctx.identity.preload_cache(lookup).await?;
            }
        }

        let items = self.paginator.fetch_all(entity, plan.limit).await?;
        report.fetched = items.len();
        let batch = parse_records(entity, items);
        for rejected in &batch.rejected {
            tracker.failed += 1;
            report.failures.push(
                rejected.external_id().map(str::to_string).into_iter().collect(),
                rejected.to_string(),
            );
        }
        tracker.set_total(report.fetched);

        match entity {
            EntityType::Sheet => self.sheet_stage(ctx, batch.accepted, report, tracker).await,
            EntityType::Answer => {
                let complete = plan.limit.is_none();
                self.answer_stage(ctx, batch.accepted, complete, report, tracker)
                    .await
            }
            _ => self.entity_stage(ctx, entity, batch.accepted, report, tracker).await,
        }
    }

    fn concurrency(&self, ctx: &RunContext) -> usize {
        if ctx.is_fresh() {
            self.batch_size
        } else {
            1
        }
    }

    fn writer<'a>(&'a self, ctx: &'a RunContext) -> BatchWriter<'a> {
        BatchWriter::new(self.target.as_ref(), ctx, self.retry, self.batch_size)
    }

    async fn entity_stage(
        &self,
        ctx: &RunContext,
        entity: EntityType,
        records: Vec<SourceRecord>,
        report: &mut StageReport,
        tracker: &mut ProgressTracker,
    ) -> Result<(), StageError> {
        let mut pending = Vec::with_capacity(records.len());
        if ctx.is_fresh() {
            pending = records;
        } else {
            for record in records {
                if ctx.identity.is_migrated(entity, record.external_id()).await? {
                    tracker.skipped += 1;
                } else {
                    pending.push(record);
                }
            }
        }

        let identity = &ctx.identity;
        let results: Vec<Result<CanonicalEntity, TransformError>> = stream::iter(pending.iter())
            .map(|record| transform_record(identity, record))
            .buffered(self.concurrency(ctx))
            .collect()
            .await;

        let mut entities = Vec::with_capacity(results.len());
        for (record, result) in pending.iter().zip(results) {
            match result {
                Ok(entity) => entities.push(entity),
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    if matches!(err, TransformError::FkUnresolved { .. }) {
                        report.fk_unresolved += 1;
                    }
                    warn!(external_id = record.external_id(), error = %err, "record not transformed");
                    tracker.failed += 1;
                    report
                        .failures
                        .push(vec![record.external_id().to_string()], err.to_string());
                }
            }
        }

        ctx.record_value_kinds(entities.iter().filter_map(|e| value_kind(&e.row)));
        self.writer(ctx)
            .write_all(&entities, tracker, &mut report.failures)
            .await?;
        Ok(())
    }

    async fn sheet_stage(
        &self,
        ctx: &RunContext,
        records: Vec<SourceRecord>,
        report: &mut StageReport,
        tracker: &mut ProgressTracker,
    ) -> Result<(), StageError> {
        let revisions: Vec<Validated<SheetSource>> = records
            .into_iter()
            .filter_map(|record| match record {
                SourceRecord::Sheet(sheet) => Some(sheet),
                _ => None,
            })
            .collect();
        let mut resolver = RevisionResolver::group(revisions);
        tracker.set_total(tracker.failed + resolver.groups().len());
        info!(
            revisions = resolver.revision_count(),
            groups = resolver.groups().len(),
            "grouped sheet revisions"
        );

        let identity = &ctx.identity;
        let fresh = ctx.is_fresh();
        let outcomes: Vec<Result<GroupOutcome, TransformError>> =
            stream::iter(resolver.groups().iter())
                .map(|group| async move {
                    if !fresh && RevisionResolver::is_fully_migrated(identity, group).await? {
                        let existing = RevisionResolver::existing_id(identity, group).await?;
                        return Ok(GroupOutcome::AlreadyMigrated(existing));
                    }
                    RevisionResolver::resolve_group(identity, group)
                        .await
                        .map(GroupOutcome::Resolved)
                })
                .buffered(self.concurrency(ctx))
                .collect()
                .await;

        let mut latest = Vec::new();
        let mut entities = Vec::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(GroupOutcome::AlreadyMigrated(existing)) => {
                    tracker.skipped += 1;
                    if let Some(id) = existing {
                        latest.push((id, index));
                    }
                }
                Ok(GroupOutcome::Resolved(entity)) => {
                    latest.push((entity.internal_id, index));
                    entities.push(entity);
                }
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    if matches!(err, TransformError::FkUnresolved { .. }) {
                        report.fk_unresolved += 1;
                    }
                    let external_ids = resolver.groups()[index].external_ids();
                    warn!(revisions = ?external_ids, error = %err, "sheet group not transformed");
                    tracker.failed += 1;
                    report.failures.push(external_ids, err.to_string());
                }
            }
        }

        self.writer(ctx)
            .write_all(&entities, tracker, &mut report.failures)
            .await?;
        for (sheet_id, index) in latest {
            resolver.record_latest(sheet_id, index);
        }
        ctx.merge_revisions(resolver.into_index());
        Ok(())
    }

    /// `complete` says whether every source answer was fetched; only then are cells that no
    /// longer win pruned from the target.
    async fn answer_stage(
        &self,
        ctx: &RunContext,
        records: Vec<SourceRecord>,
        complete: bool,
        report: &mut StageReport,
        tracker: &mut ProgressTracker,
    ) -> Result<(), StageError> {
        let answers: Vec<Validated<AnswerSource>> = records
            .into_iter()
            .filter_map(|record| match record {
                SourceRecord::Answer(answer) => Some(answer),
                _ => None,
            })
            .collect();

        let target = self.target.as_ref();
        let (stored_revisions, stored_kinds) = futures::try_join!(
            self.retry
                .run(|_| target.sheet_latest_revisions(), StoreError::disposition),
            self.retry.run(|_| target.value_kinds(), StoreError::disposition),
        )?;
        let mut revisions = RevisionIndex::from_map(stored_revisions);
        revisions.extend(ctx.revisions());
        let mut kinds: HashMap<Uuid, QuestionKind> = stored_kinds;
        kinds.extend(ctx.value_kinds());

        // Candidate resolution only reads mappings, so it runs wide in either mode.
        let mut projection = AnswerProjector::new(&ctx.identity, &kinds, self.batch_size)
            .project(&answers, &revisions)
            .await?;
        info!(
            records = projection.stats.records,
            placeholders = projection.stats.placeholders_filtered,
            fk_unresolved = projection.stats.fk_unresolved,
            stale_revision = projection.stats.stale_revision,
            superseded = projection.stats.superseded,
            retained = projection.stats.retained,
            "projected answers"
        );
        report.fk_unresolved = projection.stats.fk_unresolved;
        tracker.set_total(tracker.failed + projection.winners.len());

        let mut entities = Vec::with_capacity(projection.winners.len());
        let mut kept_cells = Vec::new();
        for winner in &projection.winners {
            let entity = answer_entity(winner);
            if matches!(entity.row, TargetRow::AnswerCell(_)) {
                kept_cells.push(entity.internal_id);
            }
            // A mapping to another id predates a re-minted sheet and does not count.
            if !ctx.is_fresh()
                && ctx
                    .identity
                    .get(EntityType::Answer, &winner.external_id)
                    .await?
                    == Some(entity.internal_id)
            {
                tracker.skipped += 1;
                continue;
            }
            entities.push(entity);
        }

        let written = self
            .writer(ctx)
            .write_all(&entities, tracker, &mut report.failures)
            .await;
        if written.is_ok() && complete && !ctx.dry_run {
            projection.stats.pruned_cells = self.prune_cells(&revisions, &kept_cells).await?;
        }
        report.projection = Some(projection.stats);
        written?;
        Ok(())
    }

    /// Removes cells of every known sheet that are not among this run's winners, so a sheet's
    /// table only ever holds rows of its latest revision.
    async fn prune_cells(&self, revisions: &RevisionIndex, keep: &[Uuid]) -> Result<usize, StageError> {
        let sheet_ids = revisions.sheet_ids();
        if sheet_ids.is_empty() {
            return Ok(0);
        }
        let target = self.target.as_ref();
        let removed = self
            .retry
            .run(
                |_| target.prune_answer_cells(&sheet_ids, keep),
                StoreError::disposition,
            )
            .await?;
        if removed > 0 {
            info!(sheets = sheet_ids.len(), removed, "removed outdated list-table cells");
        }
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }
}

enum GroupOutcome {
    AlreadyMigrated(Option<Uuid>),
    Resolved(CanonicalEntity),
}

fn value_kind(row: &TargetRow) -> Option<(Uuid, QuestionKind)> {
    match row {
        TargetRow::Question(question) => Some((question.id, question.kind)),
        TargetRow::ListTableColumn(column) => Some((column.id, column.kind)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_orders_and_filters_stages() {
        let plan = MigrationPlan::full(RunMode::Incremental)
            .with_only(&[EntityType::Answer, EntityType::Company, EntityType::Sheet]);
        assert_eq!(
            plan.ordered_stages(),
            vec![EntityType::Company, EntityType::Sheet, EntityType::Answer]
        );
        assert_eq!(MigrationPlan::test_subset(25).limit, Some(25));
        assert_eq!(MigrationPlan::answers_only().stages, vec![EntityType::Answer]);
    }

    #[test]
    fn dependency_failure_is_transitive() {
        let failed = HashSet::from([EntityType::Section]);
        assert_eq!(
            failed_dependency(EntityType::Choice, &failed),
            Some(EntityType::Section)
        );
        assert_eq!(failed_dependency(EntityType::Tag, &failed), None);
        assert_eq!(failed_dependency(EntityType::User, &failed), None);
    }

    #[test]
    fn summary_exit_code_reflects_aborts() {
        let mut aborted = StageReport::new(EntityType::Tag);
        aborted.status = StageStatus::Aborted {
            reason: "store down".into(),
        };
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            mode: RunMode::Incremental,
            dry_run: false,
            limit: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            stages: vec![StageReport::new(EntityType::Company), aborted],
        };
        assert!(summary.has_fatal());
        assert_eq!(summary.exit_code(), 2);
    }
}
