use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use qmig_adapters::FixtureRecordSource;
use qmig_core::{EntityType, MappingEntry, TargetRow, MIGRATION_ORDER};
use qmig_storage::{
    MappingStore, MemoryMappingStore, MemoryTargetStore, MinIntervalLimiter, RetryPolicy,
    SourcePaginator,
};
use qmig_sync::{MigrationOrchestrator, MigrationPlan, RunMode, StageStatus};
use serde_json::Value;
use uuid::Uuid;

fn sample_fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample")
}

fn copy_fixtures(to: &Path) {
    for entry in std::fs::read_dir(sample_fixtures()).expect("fixture dir") {
        let entry = entry.expect("entry");
        std::fs::copy(entry.path(), to.join(entry.file_name())).expect("copy fixture");
    }
}

struct Harness {
    target: Arc<MemoryTargetStore>,
    mappings: Arc<MemoryMappingStore>,
    orchestrator: MigrationOrchestrator,
}

fn orchestrator(
    fixtures: &Path,
    target: Arc<MemoryTargetStore>,
    mappings: Arc<MemoryMappingStore>,
) -> MigrationOrchestrator {
    let retry = RetryPolicy {
        max_attempts: 3,
        backoff_step: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    };
    let paginator = SourcePaginator::new(
        Arc::new(FixtureRecordSource::new(fixtures)),
        Arc::new(MinIntervalLimiter::new(Duration::ZERO)),
        retry,
        4,
    );
    MigrationOrchestrator::new(paginator, target, mappings)
        .with_retry(retry)
        .with_batch_size(3)
}

fn harness(fixtures: &Path) -> Harness {
    let target = Arc::new(MemoryTargetStore::new());
    let mappings = Arc::new(MemoryMappingStore::new());
    Harness {
        orchestrator: orchestrator(fixtures, target.clone(), mappings.clone()),
        target,
        mappings,
    }
}

impl Harness {
    /// Same stores, new source. Fixture sources cache their files, so changed input needs
    /// a new orchestrator.
    fn reload(&mut self, fixtures: &Path) {
        self.orchestrator = orchestrator(fixtures, self.target.clone(), self.mappings.clone());
    }

    fn cell_rows(&self) -> BTreeSet<String> {
        self.target.answer_cells().into_iter().map(|c| c.row_key).collect()
    }

    fn ids_of(&self, table: &str) -> BTreeSet<Uuid> {
        self.target.rows(table).iter().map(TargetRow::internal_id).collect()
    }

    /// Answers and cells whose sheet or question row no longer exists.
    fn orphaned_answers(&self) -> usize {
        let sheets = self.ids_of("sheets");
        let questions = self.ids_of("questions");
        let answers = self
            .target
            .answers()
            .into_iter()
            .filter(|a| !sheets.contains(&a.sheet_id) || !questions.contains(&a.question_id))
            .count();
        let cells = self
            .target
            .answer_cells()
            .into_iter()
            .filter(|c| !sheets.contains(&c.sheet_id) || !questions.contains(&c.question_id))
            .count();
        answers + cells
    }
}

/// Rewrites `<entity>.json` in `dir`, keeping only the items `keep` accepts.
fn filter_fixture(dir: &Path, entity: &str, keep: impl Fn(&Value) -> bool) {
    let path = dir.join(format!("{entity}.json"));
    let items: Vec<Value> =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read fixture")).expect("parse fixture");
    let kept: Vec<Value> = items.into_iter().filter(|item| keep(item)).collect();
    std::fs::write(&path, serde_json::to_string_pretty(&kept).expect("encode fixture")).expect("write fixture");
}

#[tokio::test]
async fn full_run_consolidates_revisions_and_projects_answers() {
    let h = harness(&sample_fixtures());
    let outcome = h.orchestrator.run(&MigrationPlan::full(RunMode::Incremental)).await;
    let summary = outcome.summary;
    assert!(!summary.has_fatal(), "{:?}", summary.stages);

    let users = summary.stage(EntityType::User).expect("user stage");
    assert_eq!(users.migrated, 1);
    assert_eq!(users.failed, 1);

    let sheets = h.target.sheets();
    assert_eq!(sheets.len(), 2);
    let widget = sheets
        .iter()
        .find(|s| s.latest_external_id == "R2")
        .expect("widget sheet");
    assert_eq!(widget.version_count, 2);
    assert_eq!(widget.tag_ids.len(), 2);
    assert!(widget.created_by.is_some());

    let cells = h.target.answer_cells();
    assert_eq!(cells.len(), 3);
    assert!(cells.iter().all(|c| c.sheet_id == widget.id));
    let rows: BTreeSet<_> = cells.iter().map(|c| c.row_key.as_str()).collect();
    assert_eq!(rows, BTreeSet::from(["Y", "Z"]));
    let share = cells
        .iter()
        .find(|c| c.source_external_id == "y3")
        .expect("share cell");
    assert_eq!(share.number_value, Some(40.0));

    let answers = h.target.answers();
    assert_eq!(answers.len(), 2);
    let emissions = answers
        .iter()
        .find(|a| a.source_external_id == "a2")
        .expect("latest scalar answer");
    assert_eq!(emissions.text_value.as_deref(), Some("12"));
    assert_eq!(emissions.number_value, Some(12.0));
    assert!(answers.iter().all(|a| a.source_external_id != "a1"));

    let projection = summary
        .stage(EntityType::Answer)
        .and_then(|s| s.projection)
        .expect("projection stats");
    assert_eq!(projection.placeholders_filtered, 1);
    assert_eq!(projection.fk_unresolved, 1);
    assert_eq!(projection.stale_revision, 2);
    assert_eq!(projection.retained, 5);

    // Every revision maps to its composite sheet.
    assert_eq!(h.mappings.len(EntityType::Sheet), 3);
}

#[tokio::test]
async fn incremental_rerun_is_idempotent() {
    let h = harness(&sample_fixtures());
    let plan = MigrationPlan::full(RunMode::Incremental);
    h.orchestrator.run(&plan).await;
    let mut answers_before = h.target.answers();
    let mut cells_before = h.target.answer_cells();
    let sheets_before = h.target.sheets().len();

    let second = h.orchestrator.run(&plan).await.summary;
    assert!(!second.has_fatal());
    let (migrated, skipped, _) = second.totals();
    assert_eq!(migrated, 0);
    assert!(skipped > 0);

    let mut answers_after = h.target.answers();
    let mut cells_after = h.target.answer_cells();
    answers_before.sort_by_key(|a| a.id);
    answers_after.sort_by_key(|a| a.id);
    cells_before.sort_by_key(|c| c.id);
    cells_after.sort_by_key(|c| c.id);
    assert_eq!(answers_before, answers_after);
    assert_eq!(cells_before, cells_after);
    assert_eq!(h.target.sheets().len(), sheets_before);
}

#[tokio::test]
async fn fresh_run_truncates_under_lock() {
    let h = harness(&sample_fixtures());
    h.orchestrator.run(&MigrationPlan::full(RunMode::Incremental)).await;
    let summary = h.orchestrator.run(&MigrationPlan::full(RunMode::Fresh)).await.summary;
    assert!(!summary.has_fatal());
    assert_eq!(h.target.truncations().len(), 10);
    assert!(!h.target.is_locked(EntityType::Answer));
    assert_eq!(h.target.sheets().len(), 2);
    assert_eq!(h.target.answer_cells().len(), 3);
    assert_eq!(summary.stage(EntityType::Sheet).map(|s| s.skipped), Some(0));
}

#[tokio::test]
async fn held_lock_aborts_stage_and_dependents() {
    let h = harness(&sample_fixtures());
    h.target.hold_foreign_lock(EntityType::Tag);
    let summary = h.orchestrator.run(&MigrationPlan::full(RunMode::Fresh)).await.summary;

    let tag = summary.stage(EntityType::Tag).expect("tag stage");
    assert!(matches!(tag.status, StageStatus::Aborted { .. }));
    assert_eq!(
        summary.stage(EntityType::Sheet).map(|s| s.status.clone()),
        Some(StageStatus::SkippedDependencyFailed {
            dependency: EntityType::Tag
        })
    );
    assert!(matches!(
        summary.stage(EntityType::Answer).map(|s| &s.status),
        Some(StageStatus::SkippedDependencyFailed { .. })
    ));
    assert!(summary
        .stage(EntityType::Question)
        .is_some_and(|s| s.status.is_completed()));
    assert!(!h.target.truncations().contains(&EntityType::Tag));
    assert_eq!(summary.exit_code(), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_fetch_skips_only_dependent_stages() {
    let dir = tempfile::tempdir().expect("tempdir");
    copy_fixtures(dir.path());
    std::fs::write(dir.path().join("section.json"), "{ not json").expect("break fixture");

    let h = harness(dir.path());
    let summary = h.orchestrator.run(&MigrationPlan::full(RunMode::Incremental)).await.summary;

    match &summary.stage(EntityType::Section).expect("section").status {
        StageStatus::Aborted { reason } => assert!(reason.contains("exhausted"), "{reason}"),
        other => panic!("unexpected status {other:?}"),
    }
    for dependent in [
        EntityType::Subsection,
        EntityType::Question,
        EntityType::Choice,
        EntityType::ListTableColumn,
        EntityType::Answer,
    ] {
        assert!(
            matches!(
                summary.stage(dependent).map(|s| &s.status),
                Some(StageStatus::SkippedDependencyFailed { .. })
            ),
            "{dependent} should be skipped"
        );
    }
    for independent in [EntityType::Company, EntityType::User, EntityType::Tag, EntityType::Sheet] {
        assert!(summary.stage(independent).is_some_and(|s| s.status.is_completed()));
    }
    assert_eq!(h.target.sheets().len(), 2);
    assert_eq!(summary.exit_code(), 2);
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let h = harness(&sample_fixtures());
    let plan = MigrationPlan::full(RunMode::Fresh).with_dry_run(true);
    let outcome = h.orchestrator.run(&plan).await;

    assert!(!outcome.summary.has_fatal());
    assert_eq!(h.target.chunk_writes(), 0);
    assert_eq!(h.target.row_writes(), 0);
    assert!(h.target.truncations().is_empty());
    assert!(h.mappings.is_empty());
    assert_eq!(outcome.dry_run_rows.sheets.len(), 2);
    assert_eq!(outcome.dry_run_rows.answers.len(), 2);
    assert_eq!(outcome.dry_run_rows.answer_cells.len(), 3);
}

#[tokio::test]
async fn answers_only_run_uses_stored_revisions() {
    let h = harness(&sample_fixtures());
    let upstream = MigrationPlan::full(RunMode::Incremental).with_only(&MIGRATION_ORDER[..9]);
    h.orchestrator.run(&upstream).await;
    assert!(h.target.answer_cells().is_empty());

    let summary = h.orchestrator.run(&MigrationPlan::answers_only()).await.summary;
    assert!(!summary.has_fatal());
    assert_eq!(h.target.answer_cells().len(), 3);
    assert_eq!(h.target.answers().len(), 2);
}

#[tokio::test]
async fn test_subset_caps_each_stage() {
    let h = harness(&sample_fixtures());
    let summary = h.orchestrator.run(&MigrationPlan::test_subset(1)).await.summary;
    assert!(summary.stages.iter().all(|s| s.fetched <= 1));
    assert_eq!(summary.stage(EntityType::Company).map(|s| s.fetched), Some(1));
}

#[tokio::test]
async fn new_revision_replaces_the_sheet_table() {
    let first = tempfile::tempdir().expect("tempdir");
    copy_fixtures(first.path());
    filter_fixture(first.path(), "sheet", |item| item["_id"] != "R2");
    filter_fixture(first.path(), "answer", |item| item["sheet"] != "R2");

    let mut h = harness(first.path());
    let plan = MigrationPlan::full(RunMode::Incremental);
    let summary = h.orchestrator.run(&plan).await.summary;
    assert!(!summary.has_fatal(), "{:?}", summary.stages);
    assert_eq!(h.cell_rows(), BTreeSet::from(["X".to_string(), "Y".to_string()]));
    let widget_id = h
        .target
        .sheets()
        .into_iter()
        .find(|s| s.latest_external_id == "R1")
        .map(|s| s.id)
        .expect("widget sheet");

    // R2 arrives: the composite sheet keeps its id and its table switches to R2's rows.
    h.reload(&sample_fixtures());
    let summary = h.orchestrator.run(&plan).await.summary;
    assert!(!summary.has_fatal(), "{:?}", summary.stages);

    let widget = h
        .target
        .sheets()
        .into_iter()
        .find(|s| s.latest_external_id == "R2")
        .expect("widget sheet");
    assert_eq!(widget.id, widget_id);
    assert_eq!(widget.version_count, 2);
    assert_eq!(h.target.sheets().len(), 2);

    assert_eq!(h.cell_rows(), BTreeSet::from(["Y".to_string(), "Z".to_string()]));
    let sources: BTreeSet<String> = h
        .target
        .answer_cells()
        .into_iter()
        .map(|c| c.source_external_id)
        .collect();
    assert_eq!(
        sources,
        BTreeSet::from(["y2".to_string(), "y3".to_string(), "z2".to_string()])
    );
    let projection = summary
        .stage(EntityType::Answer)
        .and_then(|s| s.projection)
        .expect("projection stats");
    assert_eq!(projection.pruned_cells, 1);

    let answers = h.target.answers();
    assert_eq!(answers.len(), 2);
    assert!(answers.iter().any(|a| a.source_external_id == "a2"));
    assert!(answers.iter().all(|a| a.source_external_id != "a1"));
}

#[tokio::test]
async fn limited_run_leaves_existing_cells_alone() {
    let mut h = harness(&sample_fixtures());
    h.orchestrator.run(&MigrationPlan::full(RunMode::Incremental)).await;
    assert_eq!(h.target.answer_cells().len(), 3);

    h.reload(&sample_fixtures());
    let summary = h.orchestrator.run(&MigrationPlan::test_subset(1)).await.summary;
    let projection = summary
        .stage(EntityType::Answer)
        .and_then(|s| s.projection)
        .expect("projection stats");
    assert_eq!(projection.pruned_cells, 0);
    assert_eq!(h.target.answer_cells().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn incremental_after_aborted_fresh_run_rewrites_answers() {
    let dir = tempfile::tempdir().expect("tempdir");
    copy_fixtures(dir.path());
    let mut h = harness(dir.path());
    h.orchestrator.run(&MigrationPlan::full(RunMode::Incremental)).await;
    assert_eq!(h.orphaned_answers(), 0);

    std::fs::write(dir.path().join("question.json"), "{ not json").expect("break fixture");
    h.reload(dir.path());
    let fresh = h.orchestrator.run(&MigrationPlan::full(RunMode::Fresh)).await.summary;
    assert!(matches!(
        fresh.stage(EntityType::Question).map(|s| &s.status),
        Some(StageStatus::Aborted { .. })
    ));
    assert_eq!(
        fresh.stage(EntityType::Answer).map(|s| s.status.clone()),
        Some(StageStatus::SkippedDependencyFailed {
            dependency: EntityType::Question
        })
    );
    assert!(fresh.stage(EntityType::Sheet).is_some_and(|s| s.status.is_completed()));
    assert_eq!(h.mappings.len(EntityType::Answer), 0);

    copy_fixtures(dir.path());
    h.reload(dir.path());
    let summary = h.orchestrator.run(&MigrationPlan::full(RunMode::Incremental)).await.summary;
    assert!(!summary.has_fatal(), "{:?}", summary.stages);
    let answers = summary.stage(EntityType::Answer).expect("answer stage");
    assert_eq!(answers.migrated, 5);
    assert_eq!(answers.skipped, 0);
    assert_eq!(h.target.answers().len(), 2);
    assert_eq!(h.target.answer_cells().len(), 3);
    assert_eq!(h.orphaned_answers(), 0);
}

#[tokio::test]
async fn fresh_run_of_one_type_clears_its_dependents() {
    let mut h = harness(&sample_fixtures());
    h.orchestrator.run(&MigrationPlan::full(RunMode::Incremental)).await;

    h.reload(&sample_fixtures());
    let plan = MigrationPlan::full(RunMode::Fresh).with_only(&[EntityType::Company]);
    let summary = h.orchestrator.run(&plan).await.summary;
    assert!(!summary.has_fatal());
    for table in ["users", "sheets", "answers", "answer_cells"] {
        assert_eq!(h.target.count(table), 0, "{table} should be empty");
    }
    for dependent in [EntityType::User, EntityType::Sheet, EntityType::Answer] {
        assert_eq!(h.mappings.len(dependent), 0, "{dependent} mappings should be cleared");
    }
    assert!(h.mappings.len(EntityType::Question) > 0);
    assert_eq!(h.target.count("companies"), 2);

    h.reload(&sample_fixtures());
    let summary = h.orchestrator.run(&MigrationPlan::full(RunMode::Incremental)).await.summary;
    assert!(!summary.has_fatal(), "{:?}", summary.stages);
    assert_eq!(h.target.sheets().len(), 2);
    assert_eq!(h.target.answers().len(), 2);
    assert_eq!(h.target.answer_cells().len(), 3);
    assert_eq!(h.orphaned_answers(), 0);
}

#[tokio::test]
async fn answer_mapping_to_another_id_is_rewritten() {
    let mut h = harness(&sample_fixtures());
    h.orchestrator.run(&MigrationPlan::full(RunMode::Incremental)).await;
    h.mappings
        .upsert(&[MappingEntry {
            entity: EntityType::Answer,
            external_id: "a2".into(),
            internal_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }])
        .await
        .expect("overwrite mapping");

    h.reload(&sample_fixtures());
    let summary = h.orchestrator.run(&MigrationPlan::full(RunMode::Incremental)).await.summary;
    let answers = summary.stage(EntityType::Answer).expect("answer stage");
    assert_eq!(answers.migrated, 1);
    assert_eq!(answers.skipped, 4);
    let emissions = h
        .target
        .answers()
        .into_iter()
        .find(|a| a.source_external_id == "a2")
        .expect("a2 row");
    assert_eq!(
        h.mappings.get(EntityType::Answer, "a2").await.expect("mapping"),
        Some(emissions.id)
    );
}
