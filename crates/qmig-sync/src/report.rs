//! Run reports and dry-run Parquet snapshots.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, Int32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use qmig_core::{AnswerCellRow, AnswerRow, SheetRow};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::context::DryRunRows;
use crate::orchestrator::{RunSummary, StageStatus};

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

pub fn reports_dir_for(workspace_root: &Path, run_id: Uuid) -> PathBuf {
    workspace_root.join("reports").join(run_id.to_string())
}

/// Writes `run_summary.json` and `summary.md`, returning the report directory.
pub async fn write_run_reports(workspace_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = reports_dir_for(workspace_root, summary.run_id);
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(reports_dir.join("summary.md"), render_summary_markdown(summary))
        .await
        .context("writing summary.md")?;
    Ok(reports_dir)
}

pub fn render_summary_markdown(summary: &RunSummary) -> String {
    let (migrated, skipped, failed) = summary.totals();
    let rows = summary
        .stages
        .iter()
        .map(|stage| {
            format!(
                "| {} | {} | {} | {} | {} | {} | {} | {:.1} |",
                stage.entity,
                stage.status.label(),
                stage.fetched,
                stage.migrated,
                stage.skipped,
                stage.failed,
                stage.duration_ms,
                stage.rows_per_sec
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut notes = Vec::new();
    for stage in &summary.stages {
        match &stage.status {
            StageStatus::Aborted { reason } => {
                notes.push(format!("- {} aborted: {}", stage.entity, reason));
            }
            StageStatus::SkippedDependencyFailed { dependency } => {
                notes.push(format!("- {} skipped: {} did not complete", stage.entity, dependency));
            }
            StageStatus::Completed => {}
        }
        if let Some(projection) = &stage.projection {
            notes.push(format!(
                "- {}: {} placeholders filtered, {} unresolved references, {} stale revision cells, {} superseded, {} retained, {} outdated cells removed",
                stage.entity,
                projection.placeholders_filtered,
                projection.fk_unresolved,
                projection.stale_revision,
                projection.superseded,
                projection.retained,
                projection.pruned_cells
            ));
        }
    }

    format!(
        "# Migration Run\n\n- Run ID: `{}`\n- Mode: {}{}\n- Started: {}\n- Finished: {}\n- Migrated: {}\n- Skipped: {}\n- Failed: {}\n\n| stage | status | fetched | migrated | skipped | failed | ms | rows/s |\n|---|---|---|---|---|---|---|---|\n{}\n{}",
        summary.run_id,
        summary.mode.as_str(),
        if summary.dry_run { " (dry run)" } else { "" },
        summary.started_at,
        summary.finished_at,
        migrated,
        skipped,
        failed,
        rows,
        if notes.is_empty() {
            String::new()
        } else {
            format!("\n## Notes\n{}\n", notes.join("\n"))
        }
    )
}

/// Writes the would-be rows of a dry run as Parquet under `snapshots/` plus a manifest.
pub async fn export_dry_run_snapshots(
    reports_dir: &Path,
    run_id: Uuid,
    rows: &DryRunRows,
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let sheets_path = snapshot_dir.join("sheets.parquet");
    let answers_path = snapshot_dir.join("answers.parquet");
    let cells_path = snapshot_dir.join("answer_cells.parquet");

    write_sheets_parquet(&sheets_path, &rows.sheets)?;
    write_answers_parquet(&answers_path, &rows.answers)?;
    write_answer_cells_parquet(&cells_path, &rows.answer_cells)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        run_id,
        files: vec![
            manifest_entry("sheets", reports_dir, &sheets_path, rows.sheets.len())?,
            manifest_entry("answers", reports_dir, &answers_path, rows.answers.len())?,
            manifest_entry("answer_cells", reports_dir, &cells_path, rows.answer_cells.len())?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn uuid_column<'a>(ids: impl Iterator<Item = &'a Uuid>) -> StringArray {
    StringArray::from(ids.map(|id| Some(id.to_string())).collect::<Vec<_>>())
}

fn optional_uuid_column(ids: impl Iterator<Item = Option<Uuid>>) -> StringArray {
    StringArray::from(ids.map(|id| id.map(|id| id.to_string())).collect::<Vec<_>>())
}

fn write_sheets_parquet(path: &Path, sheets: &[SheetRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("company_id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, true),
        ArrowField::new("latest_external_id", DataType::Utf8, false),
        ArrowField::new("version_count", DataType::Int32, false),
        ArrowField::new("tag_ids", DataType::Utf8, false),
        ArrowField::new("modified_at", DataType::Utf8, false),
    ]));

    let ids = uuid_column(sheets.iter().map(|s| &s.id));
    let companies = uuid_column(sheets.iter().map(|s| &s.company_id));
    let names = StringArray::from(sheets.iter().map(|s| Some(s.name.as_str())).collect::<Vec<_>>());
    let statuses = StringArray::from(sheets.iter().map(|s| s.status.as_deref()).collect::<Vec<_>>());
    let latest = StringArray::from(
        sheets
            .iter()
            .map(|s| Some(s.latest_external_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let versions = Int32Array::from(sheets.iter().map(|s| s.version_count).collect::<Vec<_>>());
    let tags = StringArray::from(
        sheets
            .iter()
            .map(|s| {
                Some(
                    s.tag_ids
                        .iter()
                        .map(Uuid::to_string)
                        .collect::<Vec<_>>()
                        .join(","),
                )
            })
            .collect::<Vec<_>>(),
    );
    let modified = StringArray::from(
        sheets
            .iter()
            .map(|s| Some(s.modified_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(companies),
            Arc::new(names),
            Arc::new(statuses),
            Arc::new(latest),
            Arc::new(versions),
            Arc::new(tags),
            Arc::new(modified),
        ],
    )
    .context("building sheets record batch")?;
    write_parquet(path, batch)
}

fn write_answers_parquet(path: &Path, answers: &[AnswerRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("sheet_id", DataType::Utf8, false),
        ArrowField::new("question_id", DataType::Utf8, false),
        ArrowField::new("text_value", DataType::Utf8, true),
        ArrowField::new("number_value", DataType::Float64, true),
        ArrowField::new("bool_value", DataType::Boolean, true),
        ArrowField::new("choice_count", DataType::Int32, false),
        ArrowField::new("author_id", DataType::Utf8, true),
        ArrowField::new("source_external_id", DataType::Utf8, false),
        ArrowField::new("modified_at", DataType::Utf8, false),
    ]));

    let ids = uuid_column(answers.iter().map(|a| &a.id));
    let sheets = uuid_column(answers.iter().map(|a| &a.sheet_id));
    let questions = uuid_column(answers.iter().map(|a| &a.question_id));
    let texts = StringArray::from(answers.iter().map(|a| a.text_value.as_deref()).collect::<Vec<_>>());
    let numbers = Float64Array::from(answers.iter().map(|a| a.number_value).collect::<Vec<_>>());
    let bools = BooleanArray::from(answers.iter().map(|a| a.bool_value).collect::<Vec<_>>());
    let choices = Int32Array::from(
        answers
            .iter()
            .map(|a| i32::try_from(a.choice_ids.len()).unwrap_or(i32::MAX))
            .collect::<Vec<_>>(),
    );
    let authors = optional_uuid_column(answers.iter().map(|a| a.author_id));
    let sources = StringArray::from(
        answers
            .iter()
            .map(|a| Some(a.source_external_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let modified = StringArray::from(
        answers
            .iter()
            .map(|a| Some(a.modified_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(sheets),
            Arc::new(questions),
            Arc::new(texts),
            Arc::new(numbers),
            Arc::new(bools),
            Arc::new(choices),
            Arc::new(authors),
            Arc::new(sources),
            Arc::new(modified),
        ],
    )
    .context("building answers record batch")?;
    write_parquet(path, batch)
}

fn write_answer_cells_parquet(path: &Path, cells: &[AnswerCellRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("sheet_id", DataType::Utf8, false),
        ArrowField::new("question_id", DataType::Utf8, false),
        ArrowField::new("row_key", DataType::Utf8, false),
        ArrowField::new("column_id", DataType::Utf8, false),
        ArrowField::new("text_value", DataType::Utf8, true),
        ArrowField::new("number_value", DataType::Float64, true),
        ArrowField::new("source_external_id", DataType::Utf8, false),
    ]));

    let ids = uuid_column(cells.iter().map(|c| &c.id));
    let sheets = uuid_column(cells.iter().map(|c| &c.sheet_id));
    let questions = uuid_column(cells.iter().map(|c| &c.question_id));
    let row_keys = StringArray::from(cells.iter().map(|c| Some(c.row_key.as_str())).collect::<Vec<_>>());
    let columns = uuid_column(cells.iter().map(|c| &c.column_id));
    let texts = StringArray::from(cells.iter().map(|c| c.text_value.as_deref()).collect::<Vec<_>>());
    let numbers = Float64Array::from(cells.iter().map(|c| c.number_value).collect::<Vec<_>>());
    let sources = StringArray::from(
        cells
            .iter()
            .map(|c| Some(c.source_external_id.as_str()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(sheets),
            Arc::new(questions),
            Arc::new(row_keys),
            Arc::new(columns),
            Arc::new(texts),
            Arc::new(numbers),
            Arc::new(sources),
        ],
    )
    .context("building answer_cells record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(
    name: &str,
    reports_dir: &Path,
    path: &Path,
    rows: usize,
) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}
