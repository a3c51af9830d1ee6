use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use qmig_core::{AnswerCellRow, AnswerRow, QuestionKind, SheetRow, TargetRow};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::IdentityMap;
use crate::resolver::RevisionIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Truncate, then load without per-record duplicate checks.
    Fresh,
    /// Skip records that already have a mapping.
    Incremental,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Fresh => "fresh",
            RunMode::Incremental => "incremental",
        }
    }
}

/// Rows a dry run would have written, kept for snapshot export.
#[derive(Debug, Default, Clone)]
pub struct DryRunRows {
    pub sheets: Vec<SheetRow>,
    pub answers: Vec<AnswerRow>,
    pub answer_cells: Vec<AnswerCellRow>,
}

impl DryRunRows {
    pub fn record(&mut self, rows: &[TargetRow]) {
        for row in rows {
            match row {
                TargetRow::Sheet(r) => self.sheets.push(r.clone()),
                TargetRow::Answer(r) => self.answers.push(r.clone()),
                TargetRow::AnswerCell(r) => self.answer_cells.push(r.clone()),
                _ => {}
            }
        }
    }
}

/// Everything one run shares between its stages. Created at run start, dropped at run end.
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub mode: RunMode,
    pub dry_run: bool,
    pub identity: IdentityMap,
    revisions: Mutex<RevisionIndex>,
    value_kinds: Mutex<HashMap<Uuid, QuestionKind>>,
    dry_run_rows: Mutex<DryRunRows>,
}

impl RunContext {
    pub fn new(mode: RunMode, dry_run: bool, identity: IdentityMap) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            mode,
            dry_run,
            identity,
            revisions: Mutex::new(RevisionIndex::default()),
            value_kinds: Mutex::new(HashMap::new()),
            dry_run_rows: Mutex::new(DryRunRows::default()),
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.mode == RunMode::Fresh
    }

    pub fn merge_revisions(&self, index: RevisionIndex) {
        self.revisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(index);
    }

    pub fn revisions(&self) -> RevisionIndex {
        self.revisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn record_value_kinds(&self, kinds: impl IntoIterator<Item = (Uuid, QuestionKind)>) {
        self.value_kinds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(kinds);
    }

    pub fn value_kinds(&self) -> HashMap<Uuid, QuestionKind> {
        self.value_kinds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn record_dry_run_rows(&self, rows: &[TargetRow]) {
        self.dry_run_rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(rows);
    }

    pub fn take_dry_run_rows(&self) -> DryRunRows {
        std::mem::take(&mut *self.dry_run_rows.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
