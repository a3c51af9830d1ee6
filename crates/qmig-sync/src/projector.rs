//! Answer projection: FK resolution, placeholder filtering, value typing and de-duplication.
//!
//! Scalar answers keep the newest candidate per `(sheet, question)` across every revision of
//! the composite sheet. List-table cells only count when they come from the sheet's latest
//! revision; among those the newest candidate per `(sheet, question, row, column)` wins.

use std::collections::{BTreeMap, HashMap};

use futures::stream::{self, StreamExt};
use qmig_adapters::{AnswerSource, Validated};
use qmig_core::{
    is_placeholder, type_value, AnswerCandidate, AnswerCellRow, AnswerRow, CanonicalEntity,
    DedupKey, EntityType, QuestionKind, TargetRow, TypedValue,
};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::identity::IdentityMap;
use crate::resolver::RevisionIndex;
use crate::transform::{resolve_optional, TransformError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProjectionStats {
    pub records: usize,
    pub placeholders_filtered: usize,
    pub fk_unresolved: usize,
    pub stale_revision: usize,
    pub superseded: usize,
    pub retained: usize,
    /// Cells of an earlier latest revision removed from the target.
    pub pruned_cells: usize,
}

/// Outcome of turning one raw answer into a candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateOutcome {
    Candidate(AnswerCandidate),
    Placeholder,
    FkUnresolved(String),
}

#[derive(Debug, Default)]
pub struct Projection {
    pub winners: Vec<AnswerCandidate>,
    pub stats: ProjectionStats,
}

pub struct AnswerProjector<'a> {
    identity: &'a IdentityMap,
    kinds: &'a HashMap<Uuid, QuestionKind>,
    concurrency: usize,
}

impl<'a> AnswerProjector<'a> {
    pub fn new(
        identity: &'a IdentityMap,
        kinds: &'a HashMap<Uuid, QuestionKind>,
        concurrency: usize,
    ) -> Self {
        Self {
            identity,
            kinds,
            concurrency: concurrency.max(1),
        }
    }

    /// Resolves one raw answer. Placeholders are filtered before any lookup.
    pub async fn candidate(
        &self,
        record: &Validated<AnswerSource>,
    ) -> Result<CandidateOutcome, TransformError> {
        let body = &record.body;
        let raw_text = body.text.as_deref().filter(|t| !is_placeholder(t));
        if raw_text.is_none() && body.choices.is_empty() {
            return Ok(CandidateOutcome::Placeholder);
        }

        let identity = self.identity;
        let (sheet_id, question_id, column_id, author_id, choices) = futures::try_join!(
            resolve_optional(identity, EntityType::Sheet, Some(body.sheet.as_str())),
            resolve_optional(identity, EntityType::Question, Some(body.question.as_str())),
            resolve_optional(identity, EntityType::ListTableColumn, body.column.as_deref()),
            resolve_optional(identity, EntityType::User, body.created_by.as_deref()),
            async {
                identity
                    .get_batch(EntityType::Choice, &body.choices)
                    .await
                    .map_err(TransformError::from)
            },
        )?;

        let Some(sheet_id) = sheet_id else {
            return Ok(CandidateOutcome::FkUnresolved(format!("sheet {}", body.sheet)));
        };
        let Some(question_id) = question_id else {
            return Ok(CandidateOutcome::FkUnresolved(format!("question {}", body.question)));
        };
        if let (Some(column), None) = (&body.column, column_id) {
            return Ok(CandidateOutcome::FkUnresolved(format!("column {column}")));
        }
        let mut choice_ids = Vec::with_capacity(body.choices.len());
        for choice in &body.choices {
            match choices.get(choice) {
                Some(id) => choice_ids.push(*id),
                None => return Ok(CandidateOutcome::FkUnresolved(format!("choice {choice}"))),
            }
        }

        let kind = column_id
            .and_then(|id| self.kinds.get(&id))
            .or_else(|| self.kinds.get(&question_id))
            .copied()
            .unwrap_or_default();
        let value = raw_text.and_then(|raw| type_value(kind, raw));

        Ok(CandidateOutcome::Candidate(AnswerCandidate {
            external_id: record.external_id.clone(),
            sheet_id,
            source_revision_id: body.sheet.clone(),
            question_id,
            row_key: body.row.clone(),
            column_id,
            modified_at: record.modified_at,
            value,
            choice_ids,
            author_id,
            raw_text: raw_text.map(str::to_string),
        }))
    }

    /// Resolves every record with bounded concurrency, then de-duplicates.
    pub async fn project(
        &self,
        records: &[Validated<AnswerSource>],
        revisions: &RevisionIndex,
    ) -> Result<Projection, TransformError> {
        let outcomes: Vec<Result<CandidateOutcome, TransformError>> = stream::iter(records)
            .map(|record| self.candidate(record))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut stats = ProjectionStats {
            records: records.len(),
            ..Default::default()
        };
        let mut candidates = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome? {
                CandidateOutcome::Candidate(candidate) => candidates.push(candidate),
                CandidateOutcome::Placeholder => stats.placeholders_filtered += 1,
                CandidateOutcome::FkUnresolved(reference) => {
                    debug!(%reference, "dropping answer with unresolved reference");
                    stats.fk_unresolved += 1;
                }
            }
        }

        let (winners, dedup) = deduplicate(candidates, revisions);
        stats.stale_revision = dedup.stale_revision;
        stats.superseded = dedup.superseded;
        stats.retained = winners.len();
        Ok(Projection { winners, stats })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub stale_revision: usize,
    pub superseded: usize,
}

/// Keeps one candidate per dedup key. Tabular candidates from anything but their sheet's
/// latest revision are discarded first. Output is ordered by key.
pub fn deduplicate(
    candidates: Vec<AnswerCandidate>,
    revisions: &RevisionIndex,
) -> (Vec<AnswerCandidate>, DedupStats) {
    let mut stats = DedupStats::default();
    let mut kept: BTreeMap<DedupKey, AnswerCandidate> = BTreeMap::new();
    for candidate in candidates {
        if candidate.is_tabular()
            && revisions.latest_external_id_for(candidate.sheet_id)
                != Some(candidate.source_revision_id.as_str())
        {
            stats.stale_revision += 1;
            continue;
        }
        let key = candidate.dedup_key();
        let replace = match kept.get(&key) {
            Some(current) => {
                stats.superseded += 1;
                candidate.supersedes(current)
            }
            None => true,
        };
        if replace {
            kept.insert(key, candidate);
        }
    }
    (kept.into_values().collect(), stats)
}

/// Target row for a retained candidate; the row id is derived from the dedup key.
pub fn answer_entity(candidate: &AnswerCandidate) -> CanonicalEntity {
    let key = candidate.dedup_key();
    let id = key.answer_id();
    let text_value = candidate.value.as_ref().map(TypedValue::as_text);
    let number_value = candidate.value.as_ref().and_then(TypedValue::as_number);
    let row = match (&candidate.row_key, candidate.column_id) {
        (Some(row_key), Some(column_id)) => TargetRow::AnswerCell(AnswerCellRow {
            id,
            sheet_id: candidate.sheet_id,
            question_id: candidate.question_id,
            row_key: row_key.clone(),
            column_id,
            text_value,
            number_value,
            author_id: candidate.author_id,
            source_external_id: candidate.external_id.clone(),
            modified_at: candidate.modified_at,
        }),
        _ => TargetRow::Answer(AnswerRow {
            id,
            sheet_id: candidate.sheet_id,
            question_id: candidate.question_id,
            text_value,
            number_value,
            bool_value: candidate.value.as_ref().and_then(TypedValue::as_bool),
            choice_ids: candidate.choice_ids.clone(),
            author_id: candidate.author_id,
            source_external_id: candidate.external_id.clone(),
            modified_at: candidate.modified_at,
        }),
    };
    CanonicalEntity::single(candidate.external_id.clone(), row)
}
