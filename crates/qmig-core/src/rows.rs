//! Rows as persisted in the target store, one struct per table.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{EntityType, QuestionKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompanyRow {
    pub id: Uuid,
    pub name: String,
    pub domain: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRow {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub company_id: Option<Uuid>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionRow {
    pub id: Uuid,
    pub name: String,
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubsectionRow {
    pub id: Uuid,
    pub section_id: Uuid,
    pub name: String,
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagRow {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionRow {
    pub id: Uuid,
    pub subsection_id: Uuid,
    pub section_id: Option<Uuid>,
    pub content: String,
    pub kind: QuestionKind,
    pub position: i32,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChoiceRow {
    pub id: Uuid,
    pub question_id: Uuid,
    pub content: String,
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListTableColumnRow {
    pub id: Uuid,
    pub question_id: Uuid,
    pub name: String,
    pub kind: QuestionKind,
    pub position: i32,
}

/// Composite sheet: one row per group of revisions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SheetRow {
    pub id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    pub status: Option<String>,
    pub created_by: Option<Uuid>,
    pub latest_external_id: String,
    pub version_count: i32,
    pub tag_ids: Vec<Uuid>,
    pub modified_at: DateTime<Utc>,
}

/// Scalar answer, unique per `(sheet_id, question_id)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerRow {
    pub id: Uuid,
    pub sheet_id: Uuid,
    pub question_id: Uuid,
    pub text_value: Option<String>,
    pub number_value: Option<f64>,
    pub bool_value: Option<bool>,
    pub choice_ids: Vec<Uuid>,
    pub author_id: Option<Uuid>,
    pub source_external_id: String,
    pub modified_at: DateTime<Utc>,
}

/// List-table cell, unique per `(sheet_id, question_id, row_key, column_id)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerCellRow {
    pub id: Uuid,
    pub sheet_id: Uuid,
    pub question_id: Uuid,
    pub row_key: String,
    pub column_id: Uuid,
    pub text_value: Option<String>,
    pub number_value: Option<f64>,
    pub author_id: Option<Uuid>,
    pub source_external_id: String,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum TargetRow {
    Company(CompanyRow),
    User(UserRow),
    Section(SectionRow),
    Subsection(SubsectionRow),
    Tag(TagRow),
    Question(QuestionRow),
    Choice(ChoiceRow),
    ListTableColumn(ListTableColumnRow),
    Sheet(SheetRow),
    Answer(AnswerRow),
    AnswerCell(AnswerCellRow),
}

impl TargetRow {
    pub fn entity(&self) -> EntityType {
        match self {
            TargetRow::Company(_) => EntityType::Company,
            TargetRow::User(_) => EntityType::User,
            TargetRow::Section(_) => EntityType::Section,
            TargetRow::Subsection(_) => EntityType::Subsection,
            TargetRow::Tag(_) => EntityType::Tag,
            TargetRow::Question(_) => EntityType::Question,
            TargetRow::Choice(_) => EntityType::Choice,
            TargetRow::ListTableColumn(_) => EntityType::ListTableColumn,
            TargetRow::Sheet(_) => EntityType::Sheet,
            TargetRow::Answer(_) | TargetRow::AnswerCell(_) => EntityType::Answer,
        }
    }

    pub fn internal_id(&self) -> Uuid {
        match self {
            TargetRow::Company(r) => r.id,
            TargetRow::User(r) => r.id,
            TargetRow::Section(r) => r.id,
            TargetRow::Subsection(r) => r.id,
            TargetRow::Tag(r) => r.id,
            TargetRow::Question(r) => r.id,
            TargetRow::Choice(r) => r.id,
            TargetRow::ListTableColumn(r) => r.id,
            TargetRow::Sheet(r) => r.id,
            TargetRow::Answer(r) => r.id,
            TargetRow::AnswerCell(r) => r.id,
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            TargetRow::Company(_) => "companies",
            TargetRow::User(_) => "users",
            TargetRow::Section(_) => "sections",
            TargetRow::Subsection(_) => "subsections",
            TargetRow::Tag(_) => "tags",
            TargetRow::Question(_) => "questions",
            TargetRow::Choice(_) => "choices",
            TargetRow::ListTableColumn(_) => "list_table_columns",
            TargetRow::Sheet(_) => "sheets",
            TargetRow::Answer(_) => "answers",
            TargetRow::AnswerCell(_) => "answer_cells",
        }
    }
}
