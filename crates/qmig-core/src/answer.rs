use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for answer ids derived from their dedup key.
const ANSWER_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b8e_93d4_4a57_b0e2_51c7_d9a3_0e44);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    #[default]
    Text,
    Number,
    Boolean,
    SingleChoice,
    MultiChoice,
    ListTable,
}

impl QuestionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionKind::Text => "text",
            QuestionKind::Number => "number",
            QuestionKind::Boolean => "boolean",
            QuestionKind::SingleChoice => "single_choice",
            QuestionKind::MultiChoice => "multi_choice",
            QuestionKind::ListTable => "list_table",
        }
    }
}

impl fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestionKind {
    type Err = std::convert::Infallible;

    /// Unknown kinds read as free text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        Ok(match normalized.as_str() {
            "number" | "numeric" | "integer" | "decimal" => QuestionKind::Number,
            "boolean" | "yes_no" | "checkbox" => QuestionKind::Boolean,
            "single_choice" | "dropdown" | "select" | "radio" => QuestionKind::SingleChoice,
            "multi_choice" | "multiple_choice" | "multi_select" => QuestionKind::MultiChoice,
            "list_table" | "table" | "list" => QuestionKind::ListTable,
            _ => QuestionKind::Text,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TypedValue {
    Text(String),
    Number(f64),
    Boolean(bool),
}

impl TypedValue {
    pub fn as_text(&self) -> String {
        match self {
            TypedValue::Text(s) => s.clone(),
            TypedValue::Number(n) => n.to_string(),
            TypedValue::Boolean(b) => if *b { "yes" } else { "no" }.to_string(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            TypedValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TypedValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

/// Sentinel values meaning "no answer provided": empty, `0`, `n/a` (any case) and `-`.
pub fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed == "0" || trimmed == "-" || trimmed.eq_ignore_ascii_case("n/a")
}

/// Types a raw value for a question kind. Placeholders yield `None`; values that do not
/// parse for their kind are kept as text.
pub fn type_value(kind: QuestionKind, raw: &str) -> Option<TypedValue> {
    if is_placeholder(raw) {
        return None;
    }
    let trimmed = raw.trim();
    let typed = match kind {
        QuestionKind::Number => parse_number(trimmed).map(TypedValue::Number),
        QuestionKind::Boolean => parse_bool(trimmed).map(TypedValue::Boolean),
        _ => None,
    };
    Some(typed.unwrap_or_else(|| TypedValue::Text(trimmed.to_string())))
}

fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim_end_matches('%')
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" => Some(true),
        "no" | "n" | "false" => Some(false),
        _ => None,
    }
}

/// A `(questionId, value, auxiliaryValues)` tuple produced by the spreadsheet importer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedCell {
    pub external_question_id: String,
    pub value: String,
    #[serde(default)]
    pub auxiliary_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportedAnswer {
    pub external_question_id: String,
    pub value: TypedValue,
    pub auxiliary_values: Vec<String>,
}

/// Applies the same placeholder filter and typing as bulk migration to an imported cell.
pub fn normalize_imported_cell(kind: QuestionKind, cell: &ImportedCell) -> Option<ImportedAnswer> {
    let value = type_value(kind, &cell.value)?;
    let auxiliary_values = cell
        .auxiliary_values
        .iter()
        .filter(|aux| !is_placeholder(aux))
        .map(|aux| aux.trim().to_string())
        .collect();
    Some(ImportedAnswer {
        external_question_id: cell.external_question_id.clone(),
        value,
        auxiliary_values,
    })
}

/// Scope within which at most one answer candidate survives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DedupKey {
    Scalar {
        sheet_id: Uuid,
        question_id: Uuid,
    },
    Tabular {
        sheet_id: Uuid,
        question_id: Uuid,
        row_key: String,
        column_id: Uuid,
    },
}

impl DedupKey {
    pub fn sheet_id(&self) -> Uuid {
        match self {
            DedupKey::Scalar { sheet_id, .. } | DedupKey::Tabular { sheet_id, .. } => *sheet_id,
        }
    }

    /// Stable internal id for the answer occupying this key.
    pub fn answer_id(&self) -> Uuid {
        let name = match self {
            DedupKey::Scalar {
                sheet_id,
                question_id,
            } => format!("scalar:{sheet_id}:{question_id}"),
            DedupKey::Tabular {
                sheet_id,
                question_id,
                row_key,
                column_id,
            } => format!("tabular:{sheet_id}:{question_id}:{row_key}:{column_id}"),
        };
        Uuid::new_v5(&ANSWER_ID_NAMESPACE, name.as_bytes())
    }
}

/// A resolved answer awaiting de-duplication. Lives only for the projection step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerCandidate {
    pub external_id: String,
    /// Canonical (composite) sheet id.
    pub sheet_id: Uuid,
    /// External id of the sheet revision the answer was given on.
    pub source_revision_id: String,
    pub question_id: Uuid,
    pub row_key: Option<String>,
    pub column_id: Option<Uuid>,
    pub modified_at: DateTime<Utc>,
    pub value: Option<TypedValue>,
    pub choice_ids: Vec<Uuid>,
    pub author_id: Option<Uuid>,
    pub raw_text: Option<String>,
}

impl AnswerCandidate {
    pub fn is_tabular(&self) -> bool {
        self.row_key.is_some() && self.column_id.is_some()
    }

    pub fn dedup_key(&self) -> DedupKey {
        match (&self.row_key, self.column_id) {
            (Some(row_key), Some(column_id)) => DedupKey::Tabular {
                sheet_id: self.sheet_id,
                question_id: self.question_id,
                row_key: row_key.clone(),
                column_id,
            },
            _ => DedupKey::Scalar {
                sheet_id: self.sheet_id,
                question_id: self.question_id,
            },
        }
    }

    /// Total order used for "latest wins". Equal timestamps fall back to the external id
    /// so the winner never depends on arrival order.
    pub fn supersedes(&self, other: &AnswerCandidate) -> bool {
        (self.modified_at, &self.external_id) > (other.modified_at, &other.external_id)
    }
}
