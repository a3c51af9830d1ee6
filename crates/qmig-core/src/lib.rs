//! Core domain model for the questionnaire migration engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

mod answer;
mod rows;

pub use answer::{
    is_placeholder, normalize_imported_cell, type_value, AnswerCandidate, DedupKey,
    ImportedAnswer, ImportedCell, QuestionKind, TypedValue,
};
pub use rows::{
    AnswerCellRow, AnswerRow, ChoiceRow, CompanyRow, ListTableColumnRow, QuestionRow,
    SectionRow, SheetRow, SubsectionRow, TagRow, TargetRow, UserRow,
};

pub const CRATE_NAME: &str = "qmig-core";

/// Source field carrying the external identifier.
pub const FIELD_ID: &str = "_id";
pub const FIELD_MODIFIED: &str = "Modified Date";
pub const FIELD_CREATED: &str = "Created Date";

/// Entity types in the order they must be migrated.
pub const MIGRATION_ORDER: [EntityType; 10] = [
    EntityType::Company,
    EntityType::User,
    EntityType::Section,
    EntityType::Subsection,
    EntityType::Tag,
    EntityType::Question,
    EntityType::Choice,
    EntityType::ListTableColumn,
    EntityType::Sheet,
    EntityType::Answer,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Company,
    User,
    Section,
    Subsection,
    Tag,
    Question,
    Choice,
    ListTableColumn,
    Sheet,
    Answer,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Company => "company",
            EntityType::User => "user",
            EntityType::Section => "section",
            EntityType::Subsection => "subsection",
            EntityType::Tag => "tag",
            EntityType::Question => "question",
            EntityType::Choice => "choice",
            EntityType::ListTableColumn => "list_table_column",
            EntityType::Sheet => "sheet",
            EntityType::Answer => "answer",
        }
    }

    /// Entity types whose mappings must exist before this one can be transformed.
    pub fn dependencies(self) -> &'static [EntityType] {
        match self {
            EntityType::Company | EntityType::Section | EntityType::Tag => &[],
            EntityType::User => &[EntityType::Company],
            EntityType::Subsection => &[EntityType::Section],
            EntityType::Question => &[EntityType::Section, EntityType::Subsection],
            EntityType::Choice | EntityType::ListTableColumn => &[EntityType::Question],
            EntityType::Sheet => &[EntityType::Company, EntityType::User, EntityType::Tag],
            EntityType::Answer => &[
                EntityType::Sheet,
                EntityType::Question,
                EntityType::Choice,
                EntityType::ListTableColumn,
            ],
        }
    }

    /// Entity types depending on this one directly or transitively, in migration order.
    /// Emptying this type's target rows leaves theirs dangling.
    pub fn dependents(self) -> Vec<EntityType> {
        let mut dependents: Vec<EntityType> = Vec::new();
        for candidate in MIGRATION_ORDER.iter().skip(self.stage_index() + 1) {
            if candidate
                .dependencies()
                .iter()
                .any(|dep| *dep == self || dependents.contains(dep))
            {
                dependents.push(*candidate);
            }
        }
        dependents
    }

    /// Whether several external ids may share one internal id.
    pub fn is_composite(self) -> bool {
        matches!(self, EntityType::Sheet)
    }

    /// Position in [`MIGRATION_ORDER`].
    pub fn stage_index(self) -> usize {
        MIGRATION_ORDER
            .iter()
            .position(|e| *e == self)
            .unwrap_or(MIGRATION_ORDER.len())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity type `{0}`")]
pub struct UnknownEntityType(pub String);

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        MIGRATION_ORDER
            .iter()
            .copied()
            .find(|e| e.as_str() == normalized)
            .or(match normalized.as_str() {
                "companies" => Some(EntityType::Company),
                "users" => Some(EntityType::User),
                "sections" => Some(EntityType::Section),
                "subsections" | "sub_section" => Some(EntityType::Subsection),
                "tags" => Some(EntityType::Tag),
                "questions" => Some(EntityType::Question),
                "choices" => Some(EntityType::Choice),
                "list_table_columns" | "columns" => Some(EntityType::ListTableColumn),
                "sheets" => Some(EntityType::Sheet),
                "answers" => Some(EntityType::Answer),
                _ => None,
            })
            .ok_or_else(|| UnknownEntityType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("{entity} record is not a JSON object")]
    NotAnObject { entity: EntityType },
    #[error("{entity} record has no `_id`")]
    MissingId { entity: EntityType },
    #[error("{entity} record {external_id} has an unparseable `{field}`: {value}")]
    BadTimestamp {
        entity: EntityType,
        external_id: String,
        field: &'static str,
        value: String,
    },
}

/// One record as returned by the source API: identifier, timestamps and an untyped field bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub entity: EntityType,
    pub external_id: String,
    pub modified_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    pub fields: Map<String, JsonValue>,
}

impl ExternalRecord {
    /// Lifts a raw API item into a record. Records without `Modified Date` fall back to
    /// `Created Date`, then to the Unix epoch so they always lose "latest wins" comparisons.
    pub fn from_json(entity: EntityType, value: JsonValue) -> Result<Self, RecordError> {
        let JsonValue::Object(fields) = value else {
            return Err(RecordError::NotAnObject { entity });
        };
        let external_id = match fields.get(FIELD_ID) {
            Some(JsonValue::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
            Some(JsonValue::Number(n)) => n.to_string(),
            _ => return Err(RecordError::MissingId { entity }),
        };

        let created_at = parse_timestamp_field(entity, &external_id, &fields, FIELD_CREATED)?;
        let modified_at = parse_timestamp_field(entity, &external_id, &fields, FIELD_MODIFIED)?
            .or(created_at)
            .unwrap_or_default();

        Ok(Self {
            entity,
            external_id,
            modified_at,
            created_at,
            fields,
        })
    }

    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name).filter(|v| !v.is_null())
    }
}

fn parse_timestamp_field(
    entity: EntityType,
    external_id: &str,
    fields: &Map<String, JsonValue>,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, RecordError> {
    match fields.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| RecordError::BadTimestamp {
                entity,
                external_id: external_id.to_string(),
                field,
                value: raw.clone(),
            }),
        // Epoch milliseconds.
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(Some)
            .ok_or_else(|| RecordError::BadTimestamp {
                entity,
                external_id: external_id.to_string(),
                field,
                value: n.to_string(),
            }),
        Some(other) => Err(RecordError::BadTimestamp {
            entity,
            external_id: external_id.to_string(),
            field,
            value: other.to_string(),
        }),
    }
}

/// Persistent translation of one external identifier to an internal one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub entity: EntityType,
    pub external_id: String,
    pub internal_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A transformed entity ready for writing. Composite entities carry every external id
/// that resolves to `internal_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalEntity {
    pub internal_id: Uuid,
    pub external_ids: Vec<String>,
    pub row: TargetRow,
}

impl CanonicalEntity {
    pub fn single(external_id: impl Into<String>, row: TargetRow) -> Self {
        Self {
            internal_id: row.internal_id(),
            external_ids: vec![external_id.into()],
            row,
        }
    }

    pub fn composite(external_ids: Vec<String>, row: TargetRow) -> Self {
        Self {
            internal_id: row.internal_id(),
            external_ids,
            row,
        }
    }

    pub fn entity(&self) -> EntityType {
        self.row.entity()
    }

    pub fn mapping_entries(&self, created_at: DateTime<Utc>) -> Vec<MappingEntry> {
        let entity = self.entity();
        self.external_ids
            .iter()
            .map(|external_id| MappingEntry {
                entity,
                external_id: external_id.clone(),
                internal_id: self.internal_id,
                created_at,
            })
            .collect()
    }
}
