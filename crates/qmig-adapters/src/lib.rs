//! Validated ingestion schemas per entity type + a fixture-backed record source.

use chrono::{DateTime, Utc};
use qmig_core::{EntityType, ExternalRecord, QuestionKind, RecordError};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

mod fixture;

pub use fixture::FixtureRecordSource;

pub const CRATE_NAME: &str = "qmig-adapters";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("{entity} record {external_id} rejected: {message}")]
    Invalid {
        entity: EntityType,
        external_id: String,
        message: String,
    },
}

impl SchemaError {
    pub fn external_id(&self) -> Option<&str> {
        match self {
            SchemaError::Record(RecordError::BadTimestamp { external_id, .. }) => Some(external_id),
            SchemaError::Record(_) => None,
            SchemaError::Invalid { external_id, .. } => Some(external_id),
        }
    }
}

/// A source record that passed its entity schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated<T> {
    pub external_id: String,
    pub modified_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    pub body: T,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompanySource {
    #[serde(deserialize_with = "required_text")]
    pub name: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub domain: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserSource {
    #[serde(deserialize_with = "required_text")]
    pub email: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub company: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SectionSource {
    #[serde(deserialize_with = "required_text")]
    pub name: String,
    #[serde(default)]
    pub order: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubsectionSource {
    #[serde(deserialize_with = "required_text")]
    pub name: String,
    #[serde(deserialize_with = "required_text")]
    pub section: String,
    #[serde(default)]
    pub order: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TagSource {
    #[serde(deserialize_with = "required_text")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuestionSource {
    #[serde(deserialize_with = "required_text")]
    pub content: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub kind: Option<String>,
    #[serde(deserialize_with = "required_text")]
    pub subsection: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub section: Option<String>,
    #[serde(default)]
    pub order: Option<f64>,
    #[serde(default)]
    pub required: Option<bool>,
}

impl QuestionSource {
    pub fn kind(&self) -> QuestionKind {
        parse_kind(self.kind.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChoiceSource {
    #[serde(deserialize_with = "required_text")]
    pub content: String,
    #[serde(deserialize_with = "required_text")]
    pub question: String,
    #[serde(default)]
    pub order: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListTableColumnSource {
    #[serde(deserialize_with = "required_text")]
    pub name: String,
    #[serde(deserialize_with = "required_text")]
    pub question: String,
    #[serde(default)]
    pub order: Option<f64>,
    #[serde(default, deserialize_with = "optional_text")]
    pub kind: Option<String>,
}

impl ListTableColumnSource {
    pub fn kind(&self) -> QuestionKind {
        parse_kind(self.kind.as_deref())
    }
}

/// One sheet revision. Several revisions may make up one logical sheet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SheetSource {
    #[serde(deserialize_with = "required_text")]
    pub name: String,
    #[serde(deserialize_with = "required_text")]
    pub company: String,
    #[serde(default, deserialize_with = "id_list")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnswerSource {
    /// External id of the sheet revision the answer belongs to.
    #[serde(deserialize_with = "required_text")]
    pub sheet: String,
    #[serde(deserialize_with = "required_text")]
    pub question: String,
    /// Raw value; numbers and booleans are read as their text form.
    #[serde(default, deserialize_with = "optional_text")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "id_list")]
    pub choices: Vec<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub row: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub column: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub created_by: Option<String>,
}

/// Validation beyond what the field types already enforce.
pub trait EntitySchema: DeserializeOwned {
    const ENTITY: EntityType;

    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

impl EntitySchema for CompanySource {
    const ENTITY: EntityType = EntityType::Company;
}

impl EntitySchema for UserSource {
    const ENTITY: EntityType = EntityType::User;

    fn check(&self) -> Result<(), String> {
        match self.email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
            _ => Err(format!("`{}` is not an email address", self.email)),
        }
    }
}

impl EntitySchema for SectionSource {
    const ENTITY: EntityType = EntityType::Section;
}

impl EntitySchema for SubsectionSource {
    const ENTITY: EntityType = EntityType::Subsection;
}

impl EntitySchema for TagSource {
    const ENTITY: EntityType = EntityType::Tag;
}

impl EntitySchema for QuestionSource {
    const ENTITY: EntityType = EntityType::Question;
}

impl EntitySchema for ChoiceSource {
    const ENTITY: EntityType = EntityType::Choice;
}

impl EntitySchema for ListTableColumnSource {
    const ENTITY: EntityType = EntityType::ListTableColumn;
}

impl EntitySchema for SheetSource {
    const ENTITY: EntityType = EntityType::Sheet;
}

impl EntitySchema for AnswerSource {
    const ENTITY: EntityType = EntityType::Answer;

    fn check(&self) -> Result<(), String> {
        match (&self.row, &self.column) {
            (Some(_), None) => Err("table row given without a column".into()),
            (None, Some(_)) => Err("table column given without a row".into()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    Company(Validated<CompanySource>),
    User(Validated<UserSource>),
    Section(Validated<SectionSource>),
    Subsection(Validated<SubsectionSource>),
    Tag(Validated<TagSource>),
    Question(Validated<QuestionSource>),
    Choice(Validated<ChoiceSource>),
    ListTableColumn(Validated<ListTableColumnSource>),
    Sheet(Validated<SheetSource>),
    Answer(Validated<AnswerSource>),
}

impl SourceRecord {
    pub fn entity(&self) -> EntityType {
        match self {
            SourceRecord::Company(_) => EntityType::Company,
            SourceRecord::User(_) => EntityType::User,
            SourceRecord::Section(_) => EntityType::Section,
            SourceRecord::Subsection(_) => EntityType::Subsection,
            SourceRecord::Tag(_) => EntityType::Tag,
            SourceRecord::Question(_) => EntityType::Question,
            SourceRecord::Choice(_) => EntityType::Choice,
            SourceRecord::ListTableColumn(_) => EntityType::ListTableColumn,
            SourceRecord::Sheet(_) => EntityType::Sheet,
            SourceRecord::Answer(_) => EntityType::Answer,
        }
    }

    pub fn external_id(&self) -> &str {
        match self {
            SourceRecord::Company(v) => &v.external_id,
            SourceRecord::User(v) => &v.external_id,
            SourceRecord::Section(v) => &v.external_id,
            SourceRecord::Subsection(v) => &v.external_id,
            SourceRecord::Tag(v) => &v.external_id,
            SourceRecord::Question(v) => &v.external_id,
            SourceRecord::Choice(v) => &v.external_id,
            SourceRecord::ListTableColumn(v) => &v.external_id,
            SourceRecord::Sheet(v) => &v.external_id,
            SourceRecord::Answer(v) => &v.external_id,
        }
    }
}

/// Parses one raw API item against the schema of `T`.
pub fn parse_as<T: EntitySchema>(value: JsonValue) -> Result<Validated<T>, SchemaError> {
    let ExternalRecord {
        external_id,
        modified_at,
        created_at,
        fields,
        ..
    } = ExternalRecord::from_json(T::ENTITY, value)?;
    let invalid = |message: String| SchemaError::Invalid {
        entity: T::ENTITY,
        external_id: external_id.clone(),
        message,
    };
    let body: T = serde_json::from_value(JsonValue::Object(fields)).map_err(|e| invalid(e.to_string()))?;
    body.check().map_err(invalid)?;
    Ok(Validated {
        external_id,
        modified_at,
        created_at,
        body,
    })
}

pub fn parse_record(entity: EntityType, value: JsonValue) -> Result<SourceRecord, SchemaError> {
    match entity {
        EntityType::Company => parse_as(value).map(SourceRecord::Company),
        EntityType::User => parse_as(value).map(SourceRecord::User),
        EntityType::Section => parse_as(value).map(SourceRecord::Section),
        EntityType::Subsection => parse_as(value).map(SourceRecord::Subsection),
        EntityType::Tag => parse_as(value).map(SourceRecord::Tag),
        EntityType::Question => parse_as(value).map(SourceRecord::Question),
        EntityType::Choice => parse_as(value).map(SourceRecord::Choice),
        EntityType::ListTableColumn => parse_as(value).map(SourceRecord::ListTableColumn),
        EntityType::Sheet => parse_as(value).map(SourceRecord::Sheet),
        EntityType::Answer => parse_as(value).map(SourceRecord::Answer),
    }
}

#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub accepted: Vec<SourceRecord>,
    pub rejected: Vec<SchemaError>,
}

/// Parse-or-reject over a whole fetch result. Rejections are returned, never dropped silently.
pub fn parse_records(entity: EntityType, items: Vec<JsonValue>) -> ParsedBatch {
    let mut batch = ParsedBatch::default();
    for item in items {
        match parse_record(entity, item) {
            Ok(record) => batch.accepted.push(record),
            Err(err) => {
                debug!(%entity, error = %err, "record rejected by schema");
                batch.rejected.push(err);
            }
        }
    }
    if !batch.rejected.is_empty() {
        warn!(
            %entity,
            accepted = batch.accepted.len(),
            rejected = batch.rejected.len(),
            "schema rejected source records"
        );
    }
    batch
}

fn parse_kind(raw: Option<&str>) -> QuestionKind {
    raw.map(|k| k.parse::<QuestionKind>().unwrap_or_default())
        .unwrap_or_default()
}

fn scalar_text<E: de::Error>(value: JsonValue) -> Result<Option<String>, E> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) => {
            let trimmed = s.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        JsonValue::Number(n) => Ok(Some(n.to_string())),
        JsonValue::Bool(b) => Ok(Some(b.to_string())),
        other => Err(E::custom(format!("expected a scalar, found {other}"))),
    }
}

fn required_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    scalar_text::<D::Error>(JsonValue::deserialize(deserializer)?)?
        .ok_or_else(|| de::Error::custom("required value is empty"))
}

fn optional_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    scalar_text::<D::Error>(JsonValue::deserialize(deserializer)?)
}

/// Reference lists; a lone id is accepted as a one-element list.
fn id_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    match JsonValue::deserialize(deserializer)? {
        JsonValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if let Some(id) = scalar_text::<D::Error>(item)? {
                    out.push(id);
                }
            }
            Ok(out)
        }
        other => Ok(scalar_text::<D::Error>(other)?.into_iter().collect()),
    }
}
