//! Record → canonical entity transforms for the non-composite entity types.

use futures::try_join;
use qmig_adapters::{SourceRecord, Validated};
use qmig_core::{
    CanonicalEntity, ChoiceRow, CompanyRow, EntityType, ListTableColumnRow, QuestionRow,
    SectionRow, SubsectionRow, TagRow, TargetRow, UserRow,
};
use qmig_storage::{Retried, StoreError};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::identity::IdentityMap;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unresolved {entity} reference `{external_id}`")]
    FkUnresolved {
        entity: EntityType,
        external_id: String,
    },
    #[error("{0}")]
    Invalid(String),
    #[error("identity lookup failed: {0}")]
    Store(#[from] Retried<StoreError>),
}

impl TransformError {
    /// Lookup failures mean the mapping store is gone; everything else only costs the row.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransformError::Store(_))
    }
}

/// Existing internal id for `external_id`, or a freshly minted one.
pub async fn internal_id_for(
    identity: &IdentityMap,
    entity: EntityType,
    external_id: &str,
) -> Result<Uuid, TransformError> {
    Ok(identity
        .get(entity, external_id)
        .await?
        .unwrap_or_else(Uuid::new_v4))
}

pub async fn resolve_required(
    identity: &IdentityMap,
    entity: EntityType,
    external_id: &str,
) -> Result<Uuid, TransformError> {
    identity
        .get(entity, external_id)
        .await?
        .ok_or_else(|| TransformError::FkUnresolved {
            entity,
            external_id: external_id.to_string(),
        })
}

/// Optional references that do not resolve read as absent.
pub async fn resolve_optional(
    identity: &IdentityMap,
    entity: EntityType,
    external_id: Option<&str>,
) -> Result<Option<Uuid>, TransformError> {
    let Some(external_id) = external_id else {
        return Ok(None);
    };
    let found = identity.get(entity, external_id).await?;
    if found.is_none() {
        debug!(%entity, external_id, "optional reference unresolved; leaving empty");
    }
    Ok(found)
}

fn position(order: Option<f64>) -> i32 {
    order
        .filter(|o| o.is_finite())
        .map(|o| o.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
        .unwrap_or(0)
}

fn single<T>(record: &Validated<T>, row: TargetRow) -> CanonicalEntity {
    CanonicalEntity::single(record.external_id.clone(), row)
}

/// Transforms one validated record. Foreign keys of the record are resolved concurrently.
pub async fn transform_record(
    identity: &IdentityMap,
    record: &SourceRecord,
) -> Result<CanonicalEntity, TransformError> {
    match record {
        SourceRecord::Company(v) => {
            let id = internal_id_for(identity, EntityType::Company, &v.external_id).await?;
            Ok(single(
                v,
                TargetRow::Company(CompanyRow {
                    id,
                    name: v.body.name.clone(),
                    domain: v.body.domain.as_ref().map(|d| d.to_ascii_lowercase()),
                    created_at: v.created_at,
                    modified_at: v.modified_at,
                }),
            ))
        }
        SourceRecord::User(v) => {
            let (id, company_id) = try_join!(
                internal_id_for(identity, EntityType::User, &v.external_id),
                resolve_optional(identity, EntityType::Company, v.body.company.as_deref()),
            )?;
            Ok(single(
                v,
                TargetRow::User(UserRow {
                    id,
                    email: v.body.email.to_ascii_lowercase(),
                    name: v.body.name.clone(),
                    company_id,
                    modified_at: v.modified_at,
                }),
            ))
        }
        SourceRecord::Section(v) => {
            let id = internal_id_for(identity, EntityType::Section, &v.external_id).await?;
            Ok(single(
                v,
                TargetRow::Section(SectionRow {
                    id,
                    name: v.body.name.clone(),
                    position: position(v.body.order),
                }),
            ))
        }
        SourceRecord::Subsection(v) => {
            let (id, section_id) = try_join!(
                internal_id_for(identity, EntityType::Subsection, &v.external_id),
                resolve_required(identity, EntityType::Section, &v.body.section),
            )?;
            Ok(single(
                v,
                TargetRow::Subsection(SubsectionRow {
                    id,
                    section_id,
                    name: v.body.name.clone(),
                    position: position(v.body.order),
                }),
            ))
        }
        SourceRecord::Tag(v) => {
            let id = internal_id_for(identity, EntityType::Tag, &v.external_id).await?;
            Ok(single(
                v,
                TargetRow::Tag(TagRow {
                    id,
                    name: v.body.name.clone(),
                }),
            ))
        }
        SourceRecord::Question(v) => {
            let (id, subsection_id, section_id) = try_join!(
                internal_id_for(identity, EntityType::Question, &v.external_id),
                resolve_required(identity, EntityType::Subsection, &v.body.subsection),
                resolve_optional(identity, EntityType::Section, v.body.section.as_deref()),
            )?;
            Ok(single(
                v,
                TargetRow::Question(QuestionRow {
                    id,
                    subsection_id,
                    section_id,
                    content: v.body.content.clone(),
                    kind: v.body.kind(),
                    position: position(v.body.order),
                    required: v.body.required.unwrap_or(false),
                }),
            ))
        }
        SourceRecord::Choice(v) => {
            let (id, question_id) = try_join!(
                internal_id_for(identity, EntityType::Choice, &v.external_id),
                resolve_required(identity, EntityType::Question, &v.body.question),
            )?;
            Ok(single(
                v,
                TargetRow::Choice(ChoiceRow {
                    id,
                    question_id,
                    content: v.body.content.clone(),
                    position: position(v.body.order),
                }),
            ))
        }
        SourceRecord::ListTableColumn(v) => {
            let (id, question_id) = try_join!(
                internal_id_for(identity, EntityType::ListTableColumn, &v.external_id),
                resolve_required(identity, EntityType::Question, &v.body.question),
            )?;
            Ok(single(
                v,
                TargetRow::ListTableColumn(ListTableColumnRow {
                    id,
                    question_id,
                    name: v.body.name.clone(),
                    kind: v.body.kind(),
                    position: position(v.body.order),
                }),
            ))
        }
        SourceRecord::Sheet(_) | SourceRecord::Answer(_) => Err(TransformError::Invalid(format!(
            "{} records are not transformed one at a time",
            record.entity()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use qmig_adapters::parse_record;
    use qmig_storage::{MemoryMappingStore, RetryPolicy};
    use serde_json::json;

    fn identity() -> IdentityMap {
        IdentityMap::new(Arc::new(MemoryMappingStore::new()), RetryPolicy::default())
    }

    #[tokio::test]
    async fn subsection_resolves_its_section() {
        let identity = identity();
        let section_id = Uuid::new_v4();
        identity.set(EntityType::Section, "s1", section_id).await.expect("set");
        let record = parse_record(
            EntityType::Subsection,
            json!({"_id": "ss1", "name": "Energy", "section": "s1", "order": 2.0}),
        )
        .expect("valid");

        let entity = transform_record(&identity, &record).await.expect("transform");
        match entity.row {
            TargetRow::Subsection(row) => {
                assert_eq!(row.section_id, section_id);
                assert_eq!(row.position, 2);
            }
            other => panic!("unexpected row {other:?}"),
        }
        assert_eq!(entity.external_ids, vec!["ss1".to_string()]);
    }

    #[tokio::test]
    async fn missing_required_reference_is_fk_unresolved() {
        let identity = identity();
        let record = parse_record(
            EntityType::Choice,
            json!({"_id": "ch1", "content": "Yes", "question": "q-missing"}),
        )
        .expect("valid");
        let err = transform_record(&identity, &record).await.expect_err("no question");
        assert!(matches!(
            err,
            TransformError::FkUnresolved { entity: EntityType::Question, .. }
        ));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn existing_mapping_is_reused() {
        let identity = identity();
        let id = Uuid::new_v4();
        identity.set(EntityType::Tag, "t1", id).await.expect("set");
        let record = parse_record(EntityType::Tag, json!({"_id": "t1", "name": "esg"})).expect("valid");
        let entity = transform_record(&identity, &record).await.expect("transform");
        assert_eq!(entity.internal_id, id);
    }

    #[tokio::test]
    async fn optional_company_may_be_unresolved() {
        let identity = identity();
        let record = parse_record(
            EntityType::User,
            json!({"_id": "u1", "email": "Ops@Acme.io", "company": "gone"}),
        )
        .expect("valid");
        let entity = transform_record(&identity, &record).await.expect("transform");
        match entity.row {
            TargetRow::User(row) => {
                assert_eq!(row.email, "ops@acme.io");
                assert_eq!(row.company_id, None);
            }
            other => panic!("unexpected row {other:?}"),
        }
    }
}
