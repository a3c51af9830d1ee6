use std::collections::HashMap;

use async_trait::async_trait;
use qmig_core::{EntityType, MappingEntry, QuestionKind, TargetRow};
use thiserror::Error;
use uuid::Uuid;

use crate::retry::RetryDisposition;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Connection-level failure; retrying may help.
    #[error("target store unavailable: {0}")]
    Unavailable(String),
    /// The store refused the data, e.g. a constraint violation.
    #[error("rejected by target store: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Unavailable(_) => RetryDisposition::Retryable,
            StoreError::Rejected(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Relational target: one table per entity type, upsert semantics throughout.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Writes all rows atomically: either every row lands or none does.
    async fn write_chunk(&self, rows: &[TargetRow]) -> Result<(), StoreError>;

    async fn write_row(&self, row: &TargetRow) -> Result<(), StoreError>;

    /// Empties the tables backing `entity` and every type in [`EntityType::dependents`],
    /// whose rows would otherwise reference nothing.
    async fn truncate(&self, entity: EntityType) -> Result<(), StoreError>;

    /// Deletes the list-table cells of `sheet_ids` whose id is not in `keep`. Returns the
    /// number of cells removed.
    async fn prune_answer_cells(&self, sheet_ids: &[Uuid], keep: &[Uuid]) -> Result<u64, StoreError>;

    /// Takes the exclusive logical lock on `entity`. Fails if another writer holds it.
    async fn lock_entity(&self, entity: EntityType) -> Result<(), StoreError>;

    async fn unlock_entity(&self, entity: EntityType) -> Result<(), StoreError>;

    /// Latest revision external id per composite sheet.
    async fn sheet_latest_revisions(&self) -> Result<HashMap<Uuid, String>, StoreError>;

    /// Value kind of every migrated question and list-table column, keyed by internal id.
    async fn value_kinds(&self) -> Result<HashMap<Uuid, QuestionKind>, StoreError>;
}

/// Durable `(entity_type, external_id) -> internal_id` mapping table.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn load_all(&self, entity: EntityType) -> Result<HashMap<String, Uuid>, StoreError>;

    async fn get(&self, entity: EntityType, external_id: &str) -> Result<Option<Uuid>, StoreError>;

    async fn get_many(
        &self,
        entity: EntityType,
        external_ids: &[String],
    ) -> Result<HashMap<String, Uuid>, StoreError>;

    async fn upsert(&self, entries: &[MappingEntry]) -> Result<(), StoreError>;

    /// Drops every mapping for `entity`.
    async fn clear(&self, entity: EntityType) -> Result<(), StoreError>;
}
