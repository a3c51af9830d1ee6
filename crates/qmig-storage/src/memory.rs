//! In-process stores backing tests and fixture-driven runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use qmig_core::{
    AnswerCellRow, AnswerRow, EntityType, MappingEntry, QuestionKind, SheetRow, TargetRow,
};
use uuid::Uuid;

use crate::store::{MappingStore, StoreError, TargetStore};

pub type RowPredicate = Arc<dyn Fn(&TargetRow) -> bool + Send + Sync>;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn tables_for(entity: EntityType) -> &'static [&'static str] {
    match entity {
        EntityType::Company => &["companies"],
        EntityType::User => &["users"],
        EntityType::Section => &["sections"],
        EntityType::Subsection => &["subsections"],
        EntityType::Tag => &["tags"],
        EntityType::Question => &["questions"],
        EntityType::Choice => &["choices"],
        EntityType::ListTableColumn => &["list_table_columns"],
        EntityType::Sheet => &["sheets"],
        EntityType::Answer => &["answers", "answer_cells"],
    }
}

/// Table-per-entity store held in memory, with failure injection.
#[derive(Default)]
pub struct MemoryTargetStore {
    tables: Mutex<BTreeMap<&'static str, BTreeMap<Uuid, TargetRow>>>,
    reject: Mutex<Option<RowPredicate>>,
    pending_failures: AtomicU32,
    own_locks: Mutex<HashSet<EntityType>>,
    foreign_locks: Mutex<HashSet<EntityType>>,
    truncations: Mutex<Vec<EntityType>>,
    chunk_writes: AtomicUsize,
    row_writes: AtomicUsize,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows matching `predicate` are refused with [`StoreError::Rejected`].
    pub fn reject_rows_where(&self, predicate: RowPredicate) {
        *guard(&self.reject) = Some(predicate);
    }

    /// The next `n` write calls fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Simulates another run holding the lock on `entity`.
    pub fn hold_foreign_lock(&self, entity: EntityType) {
        guard(&self.foreign_locks).insert(entity);
    }

    pub fn is_locked(&self, entity: EntityType) -> bool {
        guard(&self.own_locks).contains(&entity)
    }

    pub fn rows(&self, table: &str) -> Vec<TargetRow> {
        guard(&self.tables)
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, table: &str) -> usize {
        guard(&self.tables).get(table).map_or(0, BTreeMap::len)
    }

    pub fn row(&self, table: &str, id: Uuid) -> Option<TargetRow> {
        guard(&self.tables).get(table)?.get(&id).cloned()
    }

    pub fn sheets(&self) -> Vec<SheetRow> {
        self.rows("sheets")
            .into_iter()
            .filter_map(|row| match row {
                TargetRow::Sheet(sheet) => Some(sheet),
                _ => None,
            })
            .collect()
    }

    pub fn answers(&self) -> Vec<AnswerRow> {
        self.rows("answers")
            .into_iter()
            .filter_map(|row| match row {
                TargetRow::Answer(answer) => Some(answer),
                _ => None,
            })
            .collect()
    }

    pub fn answer_cells(&self) -> Vec<AnswerCellRow> {
        self.rows("answer_cells")
            .into_iter()
            .filter_map(|row| match row {
                TargetRow::AnswerCell(cell) => Some(cell),
                _ => None,
            })
            .collect()
    }

    pub fn chunk_writes(&self) -> usize {
        self.chunk_writes.load(Ordering::SeqCst)
    }

    pub fn row_writes(&self) -> usize {
        self.row_writes.load(Ordering::SeqCst)
    }

    pub fn truncations(&self) -> Vec<EntityType> {
        guard(&self.truncations).clone()
    }

    fn take_injected_failure(&self) -> Option<StoreError> {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| StoreError::Unavailable("injected connection failure".into()))
    }

    fn check(&self, row: &TargetRow) -> Result<(), StoreError> {
        let reject = guard(&self.reject).clone();
        match reject {
            Some(predicate) if predicate(row) => Err(StoreError::Rejected(format!(
                "{} row {} violates a constraint",
                row.table_name(),
                row.internal_id()
            ))),
            _ => Ok(()),
        }
    }

    fn insert(&self, rows: &[TargetRow]) {
        let mut tables = guard(&self.tables);
        for row in rows {
            tables
                .entry(row.table_name())
                .or_default()
                .insert(row.internal_id(), row.clone());
        }
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn write_chunk(&self, rows: &[TargetRow]) -> Result<(), StoreError> {
        self.chunk_writes.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        for row in rows {
            self.check(row)?;
        }
        self.insert(rows);
        Ok(())
    }

    async fn write_row(&self, row: &TargetRow) -> Result<(), StoreError> {
        self.row_writes.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        self.check(row)?;
        self.insert(std::slice::from_ref(row));
        Ok(())
    }

    async fn truncate(&self, entity: EntityType) -> Result<(), StoreError> {
        let mut tables = guard(&self.tables);
        for affected in std::iter::once(entity).chain(entity.dependents()) {
            for table in tables_for(affected) {
                tables.remove(table);
            }
        }
        guard(&self.truncations).push(entity);
        Ok(())
    }

    async fn prune_answer_cells(&self, sheet_ids: &[Uuid], keep: &[Uuid]) -> Result<u64, StoreError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        let sheets: HashSet<&Uuid> = sheet_ids.iter().collect();
        let keep: HashSet<&Uuid> = keep.iter().collect();
        let mut tables = guard(&self.tables);
        let Some(cells) = tables.get_mut("answer_cells") else {
            return Ok(0);
        };
        let before = cells.len();
        cells.retain(|id, row| match row {
            TargetRow::AnswerCell(cell) => !sheets.contains(&cell.sheet_id) || keep.contains(id),
            _ => true,
        });
        Ok((before - cells.len()) as u64)
    }

    async fn lock_entity(&self, entity: EntityType) -> Result<(), StoreError> {
        if guard(&self.foreign_locks).contains(&entity) {
            return Err(StoreError::Unavailable(format!(
                "{entity} is locked by another migration run"
            )));
        }
        guard(&self.own_locks).insert(entity);
        Ok(())
    }

    async fn unlock_entity(&self, entity: EntityType) -> Result<(), StoreError> {
        guard(&self.own_locks).remove(&entity);
        Ok(())
    }

    async fn sheet_latest_revisions(&self) -> Result<HashMap<Uuid, String>, StoreError> {
        Ok(self
            .sheets()
            .into_iter()
            .map(|sheet| (sheet.id, sheet.latest_external_id))
            .collect())
    }

    async fn value_kinds(&self) -> Result<HashMap<Uuid, QuestionKind>, StoreError> {
        let tables = guard(&self.tables);
        let kinds = ["questions", "list_table_columns"]
            .iter()
            .filter_map(|table| tables.get(table))
            .flat_map(|rows| rows.values())
            .filter_map(|row| match row {
                TargetRow::Question(q) => Some((q.id, q.kind)),
                TargetRow::ListTableColumn(c) => Some((c.id, c.kind)),
                _ => None,
            })
            .collect();
        Ok(kinds)
    }
}

#[derive(Default)]
pub struct MemoryMappingStore {
    entries: Mutex<HashMap<(EntityType, String), Uuid>>,
    lookups: AtomicUsize,
    pending_failures: AtomicU32,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, entity: EntityType) -> usize {
        guard(&self.entries)
            .keys()
            .filter(|(e, _)| *e == entity)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        guard(&self.entries).is_empty()
    }

    /// Number of point and batch lookups served, excluding `load_all`.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> Result<(), StoreError> {
        match self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(StoreError::Unavailable("injected mapping store failure".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn load_all(&self, entity: EntityType) -> Result<HashMap<String, Uuid>, StoreError> {
        self.take_injected_failure()?;
        Ok(guard(&self.entries)
            .iter()
            .filter(|((e, _), _)| *e == entity)
            .map(|((_, ext), id)| (ext.clone(), *id))
            .collect())
    }

    async fn get(&self, entity: EntityType, external_id: &str) -> Result<Option<Uuid>, StoreError> {
        self.take_injected_failure()?;
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(guard(&self.entries)
            .get(&(entity, external_id.to_string()))
            .copied())
    }

    async fn get_many(
        &self,
        entity: EntityType,
        external_ids: &[String],
    ) -> Result<HashMap<String, Uuid>, StoreError> {
        self.take_injected_failure()?;
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let entries = guard(&self.entries);
        Ok(external_ids
            .iter()
            .filter_map(|ext| {
                entries
                    .get(&(entity, ext.clone()))
                    .map(|id| (ext.clone(), *id))
            })
            .collect())
    }

    async fn upsert(&self, batch: &[MappingEntry]) -> Result<(), StoreError> {
        self.take_injected_failure()?;
        let mut entries = guard(&self.entries);
        for entry in batch {
            entries.insert((entry.entity, entry.external_id.clone()), entry.internal_id);
        }
        Ok(())
    }

    async fn clear(&self, entity: EntityType) -> Result<(), StoreError> {
        guard(&self.entries).retain(|(e, _), _| *e != entity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use qmig_core::TagRow;

    fn cell(sheet_id: Uuid, row_key: &str) -> TargetRow {
        TargetRow::AnswerCell(AnswerCellRow {
            id: Uuid::new_v4(),
            sheet_id,
            question_id: Uuid::new_v4(),
            row_key: row_key.to_string(),
            column_id: Uuid::new_v4(),
            text_value: Some("v".into()),
            number_value: None,
            author_id: None,
            source_external_id: format!("{row_key}-src"),
            modified_at: Utc::now(),
        })
    }

    fn tag(name: &str) -> TargetRow {
        TargetRow::Tag(TagRow {
            id: Uuid::new_v4(),
            name: name.to_string(),
        })
    }

    #[tokio::test]
    async fn chunk_writes_are_all_or_nothing() {
        let store = MemoryTargetStore::new();
        store.reject_rows_where(Arc::new(|row| match row {
            TargetRow::Tag(t) => t.name == "bad",
            _ => false,
        }));
        let err = store
            .write_chunk(&[tag("ok"), tag("bad"), tag("fine")])
            .await
            .expect_err("chunk rejected");
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.count("tags"), 0);

        store.write_row(&tag("ok")).await.expect("single row");
        assert_eq!(store.count("tags"), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryTargetStore::new();
        store.fail_next(1);
        assert!(matches!(
            store.write_chunk(&[tag("a")]).await,
            Err(StoreError::Unavailable(_))
        ));
        store.write_chunk(&[tag("a")]).await.expect("second call succeeds");
        assert_eq!(store.chunk_writes(), 2);
    }

    #[tokio::test]
    async fn truncate_empties_entity_tables() {
        let store = MemoryTargetStore::new();
        store.write_chunk(&[tag("a"), tag("b")]).await.expect("write");
        store.truncate(EntityType::Tag).await.expect("truncate");
        assert_eq!(store.count("tags"), 0);
        assert_eq!(store.truncations(), vec![EntityType::Tag]);
    }

    #[tokio::test]
    async fn truncate_cascades_to_dependent_tables() {
        let store = MemoryTargetStore::new();
        store.write_chunk(&[tag("a")]).await.expect("write tag");
        store.write_chunk(&[cell(Uuid::new_v4(), "X")]).await.expect("write cell");
        store.truncate(EntityType::Tag).await.expect("truncate");
        assert_eq!(store.count("tags"), 0);
        assert_eq!(store.count("answer_cells"), 0);

        store.write_chunk(&[tag("b")]).await.expect("write tag");
        store.truncate(EntityType::Answer).await.expect("truncate answers");
        assert_eq!(store.count("tags"), 1);
    }

    #[tokio::test]
    async fn prune_keeps_listed_cells_and_other_sheets() {
        let store = MemoryTargetStore::new();
        let sheet = Uuid::new_v4();
        let other = Uuid::new_v4();
        let (x, y, z) = (cell(sheet, "X"), cell(sheet, "Y"), cell(other, "X"));
        store
            .write_chunk(&[x.clone(), y.clone(), z.clone()])
            .await
            .expect("write cells");

        let removed = store
            .prune_answer_cells(&[sheet], &[y.internal_id()])
            .await
            .expect("prune");
        assert_eq!(removed, 1);
        assert!(store.row("answer_cells", x.internal_id()).is_none());
        assert!(store.row("answer_cells", y.internal_id()).is_some());
        assert!(store.row("answer_cells", z.internal_id()).is_some());
    }

    #[tokio::test]
    async fn foreign_lock_blocks_writer() {
        let store = MemoryTargetStore::new();
        store.hold_foreign_lock(EntityType::Answer);
        assert!(store.lock_entity(EntityType::Answer).await.is_err());
        store.lock_entity(EntityType::Sheet).await.expect("free lock");
        assert!(store.is_locked(EntityType::Sheet));
        store.unlock_entity(EntityType::Sheet).await.expect("unlock");
        assert!(!store.is_locked(EntityType::Sheet));
    }

    #[tokio::test]
    async fn mapping_store_upserts_and_clears_per_entity() {
        let store = MemoryMappingStore::new();
        let id = Uuid::new_v4();
        store
            .upsert(&[
                MappingEntry {
                    entity: EntityType::Company,
                    external_id: "c1".into(),
                    internal_id: id,
                    created_at: Utc::now(),
                },
                MappingEntry {
                    entity: EntityType::Tag,
                    external_id: "c1".into(),
                    internal_id: Uuid::new_v4(),
                    created_at: Utc::now(),
                },
            ])
            .await
            .expect("upsert");
        assert_eq!(store.get(EntityType::Company, "c1").await.expect("get"), Some(id));
        let many = store
            .get_many(EntityType::Company, &["c1".into(), "missing".into()])
            .await
            .expect("get_many");
        assert_eq!(many.len(), 1);

        store.clear(EntityType::Company).await.expect("clear");
        assert_eq!(store.len(EntityType::Company), 0);
        assert_eq!(store.len(EntityType::Tag), 1);
    }
}
