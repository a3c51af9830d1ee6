use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use qmig_core::{EntityType, MappingEntry, QuestionKind, TargetRow};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{MappingStore, StoreError, TargetStore};

/// Bind-parameter budget keeps multi-row mapping inserts well under the protocol limit.
const MAPPING_INSERT_CHUNK: usize = 1000;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
                // 08xxx connection exceptions, 57P0x operator intervention.
                if code.starts_with("08") || code.starts_with("57P") {
                    StoreError::Unavailable(err.to_string())
                } else {
                    StoreError::Rejected(err.to_string())
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Rejected(err.to_string()),
        }
    }
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
        EntityType::Sheet => &["sheet_tags", "sheets"],
        EntityType::Answer => &["answer_cells", "answers"],
    }
}

fn lock_key(entity: EntityType) -> String {
    format!("qmig:{entity}")
}

/// Postgres target store and mapping table.
pub struct PgTargetStore {
    pool: PgPool,
    locks: Mutex<HashMap<EntityType, PoolConnection<Postgres>>>,
}

impl PgTargetStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(2))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .context("connecting to target database")?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the bundled schema migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .context("applying target schema migrations")?;
        info!("target schema is up to date");
        Ok(())
    }
}

async fn upsert_row(conn: &mut PgConnection, row: &TargetRow) -> Result<(), sqlx::Error> {
    match row {
        TargetRow::Company(r) => {
            sqlx::query(
                r#"
                INSERT INTO companies (id, name, domain, created_at, modified_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE
                   SET name = EXCLUDED.name,
                       domain = EXCLUDED.domain,
                       created_at = EXCLUDED.created_at,
                       modified_at = EXCLUDED.modified_at
                "#,
            )
            .bind(r.id)
            .bind(&r.name)
            .bind(&r.domain)
            .bind(r.created_at)
            .bind(r.modified_at)
            .execute(&mut *conn)
            .await?;
        }
        TargetRow::User(r) => {
            sqlx::query(
                r#"
                INSERT INTO users (id, email, name, company_id, modified_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE
                   SET email = EXCLUDED.email,
                       name = EXCLUDED.name,
                       company_id = EXCLUDED.company_id,
                       modified_at = EXCLUDED.modified_at
                "#,
            )
            .bind(r.id)
            .bind(&r.email)
            .bind(&r.name)
            .bind(r.company_id)
            .bind(r.modified_at)
            .execute(&mut *conn)
            .await?;
        }
        TargetRow::Section(r) => {
            sqlx::query(
                r#"
                INSERT INTO sections (id, name, position)
                VALUES ($1, $2, $3)
                ON CONFLICT (id) DO UPDATE
                   SET name = EXCLUDED.name, position = EXCLUDED.position
                "#,
            )
            .bind(r.id)
            .bind(&r.name)
            .bind(r.position)
            .execute(&mut *conn)
            .await?;
        }
        TargetRow::Subsection(r) => {
            sqlx::query(
                r#"
                INSERT INTO subsections (id, section_id, name, position)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO UPDATE
                   SET section_id = EXCLUDED.section_id,
                       name = EXCLUDED.name,
                       position = EXCLUDED.position
                "#,
            )
            .bind(r.id)
            .bind(r.section_id)
            .bind(&r.name)
            .bind(r.position)
            .execute(&mut *conn)
            .await?;
        }
        TargetRow::Tag(r) => {
            sqlx::query(
                r#"
                INSERT INTO tags (id, name) VALUES ($1, $2)
                ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
                "#,
            )
            .bind(r.id)
            .bind(&r.name)
            .execute(&mut *conn)
            .await?;
        }
        TargetRow::Question(r) => {
            sqlx::query(
                r#"
                INSERT INTO questions (id, subsection_id, section_id, content, kind, position, required)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO UPDATE
                   SET subsection_id = EXCLUDED.subsection_id,
                       section_id = EXCLUDED.section_id,
                       content = EXCLUDED.content,
                       kind = EXCLUDED.kind,
                       position = EXCLUDED.position,
                       required = EXCLUDED.required
                "#,
            )
            .bind(r.id)
            .bind(r.subsection_id)
            .bind(r.section_id)
            .bind(&r.content)
            .bind(r.kind.as_str())
            .bind(r.position)
            .bind(r.required)
            .execute(&mut *conn)
            .await?;
        }
        TargetRow::Choice(r) => {
            sqlx::query(
                r#"
                INSERT INTO choices (id, question_id, content, position)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO UPDATE
                   SET question_id = EXCLUDED.question_id,
                       content = EXCLUDED.content,
                       position = EXCLUDED.position
                "#,
            )
            .bind(r.id)
            .bind(r.question_id)
            .bind(&r.content)
            .bind(r.position)
            .execute(&mut *conn)
            .await?;
        }
        TargetRow::ListTableColumn(r) => {
            sqlx::query(
                r#"
                INSERT INTO list_table_columns (id, question_id, name, kind, position)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE
                   SET question_id = EXCLUDED.question_id,
                       name = EXCLUDED.name,
                       kind = EXCLUDED.kind,
                       position = EXCLUDED.position
                "#,
            )
            .bind(r.id)
            .bind(r.question_id)
            .bind(&r.name)
            .bind(r.kind.as_str())
            .bind(r.position)
            .execute(&mut *conn)
            .await?;
        }
        TargetRow::Sheet(r) => {
            sqlx::query(
                r#"
                INSERT INTO sheets (id, company_id, name, status, created_by, latest_external_id,
                                    version_count, modified_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE
                   SET company_id = EXCLUDED.company_id,
                       name = EXCLUDED.name,
                       status = EXCLUDED.status,
                       created_by = EXCLUDED.created_by,
                       latest_external_id = EXCLUDED.latest_external_id,
                       version_count = EXCLUDED.version_count,
                       modified_at = EXCLUDED.modified_at
                "#,
            )
            .bind(r.id)
            .bind(r.company_id)
            .bind(&r.name)
            .bind(&r.status)
            .bind(r.created_by)
            .bind(&r.latest_external_id)
            .bind(r.version_count)
            .bind(r.modified_at)
            .execute(&mut *conn)
            .await?;
            sqlx::query("DELETE FROM sheet_tags WHERE sheet_id = $1")
                .bind(r.id)
                .execute(&mut *conn)
                .await?;
            if !r.tag_ids.is_empty() {
                sqlx::query(
                    r#"
                    INSERT INTO sheet_tags (sheet_id, tag_id)
                    SELECT $1, UNNEST($2::uuid[])
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(r.id)
                .bind(&r.tag_ids)
                .execute(&mut *conn)
                .await?;
            }
        }
        TargetRow::Answer(r) => {
            sqlx::query(
                r#"
                INSERT INTO answers (id, sheet_id, question_id, text_value, number_value, bool_value,
                                     choice_ids, author_id, source_external_id, modified_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id) DO UPDATE
                   SET text_value = EXCLUDED.text_value,
                       number_value = EXCLUDED.number_value,
                       bool_value = EXCLUDED.bool_value,
                       choice_ids = EXCLUDED.choice_ids,
                       author_id = EXCLUDED.author_id,
                       source_external_id = EXCLUDED.source_external_id,
                       modified_at = EXCLUDED.modified_at
                "#,
            )
            .bind(r.id)
            .bind(r.sheet_id)
            .bind(r.question_id)
            .bind(&r.text_value)
            .bind(r.number_value)
            .bind(r.bool_value)
            .bind(&r.choice_ids)
            .bind(r.author_id)
            .bind(&r.source_external_id)
            .bind(r.modified_at)
            .execute(&mut *conn)
            .await?;
        }
        TargetRow::AnswerCell(r) => {
            sqlx::query(
                r#"
                INSERT INTO answer_cells (id, sheet_id, question_id, row_key, column_id, text_value,
                                          number_value, author_id, source_external_id, modified_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id) DO UPDATE
                   SET text_value = EXCLUDED.text_value,
                       number_value = EXCLUDED.number_value,
                       author_id = EXCLUDED.author_id,
                       source_external_id = EXCLUDED.source_external_id,
                       modified_at = EXCLUDED.modified_at
                "#,
            )
            .bind(r.id)
            .bind(r.sheet_id)
            .bind(r.question_id)
            .bind(&r.row_key)
            .bind(r.column_id)
            .bind(&r.text_value)
            .bind(r.number_value)
            .bind(r.author_id)
            .bind(&r.source_external_id)
            .bind(r.modified_at)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl TargetStore for PgTargetStore {
    async fn write_chunk(&self, rows: &[TargetRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            upsert_row(&mut tx, row).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn write_row(&self, row: &TargetRow) -> Result<(), StoreError> {
        // Sheets touch two tables, so single rows still get a transaction.
        let mut tx = self.pool.begin().await?;
        upsert_row(&mut tx, row).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn truncate(&self, entity: EntityType) -> Result<(), StoreError> {
        let tables = std::iter::once(entity)
            .chain(entity.dependents())
            .flat_map(|affected| tables_for(affected).iter().copied())
            .collect::<Vec<_>>()
            .join(", ");
        sqlx::query(&format!("TRUNCATE TABLE {tables} CASCADE"))
            .execute(&self.pool)
            .await?;
        info!(%entity, %tables, "truncated target tables");
        Ok(())
    }

    async fn prune_answer_cells(&self, sheet_ids: &[Uuid], keep: &[Uuid]) -> Result<u64, StoreError> {
        if sheet_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM answer_cells
             WHERE sheet_id = ANY($1)
               AND NOT (id = ANY($2))
            "#,
        )
        .bind(sheet_ids)
        .bind(keep)
        .execute(&self.pool)
        .await?;
        debug!(removed = result.rows_affected(), "pruned answer cells");
        Ok(result.rows_affected())
    }

    async fn lock_entity(&self, entity: EntityType) -> Result<(), StoreError> {
        let mut locks = self.locks.lock().await;
        if locks.contains_key(&entity) {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(lock_key(entity))
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            return Err(StoreError::Unavailable(format!(
                "{entity} is locked by another migration run"
            )));
        }
        debug!(%entity, "acquired exclusive entity lock");
        locks.insert(entity, conn);
        Ok(())
    }

    async fn unlock_entity(&self, entity: EntityType) -> Result<(), StoreError> {
        let conn = self.locks.lock().await.remove(&entity);
        if let Some(mut conn) = conn {
            sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
                .bind(lock_key(entity))
                .execute(&mut *conn)
                .await?;
            debug!(%entity, "released exclusive entity lock");
        }
        Ok(())
    }

    async fn sheet_latest_revisions(&self) -> Result<HashMap<Uuid, String>, StoreError> {
        let rows = sqlx::query("SELECT id, latest_external_id FROM sheets")
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("id")?, row.try_get("latest_external_id")?);
        }
        Ok(out)
    }

    async fn value_kinds(&self) -> Result<HashMap<Uuid, QuestionKind>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind FROM questions
            UNION ALL
            SELECT id, kind FROM list_table_columns
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("kind")?;
            out.insert(row.try_get("id")?, kind.parse::<QuestionKind>().unwrap_or_default());
        }
        Ok(out)
    }
}

#[async_trait]
impl MappingStore for PgTargetStore {
    async fn load_all(&self, entity: EntityType) -> Result<HashMap<String, Uuid>, StoreError> {
        let rows = sqlx::query(
            "SELECT external_id, internal_id FROM id_mappings WHERE entity_type = $1",
        )
        .bind(entity.as_str())
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("external_id")?, row.try_get("internal_id")?);
        }
        Ok(out)
    }

    async fn get(&self, entity: EntityType, external_id: &str) -> Result<Option<Uuid>, StoreError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "SELECT internal_id FROM id_mappings WHERE entity_type = $1 AND external_id = $2",
        )
        .bind(entity.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_many(
        &self,
        entity: EntityType,
        external_ids: &[String],
    ) -> Result<HashMap<String, Uuid>, StoreError> {
        if external_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT external_id, internal_id
              FROM id_mappings
             WHERE entity_type = $1
               AND external_id = ANY($2)
            "#,
        )
        .bind(entity.as_str())
        .bind(external_ids)
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("external_id")?, row.try_get("internal_id")?);
        }
        Ok(out)
    }

    async fn upsert(&self, entries: &[MappingEntry]) -> Result<(), StoreError> {
        for chunk in entries.chunks(MAPPING_INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO id_mappings (entity_type, external_id, internal_id, created_at) ",
            );
            builder.push_values(chunk, |mut b, entry| {
                b.push_bind(entry.entity.as_str())
                    .push_bind(entry.external_id.clone())
                    .push_bind(entry.internal_id)
                    .push_bind(entry.created_at);
            });
            builder.push(
                " ON CONFLICT (entity_type, external_id) DO UPDATE SET internal_id = EXCLUDED.internal_id",
            );
            builder.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn clear(&self, entity: EntityType) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM id_mappings WHERE entity_type = $1")
            .bind(entity.as_str())
            .execute(&self.pool)
            .await?;
        info!(%entity, removed = result.rows_affected(), "cleared id mappings");
        Ok(())
    }
}
