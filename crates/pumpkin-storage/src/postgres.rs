use async_trait::async_trait;
use pumpkin_core::{Collection, CounterKind, Document};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::{check_group_size, DocumentStore, Mutation, StoreError, WriteMode};

/// Postgres-backed document store. Each document is one JSONB row in `documents`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("document store migrations applied");
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn load_collection(&self, collection: Collection) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, fields
              FROM documents
             WHERE collection = $1
             ORDER BY id
            "#,
        )
        .bind(collection.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let Json(fields): Json<Value> = row.try_get("fields")?;
            match fields {
                Value::Object(map) => out.push(Document::new(id, map)),
                _ => return Err(StoreError::CorruptDocument { collection, id }),
            }
        }
        Ok(out)
    }

    async fn commit_group(&self, group: &[Mutation]) -> Result<(), StoreError> {
        check_group_size(group)?;
        let mut tx = self.pool.begin().await?;
        for mutation in group {
            let fields = Json(Value::Object(mutation.fields.clone()));
            match mutation.mode {
                WriteMode::Merge => {
                    sqlx::query(
                        r#"
                        INSERT INTO documents (collection, id, fields)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (collection, id) DO UPDATE
                           SET fields = (documents.fields - $4::text[]) || EXCLUDED.fields,
                               updated_at = now()
                        "#,
                    )
                    .bind(mutation.collection.as_str())
                    .bind(mutation.id.as_str())
                    .bind(fields)
                    .bind(&mutation.clear)
                    .execute(&mut *tx)
                    .await?;
                }
                WriteMode::Replace => {
                    sqlx::query(
                        r#"
                        INSERT INTO documents (collection, id, fields)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (collection, id) DO UPDATE
                           SET fields = EXCLUDED.fields,
                               updated_at = now()
                        "#,
                    )
                    .bind(mutation.collection.as_str())
                    .bind(mutation.id.as_str())
                    .bind(fields)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn increment_counter(&self, kind: CounterKind, delta: i64) -> Result<u64, StoreError> {
        // Single-statement upsert: the row lock taken by ON CONFLICT serializes concurrent events.
        let value = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO documents (collection, id, fields)
            VALUES ($1, $2, jsonb_build_object($3::text, GREATEST($4::bigint, 0)))
            ON CONFLICT (collection, id) DO UPDATE
               SET fields = documents.fields || jsonb_build_object(
                       $3::text,
                       GREATEST(COALESCE((documents.fields ->> $3)::bigint, 0) + $4::bigint, 0)
                   ),
                   updated_at = now()
            RETURNING (fields ->> $3)::bigint
            "#,
        )
        .bind(Collection::Stats.as_str())
        .bind(kind.document_id())
        .bind(kind.field())
        .bind(delta)
        .fetch_one(&self.pool)
        .await?;
        Ok(value.max(0) as u64)
    }

    async fn read_counter(&self, kind: CounterKind) -> Result<u64, StoreError> {
        let value = sqlx::query_scalar::<_, Option<i64>>(
            r#"
            SELECT (fields ->> $3)::bigint
              FROM documents
             WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(Collection::Stats.as_str())
        .bind(kind.document_id())
        .bind(kind.field())
        .fetch_optional(&self.pool)
        .await?
        .flatten();
        Ok(value.unwrap_or(0).max(0) as u64)
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
