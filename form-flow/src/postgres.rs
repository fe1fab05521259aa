//! PostgreSQL-backed session and record stores.
//!
//! Sessions are stored whole as JSONB next to a `version` column; `put` is a
//! compare-and-swap on that column so writes from another process holding a
//! stale copy are refused. Records are written one row at a time without a
//! surrounding transaction, which is what makes partial commits observable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::sync::OwnedMutexGuard;
use tracing::info;
use uuid::Uuid;

use crate::{
    error::{FormError, Result},
    event::OwnerId,
    fields::Fields,
    records::{DraftRecord, Record, RecordStore},
    session::{OwnerLocks, Session, SessionStore},
};

const MIGRATIONS: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS form_sessions (
        owner_id BIGINT PRIMARY KEY,
        schema_id TEXT NOT NULL,
        state JSONB NOT NULL,
        version BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS form_records (
        id UUID PRIMARY KEY,
        kind TEXT NOT NULL,
        owner_id BIGINT NOT NULL,
        fields JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS form_records_kind_created_idx ON form_records (kind, created_at)",
];

/// Opens a pool and creates the tables if they are missing
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    migrate(&pool).await?;
    info!("Connected to PostgreSQL form storage");
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub struct PostgresSessionStore {
    pool: PgPool,
    locks: OwnerLocks,
}

impl PostgresSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            locks: OwnerLocks::new(),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(connect(database_url).await?))
    }
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn get(&self, owner: OwnerId) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT state FROM form_sessions WHERE owner_id = $1")
            .bind(owner.0)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let Json(session): Json<Session> = row.try_get("state")?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, session: &mut Session) -> Result<()> {
        let mut stored = session.clone();
        stored.version = session.version + 1;
        stored.updated_at = Utc::now();

        let result = if session.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO form_sessions (owner_id, schema_id, state, version, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (owner_id) DO NOTHING
                "#,
            )
            .bind(stored.owner_id.0)
            .bind(&stored.schema_id)
            .bind(Json(&stored))
            .bind(stored.version as i64)
            .bind(stored.updated_at)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE form_sessions SET
                    schema_id = $2,
                    state = $3,
                    version = $4,
                    updated_at = $5
                WHERE owner_id = $1 AND version = $6
                "#,
            )
            .bind(stored.owner_id.0)
            .bind(&stored.schema_id)
            .bind(Json(&stored))
            .bind(stored.version as i64)
            .bind(stored.updated_at)
            .bind(session.version as i64)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(FormError::StaleSession(session.owner_id));
        }
        *session = stored;
        Ok(())
    }

    async fn delete(&self, owner: OwnerId) -> Result<()> {
        sqlx::query("DELETE FROM form_sessions WHERE owner_id = $1")
            .bind(owner.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_idle(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query("DELETE FROM form_sessions WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        self.locks.prune();
        Ok(result.rows_affected() as usize)
    }

    async fn lock(&self, owner: OwnerId) -> OwnedMutexGuard<()> {
        self.locks.acquire(owner).await
    }

    fn release(&self, owner: OwnerId) {
        self.locks.release(owner);
    }
}

#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(connect(database_url).await?))
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn commit_batch(&self, kind: &str, records: &[DraftRecord]) -> Result<usize> {
        for (written, draft) in records.iter().enumerate() {
            let inserted = sqlx::query(
                r#"
                INSERT INTO form_records (id, kind, owner_id, fields, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(kind)
            .bind(draft.owner_id.0)
            .bind(Json(&draft.fields))
            .bind(Utc::now())
            .execute(&self.pool)
            .await;

            if let Err(e) = inserted {
                if written == 0 {
                    return Err(e.into());
                }
                return Err(FormError::PartialCommit {
                    written,
                    total: records.len(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(records.len())
    }

    async fn list(&self, kind: &str) -> Result<Vec<Record>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, owner_id, fields, created_at
            FROM form_records
            WHERE kind = $1
            ORDER BY created_at
            "#,
        )
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<Record> {
                let Json(fields): Json<Fields> = row.try_get("fields")?;
                Ok(Record {
                    id: row.try_get("id")?,
                    kind: row.try_get("kind")?,
                    owner_id: OwnerId(row.try_get("owner_id")?),
                    fields,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
