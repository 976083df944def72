use super::traits::{
    PersistenceResult, SignalConnection, SignalQuery, SignalRow, SignalStore, StoredSignal,
};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgPool, Postgres, QueryBuilder, Row};

/// PostgreSQL implementation of SignalStore
pub struct PostgresSignalStore {
    pool: PgPool,
}

impl PostgresSignalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize database schema
    pub async fn initialize(&self) -> PersistenceResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS brain_signals (
                id BIGSERIAL PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                device_id TEXT NOT NULL,
                value_uv REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_brain_signals_device_time
                ON brain_signals(device_id, timestamp)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl SignalStore for PostgresSignalStore {
    async fn connect(&self) -> PersistenceResult<Box<dyn SignalConnection>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PostgresSignalConnection { conn }))
    }
}

#[async_trait]
impl SignalQuery for PostgresSignalStore {
    async fn recent_signals(&self, limit: i64) -> PersistenceResult<Vec<StoredSignal>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, device_id, value_uv
            FROM brain_signals
            ORDER BY id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoredSignal {
                id: row.get("id"),
                timestamp: row.get("timestamp"),
                device_id: row.get("device_id"),
                value_uv: row.get("value_uv"),
            })
            .collect())
    }
}

struct PostgresSignalConnection {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl SignalConnection for PostgresSignalConnection {
    async fn append_batch(&mut self, rows: &[SignalRow]) -> PersistenceResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = Connection::begin(&mut *self.conn).await?;

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO brain_signals (timestamp, device_id, value_uv) ");
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.timestamp)
                .push_bind(&row.device_tag)
                .push_bind(row.value);
        });
        builder.build().execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }
}
