//! PostgreSQL-backed swap persistence
//!
//! Every dispatch persists a full session snapshot, so a restarted node
//! can resume its swaps without re-negotiation: id, parameters, current
//! state, both contract refs, and the secret/hash all round-trip through
//! the `record` column.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{SwapError, SwapResult};
use crate::protocol::SwapId;
use crate::swap::SwapRecord;

/// Storage collaborator for swap snapshots
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwapStore: Send + Sync {
    /// Upsert the latest snapshot of a swap
    async fn persist(&self, record: &SwapRecord) -> SwapResult<()>;

    /// Load every swap that has not reached a terminal state
    async fn load_active(&self) -> SwapResult<Vec<SwapRecord>>;

    /// Append to the per-swap audit log
    async fn append_event(
        &self,
        swap_id: SwapId,
        kind: &str,
        detail: serde_json::Value,
    ) -> SwapResult<()>;

    async fn health_check(&self) -> SwapResult<()>;
}

/// PostgreSQL state manager
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    pub async fn new(config: &DatabaseConfig) -> SwapResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(SwapError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> SwapResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swaps (
                swap_id UUID PRIMARY KEY,
                role VARCHAR(12) NOT NULL,
                state VARCHAR(24) NOT NULL,
                terminal BOOLEAN NOT NULL DEFAULT FALSE,
                secret_hash VARCHAR(64) NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swaps_active
            ON swaps (terminal) WHERE NOT terminal
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swap_events (
                id BIGSERIAL PRIMARY KEY,
                swap_id UUID NOT NULL,
                event_type VARCHAR(50) NOT NULL,
                detail JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swap_events_swap
            ON swap_events (swap_id, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl SwapStore for StateManager {
    async fn persist(&self, record: &SwapRecord) -> SwapResult<()> {
        let json =
            serde_json::to_value(record).map_err(|e| SwapError::Internal(e.to_string()))?;
        let role = match record.role {
            crate::protocol::Role::Initiator => "initiator",
            crate::protocol::Role::Participant => "participant",
        };

        sqlx::query(
            r#"
            INSERT INTO swaps (swap_id, role, state, terminal, secret_hash, record)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (swap_id)
            DO UPDATE SET state = $3, terminal = $4, record = $6, updated_at = NOW()
            "#,
        )
        .bind(record.swap_id.0)
        .bind(role)
        .bind(record.state.name())
        .bind(record.state.is_terminal())
        .bind(record.secret.hash.to_hex())
        .bind(json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_active(&self) -> SwapResult<Vec<SwapRecord>> {
        let rows = sqlx::query("SELECT record FROM swaps WHERE NOT terminal")
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let json: serde_json::Value = row.get("record");
            let record: SwapRecord =
                serde_json::from_value(json).map_err(|e| SwapError::Internal(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    async fn append_event(
        &self,
        swap_id: SwapId,
        kind: &str,
        detail: serde_json::Value,
    ) -> SwapResult<()> {
        sqlx::query(
            r#"
            INSERT INTO swap_events (swap_id, event_type, detail)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(swap_id.0)
        .bind(kind)
        .bind(detail)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn health_check(&self) -> SwapResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(SwapError::Database)?;
        Ok(())
    }
}
