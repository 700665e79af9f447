//! SQLite state store.

use super::{EnrichmentStateStore, StoreError};
use crate::state::{EnrichmentStage, EnrichmentState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

/// State store backed by an `enrichment_states` table.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if missing) the database at `url` and runs migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Applies pending migrations. Safe to call repeatedly.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Running enrichment state migrations");
        sqlx::migrate!("src/store/migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    ticket_id: String,
    ticket_number: String,
    parent_id: Option<String>,
    stage: String,
    extracted_entities: String,
    matched_cis: String,
    confidence_scores: String,
    attempts: i64,
    last_note_at: Option<String>,
    metadata: String,
    created_at: String,
    updated_at: String,
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

impl TryFrom<StateRow> for EnrichmentState {
    type Error = StoreError;

    fn try_from(row: StateRow) -> Result<Self, Self::Error> {
        Ok(EnrichmentState {
            ticket_id: row.ticket_id,
            ticket_number: row.ticket_number,
            parent_id: row.parent_id,
            stage: EnrichmentStage::from_str(&row.stage).map_err(StoreError::Serialization)?,
            extracted_entities: serde_json::from_str(&row.extracted_entities)?,
            matched_cis: serde_json::from_str(&row.matched_cis)?,
            confidence_scores: serde_json::from_str(&row.confidence_scores)?,
            attempts: u32::try_from(row.attempts)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            last_note_at: row.last_note_at.as_deref().map(parse_timestamp).transpose()?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            metadata: serde_json::from_str(&row.metadata)?,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT ticket_id, ticket_number, parent_id, stage, extracted_entities, matched_cis,
           confidence_scores, attempts, last_note_at, metadata, created_at, updated_at
    FROM enrichment_states
"#;

#[async_trait]
impl EnrichmentStateStore for SqliteStateStore {
    async fn get(&self, ticket_id: &str) -> Result<Option<EnrichmentState>, StoreError> {
        let row: Option<StateRow> =
            sqlx::query_as(&format!("{} WHERE ticket_id = ?", SELECT_COLUMNS))
                .bind(ticket_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(EnrichmentState::try_from).transpose()
    }

    async fn upsert(&self, state: &EnrichmentState) -> Result<(), StoreError> {
        let extracted_entities = serde_json::to_string(&state.extracted_entities)?;
        let matched_cis = serde_json::to_string(&state.matched_cis)?;
        let confidence_scores = serde_json::to_string(&state.confidence_scores)?;
        let metadata = serde_json::to_string(&state.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO enrichment_states (
                ticket_id, ticket_number, parent_id, stage, extracted_entities, matched_cis,
                confidence_scores, attempts, last_note_at, metadata, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(ticket_id) DO UPDATE SET
                ticket_number = excluded.ticket_number,
                parent_id = excluded.parent_id,
                stage = excluded.stage,
                extracted_entities = excluded.extracted_entities,
                matched_cis = excluded.matched_cis,
                confidence_scores = excluded.confidence_scores,
                attempts = excluded.attempts,
                last_note_at = excluded.last_note_at,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.ticket_id)
        .bind(&state.ticket_number)
        .bind(&state.parent_id)
        .bind(state.stage.as_str())
        .bind(&extracted_entities)
        .bind(&matched_cis)
        .bind(&confidence_scores)
        .bind(i64::from(state.attempts))
        .bind(state.last_note_at.map(|t| t.to_rfc3339()))
        .bind(&metadata)
        .bind(state.created_at.to_rfc3339())
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, ticket_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM enrichment_states WHERE ticket_id = ?")
            .bind(ticket_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_by_stages(
        &self,
        stages: &[EnrichmentStage],
    ) -> Result<Vec<EnrichmentState>, StoreError> {
        if stages.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; stages.len()].join(", ");
        let sql = format!(
            "{} WHERE stage IN ({}) ORDER BY updated_at ASC, ticket_id ASC",
            SELECT_COLUMNS, placeholders
        );

        let mut query = sqlx::query_as::<_, StateRow>(&sql);
        for stage in stages {
            query = query.bind(stage.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter().map(EnrichmentState::try_from).collect()
    }
}
