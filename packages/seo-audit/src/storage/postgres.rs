//! Postgres audit store.
//!
//! Audits live in one row each with their result maps as JSONB. Updates take a
//! `SELECT ... FOR UPDATE` row lock inside a transaction, so concurrent stage
//! merges on one audit are serialized by the database.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{AuditMutation, AuditStore};
use crate::error::{AuditError, AuditResult};
use crate::models::{Audit, AuditId, AuditPage, PageData, StageKind, StageRecord};

#[derive(Clone)]
pub struct PostgresAuditStore {
    pool: PgPool,
}

#[derive(FromRow)]
struct AuditRow {
    id: Uuid,
    url: String,
    owner: String,
    status: String,
    audit_data: Json<Map<String, Value>>,
    suggestions_data: Json<Map<String, Value>>,
    stages: Json<BTreeMap<StageKind, StageRecord>>,
    operation_failed: bool,
    operation_incomplete: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for Audit {
    type Error = AuditError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(Audit {
            id: AuditId::from_uuid(row.id),
            url: row.url,
            owner: row.owner,
            status: row.status.parse()?,
            audit_data: row.audit_data.0,
            suggestions_data: row.suggestions_data.0,
            stages: row.stages.0,
            operation_failed: row.operation_failed,
            operation_incomplete: row.operation_incomplete,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PageRow {
    id: Uuid,
    audit_id: Uuid,
    url: String,
    status_code: Option<i32>,
    visited: bool,
    depth: i32,
    page_data: Json<PageData>,
    created_at: DateTime<Utc>,
}

impl From<PageRow> for AuditPage {
    fn from(row: PageRow) -> Self {
        AuditPage {
            id: row.id,
            audit_id: AuditId::from_uuid(row.audit_id),
            url: row.url,
            status_code: row.status_code.and_then(|s| u16::try_from(s).ok()),
            visited: row.visited,
            depth: usize::try_from(row.depth).unwrap_or(0),
            page_data: row.page_data.0,
            created_at: row.created_at,
        }
    }
}

const SELECT_AUDIT: &str = "SELECT id, url, owner, status, audit_data, suggestions_data, stages, \
     operation_failed, operation_incomplete, created_at, updated_at FROM audits WHERE id = $1";

impl PostgresAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> AuditResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> AuditResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AuditError::Storage(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    async fn create_audit(&self, audit: &Audit) -> AuditResult<()> {
        sqlx::query(
            "INSERT INTO audits (id, url, owner, status, audit_data, suggestions_data, stages, \
             operation_failed, operation_incomplete, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(audit.id.as_uuid())
        .bind(&audit.url)
        .bind(&audit.owner)
        .bind(audit.status.as_str())
        .bind(Json(&audit.audit_data))
        .bind(Json(&audit.suggestions_data))
        .bind(Json(&audit.stages))
        .bind(audit.operation_failed)
        .bind(audit.operation_incomplete)
        .bind(audit.created_at)
        .bind(audit.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_audit(&self, id: AuditId) -> AuditResult<Audit> {
        let row: Option<AuditRow> = sqlx::query_as(SELECT_AUDIT)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| AuditError::not_found("audit", id))?
            .try_into()
    }

    async fn update_audit(&self, id: AuditId, mutate: AuditMutation<'_>) -> AuditResult<Audit> {
        let mut tx = self.pool.begin().await?;

        let row: Option<AuditRow> = sqlx::query_as(&format!("{} FOR UPDATE", SELECT_AUDIT))
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        let mut audit: Audit = row.ok_or_else(|| AuditError::not_found("audit", id))?.try_into()?;

        // Dropping the transaction on error rolls it back
        mutate(&mut audit)?;

        sqlx::query(
            "UPDATE audits SET status = $2, audit_data = $3, suggestions_data = $4, stages = $5, \
             operation_failed = $6, operation_incomplete = $7, updated_at = $8 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(audit.status.as_str())
        .bind(Json(&audit.audit_data))
        .bind(Json(&audit.suggestions_data))
        .bind(Json(&audit.stages))
        .bind(audit.operation_failed)
        .bind(audit.operation_incomplete)
        .bind(audit.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(audit)
    }

    async fn delete_audit(&self, id: AuditId) -> AuditResult<()> {
        // audit_pages rows go with it (ON DELETE CASCADE)
        let result = sqlx::query("DELETE FROM audits WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AuditError::not_found("audit", id));
        }
        Ok(())
    }

    async fn insert_pages(&self, pages: &[AuditPage]) -> AuditResult<()> {
        let mut tx = self.pool.begin().await?;
        for page in pages {
            sqlx::query(
                "INSERT INTO audit_pages (id, audit_id, url, status_code, visited, depth, page_data, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(page.id)
            .bind(page.audit_id.as_uuid())
            .bind(&page.url)
            .bind(page.status_code.map(i32::from))
            .bind(page.visited)
            .bind(i32::try_from(page.depth).unwrap_or(i32::MAX))
            .bind(Json(&page.page_data))
            .bind(page.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn stage_pages(
        &self,
        audit_id: AuditId,
        generation: Uuid,
        pages: &[AuditPage],
    ) -> AuditResult<()> {
        let mut tx = self.pool.begin().await?;
        for page in pages {
            sqlx::query(
                "INSERT INTO audit_pages (id, audit_id, url, status_code, visited, depth, page_data, created_at, staging_id) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(page.id)
            .bind(audit_id.as_uuid())
            .bind(&page.url)
            .bind(page.status_code.map(i32::from))
            .bind(page.visited)
            .bind(i32::try_from(page.depth).unwrap_or(i32::MAX))
            .bind(Json(&page.page_data))
            .bind(page.created_at)
            .bind(generation)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn publish_pages(&self, audit_id: AuditId, generation: Uuid) -> AuditResult<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM audit_pages WHERE audit_id = $1 AND staging_id IS NULL")
            .bind(audit_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        let published = sqlx::query(
            "UPDATE audit_pages SET staging_id = NULL WHERE audit_id = $1 AND staging_id = $2",
        )
        .bind(audit_id.as_uuid())
        .bind(generation)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(published.rows_affected() as usize)
    }

    async fn discard_staged_pages(&self, audit_id: AuditId) -> AuditResult<usize> {
        let result =
            sqlx::query("DELETE FROM audit_pages WHERE audit_id = $1 AND staging_id IS NOT NULL")
                .bind(audit_id.as_uuid())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_pages(&self, audit_id: AuditId) -> AuditResult<Vec<AuditPage>> {
        let rows: Vec<PageRow> = sqlx::query_as(
            "SELECT id, audit_id, url, status_code, visited, depth, page_data, created_at \
             FROM audit_pages WHERE audit_id = $1 AND staging_id IS NULL ORDER BY depth, created_at, id",
        )
        .bind(audit_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AuditPage::from).collect())
    }
}
