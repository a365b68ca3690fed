//! SQLite-backed collaborators: tenant directory, metrics store, activity log
//! and API key lookup.

use std::str::FromStr;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use nanoid::nanoid;
use serde_json::Value;
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use thiserror::Error;

use crate::activity::{ActivityLogRecord, ActivityLogStore};
use crate::aggregator::{
    DirectoryError, MetricsStore, PersistError, TenantAnalyticsRecord, TenantConfig,
    TenantDirectory,
};
use crate::auth::{AccessLevel, ApiKeyVerifier, AuthRejection, api_key_from_headers, digest_api_key};
use crate::insights::DateRange;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for DirectoryError {
    fn from(err: sqlx::Error) -> Self {
        DirectoryError::Query(err.to_string())
    }
}

impl From<sqlx::Error> for PersistError {
    fn from(err: sqlx::Error) -> Self {
        PersistError::Upsert(err.to_string())
    }
}

/// Stored analytics row for one tenant.
#[derive(Debug, Clone)]
pub struct StoredAnalytics {
    pub analytics: Value,
    pub params: Value,
    pub updated_at: i64,
}

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(database_path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// Private in-memory database. Pinned to one connection so every query
    /// sees the same data.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenant_configs (
                tenant_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                project_key TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenant_analytics (
                tenant_id TEXT PRIMARY KEY,
                analytics TEXT NOT NULL,
                params TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activity_logs (
                id TEXT PRIMARY KEY,
                environment TEXT NOT NULL,
                method TEXT NOT NULL,
                route TEXT NOT NULL,
                ip_address TEXT,
                user_agent TEXT,
                query_params TEXT,
                route_params TEXT,
                status_code INTEGER NOT NULL,
                response TEXT NOT NULL,
                response_time TEXT NOT NULL,
                response_size TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                key_digest TEXT NOT NULL UNIQUE,
                access_level TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Adds or replaces a tenant's analytics project.
    pub async fn save_tenant(&self, tenant: &TenantConfig) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_configs (tenant_id, project_id, project_key)
            VALUES (?, ?, ?)
            ON CONFLICT(tenant_id) DO UPDATE SET
                project_id = excluded.project_id,
                project_key = excluded.project_key
            "#,
        )
        .bind(&tenant.tenant_id)
        .bind(&tenant.project_id)
        .bind(&tenant.project_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_analytics(
        &self,
        tenant_id: &str,
    ) -> Result<Option<StoredAnalytics>, StoreError> {
        let row = sqlx::query(
            "SELECT analytics, params, updated_at FROM tenant_analytics WHERE tenant_id = ?",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let analytics: String = row.try_get("analytics")?;
        let params: String = row.try_get("params")?;
        Ok(Some(StoredAnalytics {
            analytics: serde_json::from_str(&analytics)?,
            params: serde_json::from_str(&params)?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    /// Registers an API key and returns its generated id.
    pub async fn insert_api_key(
        &self,
        secret: &str,
        access_level: AccessLevel,
    ) -> Result<String, StoreError> {
        let id = nanoid!(8);
        sqlx::query(
            r#"
            INSERT INTO api_keys (id, key_digest, access_level, active, created_at)
            VALUES (?, ?, ?, 1, ?)
            "#,
        )
        .bind(&id)
        .bind(digest_api_key(secret))
        .bind(access_level.as_str())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Returns `false` when no key has this id.
    pub async fn set_api_key_active(&self, id: &str, active: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE api_keys SET active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn recent_activity(&self, limit: i64) -> Result<Vec<ActivityLogSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, method, route, status_code, response, created_at
            FROM activity_logs
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ActivityLogSummary {
                    id: row.try_get("id")?,
                    method: row.try_get("method")?,
                    route: row.try_get("route")?,
                    status_code: row.try_get("status_code")?,
                    response: row.try_get("response")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Verifier accepting active keys of `access_level`.
    pub fn api_key_verifier(&self, access_level: AccessLevel) -> StoreKeyVerifier {
        StoreKeyVerifier {
            store: self.clone(),
            access_level,
        }
    }

    async fn key_is_valid(
        &self,
        secret: &str,
        access_level: AccessLevel,
    ) -> Result<bool, StoreError> {
        let found = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT 1 FROM api_keys
            WHERE key_digest = ? AND access_level = ? AND active = 1
            LIMIT 1
            "#,
        )
        .bind(digest_api_key(secret))
        .bind(access_level.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }
}

/// Short view of a stored activity record.
#[derive(Debug, Clone)]
pub struct ActivityLogSummary {
    pub id: String,
    pub method: String,
    pub route: String,
    pub status_code: i64,
    pub response: String,
    pub created_at: i64,
}

#[async_trait]
impl TenantDirectory for SqliteStore {
    async fn list(&self) -> Result<Vec<TenantConfig>, DirectoryError> {
        let rows = sqlx::query_as::<_, (String, String, String)>(
            r#"
            SELECT tenant_id, project_id, project_key
            FROM tenant_configs
            ORDER BY tenant_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(tenant_id, project_id, project_key)| TenantConfig {
                tenant_id,
                project_id,
                project_key,
            })
            .collect())
    }
}

#[async_trait]
impl MetricsStore for SqliteStore {
    async fn upsert(
        &self,
        tenant_id: &str,
        metrics: &TenantAnalyticsRecord,
        params: &DateRange,
    ) -> Result<(), PersistError> {
        let analytics = serde_json::to_string(metrics)?;
        let params = serde_json::to_string(params)?;

        sqlx::query(
            r#"
            INSERT INTO tenant_analytics (tenant_id, analytics, params, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(tenant_id) DO UPDATE SET
                analytics = excluded.analytics,
                params = excluded.params,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(analytics)
        .bind(params)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ActivityLogStore for SqliteStore {
    async fn create(&self, record: &ActivityLogRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO activity_logs (
                id,
                environment,
                method,
                route,
                ip_address,
                user_agent,
                query_params,
                route_params,
                status_code,
                response,
                response_time,
                response_size,
                created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.environment.as_str())
        .bind(&record.method)
        .bind(&record.route)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(&record.query_params)
        .bind(&record.route_params)
        .bind(i64::from(record.status_code))
        .bind(record.response.as_str())
        .bind(&record.response_time)
        .bind(&record.response_size)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// [`ApiKeyVerifier`] backed by the `api_keys` table.
#[derive(Clone, Debug)]
pub struct StoreKeyVerifier {
    store: SqliteStore,
    access_level: AccessLevel,
}

#[async_trait]
impl ApiKeyVerifier for StoreKeyVerifier {
    async fn verify(&self, headers: &HeaderMap) -> Result<(), AuthRejection> {
        let secret = api_key_from_headers(headers)?;
        match self.store.key_is_valid(secret, self.access_level).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AuthRejection::Invalid),
            Err(err) => Err(AuthRejection::Lookup(err.to_string())),
        }
    }
}
