//! Datasource records, credential handling, and backend acquisition.
//!
//! Create and update are the only places a cleartext password enters the
//! system; it is encrypted immediately and never read back out except to
//! open a connection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use sqlx::{postgres::PgRow, Row};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::{
    domain::models::{
        DataSource, DataSourceKind, DataSourceSummary, HealthStatus, PermissionAction, Role,
    },
    infrastructure::{auth::AuthenticatedUser, backends::SqlBackend, state::AppState},
};

use super::{authz, errors::ServiceError};

/// Probe latency above this is reported as degraded rather than healthy.
const DEGRADED_LATENCY: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize, Validate)]
pub struct CreateDataSourceRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    pub kind: DataSourceKind,
    #[validate(length(min = 1, max = 255))]
    pub host: String,
    pub port: u16,
    #[validate(length(min = 1, max = 128))]
    pub database_name: String,
    #[validate(length(min = 1, max = 128))]
    pub username: String,
    #[validate(length(min = 1))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateDataSourceRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub host: Option<String>,
    pub port: Option<u16>,
    #[validate(length(min = 1, max = 128))]
    pub database_name: Option<String>,
    #[validate(length(min = 1, max = 128))]
    pub username: Option<String>,
    #[validate(length(min = 1))]
    pub password: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

pub struct DataSourceService {
    pub state: Arc<AppState>,
}

impl DataSourceService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn create(
        &self,
        actor: &AuthenticatedUser,
        payload: CreateDataSourceRequest,
    ) -> Result<DataSourceSummary, ServiceError> {
        ensure_admin(actor)?;
        payload
            .validate()
            .map_err(|err| ServiceError::InvalidArgument(err.to_string()))?;

        let ciphertext = self.state.vault.encrypt(&payload.password)?;
        let now = Utc::now();
        let record = sqlx::query(
            "INSERT INTO data_sources (id, name, kind, host, port, database_name, username, ciphertext_password, active, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&payload.name)
        .bind(payload.kind.as_str())
        .bind(&payload.host)
        .bind(i32::from(payload.port))
        .bind(&payload.database_name)
        .bind(&payload.username)
        .bind(&ciphertext)
        .bind(true)
        .bind(now)
        .bind(now)
        .map(map_data_source)
        .fetch_one(&self.state.pool)
        .await??;

        info!(data_source_id = %record.id, name = %record.name, "data source registered");
        Ok(record.summary())
    }

    pub async fn update(
        &self,
        actor: &AuthenticatedUser,
        data_source_id: Uuid,
        payload: UpdateDataSourceRequest,
    ) -> Result<DataSourceSummary, ServiceError> {
        ensure_admin(actor)?;
        payload
            .validate()
            .map_err(|err| ServiceError::InvalidArgument(err.to_string()))?;

        let existing = load_data_source(&self.state, data_source_id)
            .await?
            .ok_or(ServiceError::NotFound)?;

        let ciphertext = match &payload.password {
            Some(password) => self.state.vault.encrypt(password)?,
            None => existing.ciphertext_password.clone(),
        };

        let record = sqlx::query(
            "UPDATE data_sources
             SET name=$1, host=$2, port=$3, database_name=$4, username=$5,
                 ciphertext_password=$6, active=$7, updated_at=$8
             WHERE id=$9
             RETURNING *",
        )
        .bind(payload.name.as_deref().unwrap_or(&existing.name))
        .bind(payload.host.as_deref().unwrap_or(&existing.host))
        .bind(i32::from(payload.port.unwrap_or(existing.port)))
        .bind(
            payload
                .database_name
                .as_deref()
                .unwrap_or(&existing.database_name),
        )
        .bind(payload.username.as_deref().unwrap_or(&existing.username))
        .bind(&ciphertext)
        .bind(payload.active.unwrap_or(existing.active))
        .bind(Utc::now())
        .bind(data_source_id)
        .map(map_data_source)
        .fetch_one(&self.state.pool)
        .await??;

        // connection details or credentials may have changed
        self.state.backends.invalidate(data_source_id);

        Ok(record.summary())
    }

    pub async fn deactivate(
        &self,
        actor: &AuthenticatedUser,
        data_source_id: Uuid,
    ) -> Result<(), ServiceError> {
        ensure_admin(actor)?;

        let updated = sqlx::query(
            "UPDATE data_sources SET active=FALSE, updated_at=$1 WHERE id=$2 AND active",
        )
        .bind(Utc::now())
        .bind(data_source_id)
        .execute(&self.state.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ServiceError::NotFound);
        }
        self.state.backends.invalidate(data_source_id);
        Ok(())
    }

    pub async fn list(
        &self,
        actor: &AuthenticatedUser,
    ) -> Result<Vec<DataSourceSummary>, ServiceError> {
        ensure_admin(actor)?;

        let rows = sqlx::query("SELECT * FROM data_sources ORDER BY name ASC")
            .map(map_data_source)
            .fetch_all(&self.state.pool)
            .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            summaries.push(row?.summary());
        }
        Ok(summaries)
    }

    /// On-demand health probe. Latency beyond the threshold degrades the
    /// report; any probe failure is unhealthy.
    pub async fn health(
        &self,
        actor: &AuthenticatedUser,
        data_source_id: Uuid,
    ) -> Result<HealthReport, ServiceError> {
        authz::authorize(&self.state, actor, data_source_id, PermissionAction::Read).await?;

        let ds = load_data_source(&self.state, data_source_id)
            .await?
            .ok_or(ServiceError::NotFound)?;
        let backend = connect_backend(&self.state, &ds)?;

        let probe = tokio::time::timeout(
            self.state.config.statement_timeout_read(),
            backend.probe(),
        )
        .await;

        let report = match probe {
            Ok(Ok(latency)) => HealthReport {
                status: if latency > DEGRADED_LATENCY {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                },
                latency_ms: Some(latency.as_millis() as u64),
            },
            Ok(Err(_)) | Err(_) => HealthReport {
                status: HealthStatus::Unhealthy,
                latency_ms: None,
            },
        };
        Ok(report)
    }
}

fn ensure_admin(actor: &AuthenticatedUser) -> Result<(), ServiceError> {
    if actor.role == Role::Admin {
        Ok(())
    } else {
        Err(ServiceError::PermissionDenied)
    }
}

/// Loads a datasource row. Inactive datasources are invisible to execution
/// paths; admin CRUD reads them through its own queries.
pub async fn load_data_source(
    state: &AppState,
    data_source_id: Uuid,
) -> Result<Option<DataSource>, ServiceError> {
    let row = sqlx::query("SELECT * FROM data_sources WHERE id = $1")
        .bind(data_source_id)
        .map(map_data_source)
        .fetch_optional(&state.pool)
        .await?;
    row.transpose().map_err(Into::into)
}

/// Decrypts the stored credential and returns the pooled backend for a
/// datasource, building the pool on first use.
pub fn connect_backend(
    state: &AppState,
    ds: &DataSource,
) -> Result<Arc<dyn SqlBackend>, ServiceError> {
    let password = state.vault.decrypt(&ds.ciphertext_password)?;
    state.backends.acquire(ds, &password).map_err(Into::into)
}

fn map_data_source(row: PgRow) -> Result<DataSource, ServiceError> {
    let kind: String = row.get("kind");
    let port: i32 = row.get("port");
    Ok(DataSource {
        id: row.get("id"),
        name: row.get("name"),
        kind: kind
            .parse::<DataSourceKind>()
            .map_err(ServiceError::Internal)?,
        host: row.get("host"),
        port: port as u16,
        database_name: row.get("database_name"),
        username: row.get("username"),
        ciphertext_password: row.get("ciphertext_password"),
        active: row.get("active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
