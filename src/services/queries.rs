//! Query submission pipeline: classify, authorize, persist, execute,
//! capture.
//!
//! Reads run synchronously against the datasource and land in history with
//! their captured result. Writes never execute here; they are persisted as
//! `pending` and handed to the approval workflow. The history row is always
//! created before the backend sees the statement, so a failure can never
//! erase the fact that a submission happened.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{postgres::PgRow, Row};
use uuid::Uuid;
use validator::Validate;

use crate::{
    domain::{
        classify::{self, Classification},
        models::{
            DataSource, OperationKind, PermissionAction, Query, QueryResultRecord, QueryStatus,
            Role,
        },
    },
    infrastructure::{auth::AuthenticatedUser, backends::TableData, state::AppState},
};

use super::{approvals::ApprovalService, authz, datasources, errors::ServiceError};

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitQueryRequest {
    pub data_source_id: Uuid,
    #[validate(length(min = 1))]
    pub text: String,
    pub row_limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ExplainRequest {
    pub data_source_id: Uuid,
    pub text: String,
    #[serde(default)]
    pub analyze: bool,
}

#[derive(Debug, Deserialize)]
pub struct DryRunRequest {
    pub data_source_id: Uuid,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub data_source_id: Uuid,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    pub query_id: Uuid,
    pub status: QueryStatus,
    pub columns: Vec<ColumnMeta>,
    pub data: Vec<serde_json::Map<String, Value>>,
    pub row_count: i64,
    pub duration_ms: i64,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub query_id: Uuid,
    pub approval_id: Uuid,
    pub requires_approval: bool,
    pub status: QueryStatus,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SubmitResponse {
    Read(ReadResponse),
    Write(WriteResponse),
}

#[derive(Debug, Serialize)]
pub struct ExplainResponse {
    pub plan: Vec<serde_json::Map<String, Value>>,
    pub raw_output: String,
}

#[derive(Debug, Serialize)]
pub struct DryRunResponse {
    pub affected_rows: i64,
    pub rewritten_query: String,
    pub rows: Vec<serde_json::Map<String, Value>>,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub ok: bool,
    pub operation: OperationKind,
    pub referenced_tables: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryFilter {
    pub status: Option<QueryStatus>,
    pub data_source_id: Option<Uuid>,
    pub operation: Option<OperationKind>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    25
}

#[derive(Debug, Serialize)]
pub struct HistoryPage {
    pub items: Vec<Query>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Serialize)]
pub struct QueryDetail {
    pub query: Query,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<QueryResultRecord>,
}

pub struct QueryService {
    pub state: Arc<AppState>,
}

impl QueryService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Entry point for `POST /queries`.
    ///
    /// Reads return synchronously with columns, rows, and the history id.
    /// Writes are persisted `pending` and answered with an approval id,
    /// without touching the backend.
    pub async fn submit(
        &self,
        actor: &AuthenticatedUser,
        payload: SubmitQueryRequest,
    ) -> Result<SubmitResponse, ServiceError> {
        payload
            .validate()
            .map_err(|err| ServiceError::InvalidArgument(err.to_string()))?;
        let row_limit = self.resolve_row_limit(payload.row_limit)?;

        if !self.state.rate_limiter.try_acquire(actor.user_id) {
            return Err(ServiceError::RateLimited);
        }

        let classification = classify::classify(&payload.text)?;
        let ds = self
            .resolve_data_source(actor, payload.data_source_id)
            .await?;

        let action = if classification.requires_approval {
            PermissionAction::Write
        } else {
            PermissionAction::Read
        };

        if let Err(denied) =
            authz::authorize(&self.state, actor, payload.data_source_id, action).await
        {
            // denials still leave a history row
            self.record_rejected_submission(actor, &ds, &payload.text, &classification)
                .await?;
            return Err(denied);
        }

        if !ds.active {
            return Err(ServiceError::DataSourceUnavailable(
                "data source is inactive".to_string(),
            ));
        }

        if classification.requires_approval {
            self.submit_write(actor, &ds, &payload.text, &classification)
                .await
                .map(SubmitResponse::Write)
        } else {
            self.execute_read(actor, &ds, &payload.text, &classification, row_limit)
                .await
                .map(SubmitResponse::Read)
        }
    }

    /// `EXPLAIN` / `EXPLAIN ANALYZE` without touching history. ANALYZE over
    /// anything but a read is refused because it executes the plan.
    pub async fn explain(
        &self,
        actor: &AuthenticatedUser,
        payload: ExplainRequest,
    ) -> Result<ExplainResponse, ServiceError> {
        if leading_verb_is(&payload.text, "EXPLAIN") {
            return Err(ServiceError::InvalidArgument(
                "statement is already an EXPLAIN".to_string(),
            ));
        }

        let classification = classify::classify(&payload.text)?;
        if payload.analyze && classification.operation != OperationKind::Select {
            return Err(ServiceError::InvalidArgument(
                "EXPLAIN ANALYZE is only allowed for read statements".to_string(),
            ));
        }

        authz::authorize(
            &self.state,
            actor,
            payload.data_source_id,
            PermissionAction::Read,
        )
        .await?;
        let ds = self
            .resolve_data_source(actor, payload.data_source_id)
            .await?;
        self.ensure_active(&ds)?;

        let prefix = if payload.analyze {
            "EXPLAIN ANALYZE"
        } else {
            "EXPLAIN"
        };
        let effective = format!("{prefix} {}", payload.text.trim().trim_end_matches(';'));
        let data = self.run_read_statement(&ds, &effective).await?;

        let raw_output = render_plan_text(&data);
        Ok(ExplainResponse {
            plan: data.rows,
            raw_output,
        })
    }

    /// Safe preview of a DELETE: the predicate is re-targeted at `SELECT *`
    /// and executed read-only. Nothing is deleted and no transaction opens.
    pub async fn dry_run(
        &self,
        actor: &AuthenticatedUser,
        payload: DryRunRequest,
    ) -> Result<DryRunResponse, ServiceError> {
        let classification = classify::classify(&payload.text)?;
        if classification.operation != OperationKind::Delete {
            return Err(ServiceError::DryRunUnsupported(
                "only DELETE statements can be dry-run".to_string(),
            ));
        }

        let rewritten =
            classify::rewrite_delete_for_preview(&payload.text).map_err(ServiceError::DryRunUnsupported)?;

        // previewing a write requires write intent on the datasource
        authz::authorize(
            &self.state,
            actor,
            payload.data_source_id,
            PermissionAction::Write,
        )
        .await?;
        let ds = self
            .resolve_data_source(actor, payload.data_source_id)
            .await?;
        self.ensure_active(&ds)?;

        let data = self.run_read_statement(&ds, &rewritten).await?;

        Ok(DryRunResponse {
            affected_rows: data.row_count(),
            rewritten_query: rewritten,
            rows: data.rows,
        })
    }

    pub async fn validate(
        &self,
        actor: &AuthenticatedUser,
        payload: ValidateRequest,
    ) -> Result<ValidateResponse, ServiceError> {
        authz::authorize(
            &self.state,
            actor,
            payload.data_source_id,
            PermissionAction::Read,
        )
        .await?;

        let Classification {
            operation,
            referenced_tables,
            ..
        } = classify::classify(&payload.text)?;

        Ok(ValidateResponse {
            ok: true,
            operation,
            referenced_tables,
        })
    }

    /// Paginated history with accurate totals. Non-admins see their own
    /// submissions only.
    pub async fn history(
        &self,
        actor: &AuthenticatedUser,
        filter: HistoryFilter,
    ) -> Result<HistoryPage, ServiceError> {
        let page = filter.page.max(1);
        let page_size = filter.page_size.clamp(1, 200);
        let status = filter.status.map(|s| s.as_str().to_string());
        let operation = filter.operation.map(|o| o.as_str().to_string());
        let scope_user = match actor.role {
            Role::Admin => None,
            _ => Some(actor.user_id),
        };

        let rows = sqlx::query(
            r#"
            SELECT * FROM queries
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR data_source_id = $2)
              AND ($3::text IS NULL OR operation = $3)
              AND ($4::uuid IS NULL OR user_id = $4)
            ORDER BY created_at DESC, id DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(&status)
        .bind(filter.data_source_id)
        .bind(&operation)
        .bind(scope_user)
        .bind(page_size)
        .bind((page - 1) * page_size)
        .map(map_query)
        .fetch_all(&self.state.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(row?);
        }

        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(1) FROM queries
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR data_source_id = $2)
              AND ($3::text IS NULL OR operation = $3)
              AND ($4::uuid IS NULL OR user_id = $4)
            "#,
        )
        .bind(&status)
        .bind(filter.data_source_id)
        .bind(&operation)
        .bind(scope_user)
        .fetch_one(&self.state.pool)
        .await?;

        Ok(HistoryPage {
            items,
            total,
            page,
            page_size,
        })
    }

    /// One history entry, with the captured result attached when the query
    /// is a completed read.
    pub async fn get(
        &self,
        actor: &AuthenticatedUser,
        query_id: Uuid,
    ) -> Result<QueryDetail, ServiceError> {
        let query = sqlx::query("SELECT * FROM queries WHERE id = $1")
            .bind(query_id)
            .map(map_query)
            .fetch_optional(&self.state.pool)
            .await?
            .ok_or(ServiceError::NotFound)??;

        if actor.role != Role::Admin && query.user_id != actor.user_id {
            return Err(ServiceError::PermissionDenied);
        }

        let result = if query.status == QueryStatus::Completed
            && query.operation == OperationKind::Select
        {
            sqlx::query("SELECT * FROM query_results WHERE query_id = $1")
                .bind(query_id)
                .map(map_query_result)
                .fetch_optional(&self.state.pool)
                .await?
                .transpose()?
        } else {
            None
        };

        Ok(QueryDetail { query, result })
    }

    async fn execute_read(
        &self,
        actor: &AuthenticatedUser,
        ds: &DataSource,
        text: &str,
        classification: &Classification,
        row_limit: i64,
    ) -> Result<ReadResponse, ServiceError> {
        let effective = apply_row_limit(text, row_limit);
        let query = self
            .insert_query(actor, ds, text, classification, QueryStatus::Running)
            .await?;

        let started = Instant::now();
        let outcome = self.run_read_statement(ds, &effective).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let data = match outcome {
            Ok(data) => data,
            Err(err) => {
                self.mark_query_failed(query.id, &err).await?;
                return Err(err);
            }
        };

        // result capture and the completed transition land together
        let row_count = data.row_count();
        let mut tx = self.state.pool.begin().await?;
        sqlx::query(
            "INSERT INTO query_results (query_id, column_names, column_types, row_count, data)
             VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(query.id)
        .bind(Value::from(data.column_names.clone()))
        .bind(Value::from(data.column_types.clone()))
        .bind(row_count)
        .bind(Value::Array(
            data.rows.iter().cloned().map(Value::Object).collect(),
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE queries SET status='completed', row_count=$1, duration_ms=$2 WHERE id=$3",
        )
        .bind(row_count)
        .bind(duration_ms)
        .bind(query.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let columns = data
            .column_names
            .iter()
            .zip(&data.column_types)
            .map(|(name, type_name)| ColumnMeta {
                name: name.clone(),
                type_name: type_name.clone(),
            })
            .collect();

        Ok(ReadResponse {
            query_id: query.id,
            status: QueryStatus::Completed,
            columns,
            data: data.rows,
            row_count,
            duration_ms,
        })
    }

    async fn submit_write(
        &self,
        actor: &AuthenticatedUser,
        ds: &DataSource,
        text: &str,
        classification: &Classification,
    ) -> Result<WriteResponse, ServiceError> {
        let mut tx = self.state.pool.begin().await?;
        let query = insert_query_in(
            &mut tx,
            actor,
            ds,
            text,
            classification,
            QueryStatus::Pending,
        )
        .await?;

        let approvals = ApprovalService::new(Arc::clone(&self.state));
        let approval = approvals.create_for_query(&mut tx, &query).await?;
        tx.commit().await?;

        Ok(WriteResponse {
            query_id: query.id,
            approval_id: approval.id,
            requires_approval: true,
            status: QueryStatus::Pending,
        })
    }

    /// Runs one read-only statement against the datasource under the read
    /// time budget.
    async fn run_read_statement(
        &self,
        ds: &DataSource,
        sql: &str,
    ) -> Result<TableData, ServiceError> {
        let backend = datasources::connect_backend(&self.state, ds)?;
        match tokio::time::timeout(
            self.state.config.statement_timeout_read(),
            backend.run_query(sql),
        )
        .await
        {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ServiceError::TimeoutExceeded),
        }
    }

    async fn insert_query(
        &self,
        actor: &AuthenticatedUser,
        ds: &DataSource,
        text: &str,
        classification: &Classification,
        status: QueryStatus,
    ) -> Result<Query, ServiceError> {
        let mut tx = self.state.pool.begin().await?;
        let query = insert_query_in(&mut tx, actor, ds, text, classification, status).await?;
        tx.commit().await?;
        Ok(query)
    }

    async fn record_rejected_submission(
        &self,
        actor: &AuthenticatedUser,
        ds: &DataSource,
        text: &str,
        classification: &Classification,
    ) -> Result<(), ServiceError> {
        let query = self
            .insert_query(actor, ds, text, classification, QueryStatus::Failed)
            .await?;
        sqlx::query("UPDATE queries SET error=$1 WHERE id=$2")
            .bind("permission denied")
            .bind(query.id)
            .execute(&self.state.pool)
            .await?;
        Ok(())
    }

    async fn mark_query_failed(
        &self,
        query_id: Uuid,
        err: &ServiceError,
    ) -> Result<(), ServiceError> {
        sqlx::query("UPDATE queries SET status='failed', error=$1 WHERE id=$2")
            .bind(err.to_string())
            .bind(query_id)
            .execute(&self.state.pool)
            .await?;
        Ok(())
    }

    fn resolve_row_limit(&self, requested: Option<i64>) -> Result<i64, ServiceError> {
        let max = self.state.config.query.max_row_limit;
        match requested {
            Some(limit) if limit < 1 => Err(ServiceError::InvalidArgument(
                "row_limit must be positive".to_string(),
            )),
            Some(limit) if limit > max => Err(ServiceError::InvalidArgument(format!(
                "row_limit exceeds the configured ceiling of {max}"
            ))),
            Some(limit) => Ok(limit),
            None => Ok(self.state.config.query.default_row_limit),
        }
    }

    /// Loads the datasource without telling unauthorized callers whether it
    /// exists; only admins get a 404 for a missing id.
    async fn resolve_data_source(
        &self,
        actor: &AuthenticatedUser,
        data_source_id: Uuid,
    ) -> Result<DataSource, ServiceError> {
        match datasources::load_data_source(&self.state, data_source_id).await? {
            Some(ds) => Ok(ds),
            None if actor.role == Role::Admin => Err(ServiceError::NotFound),
            None => Err(ServiceError::PermissionDenied),
        }
    }

    fn ensure_active(&self, ds: &DataSource) -> Result<(), ServiceError> {
        if ds.active {
            Ok(())
        } else {
            Err(ServiceError::DataSourceUnavailable(
                "data source is inactive".to_string(),
            ))
        }
    }
}

async fn insert_query_in(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    actor: &AuthenticatedUser,
    ds: &DataSource,
    text: &str,
    classification: &Classification,
    status: QueryStatus,
) -> Result<Query, ServiceError> {
    let query = sqlx::query(
        "INSERT INTO queries (id, user_id, data_source_id, query_text, operation, status, requires_approval, created_at)
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(actor.user_id)
    .bind(ds.id)
    .bind(text)
    .bind(classification.operation.as_str())
    .bind(status.as_str())
    .bind(classification.requires_approval)
    .bind(Utc::now())
    .map(map_query)
    .fetch_one(&mut **tx)
    .await??;
    Ok(query)
}

/// Appends `LIMIT n` to plain SELECT/WITH reads that do not carry one.
/// `SHOW` and `EXPLAIN` inputs are never rewritten.
fn apply_row_limit(text: &str, limit: i64) -> String {
    let trimmed = text.trim().trim_end_matches(';').trim_end();
    let limitable = leading_verb_is(trimmed, "SELECT") || leading_verb_is(trimmed, "WITH");
    if limitable && !classify::has_limit_clause(trimmed) {
        format!("{trimmed} LIMIT {limit}")
    } else {
        trimmed.to_string()
    }
}

fn leading_verb_is(text: &str, verb: &str) -> bool {
    text.trim_start()
        .split_whitespace()
        .next()
        .map(|word| word.eq_ignore_ascii_case(verb))
        .unwrap_or(false)
}

fn render_plan_text(data: &TableData) -> String {
    let mut lines = Vec::with_capacity(data.rows.len());
    for row in &data.rows {
        let rendered: Vec<String> = data
            .column_names
            .iter()
            .filter_map(|name| row.get(name))
            .map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect();
        lines.push(rendered.join(" | "));
    }
    lines.join("\n")
}

pub(crate) fn map_query(row: PgRow) -> Result<Query, ServiceError> {
    let operation: String = row.get("operation");
    let status: String = row.get("status");
    Ok(Query {
        id: row.get("id"),
        user_id: row.get("user_id"),
        data_source_id: row.get("data_source_id"),
        query_text: row.get("query_text"),
        operation: operation
            .parse::<OperationKind>()
            .map_err(ServiceError::Internal)?,
        status: status
            .parse::<QueryStatus>()
            .map_err(ServiceError::Internal)?,
        row_count: row.get("row_count"),
        duration_ms: row.get("duration_ms"),
        error: row.get("error"),
        requires_approval: row.get("requires_approval"),
        created_at: row.get("created_at"),
    })
}

fn map_query_result(row: PgRow) -> Result<QueryResultRecord, ServiceError> {
    let column_names: Value = row.get("column_names");
    let column_types: Value = row.get("column_types");
    let data: Value = row.get("data");

    let into_internal = |err: serde_json::Error| ServiceError::Internal(err.to_string());

    Ok(QueryResultRecord {
        query_id: row.get("query_id"),
        column_names: serde_json::from_value(column_names).map_err(into_internal)?,
        column_types: serde_json::from_value(column_types).map_err(into_internal)?,
        row_count: row.get("row_count"),
        data: serde_json::from_value(data).map_err(into_internal)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_limit_appended_only_when_missing() {
        assert_eq!(
            apply_row_limit("SELECT * FROM t", 100),
            "SELECT * FROM t LIMIT 100"
        );
        assert_eq!(
            apply_row_limit("SELECT * FROM t LIMIT 5;", 100),
            "SELECT * FROM t LIMIT 5"
        );
        assert_eq!(
            apply_row_limit("WITH c AS (SELECT 1) SELECT * FROM c", 10),
            "WITH c AS (SELECT 1) SELECT * FROM c LIMIT 10"
        );
    }

    #[test]
    fn show_and_explain_are_never_rewritten() {
        assert_eq!(apply_row_limit("SHOW TABLES", 100), "SHOW TABLES");
        assert_eq!(
            apply_row_limit("EXPLAIN SELECT * FROM t", 100),
            "EXPLAIN SELECT * FROM t"
        );
    }

    #[test]
    fn subquery_limit_does_not_suppress_outer_limit() {
        assert_eq!(
            apply_row_limit("SELECT * FROM (SELECT a FROM t LIMIT 5) sub", 100),
            "SELECT * FROM (SELECT a FROM t LIMIT 5) sub LIMIT 100"
        );
    }

    #[test]
    fn plan_text_joins_columns_in_order() {
        let mut row = serde_json::Map::new();
        row.insert("QUERY PLAN".to_string(), Value::String("Seq Scan".to_string()));
        let data = TableData {
            column_names: vec!["QUERY PLAN".to_string()],
            column_types: vec!["TEXT".to_string()],
            rows: vec![row],
        };
        assert_eq!(render_plan_text(&data), "Seq Scan");
    }
}
