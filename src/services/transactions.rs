//! Preview transactions: live backend transactions pinned across requests.
//!
//! `start` executes the gated write inside `BEGIN` and parks the open
//! session in the in-memory registry; the reviewer then commits or rolls
//! back, or the supervisor times the preview out. Exactly one terminal
//! transition happens per transaction, and the backend session receives
//! exactly one `COMMIT` or `ROLLBACK` because the session can be taken from
//! its slot only once.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    domain::models::{
        ApprovalStatus, PermissionAction, PreviewTransaction, QueryStatus, Role, TransactionStatus,
    },
    infrastructure::{
        auth::AuthenticatedUser, backends::BackendSession, db::PgPool, state::AppState,
        tx_registry::TxSlot,
    },
    jobs::NotificationEvent,
};

use super::{approvals::map_approval, authz, datasources, errors::ServiceError};

#[derive(Debug, Serialize)]
pub struct TransactionPreview {
    pub transaction: PreviewTransaction,
    pub affected_rows: u64,
    pub duration_ms: i64,
}

pub struct TransactionService {
    pub state: Arc<AppState>,
}

impl TransactionService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Opens a preview: runs the approved statement inside a fresh backend
    /// transaction and returns its effect without committing.
    ///
    /// Preconditions: the caller holds `can_approve`, is not the requester,
    /// the approval is not rejected, and no other preview is active for it
    /// (enforced by a partial unique index on the store).
    pub async fn start(
        &self,
        actor: &AuthenticatedUser,
        approval_id: Uuid,
    ) -> Result<TransactionPreview, ServiceError> {
        let approval = sqlx::query("SELECT * FROM approval_requests WHERE id = $1")
            .bind(approval_id)
            .map(map_approval)
            .fetch_optional(&self.state.pool)
            .await?
            .ok_or(ServiceError::NotFound)??;

        authz::authorize(
            &self.state,
            actor,
            approval.data_source_id,
            PermissionAction::Approve,
        )
        .await?;

        if approval.requester_id == actor.user_id {
            return Err(ServiceError::SelfApprovalForbidden);
        }
        if approval.status == ApprovalStatus::Rejected {
            return Err(ServiceError::NotPending);
        }

        let ds = datasources::load_data_source(&self.state, approval.data_source_id)
            .await?
            .ok_or(ServiceError::NotFound)?;
        if !ds.active {
            return Err(ServiceError::DataSourceUnavailable(
                "data source is inactive".to_string(),
            ));
        }

        let transaction_id = Uuid::new_v4();
        let started_at = Utc::now();
        let deadline = started_at
            + chrono::Duration::from_std(self.state.config.preview_timeout())
                .map_err(|err| ServiceError::Internal(err.to_string()))?;

        // the partial unique index rejects a second active preview
        let record = sqlx::query(
            "INSERT INTO preview_transactions (id, approval_id, reviewer_id, data_source_id, status, started_at, deadline)
             VALUES ($1,$2,$3,$4,$5,$6,$7)
             RETURNING *",
        )
        .bind(transaction_id)
        .bind(approval_id)
        .bind(actor.user_id)
        .bind(approval.data_source_id)
        .bind(TransactionStatus::Active.as_str())
        .bind(started_at)
        .bind(deadline)
        .map(map_preview_transaction)
        .fetch_one(&self.state.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                ServiceError::Conflict
            }
            other => ServiceError::from(other),
        })??;

        let backend = datasources::connect_backend(&self.state, &ds)?;
        let mut session = match backend.begin().await {
            Ok(session) => session,
            Err(err) => {
                self.persist_terminal(
                    transaction_id,
                    TransactionStatus::Failed,
                    Some(&err.to_string()),
                )
                .await?;
                return Err(err.into());
            }
        };

        let write_budget = self.state.config.statement_timeout_write();
        let affected = match tokio::time::timeout(
            write_budget,
            session.execute_write(&approval.query_text),
        )
        .await
        {
            Ok(Ok(affected)) => affected,
            Ok(Err(err)) => {
                abandon_session(session).await;
                self.persist_terminal(
                    transaction_id,
                    TransactionStatus::Failed,
                    Some(&err.to_string()),
                )
                .await?;
                self.set_query_status(
                    approval.query_id,
                    QueryStatus::Failed,
                    None,
                    None,
                    Some(&err.to_string()),
                )
                .await?;
                return Err(err.into());
            }
            Err(_) => {
                abandon_session(session).await;
                self.persist_terminal(
                    transaction_id,
                    TransactionStatus::Failed,
                    Some("statement exceeded its write time budget"),
                )
                .await?;
                return Err(ServiceError::TimeoutExceeded);
            }
        };

        self.set_query_status(approval.query_id, QueryStatus::Running, None, None, None)
            .await?;

        self.state.transactions.insert(
            transaction_id,
            TxSlot::new(
                approval_id,
                approval.query_id,
                actor.user_id,
                approval.data_source_id,
                deadline,
                affected,
                session,
            ),
        );

        let duration_ms = (Utc::now() - started_at).num_milliseconds();
        info!(%transaction_id, %approval_id, affected, "preview transaction started");

        Ok(TransactionPreview {
            transaction: record,
            affected_rows: affected,
            duration_ms,
        })
    }

    /// Commits an active preview before its deadline. Idempotent on
    /// already-terminal transactions: the prior outcome is returned without
    /// touching the backend again.
    pub async fn commit(
        &self,
        actor: &AuthenticatedUser,
        transaction_id: Uuid,
    ) -> Result<PreviewTransaction, ServiceError> {
        let record = self.fetch(transaction_id).await?;
        self.ensure_owner(actor, &record)?;

        match record.status {
            // a repeated commit returns the prior outcome without touching
            // the backend again
            TransactionStatus::Committed => return Ok(record),
            TransactionStatus::TimedOut => return Err(ServiceError::TransactionExpired),
            TransactionStatus::RolledBack | TransactionStatus::Failed => {
                return Err(ServiceError::Conflict)
            }
            TransactionStatus::Active => {}
        }

        let Some(slot) = self.state.transactions.get(transaction_id) else {
            return self.mark_orphaned(transaction_id).await;
        };

        if Utc::now() >= slot.deadline {
            // the supervisor owns the timeout transition
            return Err(ServiceError::TransactionExpired);
        }

        let session = self.claim_session(&slot)?;
        let outcome = session.commit().await;
        self.state.transactions.remove(transaction_id);

        match outcome {
            Ok(()) => {
                let record = self
                    .persist_terminal(transaction_id, TransactionStatus::Committed, None)
                    .await?;

                // advisory approve may already have happened; only pending flips
                sqlx::query(
                    "UPDATE approval_requests SET status='approved', updated_at=$1
                     WHERE id=$2 AND status='pending'",
                )
                .bind(Utc::now())
                .bind(slot.approval_id)
                .execute(&self.state.pool)
                .await?;

                let duration_ms = (Utc::now() - record.started_at).num_milliseconds();
                self.set_query_status(
                    slot.query_id,
                    QueryStatus::Completed,
                    Some(slot.affected_rows as i64),
                    Some(duration_ms),
                    None,
                )
                .await?;

                self.state.notify(NotificationEvent::TransactionCommitted {
                    transaction_id,
                    approval_id: slot.approval_id,
                    reviewer_id: slot.reviewer_id,
                });
                info!(%transaction_id, "preview transaction committed");
                Ok(record)
            }
            Err(err) => {
                let message = err.to_string();
                self.persist_terminal(
                    transaction_id,
                    TransactionStatus::Failed,
                    Some(&message),
                )
                .await?;
                self.set_query_status(
                    slot.query_id,
                    QueryStatus::Failed,
                    None,
                    None,
                    Some(&message),
                )
                .await?;
                Err(err.into())
            }
        }
    }

    /// Rolls back an active preview. Always permitted on `active`; also
    /// rejects the linked approval so the request does not linger approved
    /// with nothing executed.
    pub async fn rollback(
        &self,
        actor: &AuthenticatedUser,
        transaction_id: Uuid,
    ) -> Result<PreviewTransaction, ServiceError> {
        let record = self.fetch(transaction_id).await?;
        self.ensure_owner(actor, &record)?;

        match record.status {
            // already aborted one way or another; nothing left to undo
            TransactionStatus::RolledBack
            | TransactionStatus::TimedOut
            | TransactionStatus::Failed => return Ok(record),
            TransactionStatus::Committed => return Err(ServiceError::Conflict),
            TransactionStatus::Active => {}
        }

        let Some(slot) = self.state.transactions.get(transaction_id) else {
            return self.mark_orphaned(transaction_id).await;
        };

        let session = self.claim_session(&slot)?;
        let outcome = session.rollback().await;
        self.state.transactions.remove(transaction_id);

        if let Err(err) = &outcome {
            // disconnect aborts the backend transaction anyway
            warn!(%transaction_id, error = %err, "rollback returned an error");
        }

        let record = self
            .persist_terminal(transaction_id, TransactionStatus::RolledBack, None)
            .await?;

        sqlx::query(
            "UPDATE approval_requests SET status='rejected', rejection_reason=$1, updated_at=$2
             WHERE id=$3 AND status IN ('pending', 'approved')",
        )
        .bind("rolled back by reviewer")
        .bind(Utc::now())
        .bind(slot.approval_id)
        .execute(&self.state.pool)
        .await?;

        // the write never happened; the query goes back to awaiting approval
        self.set_query_status(slot.query_id, QueryStatus::Pending, None, None, None)
            .await?;

        self.state.notify(NotificationEvent::TransactionRolledBack {
            transaction_id,
            approval_id: slot.approval_id,
            reviewer_id: slot.reviewer_id,
        });
        info!(%transaction_id, "preview transaction rolled back");
        Ok(record)
    }

    /// Supervisor-only transition for previews whose deadline passed. A busy
    /// handle is retried on the next scan instead of forcing a second
    /// terminal operation.
    pub async fn force_timeout(&self, transaction_id: Uuid) -> Result<(), ServiceError> {
        let Some(slot) = self.state.transactions.get(transaction_id) else {
            return Ok(());
        };

        let session = match slot.take_session() {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(()),
            Err(_) => {
                self.state
                    .transactions
                    .requeue(transaction_id, slot.deadline);
                return Ok(());
            }
        };

        if let Err(err) = session.rollback().await {
            warn!(%transaction_id, error = %err, "rollback during timeout returned an error");
        }
        self.state.transactions.remove(transaction_id);

        self.persist_terminal(transaction_id, TransactionStatus::TimedOut, None)
            .await?;
        // leave the approval pending so a reviewer can open a fresh preview
        self.set_query_status(slot.query_id, QueryStatus::Pending, None, None, None)
            .await?;

        self.state.notify(NotificationEvent::TransactionTimedOut {
            transaction_id,
            approval_id: slot.approval_id,
        });
        info!(%transaction_id, "preview transaction timed out");
        Ok(())
    }

    pub async fn status(
        &self,
        actor: &AuthenticatedUser,
        transaction_id: Uuid,
    ) -> Result<PreviewTransaction, ServiceError> {
        let record = self.fetch(transaction_id).await?;
        if actor.role != Role::Admin && actor.user_id != record.reviewer_id {
            authz::authorize(
                &self.state,
                actor,
                record.data_source_id,
                PermissionAction::Read,
            )
            .await?;
        }
        Ok(record)
    }

    async fn fetch(&self, transaction_id: Uuid) -> Result<PreviewTransaction, ServiceError> {
        let row = sqlx::query("SELECT * FROM preview_transactions WHERE id = $1")
            .bind(transaction_id)
            .map(map_preview_transaction)
            .fetch_optional(&self.state.pool)
            .await?;
        row.ok_or(ServiceError::NotFound)?
    }

    fn ensure_owner(
        &self,
        actor: &AuthenticatedUser,
        record: &PreviewTransaction,
    ) -> Result<(), ServiceError> {
        if actor.user_id == record.reviewer_id {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied)
        }
    }

    fn claim_session(&self, slot: &TxSlot) -> Result<Box<dyn BackendSession>, ServiceError> {
        match slot.take_session() {
            Ok(Some(session)) => Ok(session),
            // either mid-operation or already finishing; both read as busy
            Ok(None) => Err(ServiceError::TransactionBusy),
            Err(_) => Err(ServiceError::TransactionBusy),
        }
    }

    /// An `active` row with no in-memory owner can only come from a crashed
    /// predecessor process; the backend already aborted it on disconnect.
    async fn mark_orphaned(
        &self,
        transaction_id: Uuid,
    ) -> Result<PreviewTransaction, ServiceError> {
        warn!(%transaction_id, "active transaction has no live session; marking orphaned");
        self.persist_terminal(transaction_id, TransactionStatus::Failed, Some("orphaned"))
            .await
    }

    async fn persist_terminal(
        &self,
        transaction_id: Uuid,
        status: TransactionStatus,
        reason: Option<&str>,
    ) -> Result<PreviewTransaction, ServiceError> {
        let row = sqlx::query(
            "UPDATE preview_transactions
             SET status=$1, failure_reason=$2, finished_at=$3
             WHERE id=$4
             RETURNING *",
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(Utc::now())
        .bind(transaction_id)
        .map(map_preview_transaction)
        .fetch_one(&self.state.pool)
        .await??;
        Ok(row)
    }

    async fn set_query_status(
        &self,
        query_id: Uuid,
        status: QueryStatus,
        row_count: Option<i64>,
        duration_ms: Option<i64>,
        error: Option<&str>,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            "UPDATE queries SET status=$1, row_count=COALESCE($2, row_count),
             duration_ms=COALESCE($3, duration_ms), error=$4
             WHERE id=$5",
        )
        .bind(status.as_str())
        .bind(row_count)
        .bind(duration_ms)
        .bind(error)
        .bind(query_id)
        .execute(&self.state.pool)
        .await?;
        Ok(())
    }
}

/// Startup reconciliation: any `active` row predates this process, its
/// connection is gone, and the backend rolled it back on disconnect. The
/// record becomes `failed` with reason "orphaned" and the linked query goes
/// back to awaiting approval.
pub async fn reconcile_orphans(pool: &PgPool) -> Result<u64, ServiceError> {
    let now = Utc::now();
    let orphaned = sqlx::query(
        "UPDATE preview_transactions
         SET status='failed', failure_reason='orphaned', finished_at=$1
         WHERE status='active'
         RETURNING approval_id",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    for row in &orphaned {
        let approval_id: Uuid = row.get("approval_id");
        sqlx::query(
            "UPDATE queries SET status='pending'
             WHERE status='running'
               AND id IN (SELECT query_id FROM approval_requests WHERE id = $1)",
        )
        .bind(approval_id)
        .execute(pool)
        .await?;
    }

    // reads that died mid-flight have nothing to resume
    sqlx::query("UPDATE queries SET status='failed', error='orphaned' WHERE status='running'")
        .execute(pool)
        .await?;

    let count = orphaned.len() as u64;
    if count > 0 {
        warn!(count, "reconciled orphaned preview transactions");
    }
    Ok(count)
}

fn map_preview_transaction(row: PgRow) -> Result<PreviewTransaction, ServiceError> {
    let status: String = row.get("status");
    Ok(PreviewTransaction {
        id: row.get("id"),
        approval_id: row.get("approval_id"),
        reviewer_id: row.get("reviewer_id"),
        data_source_id: row.get("data_source_id"),
        status: status
            .parse::<TransactionStatus>()
            .map_err(ServiceError::Internal)?,
        started_at: row.get("started_at"),
        deadline: row.get("deadline"),
        finished_at: row.get("finished_at"),
        failure_reason: row.get("failure_reason"),
    })
}

/// Explicit rollback for sessions abandoned on error paths; dropping alone
/// would also abort server-side, but an eager ROLLBACK frees the connection
/// for the pool immediately.
async fn abandon_session(session: Box<dyn BackendSession>) {
    if let Err(err) = session.rollback().await {
        warn!(error = %err, "failed to roll back abandoned session");
    }
}
