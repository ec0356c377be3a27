//! Approval workflow for write statements.
//!
//! Backing service for the `/approvals` routes. An approval request is born
//! `pending` and moves exactly once to `approved` or `rejected`; the first
//! valid review wins and terminal states are absorbing. A decision alone
//! never executes the gated statement — execution happens only through the
//! transaction preview in `services::transactions`.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{
    domain::models::{
        ApprovalComment, ApprovalRequest, ApprovalReview, ApprovalStatus, OperationKind,
        PermissionAction, Query, ReviewDecision,
    },
    infrastructure::{auth::AuthenticatedUser, state::AppState},
    jobs::NotificationEvent,
};

use super::{authz, errors::ServiceError};

/// Reviewer decision recorded through `POST /approvals/:id/review`.
#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub decision: ReviewDecision,
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub body: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApprovalListFilter {
    pub status: Option<ApprovalStatus>,
    pub data_source_id: Option<Uuid>,
    pub requester_id: Option<Uuid>,
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

/// Per-status totals, always derived from the canonical table rather than
/// the currently paged window.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ApprovalCounts {
    pub pending: i64,
    pub approved: i64,
    pub rejected: i64,
}

#[derive(Debug, Serialize)]
pub struct ApprovalPage {
    pub items: Vec<ApprovalRequest>,
    pub total: i64,
    pub counts: ApprovalCounts,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Serialize)]
pub struct ApprovalDetail {
    pub approval: ApprovalRequest,
    pub reviews: Vec<ApprovalReview>,
    pub comments: Vec<ApprovalComment>,
}

pub struct ApprovalService {
    pub state: Arc<AppState>,
}

impl ApprovalService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Opens an approval request for a freshly persisted write query. Only
    /// the submit pipeline calls this, and only for `requires_approval`
    /// queries.
    pub async fn create_for_query(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        query: &Query,
    ) -> Result<ApprovalRequest, ServiceError> {
        if !query.requires_approval {
            return Err(ServiceError::Internal(
                "approval requested for a query that does not require one".to_string(),
            ));
        }

        let now = Utc::now();
        let approval = sqlx::query(
            "INSERT INTO approval_requests (id, query_id, data_source_id, query_text, operation, requester_id, status, rejection_reason, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(query.id)
        .bind(query.data_source_id)
        .bind(&query.query_text)
        .bind(query.operation.as_str())
        .bind(query.user_id)
        .bind(ApprovalStatus::Pending.as_str())
        .bind::<Option<String>>(None)
        .bind(now)
        .bind(now)
        .map(map_approval)
        .fetch_one(&mut **tx)
        .await??;

        self.state.notify(NotificationEvent::RequestCreated {
            approval_id: approval.id,
            query_id: approval.query_id,
            data_source_id: approval.data_source_id,
            requester_id: approval.requester_id,
            operation: approval.operation,
        });

        Ok(approval)
    }

    /// Paginated listing with status/datasource/requester filters. The
    /// per-status counts honor the non-status filters so tabbed UIs stay
    /// accurate without counting locally.
    pub async fn list(
        &self,
        actor: &AuthenticatedUser,
        filter: ApprovalListFilter,
    ) -> Result<ApprovalPage, ServiceError> {
        let page = filter.page.max(1);
        let page_size = filter.page_size.clamp(1, 200);
        let status = filter.status.map(|s| s.as_str().to_string());
        let is_admin = actor.role == crate::domain::models::Role::Admin;

        // non-admins see their own requests plus those on datasources they
        // can approve
        let rows = sqlx::query(
            r#"
            SELECT * FROM approval_requests a
            WHERE ($1::text IS NULL OR a.status = $1)
              AND ($2::uuid IS NULL OR a.data_source_id = $2)
              AND ($3::uuid IS NULL OR a.requester_id = $3)
              AND ($4 OR a.requester_id = $5 OR a.data_source_id IN (
                    SELECT p.data_source_id
                    FROM permissions p
                    JOIN group_members gm ON gm.group_id = p.group_id
                    WHERE gm.user_id = $5 AND p.can_approve
                  ))
            ORDER BY a.created_at DESC, a.id DESC
            LIMIT $6 OFFSET $7
            "#,
        )
        .bind(&status)
        .bind(filter.data_source_id)
        .bind(filter.requester_id)
        .bind(is_admin)
        .bind(actor.user_id)
        .bind(page_size)
        .bind((page - 1) * page_size)
        .map(map_approval)
        .fetch_all(&self.state.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(row?);
        }

        let counts = self
            .counts_filtered(filter.data_source_id, filter.requester_id)
            .await?;
        let total = match filter.status {
            Some(ApprovalStatus::Pending) => counts.pending,
            Some(ApprovalStatus::Approved) => counts.approved,
            Some(ApprovalStatus::Rejected) => counts.rejected,
            None => counts.pending + counts.approved + counts.rejected,
        };

        Ok(ApprovalPage {
            items,
            total,
            counts,
            page,
            page_size,
        })
    }

    /// Global per-status counts from the canonical table.
    pub async fn counts(&self, _actor: &AuthenticatedUser) -> Result<ApprovalCounts, ServiceError> {
        self.counts_filtered(None, None).await
    }

    pub async fn detail(
        &self,
        actor: &AuthenticatedUser,
        approval_id: Uuid,
    ) -> Result<ApprovalDetail, ServiceError> {
        let approval = self.fetch(approval_id).await?;
        self.ensure_can_view(actor, &approval).await?;

        let review_rows = sqlx::query(
            "SELECT * FROM approval_reviews WHERE approval_id = $1 ORDER BY reviewed_at ASC",
        )
        .bind(approval_id)
        .map(map_review)
        .fetch_all(&self.state.pool)
        .await?;
        let mut reviews = Vec::with_capacity(review_rows.len());
        for row in review_rows {
            reviews.push(row?);
        }

        let comments = sqlx::query(
            "SELECT * FROM approval_comments WHERE approval_id = $1 ORDER BY created_at ASC",
        )
        .bind(approval_id)
        .map(map_comment)
        .fetch_all(&self.state.pool)
        .await?;

        Ok(ApprovalDetail {
            approval,
            reviews,
            comments,
        })
    }

    /// Records a reviewer decision and flips the request out of `pending`.
    ///
    /// Requires `can_approve` on the datasource, forbids self-approval, and
    /// resolves concurrent reviews by letting the first status transition
    /// win; losers observe `AlreadyReviewed`.
    pub async fn review(
        &self,
        actor: &AuthenticatedUser,
        approval_id: Uuid,
        payload: ReviewRequest,
    ) -> Result<ApprovalReview, ServiceError> {
        let approval = self.fetch(approval_id).await?;

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
        if approval.status != ApprovalStatus::Pending {
            return Err(ServiceError::AlreadyReviewed);
        }

        let mut tx = self.state.pool.begin().await?;
        let now = Utc::now();

        let review = sqlx::query(
            "INSERT INTO approval_reviews (id, approval_id, reviewer_id, decision, comment, reviewed_at)
             VALUES ($1,$2,$3,$4,$5,$6)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(approval_id)
        .bind(actor.user_id)
        .bind(payload.decision.as_str())
        .bind(&payload.comment)
        .bind(now)
        .map(map_review)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                ServiceError::AlreadyReviewed
            }
            other => ServiceError::from(other),
        })??;

        let rejection_reason = match payload.decision {
            ReviewDecision::Rejected => Some(
                payload
                    .comment
                    .clone()
                    .unwrap_or_else(|| "rejected by reviewer".to_string()),
            ),
            ReviewDecision::Approved => None,
        };

        let new_status = match payload.decision {
            ReviewDecision::Approved => ApprovalStatus::Approved,
            ReviewDecision::Rejected => ApprovalStatus::Rejected,
        };

        let updated = sqlx::query(
            "UPDATE approval_requests SET status=$1, rejection_reason=$2, updated_at=$3
             WHERE id=$4 AND status='pending'",
        )
        .bind(new_status.as_str())
        .bind(&rejection_reason)
        .bind(now)
        .bind(approval_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // another reviewer flipped the status between our read and write
            return Err(ServiceError::AlreadyReviewed);
        }

        tx.commit().await?;

        self.state.notify(NotificationEvent::ReviewDecided {
            approval_id,
            reviewer_id: actor.user_id,
            decision: payload.decision,
        });

        Ok(review)
    }

    /// Comments are independent of the request state; anyone who can see the
    /// request may add one.
    pub async fn add_comment(
        &self,
        actor: &AuthenticatedUser,
        approval_id: Uuid,
        payload: CommentRequest,
    ) -> Result<ApprovalComment, ServiceError> {
        let body = payload.body.trim().to_string();
        if body.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "comment body must not be empty".to_string(),
            ));
        }

        let approval = self.fetch(approval_id).await?;
        self.ensure_can_view(actor, &approval).await?;

        let comment = sqlx::query(
            "INSERT INTO approval_comments (id, approval_id, user_id, body, created_at)
             VALUES ($1,$2,$3,$4,$5)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(approval_id)
        .bind(actor.user_id)
        .bind(&body)
        .bind(Utc::now())
        .map(map_comment)
        .fetch_one(&self.state.pool)
        .await?;

        Ok(comment)
    }

    /// Only the author may delete a comment.
    pub async fn delete_comment(
        &self,
        actor: &AuthenticatedUser,
        approval_id: Uuid,
        comment_id: Uuid,
    ) -> Result<(), ServiceError> {
        let deleted = sqlx::query(
            "DELETE FROM approval_comments WHERE id=$1 AND approval_id=$2 AND user_id=$3",
        )
        .bind(comment_id)
        .bind(approval_id)
        .bind(actor.user_id)
        .execute(&self.state.pool)
        .await?;

        if deleted.rows_affected() > 0 {
            return Ok(());
        }

        // disambiguate: a foreign comment is forbidden, a missing one is 404
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(1) FROM approval_comments WHERE id=$1 AND approval_id=$2",
        )
        .bind(comment_id)
        .bind(approval_id)
        .fetch_one(&self.state.pool)
        .await?;

        if exists > 0 {
            Err(ServiceError::PermissionDenied)
        } else {
            Err(ServiceError::NotFound)
        }
    }

    pub async fn fetch(&self, approval_id: Uuid) -> Result<ApprovalRequest, ServiceError> {
        let row = sqlx::query("SELECT * FROM approval_requests WHERE id = $1")
            .bind(approval_id)
            .map(map_approval)
            .fetch_optional(&self.state.pool)
            .await?;
        row.ok_or(ServiceError::NotFound)?
    }

    async fn counts_filtered(
        &self,
        data_source_id: Option<Uuid>,
        requester_id: Option<Uuid>,
    ) -> Result<ApprovalCounts, ServiceError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM approval_requests
            WHERE ($1::uuid IS NULL OR data_source_id = $1)
              AND ($2::uuid IS NULL OR requester_id = $2)
            GROUP BY status
            "#,
        )
        .bind(data_source_id)
        .bind(requester_id)
        .fetch_all(&self.state.pool)
        .await?;

        let mut counts = ApprovalCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let total: i64 = row.get("total");
            match status.parse::<ApprovalStatus>() {
                Ok(ApprovalStatus::Pending) => counts.pending = total,
                Ok(ApprovalStatus::Approved) => counts.approved = total,
                Ok(ApprovalStatus::Rejected) => counts.rejected = total,
                Err(other) => return Err(ServiceError::Internal(other)),
            }
        }
        Ok(counts)
    }

    /// Requesters always see their own requests; everyone else needs read
    /// access on the datasource.
    async fn ensure_can_view(
        &self,
        actor: &AuthenticatedUser,
        approval: &ApprovalRequest,
    ) -> Result<(), ServiceError> {
        if approval.requester_id == actor.user_id {
            return Ok(());
        }
        authz::authorize(
            &self.state,
            actor,
            approval.data_source_id,
            PermissionAction::Read,
        )
        .await
    }

}

pub(crate) fn map_approval(row: PgRow) -> Result<ApprovalRequest, ServiceError> {
    let operation: String = row.get("operation");
    let status: String = row.get("status");
    Ok(ApprovalRequest {
        id: row.get("id"),
        query_id: row.get("query_id"),
        data_source_id: row.get("data_source_id"),
        query_text: row.get("query_text"),
        operation: operation
            .parse::<OperationKind>()
            .map_err(ServiceError::Internal)?,
        requester_id: row.get("requester_id"),
        status: status
            .parse::<ApprovalStatus>()
            .map_err(ServiceError::Internal)?,
        rejection_reason: row.get("rejection_reason"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_review(row: PgRow) -> Result<ApprovalReview, ServiceError> {
    let decision: String = row.get("decision");
    Ok(ApprovalReview {
        id: row.get("id"),
        approval_id: row.get("approval_id"),
        reviewer_id: row.get("reviewer_id"),
        decision: decision
            .parse::<ReviewDecision>()
            .map_err(ServiceError::Internal)?,
        comment: row.get("comment"),
        reviewed_at: row.get("reviewed_at"),
    })
}

fn map_comment(row: PgRow) -> ApprovalComment {
    ApprovalComment {
        id: row.get("id"),
        approval_id: row.get("approval_id"),
        user_id: row.get("user_id"),
        body: row.get("body"),
        created_at: row.get("created_at"),
    }
}
