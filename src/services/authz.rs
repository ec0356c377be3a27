//! Effective-permission resolution enforced on every datasource operation.

use sqlx::Row;
use uuid::Uuid;

use crate::{
    domain::models::{PermissionAction, PermissionSet, Role},
    infrastructure::{auth::AuthenticatedUser, state::AppState},
};

use super::errors::ServiceError;

/// Checks one action against the actor's effective permission set. Denials
/// carry no detail about the datasource, including whether it exists.
pub async fn authorize(
    state: &AppState,
    actor: &AuthenticatedUser,
    data_source_id: Uuid,
    action: PermissionAction,
) -> Result<(), ServiceError> {
    let effective = effective_permissions(state, actor, data_source_id).await?;
    if effective.allows(action) {
        Ok(())
    } else {
        Err(ServiceError::PermissionDenied)
    }
}

/// Pointwise OR over the actor's group grants on the datasource, capped by
/// role. Admins short-circuit to the full set without touching the store.
pub async fn effective_permissions(
    state: &AppState,
    actor: &AuthenticatedUser,
    data_source_id: Uuid,
) -> Result<PermissionSet, ServiceError> {
    if actor.role == Role::Admin {
        return Ok(PermissionSet::all());
    }

    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(bool_or(p.can_read), FALSE) AS can_read,
            COALESCE(bool_or(p.can_write), FALSE) AS can_write,
            COALESCE(bool_or(p.can_approve), FALSE) AS can_approve
        FROM permissions p
        JOIN group_members gm ON gm.group_id = p.group_id
        WHERE gm.user_id = $1 AND p.data_source_id = $2
        "#,
    )
    .bind(actor.user_id)
    .bind(data_source_id)
    .fetch_one(&state.pool)
    .await?;

    let granted = PermissionSet {
        can_read: row.get("can_read"),
        can_write: row.get("can_write"),
        can_approve: row.get("can_approve"),
    };

    Ok(granted.capped_by(actor.role))
}
