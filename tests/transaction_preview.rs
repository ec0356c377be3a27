mod common;

use anyhow::Result;
use axum::http::StatusCode;
use chrono::Utc;
use query_gateway::{domain::models::Role, services::transactions::TransactionService};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn submit_delete(
    app: &common::TestApp,
    requester: Uuid,
    ds: Uuid,
    table: &str,
) -> Result<String> {
    let (status, body) = common::send(
        app,
        "POST",
        "/api/queries",
        requester,
        Role::User,
        Some(json!({ "data_source_id": ds, "text": format!("DELETE FROM {table} WHERE id = 1") })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    Ok(body["approval_id"].as_str().unwrap().to_string())
}

#[tokio::test]
async fn preview_then_commit_applies_the_write() -> Result<()> {
    let Some((pool, database_url)) = common::maybe_connect_pool().await? else {
        return Ok(());
    };
    let app = common::build_app(pool.clone(), &database_url).await?;

    let requester = common::create_user(&pool, Role::User).await?;
    let reviewer = common::create_user(&pool, Role::User).await?;
    let ds = common::register_data_source(&app).await?;
    common::grant(&pool, requester, ds, true, true, false).await?;
    common::grant(&pool, reviewer, ds, true, false, true).await?;

    let table = common::scratch_table();
    sqlx::query(&format!("CREATE TABLE {table} (id INT)"))
        .execute(&pool)
        .await?;
    sqlx::query(&format!("INSERT INTO {table} (id) VALUES (1), (2)"))
        .execute(&pool)
        .await?;

    let approval_id = submit_delete(&app, requester, ds, &table).await?;

    let (status, body) = common::send(
        &app,
        "POST",
        &format!("/api/approvals/{approval_id}/transaction-start"),
        reviewer,
        Role::User,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["status"], "active");
    assert_eq!(body["preview"]["affected_rows"], 1);
    let transaction_id = body["transaction_id"].as_str().unwrap().to_string();

    // uncommitted: other connections still see both rows
    let visible = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(1) FROM {table}"))
        .fetch_one(&pool)
        .await?;
    assert_eq!(visible, 2);

    let (status, body) = common::send(
        &app,
        "POST",
        &format!("/api/transactions/{transaction_id}/commit"),
        reviewer,
        Role::User,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["transaction"]["status"], "committed");

    let visible = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(1) FROM {table}"))
        .fetch_one(&pool)
        .await?;
    assert_eq!(visible, 1);

    let approval_status =
        sqlx::query_scalar::<_, String>("SELECT status FROM approval_requests WHERE id = $1")
            .bind(Uuid::parse_str(&approval_id)?)
            .fetch_one(&pool)
            .await?;
    assert_eq!(approval_status, "approved");

    let row = sqlx::query_as::<_, (String, Option<i64>)>(
        "SELECT status, row_count FROM queries WHERE data_source_id = $1",
    )
    .bind(ds)
    .fetch_one(&pool)
    .await?;
    assert_eq!(row.0, "completed");
    assert_eq!(row.1, Some(1));

    // a second commit reports the prior outcome instead of re-committing
    let (status, body) = common::send(
        &app,
        "POST",
        &format!("/api/transactions/{transaction_id}/commit"),
        reviewer,
        Role::User,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transaction"]["status"], "committed");

    common::cleanup(&pool, ds, &[requester, reviewer], Some(&table)).await?;
    Ok(())
}

#[tokio::test]
async fn rollback_leaves_the_backend_untouched() -> Result<()> {
    let Some((pool, database_url)) = common::maybe_connect_pool().await? else {
        return Ok(());
    };
    let app = common::build_app(pool.clone(), &database_url).await?;

    let requester = common::create_user(&pool, Role::User).await?;
    let reviewer = common::create_user(&pool, Role::User).await?;
    let ds = common::register_data_source(&app).await?;
    common::grant(&pool, requester, ds, true, true, false).await?;
    common::grant(&pool, reviewer, ds, true, false, true).await?;

    let table = common::scratch_table();
    sqlx::query(&format!("CREATE TABLE {table} (id INT)"))
        .execute(&pool)
        .await?;
    sqlx::query(&format!("INSERT INTO {table} (id) VALUES (1)"))
        .execute(&pool)
        .await?;

    let approval_id = submit_delete(&app, requester, ds, &table).await?;

    let (_, body) = common::send(
        &app,
        "POST",
        &format!("/api/approvals/{approval_id}/transaction-start"),
        reviewer,
        Role::User,
        None,
    )
    .await?;
    let transaction_id = body["transaction_id"].as_str().unwrap().to_string();

    let (status, body) = common::send(
        &app,
        "POST",
        &format!("/api/transactions/{transaction_id}/rollback"),
        reviewer,
        Role::User,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["transaction"]["status"], "rolled_back");

    let remaining = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(1) FROM {table}"))
        .fetch_one(&pool)
        .await?;
    assert_eq!(remaining, 1);

    let approval_status =
        sqlx::query_scalar::<_, String>("SELECT status FROM approval_requests WHERE id = $1")
            .bind(Uuid::parse_str(&approval_id)?)
            .fetch_one(&pool)
            .await?;
    assert_eq!(approval_status, "rejected");

    common::cleanup(&pool, ds, &[requester, reviewer], Some(&table)).await?;
    Ok(())
}

#[tokio::test]
async fn expired_preview_times_out_and_refuses_commit() -> Result<()> {
    let Some((pool, database_url)) = common::maybe_connect_pool().await? else {
        return Ok(());
    };
    let app = common::build_app_with(pool.clone(), &database_url, |config| {
        config.transaction.preview_timeout_secs = 1;
    })
    .await?;

    let requester = common::create_user(&pool, Role::User).await?;
    let reviewer = common::create_user(&pool, Role::User).await?;
    let ds = common::register_data_source(&app).await?;
    common::grant(&pool, requester, ds, true, true, false).await?;
    common::grant(&pool, reviewer, ds, true, false, true).await?;

    let table = common::scratch_table();
    sqlx::query(&format!("CREATE TABLE {table} (id INT)"))
        .execute(&pool)
        .await?;
    sqlx::query(&format!("INSERT INTO {table} (id) VALUES (1)"))
        .execute(&pool)
        .await?;

    let approval_id = submit_delete(&app, requester, ds, &table).await?;

    let (_, body) = common::send(
        &app,
        "POST",
        &format!("/api/approvals/{approval_id}/transaction-start"),
        reviewer,
        Role::User,
        None,
    )
    .await?;
    let transaction_id = Uuid::parse_str(body["transaction_id"].as_str().unwrap())?;

    // run the supervisor's scan once the deadline has passed
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    let due = app.state.transactions.due(Utc::now());
    assert!(due.contains(&transaction_id));
    let service = TransactionService::new(Arc::clone(&app.state));
    for id in due {
        service.force_timeout(id).await.map_err(|err| anyhow::anyhow!("{err}"))?;
    }

    let tx_status =
        sqlx::query_scalar::<_, String>("SELECT status FROM preview_transactions WHERE id = $1")
            .bind(transaction_id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(tx_status, "timed_out");

    // the delete was rolled back
    let remaining = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(1) FROM {table}"))
        .fetch_one(&pool)
        .await?;
    assert_eq!(remaining, 1);

    let (status, body) = common::send(
        &app,
        "POST",
        &format!("/api/transactions/{transaction_id}/commit"),
        reviewer,
        Role::User,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::GONE, "unexpected body: {body}");
    assert_eq!(body["error"]["kind"], "TransactionExpired");

    common::cleanup(&pool, ds, &[requester, reviewer], Some(&table)).await?;
    Ok(())
}

#[tokio::test]
async fn only_the_owning_reviewer_may_commit() -> Result<()> {
    let Some((pool, database_url)) = common::maybe_connect_pool().await? else {
        return Ok(());
    };
    let app = common::build_app(pool.clone(), &database_url).await?;

    let requester = common::create_user(&pool, Role::User).await?;
    let reviewer = common::create_user(&pool, Role::User).await?;
    let other = common::create_user(&pool, Role::User).await?;
    let ds = common::register_data_source(&app).await?;
    common::grant(&pool, requester, ds, true, true, false).await?;
    common::grant(&pool, reviewer, ds, true, false, true).await?;
    common::grant(&pool, other, ds, true, false, true).await?;

    let table = common::scratch_table();
    sqlx::query(&format!("CREATE TABLE {table} (id INT)"))
        .execute(&pool)
        .await?;
    sqlx::query(&format!("INSERT INTO {table} (id) VALUES (1)"))
        .execute(&pool)
        .await?;

    let approval_id = submit_delete(&app, requester, ds, &table).await?;

    let (_, body) = common::send(
        &app,
        "POST",
        &format!("/api/approvals/{approval_id}/transaction-start"),
        reviewer,
        Role::User,
        None,
    )
    .await?;
    let transaction_id = body["transaction_id"].as_str().unwrap().to_string();

    let (status, body) = common::send(
        &app,
        "POST",
        &format!("/api/transactions/{transaction_id}/commit"),
        other,
        Role::User,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::FORBIDDEN, "unexpected body: {body}");
    assert_eq!(body["error"]["kind"], "PermissionDenied");

    // a second concurrent preview for the same approval is refused
    let (status, body) = common::send(
        &app,
        "POST",
        &format!("/api/approvals/{approval_id}/transaction-start"),
        other,
        Role::User,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT, "unexpected body: {body}");

    // clean exit so the scratch table can be dropped
    let (status, _) = common::send(
        &app,
        "POST",
        &format!("/api/transactions/{transaction_id}/rollback"),
        reviewer,
        Role::User,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    common::cleanup(&pool, ds, &[requester, reviewer, other], Some(&table)).await?;
    Ok(())
}
