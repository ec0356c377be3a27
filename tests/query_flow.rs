mod common;

use anyhow::Result;
use axum::http::StatusCode;
use query_gateway::domain::models::Role;
use serde_json::json;

#[tokio::test]
async fn select_runs_synchronously_and_lands_in_history() -> Result<()> {
    let Some((pool, database_url)) = common::maybe_connect_pool().await? else {
        return Ok(());
    };
    let app = common::build_app(pool.clone(), &database_url).await?;

    let user = common::create_user(&pool, Role::User).await?;
    let ds = common::register_data_source(&app).await?;
    common::grant(&pool, user, ds, true, false, false).await?;

    let (status, body) = common::send(
        &app,
        "POST",
        "/api/queries",
        user,
        Role::User,
        Some(json!({ "data_source_id": ds, "text": "SELECT 1 AS x" })),
    )
    .await?;

    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["row_count"], 1);
    assert_eq!(body["columns"][0]["name"], "x");
    assert_eq!(body["columns"][0]["type"], "INT4");
    assert_eq!(body["data"][0]["x"], 1);

    let query_id = body["query_id"].as_str().unwrap().to_string();

    // the history row and its captured result both exist
    let (status, detail) = common::send(
        &app,
        "GET",
        &format!("/api/queries/{query_id}"),
        user,
        Role::User,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["query"]["operation"], "select");
    assert_eq!(detail["query"]["status"], "completed");
    assert_eq!(detail["result"]["row_count"], 1);
    assert_eq!(detail["result"]["column_names"][0], "x");

    common::cleanup(&pool, ds, &[user], None).await?;
    Ok(())
}

#[tokio::test]
async fn submission_without_read_permission_is_denied_but_recorded() -> Result<()> {
    let Some((pool, database_url)) = common::maybe_connect_pool().await? else {
        return Ok(());
    };
    let app = common::build_app(pool.clone(), &database_url).await?;

    let user = common::create_user(&pool, Role::User).await?;
    let ds = common::register_data_source(&app).await?;
    // membership exists but carries no read grant
    common::grant(&pool, user, ds, false, false, false).await?;

    let (status, body) = common::send(
        &app,
        "POST",
        "/api/queries",
        user,
        Role::User,
        Some(json!({ "data_source_id": ds, "text": "SELECT 1" })),
    )
    .await?;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["kind"], "PermissionDenied");

    // history still captured the failed submission
    let recorded = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM queries WHERE data_source_id = $1 AND status = 'failed'",
    )
    .bind(ds)
    .fetch_one(&pool)
    .await?;
    assert_eq!(recorded, 1);

    common::cleanup(&pool, ds, &[user], None).await?;
    Ok(())
}

#[tokio::test]
async fn viewer_cannot_submit_writes() -> Result<()> {
    let Some((pool, database_url)) = common::maybe_connect_pool().await? else {
        return Ok(());
    };
    let app = common::build_app(pool.clone(), &database_url).await?;

    let viewer = common::create_user(&pool, Role::Viewer).await?;
    let ds = common::register_data_source(&app).await?;
    // even an explicit write grant is capped away by the viewer role
    common::grant(&pool, viewer, ds, true, true, true).await?;

    let (status, body) = common::send(
        &app,
        "POST",
        "/api/queries",
        viewer,
        Role::Viewer,
        Some(json!({ "data_source_id": ds, "text": "DELETE FROM missing_table WHERE id = 1" })),
    )
    .await?;

    assert_eq!(status, StatusCode::FORBIDDEN, "unexpected body: {body}");
    assert_eq!(body["error"]["kind"], "PermissionDenied");

    common::cleanup(&pool, ds, &[viewer], None).await?;
    Ok(())
}

#[tokio::test]
async fn row_limit_above_ceiling_is_rejected() -> Result<()> {
    let Some((pool, database_url)) = common::maybe_connect_pool().await? else {
        return Ok(());
    };
    let app = common::build_app(pool.clone(), &database_url).await?;

    let user = common::create_user(&pool, Role::User).await?;
    let ds = common::register_data_source(&app).await?;
    common::grant(&pool, user, ds, true, false, false).await?;

    let (status, body) = common::send(
        &app,
        "POST",
        "/api/queries",
        user,
        Role::User,
        Some(json!({ "data_source_id": ds, "text": "SELECT 1", "row_limit": 1_000_000 })),
    )
    .await?;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "InvalidArgument");

    common::cleanup(&pool, ds, &[user], None).await?;
    Ok(())
}

#[tokio::test]
async fn validate_reports_operation_and_tables() -> Result<()> {
    let Some((pool, database_url)) = common::maybe_connect_pool().await? else {
        return Ok(());
    };
    let app = common::build_app(pool.clone(), &database_url).await?;

    let user = common::create_user(&pool, Role::User).await?;
    let ds = common::register_data_source(&app).await?;
    common::grant(&pool, user, ds, true, false, false).await?;

    let (status, body) = common::send(
        &app,
        "POST",
        "/api/queries/validate",
        user,
        Role::User,
        Some(json!({ "data_source_id": ds, "text": "SELECT * FROM orders o JOIN items i ON i.order_id = o.id" })),
    )
    .await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["operation"], "select");
    assert_eq!(body["referenced_tables"], json!(["orders", "items"]));

    let (status, body) = common::send(
        &app,
        "POST",
        "/api/queries/validate",
        user,
        Role::User,
        Some(json!({ "data_source_id": ds, "text": "SELECT 1; SELECT 2" })),
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "MultiStatementForbidden");

    common::cleanup(&pool, ds, &[user], None).await?;
    Ok(())
}

#[tokio::test]
async fn explain_returns_plan_rows_and_guards_analyze() -> Result<()> {
    let Some((pool, database_url)) = common::maybe_connect_pool().await? else {
        return Ok(());
    };
    let app = common::build_app(pool.clone(), &database_url).await?;

    let user = common::create_user(&pool, Role::User).await?;
    let ds = common::register_data_source(&app).await?;
    common::grant(&pool, user, ds, true, false, false).await?;

    let (status, body) = common::send(
        &app,
        "POST",
        "/api/queries/explain",
        user,
        Role::User,
        Some(json!({ "data_source_id": ds, "text": "SELECT 1" })),
    )
    .await?;

    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    assert!(!body["plan"].as_array().unwrap().is_empty());
    assert!(body["raw_output"].as_str().unwrap().contains("Result"));

    // ANALYZE over a write would execute it
    let (status, body) = common::send(
        &app,
        "POST",
        "/api/queries/explain",
        user,
        Role::User,
        Some(json!({ "data_source_id": ds, "text": "DELETE FROM t WHERE id = 1", "analyze": true })),
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "InvalidArgument");

    common::cleanup(&pool, ds, &[user], None).await?;
    Ok(())
}

#[tokio::test]
async fn dry_run_previews_delete_without_deleting() -> Result<()> {
    let Some((pool, database_url)) = common::maybe_connect_pool().await? else {
        return Ok(());
    };
    let app = common::build_app(pool.clone(), &database_url).await?;

    let user = common::create_user(&pool, Role::User).await?;
    let ds = common::register_data_source(&app).await?;
    common::grant(&pool, user, ds, true, true, false).await?;

    let table = common::scratch_table();
    sqlx::query(&format!("CREATE TABLE {table} (x INT)"))
        .execute(&pool)
        .await?;
    sqlx::query(&format!("INSERT INTO {table} (x) VALUES (1), (5), (20)"))
        .execute(&pool)
        .await?;

    let (status, body) = common::send(
        &app,
        "POST",
        "/api/queries/dry-run",
        user,
        Role::User,
        Some(json!({ "data_source_id": ds, "text": format!("DELETE FROM {table} WHERE x < 10") })),
    )
    .await?;

    assert_eq!(status, StatusCode::OK, "unexpected body: {body}");
    assert_eq!(body["affected_rows"], 2);
    assert_eq!(
        body["rewritten_query"],
        format!("SELECT * FROM {table} WHERE x < 10")
    );
    assert_eq!(body["rows"].as_array().unwrap().len(), 2);

    // nothing was deleted and no preview transaction was opened
    let remaining =
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(1) FROM {table}"))
            .fetch_one(&pool)
            .await?;
    assert_eq!(remaining, 3);
    let previews = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM preview_transactions WHERE data_source_id = $1",
    )
    .bind(ds)
    .fetch_one(&pool)
    .await?;
    assert_eq!(previews, 0);

    // non-trivial DELETE shapes refuse instead of misleading
    let (status, body) = common::send(
        &app,
        "POST",
        "/api/queries/dry-run",
        user,
        Role::User,
        Some(json!({ "data_source_id": ds, "text": format!("DELETE FROM {table} USING other WHERE {table}.x = other.x") })),
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["kind"], "DryRunUnsupported");

    common::cleanup(&pool, ds, &[user], Some(&table)).await?;
    Ok(())
}
