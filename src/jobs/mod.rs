//! Side-channel background workers. Nothing here sits on the query critical
//! path: the supervisor times out overdue previews, the notification worker
//! drains events onto the Redis queue for external consumers.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::models::{OperationKind, ReviewDecision};
use crate::infrastructure::state::AppState;
use crate::services::transactions::TransactionService;

/// Events consumed by the external notification sender. Serialized as JSON
/// and pushed onto the configured Redis list.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    RequestCreated {
        approval_id: Uuid,
        query_id: Uuid,
        data_source_id: Uuid,
        requester_id: Uuid,
        operation: OperationKind,
    },
    ReviewDecided {
        approval_id: Uuid,
        reviewer_id: Uuid,
        decision: ReviewDecision,
    },
    TransactionCommitted {
        transaction_id: Uuid,
        approval_id: Uuid,
        reviewer_id: Uuid,
    },
    TransactionRolledBack {
        transaction_id: Uuid,
        approval_id: Uuid,
        reviewer_id: Uuid,
    },
    TransactionTimedOut {
        transaction_id: Uuid,
        approval_id: Uuid,
    },
}

/// Single long-lived task that rolls back previews whose deadline passed.
/// It is the only caller of the timed-out transition.
pub fn spawn_timeout_supervisor(state: Arc<AppState>) -> JoinHandle<()> {
    let interval = state.config.supervisor_interval();
    tokio::spawn(async move {
        let service = TransactionService::new(Arc::clone(&state));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let due = state.transactions.due(Utc::now());
            for transaction_id in due {
                if let Err(err) = service.force_timeout(transaction_id).await {
                    warn!(%transaction_id, error = %err, "failed to time out preview transaction");
                }
            }
        }
    })
}

pub fn spawn_notification_worker(
    state: Arc<AppState>,
    mut events: UnboundedReceiver<NotificationEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pool = build_redis_pool(&state);
        let queue_key = state.config.redis.queue_key.clone();
        if pool.is_none() {
            info!("redis.url not configured; notification events will only be logged");
        }

        while let Some(event) = events.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "failed to serialize notification event");
                    continue;
                }
            };

            match &pool {
                Some(pool) => {
                    if let Err(err) = push_event(pool, &queue_key, &payload).await {
                        warn!(error = %err, "failed to enqueue notification event");
                    }
                }
                None => debug!(payload, "notification event"),
            }
        }
    })
}

fn build_redis_pool(state: &AppState) -> Option<deadpool_redis::Pool> {
    let url = state.config.redis.url.as_deref()?;
    match deadpool_redis::Config::from_url(url).create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => Some(pool),
        Err(err) => {
            warn!(error = %err, "failed to create redis pool; notifications degraded to logs");
            None
        }
    }
}

async fn push_event(
    pool: &deadpool_redis::Pool,
    queue_key: &str,
    payload: &str,
) -> anyhow::Result<()> {
    use deadpool_redis::redis::AsyncCommands;

    let mut conn = pool.get().await?;
    conn.lpush::<_, _, ()>(queue_key, payload).await?;
    Ok(())
}
