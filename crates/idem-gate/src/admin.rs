use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use idem_guard::{ExecutionGuard, codes};
use serde::Deserialize;

use crate::error::ApiError;

/// Operator endpoints: metrics scrape and audit reconciliation.
pub fn admin_router(guard: ExecutionGuard) -> Router {
    Router::new()
        .route("/admin/metrics", get(metrics))
        .route("/admin/idempotency/audit-summary", get(audit_summary))
        .with_state(guard)
}

async fn metrics(State(guard): State<ExecutionGuard>) -> Result<Response, ApiError> {
    let text = guard.metrics().encode_text().map_err(|e| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "METRICS_UNAVAILABLE",
            e.to_string(),
        )
    })?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    tenant: Option<String>,
    operation: Option<String>,
    since_ms: Option<i64>,
}

async fn audit_summary(
    State(guard): State<ExecutionGuard>,
    Query(query): Query<SummaryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = query
        .tenant
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::bad_request("tenant is required"))?;
    let since_ms = query.since_ms.unwrap_or(0);
    let summary = guard
        .audit()
        .summarize(&tenant, query.operation.as_deref(), since_ms)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "audit summary query failed");
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::IDEMPOTENCY_STORE_UNAVAILABLE,
                e.to_string(),
            )
        })?;
    Ok(Json(serde_json::json!({
        "tenant": tenant,
        "operation": query.operation,
        "since_ms": since_ms,
        "executed": summary.executed,
        "deduplicated": summary.deduplicated,
        "conflict": summary.conflict,
        "rejected": summary.rejected,
        "failed": summary.failed,
        "total": summary.total(),
    })))
}
