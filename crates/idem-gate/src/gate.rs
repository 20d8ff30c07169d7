//! Route registration for mutating endpoints.
//!
//! Every mutating route is built through [`RouteGate`]. Registration checks
//! the operation against the mutation registry and fails if it is missing or
//! carries a different risk tier than the gate being used. At request time
//! the gate resolves the caller, checks the `Idempotency-Key` header and the
//! operation's permissions, then hands the body to the execution guard.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, post};
use idem_guard::{
    ExecutionGuard, GuardError, HandlerError, HandlerResult, RejectedAttempt, WriteContext, codes,
    validate_idempotency_key,
};
use idem_registry::{MutationDescriptor, RiskTier};
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::access::{AccessControl, Caller, header_str};
use crate::error::{ApiError, GateError, GateResult};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const REPLAY_HEADER: &str = "x-idempotent-replay";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Input handed to a gated handler once the request has a claim.
#[derive(Clone, Debug)]
pub struct GatedRequest {
    pub caller: Caller,
    pub operation_name: String,
    pub idempotency_key: String,
    pub correlation_id: String,
    pub body: Vec<u8>,
}

impl GatedRequest {
    /// Decode the body, mapping failures to a 400 handler error.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.body).map_err(|e| {
            HandlerError::new(400, codes::INVALID_REQUEST, format!("decode json: {e}"))
        })
    }
}

#[derive(Clone)]
pub struct RouteGate {
    guard: ExecutionGuard,
    access: Arc<dyn AccessControl>,
}

impl RouteGate {
    pub fn new(guard: ExecutionGuard, access: Arc<dyn AccessControl>) -> Self {
        Self { guard, access }
    }

    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    /// POST route for an operation registered as `FINANCIAL`.
    pub fn register_financial_route<S, H, Fut>(
        &self,
        operation: &str,
        handler: H,
    ) -> GateResult<MethodRouter<S>>
    where
        S: Clone + Send + Sync + 'static,
        H: Fn(GatedRequest) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(operation, RiskTier::Financial, handler)
    }

    /// POST route for an operation registered as `HIGH_RISK`.
    pub fn register_high_risk_route<S, H, Fut>(
        &self,
        operation: &str,
        handler: H,
    ) -> GateResult<MethodRouter<S>>
    where
        S: Clone + Send + Sync + 'static,
        H: Fn(GatedRequest) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(operation, RiskTier::HighRisk, handler)
    }

    fn register<S, H, Fut>(
        &self,
        operation: &str,
        gated: RiskTier,
        handler: H,
    ) -> GateResult<MethodRouter<S>>
    where
        S: Clone + Send + Sync + 'static,
        H: Fn(GatedRequest) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let descriptor = self
            .guard
            .registry()
            .lookup(operation)
            .map_err(|_| GateError::NotRegistered(operation.to_string()))?;
        if descriptor.risk_tier != gated {
            return Err(GateError::TierMismatch {
                operation: operation.to_string(),
                registered: descriptor.risk_tier,
                gated,
            });
        }
        tracing::info!(operation, tier = %gated, "gated route registered");

        let route = GatedRoute {
            gate: self.clone(),
            descriptor: Arc::new(descriptor.clone()),
            handler,
        };
        Ok(post(move |headers: HeaderMap, body: Bytes| {
            let route = route.clone();
            async move { route.handle(headers, body).await }
        }))
    }
}

#[derive(Clone)]
struct GatedRoute<H> {
    gate: RouteGate,
    descriptor: Arc<MutationDescriptor>,
    handler: H,
}

impl<H, Fut> GatedRoute<H>
where
    H: Fn(GatedRequest) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(self, headers: HeaderMap, body: Bytes) -> Response {
        let started = Instant::now();
        let operation_name = self.descriptor.operation_name.clone();
        let correlation_id = header_str(&headers, CORRELATION_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let max_key_len = self.gate.guard.config().max_key_len;
        let key = idempotency_key(&headers, max_key_len);

        let mut attempt = RejectedAttempt {
            operation_name: operation_name.clone(),
            tenant_id: None,
            idempotency_key: key.as_ref().ok().cloned(),
            actor_id: None,
            correlation_id: correlation_id.clone(),
        };

        let caller = self.gate.access.caller(&headers).await;
        if let Some(caller) = &caller {
            attempt.tenant_id = Some(caller.tenant_id.clone());
            attempt.actor_id = caller.actor_id.clone();
        }

        let key = match key {
            Ok(key) => key,
            Err(err) => return self.reject(attempt, started, err).await,
        };
        let Some(caller) = caller else {
            return self
                .reject(attempt, started, ApiError::unauthenticated())
                .await;
        };
        if !self
            .gate
            .access
            .authorize(&caller, &self.descriptor.required_permissions)
            .await
        {
            let err = ApiError::forbidden(&operation_name);
            return self.reject(attempt, started, err).await;
        }

        let ctx = WriteContext {
            tenant_id: caller.tenant_id.clone(),
            operation_name: operation_name.clone(),
            idempotency_key: key.clone(),
            actor_id: caller.actor_id.clone(),
            correlation_id: correlation_id.clone(),
        };
        let request = GatedRequest {
            caller,
            operation_name,
            idempotency_key: key,
            correlation_id: correlation_id.clone(),
            body: Vec::new(),
        };
        let handler = self.handler.clone();
        let outcome = self
            .gate
            .guard
            .with_idempotent_write(ctx, body.to_vec(), move |payload| {
                handler(GatedRequest {
                    body: payload,
                    ..request
                })
            })
            .await;

        let mut response = match outcome {
            Ok(result) => {
                let status = StatusCode::from_u16(result.status_code)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let mut response = (
                    status,
                    [(header::CONTENT_TYPE, "application/json")],
                    result.payload,
                )
                    .into_response();
                if result.replayed {
                    response.headers_mut().insert(
                        HeaderName::from_static(REPLAY_HEADER),
                        HeaderValue::from_static("true"),
                    );
                }
                response
            }
            Err(err) => ApiError::from(err).into_response(),
        };
        with_correlation_id(&mut response, &correlation_id);
        response
    }

    async fn reject(self, attempt: RejectedAttempt, started: Instant, err: ApiError) -> Response {
        tracing::debug!(
            operation = %attempt.operation_name,
            code = err.code(),
            "request rejected at the gate"
        );
        let correlation_id = attempt.correlation_id.clone();
        self.gate.guard.record_rejection(attempt, started).await;
        let mut response = err.into_response();
        with_correlation_id(&mut response, &correlation_id);
        response
    }
}

fn idempotency_key(headers: &HeaderMap, max_len: usize) -> Result<String, ApiError> {
    let Some(raw) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Err(ApiError::missing_key());
    };
    let key = raw
        .to_str()
        .map_err(|_| GuardError::InvalidKey("key must be visible ASCII".into()))?;
    validate_idempotency_key(key, max_len)?;
    Ok(key.to_string())
}

fn with_correlation_id(response: &mut Response, correlation_id: &str) {
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(CORRELATION_HEADER), value);
    }
}
