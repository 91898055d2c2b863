use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::GatewayState;
use crate::error::{ErrorBody, GatewayError};
use crate::limiter::LimitRequest;
use crate::overrides::{Namespace, NewOverride, RateLimitOverride, Sharding};
use crate::server::auth::Principal;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

const MIN_DURATION_MS: u64 = 1_000;
const MAX_DURATION_MS: u64 = 86_400_000;
const MAX_NAME_LEN: usize = 255;
const MAX_PAGE_SIZE: usize = 100;
const DEFAULT_PAGE_SIZE: usize = 50;

/// Public API entry point. Every operation is a POST with a JSON body;
/// errors carry `{code, message, docs_url, request_id}` and the mapped
/// status, with the success fields omitted.
pub async fn handle_api(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let start = Instant::now();
    let request_id = generate_request_id();
    let path = req.uri().path().to_string();

    let operation = match path.as_str() {
        "/v1/ratelimit.limit" => "limit",
        "/v1/ratelimit.setOverride" => "setOverride",
        "/v1/ratelimit.getOverride" => "getOverride",
        "/v1/ratelimit.listOverrides" => "listOverrides",
        "/v1/ratelimit.deleteOverride" => "deleteOverride",
        _ => {
            let body = serde_json::json!({
                "code": "NOT_FOUND",
                "message": format!("unknown operation: {}", path),
                "docs_url": crate::error::ErrorCode::NotFound.docs_url(),
                "request_id": request_id,
            })
            .to_string();
            return Ok(json_response(StatusCode::NOT_FOUND, body, &request_id));
        }
    };

    metrics::gauge!("aegis_http_requests_in_flight").increment(1.0);

    let outcome = dispatch(req, &state, operation, &request_id).await;

    let response = match outcome {
        Ok(body) => Ok(json_response(StatusCode::OK, body, &request_id)),
        Err(err) => {
            let status = err.code().status();
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                tracing::error!(
                    "api: request failed, operation={}, request_id={}, error={}",
                    operation,
                    request_id,
                    err
                );
            } else {
                tracing::debug!(
                    "api: request rejected, operation={}, request_id={}, error={}",
                    operation,
                    request_id,
                    err
                );
            }
            Ok(error_response(&err, status, &request_id))
        }
    };

    let status = match &response {
        Ok(r) => r.status().as_u16(),
        Err(_) => 500,
    };
    let mut buf = itoa::Buffer::new();
    metrics::counter!(
        "aegis_http_requests_total",
        "operation" => operation,
        "status_code" => buf.format(status).to_owned(),
    )
    .increment(1);
    metrics::histogram!(
        "aegis_http_request_duration_seconds",
        "operation" => operation,
    )
    .record(start.elapsed().as_secs_f64());
    metrics::gauge!("aegis_http_requests_in_flight").decrement(1.0);

    response
}

async fn dispatch(
    req: Request<Incoming>,
    state: &GatewayState,
    operation: &'static str,
    request_id: &str,
) -> Result<String, GatewayError> {
    if req.method() != Method::POST {
        return Err(GatewayError::Validation(format!(
            "{} requires POST",
            operation
        )));
    }

    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let principal = state.auth.authorize(auth_header.as_deref())?;

    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| GatewayError::Validation(format!("failed to read body: {}", e)))?
        .to_bytes();

    match operation {
        "limit" => op_limit(state, &principal, &body, request_id).await,
        "setOverride" => op_set_override(state, &principal, &body).await,
        "getOverride" => op_get_override(state, &principal, &body).await,
        "listOverrides" => op_list_overrides(state, &principal, &body).await,
        "deleteOverride" => op_delete_override(state, &principal, &body).await,
        _ => unreachable!("routed operations only"),
    }
}

// ---------------------------------------------------------------------------
// ratelimit.limit
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LimitBody {
    namespace: String,
    identifier: String,
    limit: u64,
    /// Window length in milliseconds.
    duration: u64,
    #[serde(default)]
    cost: Option<u64>,
    #[serde(default, rename = "async")]
    async_mode: Option<bool>,
}

#[derive(Serialize)]
struct LimitReply {
    success: bool,
    limit: u64,
    remaining: u64,
    /// Unix milliseconds.
    reset: u64,
    #[serde(rename = "overrideId")]
    override_id: String,
}

async fn op_limit(
    state: &GatewayState,
    principal: &Principal,
    body: &[u8],
    request_id: &str,
) -> Result<String, GatewayError> {
    let body: LimitBody = parse_body(body)?;

    validate_name("namespace", &body.namespace)?;
    validate_name("identifier", &body.identifier)?;
    if body.limit < 1 {
        return Err(GatewayError::Validation("limit must be at least 1".into()));
    }
    if !(MIN_DURATION_MS..=MAX_DURATION_MS).contains(&body.duration) {
        return Err(GatewayError::Validation(format!(
            "duration must be within {}..={} ms",
            MIN_DURATION_MS, MAX_DURATION_MS
        )));
    }

    let limit_req = LimitRequest {
        workspace_id: principal.workspace_id.clone(),
        namespace: body.namespace,
        identifier: body.identifier,
        limit: body.limit,
        duration_ms: body.duration,
        cost: body.cost.unwrap_or(1),
        async_mode: body.async_mode.unwrap_or(false),
    };

    let out = state
        .limiter
        .limit(&limit_req, principal.create_namespace)
        .await?;

    tracing::debug!(
        "api: limit decided, request_id={}, passed={}, remaining={}",
        request_id,
        out.passed,
        out.remaining
    );

    serialize_reply(&LimitReply {
        success: out.passed,
        limit: out.limit,
        remaining: out.remaining,
        reset: out.reset_at_ms,
        override_id: out.override_id.unwrap_or_default(),
    })
}

// ---------------------------------------------------------------------------
// Override CRUD
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SetOverrideBody {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default, rename = "namespaceId")]
    namespace_id: Option<String>,
    identifier: String,
    limit: u64,
    duration: u64,
    #[serde(default, rename = "async")]
    async_mode: Option<bool>,
    #[serde(default)]
    sharding: Option<Sharding>,
}

#[derive(Deserialize)]
struct OverrideRefBody {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default, rename = "namespaceId")]
    namespace_id: Option<String>,
    identifier: String,
}

#[derive(Deserialize)]
struct ListOverridesBody {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default, rename = "namespaceId")]
    namespace_id: Option<String>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Serialize)]
struct OverrideReply {
    #[serde(rename = "overrideId")]
    override_id: String,
    #[serde(rename = "namespaceId")]
    namespace_id: String,
    identifier: String,
    limit: u64,
    duration: u64,
    #[serde(rename = "async")]
    async_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    sharding: Option<Sharding>,
}

impl From<&RateLimitOverride> for OverrideReply {
    fn from(ov: &RateLimitOverride) -> Self {
        Self {
            override_id: ov.id.clone(),
            namespace_id: ov.namespace_id.clone(),
            identifier: ov.identifier.clone(),
            limit: ov.limit,
            duration: ov.duration_ms,
            async_mode: ov.async_mode,
            sharding: ov.sharding,
        }
    }
}

#[derive(Serialize)]
struct ListOverridesReply {
    overrides: Vec<OverrideReply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
}

async fn op_set_override(
    state: &GatewayState,
    principal: &Principal,
    body: &[u8],
) -> Result<String, GatewayError> {
    require_override_management(principal)?;
    let body: SetOverrideBody = parse_body(body)?;

    validate_name("identifier", &body.identifier)?;
    if body.limit < 1 {
        return Err(GatewayError::Validation("limit must be at least 1".into()));
    }
    if !(MIN_DURATION_MS..=MAX_DURATION_MS).contains(&body.duration) {
        return Err(GatewayError::Validation(format!(
            "duration must be within {}..={} ms",
            MIN_DURATION_MS, MAX_DURATION_MS
        )));
    }

    let ns = target_namespace(
        state,
        principal,
        body.namespace.as_deref(),
        body.namespace_id.as_deref(),
        // Writing an override into a fresh namespace is allowed for callers
        // that could have auto-created it with a limit call anyway.
        principal.create_namespace,
    )
    .await?;

    let row = state
        .resolver()
        .primary_store()
        .upsert_override(NewOverride {
            namespace_id: ns.id.clone(),
            identifier: body.identifier,
            limit: body.limit,
            duration_ms: body.duration,
            async_mode: body.async_mode.unwrap_or(false),
            sharding: body.sharding,
        })
        .await?;

    state.resolver().invalidate_namespace(&ns.id).await;
    tracing::info!(
        "api: override set, namespace={}, identifier={}, limit={}, duration={}",
        ns.name,
        row.identifier,
        row.limit,
        row.duration_ms
    );

    serialize_reply(&serde_json::json!({ "overrideId": row.id }))
}

async fn op_get_override(
    state: &GatewayState,
    principal: &Principal,
    body: &[u8],
) -> Result<String, GatewayError> {
    let body: OverrideRefBody = parse_body(body)?;
    let ns = target_namespace(
        state,
        principal,
        body.namespace.as_deref(),
        body.namespace_id.as_deref(),
        false,
    )
    .await?;

    let ov = state
        .resolver()
        .primary_store()
        .get_override(&ns.id, &body.identifier)
        .await?
        .ok_or_else(|| GatewayError::OverrideNotFound(body.identifier.clone()))?;

    serialize_reply(&OverrideReply::from(&ov))
}

async fn op_list_overrides(
    state: &GatewayState,
    principal: &Principal,
    body: &[u8],
) -> Result<String, GatewayError> {
    // An empty body lists the workspace's default namespace — still requires
    // a namespace reference, so parse leniently and validate below.
    let body: ListOverridesBody = parse_body(body)?;
    let ns = target_namespace(
        state,
        principal,
        body.namespace.as_deref(),
        body.namespace_id.as_deref(),
        false,
    )
    .await?;

    let page_size = body.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let page = state
        .resolver()
        .primary_store()
        .list_overrides(&ns.id, body.cursor.as_deref(), page_size)
        .await?;

    serialize_reply(&ListOverridesReply {
        overrides: page.overrides.iter().map(OverrideReply::from).collect(),
        cursor: page.cursor,
    })
}

async fn op_delete_override(
    state: &GatewayState,
    principal: &Principal,
    body: &[u8],
) -> Result<String, GatewayError> {
    require_override_management(principal)?;
    let body: OverrideRefBody = parse_body(body)?;
    let ns = target_namespace(
        state,
        principal,
        body.namespace.as_deref(),
        body.namespace_id.as_deref(),
        false,
    )
    .await?;

    let deleted = state
        .resolver()
        .primary_store()
        .delete_override(&ns.id, &body.identifier)
        .await?;
    if !deleted {
        return Err(GatewayError::OverrideNotFound(body.identifier));
    }

    state.resolver().invalidate_namespace(&ns.id).await;
    tracing::info!(
        "api: override deleted, namespace={}, identifier={}",
        ns.name,
        body.identifier
    );

    serialize_reply(&serde_json::json!({}))
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Resolve the namespace an override operation addresses, by id or by name,
/// always scoped to the caller's workspace.
async fn target_namespace(
    state: &GatewayState,
    principal: &Principal,
    namespace: Option<&str>,
    namespace_id: Option<&str>,
    create_if_missing: bool,
) -> Result<Namespace, GatewayError> {
    let store = state.resolver().primary_store();

    if let Some(id) = namespace_id {
        let ns = store
            .namespace_by_id(id)
            .await?
            .ok_or_else(|| GatewayError::NamespaceNotFound(id.to_string()))?;
        // A foreign workspace's namespace is indistinguishable from a
        // missing one.
        if ns.workspace_id != principal.workspace_id {
            return Err(GatewayError::NamespaceNotFound(id.to_string()));
        }
        return Ok(ns);
    }

    let Some(name) = namespace else {
        return Err(GatewayError::Validation(
            "namespace or namespaceId is required".into(),
        ));
    };
    validate_name("namespace", name)?;

    match store
        .namespace_by_name(&principal.workspace_id, name)
        .await?
    {
        Some(ns) => Ok(ns),
        None if create_if_missing => {
            state
                .resolver()
                .resolve_namespace(&principal.workspace_id, name, true)
                .await
        }
        None => Err(GatewayError::NamespaceNotFound(name.to_string())),
    }
}

fn require_override_management(principal: &Principal) -> Result<(), GatewayError> {
    if principal.manage_overrides {
        Ok(())
    } else {
        Err(GatewayError::Forbidden("manage_overrides".into()))
    }
}

fn parse_body<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, GatewayError> {
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::Validation(format!("malformed payload: {}", e)))
}

fn validate_name(field: &str, value: &str) -> Result<(), GatewayError> {
    if value.is_empty() || value.len() > MAX_NAME_LEN {
        return Err(GatewayError::Validation(format!(
            "{} length must be within 1..={}",
            field, MAX_NAME_LEN
        )));
    }
    Ok(())
}

fn serialize_reply<T: Serialize>(value: &T) -> Result<String, GatewayError> {
    serde_json::to_string(value).map_err(|e| GatewayError::Internal(e.to_string()))
}

fn json_response(status: StatusCode, body: String, request_id: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("x-request-id", request_id)
        .body(full_body(body))
        .unwrap()
}

fn error_response(
    err: &GatewayError,
    status: StatusCode,
    request_id: &str,
) -> Response<BoxBody> {
    let body = serde_json::to_string(&ErrorBody::from_error(err, request_id))
        .unwrap_or_else(|_| r#"{"code":"INTERNAL_SERVER_ERROR"}"#.to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("x-request-id", request_id)
        .body(full_body(body))
        .unwrap()
}

fn generate_request_id() -> String {
    format!("req_{:016x}", rand::random::<u64>())
}
