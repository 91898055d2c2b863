use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

use super::{Member, Membership};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Delta convergence from a non-owner to the owning node.
///
/// `granted = true` carries edge-granted traffic: the owner merges it
/// unconditionally, past the limit if need be. `granted = false` is a
/// synchronous admission request and the owner's sliding-window decision is
/// authoritative. `request_id` makes retries idempotent — the owner replays
/// the original response from its dedupe window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushCounterRequest {
    pub request_id: String,
    pub namespace_id: String,
    pub identifier: String,
    pub delta: u64,
    pub window_start_ms: u64,
    pub limit: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub granted: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PushCounterResponse {
    /// Authoritative effective count after the push.
    pub current: u64,
    /// False when the authoritative count has consumed the full limit.
    pub passed: bool,
    pub reset_at_ms: u64,
}

/// Fan-out from the owner when its authoritative count crossed the limit.
/// Recipients pin their local counter to deny until `reset_at_ms`. The
/// limit rides along so recipients can address the exact counter; the
/// duration is `reset_at_ms - window_start_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastExceededRequest {
    pub namespace_id: String,
    pub identifier: String,
    pub limit: u64,
    pub window_start_ms: u64,
    pub reset_at_ms: u64,
}

/// The operations a node exposes to its peers. Implemented by the limiter
/// coordinator; the transport below stays protocol-only.
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn push_counter(&self, req: PushCounterRequest) -> PushCounterResponse;

    async fn broadcast_exceeded(&self, req: BroadcastExceededRequest);
}

/// Serve peer RPC until shutdown. Requests from source addresses outside
/// the current membership are rejected before the body is read.
pub async fn run_rpc_server(
    listener: TcpListener,
    service: Arc<dyn RpcService>,
    membership: Arc<Membership>,
    shutdown: Arc<Notify>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("rpc: listening, addr={}", addr);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("rpc: listener stopped");
                return Ok(());
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("rpc: accept failed, error={}", e);
                continue;
            }
        };

        let service = Arc::clone(&service);
        let membership = Arc::clone(&membership);

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let service = Arc::clone(&service);
                let membership = Arc::clone(&membership);
                async move { handle_rpc(req, service, membership, peer_addr).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    tracing::debug!("rpc: connection error, peer={}, error={}", peer_addr, e);
                }
            }
        });
    }
}

async fn handle_rpc(
    req: Request<Incoming>,
    service: Arc<dyn RpcService>,
    membership: Arc<Membership>,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    if !membership.is_member_addr(peer_addr.ip()) {
        metrics::counter!("aegis_acl_rejected_total", "listener" => "rpc").increment(1);
        tracing::debug!("rpc: rejected non-member, addr={}", peer_addr);
        return Ok(status_response(
            StatusCode::FORBIDDEN,
            r#"{"error":"not a cluster member"}"#,
        ));
    }

    let path = req.uri().path().to_string();
    let body = req.into_body().collect().await?.to_bytes();

    match path.as_str() {
        "/rpc/push_counter" => {
            let push: PushCounterRequest = match serde_json::from_slice(&body) {
                Ok(p) => p,
                Err(e) => {
                    return Ok(status_response(
                        StatusCode::BAD_REQUEST,
                        &format!(r#"{{"error":"malformed push: {}"}}"#, e),
                    ))
                }
            };
            let start = std::time::Instant::now();
            let resp = service.push_counter(push).await;
            metrics::histogram!("aegis_rpc_push_duration_seconds", "side" => "server")
                .record(start.elapsed().as_secs_f64());
            Ok(json_response(&resp))
        }
        "/rpc/broadcast_exceeded" => {
            let bc: BroadcastExceededRequest = match serde_json::from_slice(&body) {
                Ok(b) => b,
                Err(e) => {
                    return Ok(status_response(
                        StatusCode::BAD_REQUEST,
                        &format!(r#"{{"error":"malformed broadcast: {}"}}"#, e),
                    ))
                }
            };
            service.broadcast_exceeded(bc).await;
            Ok(status_response(StatusCode::OK, r#"{"ok":true}"#))
        }
        _ => Ok(status_response(
            StatusCode::NOT_FOUND,
            r#"{"error":"not found"}"#,
        )),
    }
}

fn json_response<T: Serialize>(value: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(value).unwrap_or_default();
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}

fn status_response(status: StatusCode, body: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}

/// Outbound peer RPC. Cheaply cloneable — the underlying `reqwest::Client`
/// holds its pool behind an `Arc`. Every call carries the configured
/// deadline; there is no retry here, the batcher and breaker own that
/// policy off the hot path.
#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
}

impl RpcClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http })
    }

    pub async fn push_counter(
        &self,
        owner: &Member,
        req: &PushCounterRequest,
    ) -> anyhow::Result<PushCounterResponse> {
        let start = std::time::Instant::now();
        let resp = self
            .http
            .post(format!("http://{}/rpc/push_counter", owner.rpc_addr()))
            .json(req)
            .send()
            .await?;
        metrics::histogram!("aegis_rpc_push_duration_seconds", "side" => "client")
            .record(start.elapsed().as_secs_f64());

        if !resp.status().is_success() {
            anyhow::bail!("push_counter to {} failed: {}", owner.node_id, resp.status());
        }
        Ok(resp.json().await?)
    }

    pub async fn broadcast_exceeded(
        &self,
        peer: &Member,
        req: &BroadcastExceededRequest,
    ) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(format!(
                "http://{}/rpc/broadcast_exceeded",
                peer.rpc_addr()
            ))
            .json(req)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!(
                "broadcast_exceeded to {} failed: {}",
                peer.node_id,
                resp.status()
            );
        }
        Ok(())
    }
}
