use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};

use super::GatewayState;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            let (status, body) = if state.is_ready() {
                (
                    200,
                    format!(
                        r#"{{"status":"ready","members":{},"counters":{}}}"#,
                        state.membership.alive_members().len(),
                        state.limiter.counters().len(),
                    ),
                )
            } else {
                (503, r#"{"status":"starting"}"#.to_string())
            };
            Ok(Response::builder()
                .status(status)
                .body(full_body(body))
                .unwrap())
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/cluster" => {
            let ring = state.membership.ring();
            let members: Vec<serde_json::Value> = state
                .membership
                .member_table()
                .into_iter()
                .map(|(m, peer_state, incarnation)| {
                    let joined_at = std::time::SystemTime::UNIX_EPOCH
                        + std::time::Duration::from_millis(m.joined_at_ms);
                    serde_json::json!({
                        "nodeId": m.node_id,
                        "advertiseAddr": m.advertise_addr,
                        "rpcPort": m.rpc_port,
                        "gossipPort": m.gossip_port,
                        "state": format!("{:?}", peer_state).to_lowercase(),
                        "incarnation": incarnation,
                        "joinedAt": humantime::format_rfc3339_seconds(joined_at).to_string(),
                        "onRing": ring.contains(&m.node_id),
                    })
                })
                .collect();

            let breakers: Vec<serde_json::Value> = state
                .limiter
                .breakers()
                .table()
                .into_iter()
                .map(|(owner, breaker_state)| {
                    serde_json::json!({ "owner": owner, "state": breaker_state })
                })
                .collect();

            let body = serde_json::to_string_pretty(&serde_json::json!({
                "self": state.membership.local().node_id,
                "incarnation": state.membership.incarnation(),
                "ringMembers": ring.len(),
                "batchQueueDepth": state.limiter.batcher().depth(),
                "breakers": breakers,
                "members": members,
            }))
            .unwrap_or_default();

            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
