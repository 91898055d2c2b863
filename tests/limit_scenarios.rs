//! End-to-end scenarios for a single node through the public HTTP API.

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use aegis_gateway::cluster::{Member, Membership, MembershipConfig};
use aegis_gateway::config::{AuthConfig, CacheConfig, GatewayConfig, LimiterConfig, TokenConfig};
use aegis_gateway::counter::{unix_ms, CounterStore};
use aegis_gateway::limiter::Limiter;
use aegis_gateway::overrides::{MemoryPrimaryStore, OverrideResolver};
use aegis_gateway::server::{run_api_server, GatewayState};

const FULL_TOKEN: &str = "root_full_access";
const READONLY_TOKEN: &str = "root_readonly";

struct ApiNode {
    base_url: String,
    http: reqwest::Client,
    shutdown: Arc<Notify>,
}

impl ApiNode {
    async fn spawn() -> Self {
        let mut config = GatewayConfig::default();
        config.auth = AuthConfig {
            tokens: vec![
                TokenConfig {
                    token: FULL_TOKEN.to_string(),
                    workspace_id: "ws_1".to_string(),
                    create_namespace: true,
                    manage_overrides: true,
                },
                TokenConfig {
                    token: READONLY_TOKEN.to_string(),
                    workspace_id: "ws_1".to_string(),
                    create_namespace: false,
                    manage_overrides: false,
                },
            ],
        };

        let membership = Membership::detached(
            Member {
                node_id: "api-node".to_string(),
                advertise_addr: "127.0.0.1".to_string(),
                rpc_port: 1,
                gossip_port: 2,
                joined_at_ms: 0,
            },
            MembershipConfig {
                probe_interval_ms: 60_000,
                probe_timeout_ms: 1_000,
                suspect_timeout_ms: 300_000,
                fanout: 1,
                vnodes: 64,
            },
        );

        let store = Arc::new(MemoryPrimaryStore::new());
        let resolver = OverrideResolver::new(store, &CacheConfig::default());
        let limiter = Limiter::new(
            Arc::new(CounterStore::new()),
            resolver,
            membership.clone(),
            LimiterConfig::default(),
        )
        .unwrap();

        let state = GatewayState::assemble(config, limiter, membership);
        state.set_ready();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = Arc::new(Notify::new());

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let _ = run_api_server(listener, state, shutdown).await;
            }
        });

        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            http: reqwest::Client::new(),
            shutdown,
        }
    }

    async fn call(
        &self,
        operation: &str,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> (u16, serde_json::Value) {
        let mut req = self
            .http
            .post(format!("{}/v1/ratelimit.{}", self.base_url, operation))
            .json(&body);
        if let Some(t) = token {
            req = req.header("authorization", format!("Bearer {}", t));
        }
        let resp = req.send().await.unwrap();
        let status = resp.status().as_u16();
        let value = resp.json().await.unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    async fn limit(&self, token: &str, body: serde_json::Value) -> (u16, serde_json::Value) {
        self.call("limit", Some(token), body).await
    }
}

impl Drop for ApiNode {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

#[tokio::test]
async fn test_burst_within_one_window() {
    let node = ApiNode::spawn().await;
    let before = unix_ms();

    for i in 0..10u64 {
        let (status, body) = node
            .limit(
                FULL_TOKEN,
                serde_json::json!({
                    "namespace": "email.send",
                    "identifier": "user@acme.com",
                    "limit": 10,
                    "duration": 60_000
                }),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["success"], true, "call {} should pass: {}", i, body);
        assert_eq!(body["limit"], 10);
        assert_eq!(body["remaining"], 9 - i);
        assert_eq!(body["overrideId"], "");
    }

    for _ in 0..2 {
        let (status, body) = node
            .limit(
                FULL_TOKEN,
                serde_json::json!({
                    "namespace": "email.send",
                    "identifier": "user@acme.com",
                    "limit": 10,
                    "duration": 60_000
                }),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["success"], false);
        assert_eq!(body["remaining"], 0);

        let reset = body["reset"].as_u64().unwrap();
        assert!(reset > before, "reset must be in the future");
        assert!(reset <= before + 60_000 + 1_000, "reset within one window");
    }
}

#[tokio::test]
async fn test_cost_boundaries() {
    let node = ApiNode::spawn().await;
    let base = serde_json::json!({
        "namespace": "cost.ns",
        "identifier": "edge-user",
        "limit": 10,
        "duration": 60_000
    });

    // cost = limit exactly fills the window.
    let mut fill = base.clone();
    fill["cost"] = serde_json::json!(10);
    let (_, body) = node.limit(FULL_TOKEN, fill).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["remaining"], 0);

    // cost = 0 peeks and always passes, even exhausted.
    let mut peek = base.clone();
    peek["cost"] = serde_json::json!(0);
    let (_, body) = node.limit(FULL_TOKEN, peek).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["remaining"], 0);

    // cost = limit + 1 on a fresh identifier always denies without mutating.
    let over = serde_json::json!({
        "namespace": "cost.ns",
        "identifier": "other-user",
        "limit": 10,
        "duration": 60_000,
        "cost": 11
    });
    let (_, body) = node.limit(FULL_TOKEN, over).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["remaining"], 10);
}

#[tokio::test]
async fn test_validation_errors() {
    let node = ApiNode::spawn().await;

    for bad in [
        serde_json::json!({"namespace": "n", "identifier": "i", "limit": 0, "duration": 60_000}),
        serde_json::json!({"namespace": "n", "identifier": "i", "limit": 5, "duration": 500}),
        serde_json::json!({"namespace": "n", "identifier": "i", "limit": 5, "duration": 90_000_000}),
        serde_json::json!({"namespace": "", "identifier": "i", "limit": 5, "duration": 60_000}),
        serde_json::json!({"namespace": "n".repeat(300), "identifier": "i", "limit": 5, "duration": 60_000}),
    ] {
        let (status, body) = node.limit(FULL_TOKEN, bad).await;
        assert_eq!(status, 400);
        assert_eq!(body["code"], "BAD_REQUEST");
        assert!(body["request_id"].as_str().unwrap().starts_with("req_"));
        assert!(body.get("success").is_none(), "no success field on errors");
    }
}

#[tokio::test]
async fn test_auth_and_permission_errors() {
    let node = ApiNode::spawn().await;
    let body = serde_json::json!({
        "namespace": "auth.ns",
        "identifier": "u",
        "limit": 5,
        "duration": 60_000
    });

    let (status, reply) = node.call("limit", None, body.clone()).await;
    assert_eq!(status, 401);
    assert_eq!(reply["code"], "UNAUTHORIZED");

    let (status, _) = node.call("limit", Some("bogus"), body.clone()).await;
    assert_eq!(status, 401);

    // Readonly caller may not auto-create the namespace.
    let (status, reply) = node.call("limit", Some(READONLY_TOKEN), body).await;
    assert_eq!(status, 404);
    assert_eq!(reply["code"], "NOT_FOUND");

    // Nor manage overrides.
    let (status, reply) = node
        .call(
            "setOverride",
            Some(READONLY_TOKEN),
            serde_json::json!({
                "namespace": "auth.ns",
                "identifier": "x",
                "limit": 5,
                "duration": 60_000
            }),
        )
        .await;
    assert_eq!(status, 403);
    assert_eq!(reply["code"], "FORBIDDEN");
}

#[tokio::test]
async fn test_wildcard_precedence_through_api() {
    let node = ApiNode::spawn().await;

    let (status, _) = node
        .call(
            "setOverride",
            Some(FULL_TOKEN),
            serde_json::json!({
                "namespace": "mail",
                "identifier": "*@acme.com",
                "limit": 100,
                "duration": 60_000
            }),
        )
        .await;
    assert_eq!(status, 200);

    let (status, _) = node
        .call(
            "setOverride",
            Some(FULL_TOKEN),
            serde_json::json!({
                "namespace": "mail",
                "identifier": "ceo@acme.com",
                "limit": 10,
                "duration": 60_000
            }),
        )
        .await;
    assert_eq!(status, 200);

    let limit_of = |identifier: &str| {
        serde_json::json!({
            "namespace": "mail",
            "identifier": identifier,
            "limit": 7,
            "duration": 60_000
        })
    };

    let (_, body) = node.limit(FULL_TOKEN, limit_of("ceo@acme.com")).await;
    assert_eq!(body["limit"], 10, "exact override wins: {}", body);
    assert_ne!(body["overrideId"], "");

    let (_, body) = node.limit(FULL_TOKEN, limit_of("eng@acme.com")).await;
    assert_eq!(body["limit"], 100, "wildcard override applies");

    let (_, body) = node.limit(FULL_TOKEN, limit_of("ceo@other.com")).await;
    assert_eq!(body["limit"], 7, "request defaults when nothing matches");
    assert_eq!(body["overrideId"], "");
}

#[tokio::test]
async fn test_override_crud_roundtrip() {
    let node = ApiNode::spawn().await;

    let (status, set_reply) = node
        .call(
            "setOverride",
            Some(FULL_TOKEN),
            serde_json::json!({
                "namespace": "crud",
                "identifier": "vip-*",
                "limit": 50,
                "duration": 30_000,
                "async": true,
                "sharding": "edge"
            }),
        )
        .await;
    assert_eq!(status, 200);
    let override_id = set_reply["overrideId"].as_str().unwrap().to_string();
    assert!(!override_id.is_empty());

    let (status, got) = node
        .call(
            "getOverride",
            Some(FULL_TOKEN),
            serde_json::json!({"namespace": "crud", "identifier": "vip-*"}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(got["overrideId"], override_id.as_str());
    assert_eq!(got["limit"], 50);
    assert_eq!(got["duration"], 30_000);
    assert_eq!(got["async"], true);
    assert_eq!(got["sharding"], "edge");

    let (status, _) = node
        .call(
            "deleteOverride",
            Some(FULL_TOKEN),
            serde_json::json!({"namespace": "crud", "identifier": "vip-*"}),
        )
        .await;
    assert_eq!(status, 200);

    let (status, body) = node
        .call(
            "getOverride",
            Some(FULL_TOKEN),
            serde_json::json!({"namespace": "crud", "identifier": "vip-*"}),
        )
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_list_overrides_paginates() {
    let node = ApiNode::spawn().await;

    for i in 0..7 {
        let (status, _) = node
            .call(
                "setOverride",
                Some(FULL_TOKEN),
                serde_json::json!({
                    "namespace": "paging",
                    "identifier": format!("user-{}", i),
                    "limit": 10 + i,
                    "duration": 60_000
                }),
            )
            .await;
        assert_eq!(status, 200);
    }

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let mut body = serde_json::json!({"namespace": "paging", "limit": 3});
        if let Some(c) = &cursor {
            body["cursor"] = serde_json::json!(c);
        }
        let (status, page) = node.call("listOverrides", Some(FULL_TOKEN), body).await;
        assert_eq!(status, 200);

        let overrides = page["overrides"].as_array().unwrap();
        assert!(overrides.len() <= 3);
        for ov in overrides {
            seen.push(ov["identifier"].as_str().unwrap().to_string());
        }
        match page.get("cursor").and_then(|c| c.as_str()) {
            Some(c) => cursor = Some(c.to_string()),
            None => break,
        }
    }

    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 7, "pagination covers all overrides exactly once");
}

#[tokio::test]
async fn test_concurrent_autocreate_single_namespace() {
    let node = ApiNode::spawn().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let http = node.http.clone();
        let url = format!("{}/v1/ratelimit.limit", node.base_url);
        handles.push(tokio::spawn(async move {
            http.post(&url)
                .header("authorization", format!("Bearer {}", FULL_TOKEN))
                .json(&serde_json::json!({
                    "namespace": "fresh.namespace",
                    "identifier": "same-user",
                    "limit": 100,
                    "duration": 60_000
                }))
                .send()
                .await
                .unwrap()
                .status()
                .as_u16()
        }));
    }
    for h in handles {
        assert_eq!(h.await.unwrap(), 200);
    }

    // All eight calls must have landed on one namespace and one counter.
    let (_, body) = node
        .limit(
            FULL_TOKEN,
            serde_json::json!({
                "namespace": "fresh.namespace",
                "identifier": "same-user",
                "limit": 100,
                "duration": 60_000,
                "cost": 0
            }),
        )
        .await;
    assert_eq!(body["remaining"], 100 - 8);
}

#[tokio::test]
async fn test_unknown_operation_is_not_found() {
    let node = ApiNode::spawn().await;
    let (status, body) = node
        .call("unknownOp", Some(FULL_TOKEN), serde_json::json!({}))
        .await;
    assert_eq!(status, 404);
    assert!(body["request_id"].is_string());
}
