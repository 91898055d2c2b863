use std::fmt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cluster::{
    self, detect_advertise_addr, generate_node_id, Discovery, Member, Membership,
    MembershipConfig,
};
use crate::config::GatewayConfig;
use crate::counter::{unix_ms, CounterStore};
use crate::limiter::Limiter;
use crate::overrides::OverrideResolver;
use crate::server::{self, GatewayState};

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Startup failure classes, mapped to process exit codes:
/// 1 = configuration error, 2 = initial discovery unreachable,
/// 3 = unrecoverable runtime error.
#[derive(Debug)]
pub enum BootstrapError {
    Config(anyhow::Error),
    Discovery(anyhow::Error),
    Runtime(anyhow::Error),
}

impl BootstrapError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::Config(_) => 1,
            BootstrapError::Discovery(_) => 2,
            BootstrapError::Runtime(_) => 3,
        }
    }
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::Config(e) => write!(f, "configuration error: {}", e),
            BootstrapError::Discovery(e) => write!(f, "initial discovery failed: {}", e),
            BootstrapError::Runtime(e) => write!(f, "runtime error: {}", e),
        }
    }
}

/// Node lifecycle: config → identity → membership → discovery seed →
/// listeners → loops → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<(), BootstrapError> {
    init_tracing();

    // Phase 1: configuration.
    let config = GatewayConfig::load(&args.config_path).map_err(BootstrapError::Config)?;

    // Phase 2: identity and the gossip socket.
    let node_id = config
        .cluster
        .node_id
        .clone()
        .unwrap_or_else(generate_node_id);
    let advertise_addr = match config.cluster.advertise_addr.clone() {
        Some(a) => a,
        None => detect_advertise_addr().map_err(BootstrapError::Config)?,
    };
    let local = Member {
        node_id,
        advertise_addr,
        rpc_port: config.cluster.rpc_port,
        gossip_port: config.cluster.gossip_port,
        joined_at_ms: unix_ms(),
    };
    info!(
        "cluster: node identity, id={}, advertise={}, rpc_port={}, gossip_port={}",
        local.node_id, local.advertise_addr, local.rpc_port, local.gossip_port
    );

    let membership = Membership::bind(local, MembershipConfig::from(&config.cluster))
        .await
        .map_err(BootstrapError::Runtime)?;

    // Phase 3: core components.
    let store = GatewayState::default_primary_store();
    let resolver = OverrideResolver::new(store, &config.cache);
    let counters = Arc::new(CounterStore::new());
    let limiter = Limiter::new(
        Arc::clone(&counters),
        resolver,
        Arc::clone(&membership),
        config.limiter.clone(),
    )
    .map_err(BootstrapError::Runtime)?;
    let state = GatewayState::assemble(config.clone(), Arc::clone(&limiter), Arc::clone(&membership));

    // Phase 4: discovery seed. This MUST succeed before the node serves
    // traffic; a lost registry afterwards is tolerated (gossip takes over).
    let discovery =
        cluster::discovery::from_config(&config.discovery).map_err(BootstrapError::Config)?;
    let me = membership.local().clone();
    discovery
        .register(&me)
        .await
        .map_err(BootstrapError::Discovery)?;
    let seeds = discovery.list().await.map_err(BootstrapError::Discovery)?;
    membership.observe_discovered(seeds);
    info!(
        "discovery: {}: initial peer view seeded, members={}",
        discovery.name(),
        membership.alive_members().len()
    );

    // Phase 5: cluster listeners.
    let shutdown = Arc::new(Notify::new());

    let rpc_listener = TcpListener::bind(("0.0.0.0", config.cluster.rpc_port))
        .await
        .map_err(|e| BootstrapError::Runtime(e.into()))?;
    tokio::spawn({
        let limiter = Arc::clone(&limiter) as Arc<dyn cluster::RpcService>;
        let membership = Arc::clone(&membership);
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) =
                cluster::rpc::run_rpc_server(rpc_listener, limiter, membership, shutdown).await
            {
                error!("rpc: server failed, error={}", e);
            }
        }
    });
    tokio::spawn(membership.clone().serve_gossip(shutdown.clone()));

    // Phase 6: loop owners — every background cadence lives here.
    start_probe_loop(&membership, &config, &shutdown);
    start_discovery_loop(&discovery, &membership, &limiter, &config, &shutdown);
    start_flusher(&limiter, &config, &shutdown);
    counters.start_gc(std::time::Duration::from_secs(60), shutdown.clone());
    limiter
        .resolver()
        .start_cache_sweeps(std::time::Duration::from_secs(60), shutdown.clone());

    // Phase 7: admin + public API.
    let admin_listener = TcpListener::bind(args.admin_listen.as_str())
        .await
        .map_err(|e| BootstrapError::Runtime(e.into()))?;
    tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = server::run_admin_server(admin_listener, state, shutdown).await {
                error!("server: admin failed, error={}", e);
            }
        }
    });

    let api_listener = TcpListener::bind(args.listen.as_str())
        .await
        .map_err(|e| BootstrapError::Runtime(e.into()))?;
    state.set_ready();

    let api_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_api_server(api_listener, state, shutdown).await }
    });

    // Phase 8: block until signal, then clean up.
    wait_for_shutdown(&shutdown).await;

    if let Err(e) = discovery.deregister(&me).await {
        error!("discovery: deregister on shutdown failed: {}", e);
    }
    // One last convergence push so peers lose as little as possible.
    limiter.flush_once().await;

    if let Err(e) = api_handle.await {
        error!("server: api task error: {}", e);
    }

    info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Sleep for `duration`, but return `true` immediately if shutdown is
/// signalled. Returns `false` if the full duration elapsed normally.
async fn sleep_or_shutdown(duration: std::time::Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

fn start_probe_loop(
    membership: &Arc<Membership>,
    config: &GatewayConfig,
    shutdown: &Arc<Notify>,
) {
    let membership = Arc::clone(membership);
    let interval = std::time::Duration::from_millis(config.cluster.probe_interval_ms);
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            membership.probe_round().await;
        }
    });
}

fn start_discovery_loop(
    discovery: &Arc<dyn Discovery>,
    membership: &Arc<Membership>,
    limiter: &Arc<Limiter>,
    config: &GatewayConfig,
    shutdown: &Arc<Notify>,
) {
    let discovery = Arc::clone(discovery);
    let membership = Arc::clone(membership);
    let limiter = Arc::clone(limiter);
    let interval = std::time::Duration::from_secs(config.cluster.heartbeat_interval_secs);
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        let me = membership.local().clone();
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }

            if let Err(e) = discovery.heartbeat(&me).await {
                error!("discovery: heartbeat failed: {}", e);
                metrics::counter!("aegis_discovery_poll_total", "result" => "error").increment(1);
                // Heartbeat loss is survivable; re-registration happens on
                // the next successful cycle because heartbeat is an upsert.
                continue;
            }

            match discovery.list().await {
                Ok(members) => {
                    metrics::counter!("aegis_discovery_poll_total", "result" => "success")
                        .increment(1);
                    membership.observe_discovered(members);
                }
                Err(e) => {
                    error!("discovery: list failed: {}", e);
                    metrics::counter!("aegis_discovery_poll_total", "result" => "error")
                        .increment(1);
                }
            }

            // Drop breakers for owners that left the view.
            let active: std::collections::HashSet<String> = membership
                .alive_members()
                .into_iter()
                .map(|m| m.node_id)
                .collect();
            limiter.breakers().retain_nodes(&active);
        }
    });
}

fn start_flusher(limiter: &Arc<Limiter>, config: &GatewayConfig, shutdown: &Arc<Notify>) {
    let limiter = Arc::clone(limiter);
    let interval = std::time::Duration::from_millis(config.limiter.flush_interval_ms);
    let wake = limiter.batcher().flush_wake();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake.notified() => {}
                _ = shutdown.notified() => return,
            }
            limiter.flush_once().await;
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("server: received SIGINT, shutting down"),
        _ = terminate => info!("server: received SIGTERM, shutting down"),
    }

    // Signal all background loops to stop.
    shutdown.notify_waiters();
}
