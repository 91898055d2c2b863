use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cluster::Membership;
use crate::config::GatewayConfig;
use crate::limiter::Limiter;
use crate::metrics::Metrics;
use crate::overrides::{MemoryPrimaryStore, OverrideResolver, PrimaryStore};
use crate::server::auth::Authorizer;

/// Shared node state, cheaply cloneable.
///
/// Process-wide mutable state is limited to what is listed here:
/// configuration, the membership view (and its ring), the counter map
/// inside the limiter, and the caches inside the resolver. All of it is
/// constructed once during bootstrap, mutated only through its own API, and
/// torn down on shutdown.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Metrics,
    pub limiter: Arc<Limiter>,
    pub membership: Arc<Membership>,
    pub auth: Arc<Authorizer>,
    ready: Arc<AtomicBool>,
}

impl GatewayState {
    /// Assemble state from already-built components. Bootstrap owns
    /// identity resolution and socket binding; tests assemble miniature
    /// nodes directly.
    pub fn assemble(
        config: GatewayConfig,
        limiter: Arc<Limiter>,
        membership: Arc<Membership>,
    ) -> Self {
        let auth = Arc::new(Authorizer::from_config(&config.auth));
        Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics: Metrics::install(),
            limiter,
            membership,
            auth,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The default primary store for a node without an external one: shared
    /// in-process tables.
    pub fn default_primary_store() -> Arc<dyn PrimaryStore> {
        Arc::new(MemoryPrimaryStore::new())
    }

    pub fn resolver(&self) -> &OverrideResolver {
        self.limiter.resolver()
    }

    /// Readiness flips once discovery seeded the view and the RPC listener
    /// is bound.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
