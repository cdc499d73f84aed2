pub mod apply;
pub mod reconcile;
pub mod state;
mod sync;

use std::sync::Arc;

pub use apply::{NftApplier, RulesetApplier};
pub use reconcile::{ReconcileOutcome, Reconciler, spawn_reconcile};
pub use sync::ShutdownSignal;

use crate::{
    cli::ConfigFile,
    error::NftwallError,
    net::{DnsCache, DnsProxy, FqdnCache, system_upstream},
    render::NftValidator,
};

/// Build the DNS cache, seeded from the persisted FQDN state
///
/// Returns `None` when DNS interception is disabled.
pub fn build_cache(config: &ConfigFile) -> Result<Option<Arc<DnsCache>>, NftwallError> {
    if !config.dns.enabled {
        return Ok(None);
    }

    let upstream = match config.dns.upstream {
        Some(upstream) => upstream,
        None => system_upstream(true)?,
    };
    let cache = Arc::new(DnsCache::new(upstream));

    let states = state::load_state(&config.paths.state)?;
    let restored = cache.restore(state::restored_sets(&states));
    if restored > 0 {
        log::info!(
            "Restored {restored} DNS sets from {}",
            config.paths.state.display()
        );
    }
    Ok(Some(cache))
}

pub fn build_reconciler(
    config: &ConfigFile,
    cache: Option<Arc<DnsCache>>,
) -> Result<Reconciler, NftwallError> {
    let binary = &config.firewall.nft_binary;
    Reconciler::from_config(
        config,
        cache,
        Arc::new(NftValidator::new(binary)),
        Arc::new(NftApplier::new(binary)),
    )
}

/// Run the DNS proxy and the periodic reconcile task until Ctrl-C
pub async fn run(config: &ConfigFile) -> Result<(), NftwallError> {
    let cache = build_cache(config)?;
    let reconciler = Arc::new(build_reconciler(config, cache.clone())?);

    let proxy = match cache {
        Some(cache) => {
            let cache: Arc<dyn FqdnCache> = cache;
            Some(DnsProxy::new(config.dns.proxy_config(), cache).start().await?)
        }
        None => None,
    };

    let shutdown_signal = ShutdownSignal::new();
    let reconcile = spawn_reconcile(
        reconciler,
        config.firewall.reconcile_interval(),
        Arc::clone(&shutdown_signal),
    );

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");

    shutdown_signal.shutdown();
    if let Some(proxy) = proxy {
        proxy.stop().await;
    }
    let _ = reconcile.await.inspect_err(|err| {
        log::error!("Reconcile task failed: {err}");
    });
    Ok(())
}
