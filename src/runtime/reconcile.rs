use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::{apply::RulesetApplier, state::save_state, sync::ShutdownSignal};
use crate::{
    cli::{ConfigFile, Snapshot},
    error::NftwallError,
    net::{DnsCache, FqdnCache, PrefixSet},
    policy::{CompileOptions, CompiledRules, compile},
    render::{RateLimit, RenderInput, Renderer, RulesetValidator, Snat},
};

/// Outcome of one reconcile cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Whether a new ruleset was written and applied
    pub changed: bool,
    pub rejected: usize,
}

/// Snapshot to compiled, rendered and applied ruleset
pub struct Reconciler {
    snapshot_path: PathBuf,
    state_path: PathBuf,
    ruleset_path: PathBuf,
    options: CompileOptions,
    cluster_prefixes: PrefixSet,
    rate_limits: Vec<RateLimit>,
    snat: Vec<Snat>,
    dns_proxy: Option<SocketAddr>,
    cache: Option<Arc<DnsCache>>,
    renderer: Renderer,
    validator: Arc<dyn RulesetValidator>,
    applier: Arc<dyn RulesetApplier>,
}

impl Reconciler {
    pub fn from_config(
        config: &ConfigFile,
        cache: Option<Arc<DnsCache>>,
        validator: Arc<dyn RulesetValidator>,
        applier: Arc<dyn RulesetApplier>,
    ) -> Result<Self, NftwallError> {
        let dns_proxy = cache.as_ref().map(|_| config.dns.listen_addr());
        Ok(Self {
            snapshot_path: config.paths.snapshot.clone(),
            state_path: config.paths.state.clone(),
            ruleset_path: config.firewall.ruleset_path.clone(),
            options: config.firewall.compile_options()?,
            cluster_prefixes: config.firewall.cluster_prefixes()?,
            rate_limits: config.firewall.rate_limits.clone(),
            snat: config.firewall.snat.clone(),
            dns_proxy,
            cache,
            renderer: Renderer::new()?,
            validator,
            applier,
        })
    }

    /// Load the snapshot, compile it and render the ruleset text
    pub fn render_once(&self) -> Result<(String, CompiledRules), NftwallError> {
        self.render_at(Utc::now())
    }

    /// Compile and render with every cache lookup pinned to `now`
    pub fn render_at(&self, now: DateTime<Utc>) -> Result<(String, CompiledRules), NftwallError> {
        let snapshot = Snapshot::load(&self.snapshot_path)?;

        if let Some(cache) = &self.cache {
            let purged = cache.purge_expired(now);
            if purged > 0 {
                log::debug!("Purged {purged} expired DNS records");
            }
        }
        let view = self.cache.as_deref().map(|cache| cache.at(now));
        let cache = view.as_ref().map(|view| view as &dyn FqdnCache);

        let compiled = compile(&snapshot.policies, &snapshot.services, cache, &self.options)?;
        let input = RenderInput {
            ingress: compiled.ingress.clone(),
            egress: compiled.egress.clone(),
            dns_sets: cache
                .map(|cache| cache.get_sets_for_rendering())
                .unwrap_or_default(),
            cluster_prefixes: self.cluster_prefixes.clone(),
            rate_limits: self.rate_limits.clone(),
            snat: self.snat.clone(),
            dns_proxy: self.dns_proxy,
        };
        let text = self.renderer.render(&input)?;
        Ok((text, compiled))
    }

    /// One full cycle: render, replace the ruleset when it changed, apply, persist FQDN state
    pub async fn reconcile_once(&self) -> Result<ReconcileOutcome, NftwallError> {
        let (text, compiled) = self.render_once()?;

        let changed =
            Renderer::write_if_changed(&self.ruleset_path, &text, self.validator.as_ref()).await?;
        if changed {
            self.applier.apply(&self.ruleset_path).await?;
        }

        if self.cache.is_some() {
            save_state(&self.state_path, &compiled.fqdn_states)?;
        }

        Ok(ReconcileOutcome {
            changed,
            rejected: compiled.rejected.len(),
        })
    }
}

/// Spawn a task running a reconcile cycle immediately and then every `interval`
///
/// A failed cycle is logged and retried on the next tick. The task ends once
/// `shutdown_signal` fires.
pub fn spawn_reconcile(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    shutdown_signal: Arc<ShutdownSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match reconciler.reconcile_once().await {
                Ok(outcome) if outcome.changed => {
                    log::info!(
                        "Ruleset reconciled and applied ({} rules rejected)",
                        outcome.rejected
                    );
                }
                Ok(_) => log::debug!("Ruleset unchanged"),
                Err(err) => log::error!("Failed to reconcile ruleset: {err}"),
            }

            // Wait for timeout or shutdown signal
            if shutdown_signal.wait_timeout_or_shutdown(interval).await {
                return;
            }
        }
    })
}
