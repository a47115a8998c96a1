//! Provides the on-demand cache service and a way to initialize it.
//!
//! [`create_on_demand_updater`] wires the registered agents, the agent scheduler and the provider
//! caches into an [`OnDemandCacheUpdater`] according to the provided [`Config`].
//! [`init_observability`] sets up error reporting, logging and metrics beforehand.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::agent::AgentRegistry;
use crate::cache::ProviderRegistry;
use crate::config::{Config, Metrics};
use crate::interval::DefaultAgentIntervalProvider;
use crate::ondemand::{NoopOnDemandCacheUpdater, OnDemandCacheUpdater, OnDemandCoordinator};
use crate::scheduler::AgentScheduler;
use crate::{logging, metrics};

/// Installs sentry, the global logger and the statsd client.
///
/// The returned guard flushes pending sentry events on drop, so it has to be held until the
/// process exits.
///
/// # Safety
/// Has to be called before any other thread is spawned, see [`logging::init_logging`].
pub unsafe fn init_observability(config: &Config) -> Result<sentry::ClientInitGuard> {
    let sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        ..Default::default()
    });

    // SAFETY: Forwarded to the caller.
    unsafe { logging::init_logging(&config.logging) };

    if let Some(statsd) = &config.metrics.statsd {
        let tags = metric_tags(&config.metrics);
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure statsd")?;
    }

    Ok(sentry)
}

/// The tags appended to every metric.
fn metric_tags(config: &Metrics) -> BTreeMap<String, String> {
    let mut tags = config.custom_tags.clone();
    let hostname = config.hostname_tag.clone().and_then(|tag| {
        hostname::get()
            .ok()
            .and_then(|s| s.into_string().ok())
            .map(|name| (tag, name))
    });
    tags.extend(hostname);
    tags
}

pub fn create_on_demand_updater(
    config: &Config,
    registry: &AgentRegistry,
    scheduler: Arc<dyn AgentScheduler>,
    providers: Arc<dyn ProviderRegistry>,
) -> Arc<dyn OnDemandCacheUpdater> {
    if !config.caching.write_enabled {
        tracing::info!("Cache writes are disabled, on-demand updates are ignored");
        return Arc::new(NoopOnDemandCacheUpdater);
    }

    let coordinator = OnDemandCoordinator::new(registry, scheduler, providers);
    tracing::info!(
        agents = registry.on_demand_agents().count(),
        "Created on-demand cache coordinator"
    );
    Arc::new(coordinator)
}

/// Creates the interval policy background schedulers consult for each agent.
pub fn create_interval_provider(config: &Config) -> DefaultAgentIntervalProvider {
    DefaultAgentIntervalProvider::from_config(&config.agent)
}
