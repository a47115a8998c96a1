use std::sync::Arc;
use std::time::Duration;

use cachedriver_service::agent::AgentRegistry;
use cachedriver_service::cache::ProviderCaches;
use cachedriver_service::config::Config;
use cachedriver_service::interval::{AgentIntervalProvider, Interval};
use cachedriver_service::ondemand::{OnDemandCacheResult, OnDemandCacheStatus, OnDemandType};
use cachedriver_service::services::{create_interval_provider, create_on_demand_updater};
use cachedriver_test::{InMemoryProviderCache, ScriptedScheduler, TestAgent, setup};

use crate::{PROVIDER, payload, server_group_result};

fn registry(agent: &Arc<TestAgent>) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry.register(agent.clone());
    registry
}

fn providers(cache: &Arc<InMemoryProviderCache>) -> Arc<ProviderCaches> {
    Arc::new(ProviderCaches::new().with(PROVIDER, cache.clone()))
}

fn cluster_agent() -> Arc<TestAgent> {
    Arc::new(
        TestAgent::new(PROVIDER, "ClusterCachingAgent")
            .handling(OnDemandType::SERVER_GROUP, PROVIDER)
            .returning(server_group_result("ClusterCachingAgent", "app-v001", 1)),
    )
}

#[tokio::test]
async fn test_disabled_writes_ignore_requests() {
    setup();

    let mut config = Config::default();
    config.caching.write_enabled = false;

    let agent = cluster_agent();
    let cache = InMemoryProviderCache::new();
    let updater = create_on_demand_updater(
        &config,
        &registry(&agent),
        Arc::new(ScriptedScheduler::non_atomic()),
        providers(&cache),
    );

    assert!(!updater.handles(&OnDemandType::SERVER_GROUP, PROVIDER));
    let result = updater
        .handle(&OnDemandType::SERVER_GROUP, PROVIDER, &payload("app-v001"))
        .await;
    assert_eq!(result, OnDemandCacheResult::successful());
    assert_eq!(agent.invocations(), 0);
    assert!(cache.calls().is_empty());
}

#[tokio::test]
async fn test_enabled_writes_reach_agents() {
    setup();

    let agent = cluster_agent();
    let cache = InMemoryProviderCache::new();
    let updater = create_on_demand_updater(
        &Config::default(),
        &registry(&agent),
        Arc::new(ScriptedScheduler::non_atomic()),
        providers(&cache),
    );

    assert!(updater.handles(&OnDemandType::SERVER_GROUP, PROVIDER));
    let result = updater
        .handle(&OnDemandType::SERVER_GROUP, PROVIDER, &payload("app-v001"))
        .await;
    assert_eq!(result.status, OnDemandCacheStatus::Pending);
    assert_eq!(agent.invocations(), 1);
}

#[test]
fn test_interval_provider_from_config() {
    let mut config = Config::default();
    config.agent.poll_interval = Duration::from_secs(60);

    let provider = create_interval_provider(&config);
    let agent = TestAgent::new(PROVIDER, "ClusterCachingAgent");

    assert_eq!(
        provider.interval(&agent),
        Interval::new(60_000, 30_000, 300_000)
    );
}
