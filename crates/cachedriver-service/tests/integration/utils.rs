use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use cachedriver_service::agent::AgentRegistry;
use cachedriver_service::cache::{CacheData, CacheResult, ProviderCaches};
use cachedriver_service::ondemand::{OnDemandCoordinator, OnDemandPayload, OnDemandResult};
use cachedriver_test::{InMemoryProviderCache, ScriptedScheduler, TestAgent, records};

pub const PROVIDER: &str = "aws";

/// A coordinator over the given agents, writing to a single `aws` cache.
pub struct Fixture {
    pub cache: Arc<InMemoryProviderCache>,
    pub scheduler: Arc<ScriptedScheduler>,
    pub coordinator: OnDemandCoordinator,
}

impl Fixture {
    pub fn new(scheduler: ScriptedScheduler, agents: &[Arc<TestAgent>]) -> Self {
        Self::with_cache(scheduler, InMemoryProviderCache::new(), agents)
    }

    pub fn with_cache(
        scheduler: ScriptedScheduler,
        cache: Arc<InMemoryProviderCache>,
        agents: &[Arc<TestAgent>],
    ) -> Self {
        let mut registry = AgentRegistry::new();
        for agent in agents {
            registry.register(agent.clone());
        }

        let scheduler = Arc::new(scheduler);
        let providers = ProviderCaches::new().with(PROVIDER, cache.clone());
        let coordinator =
            OnDemandCoordinator::new(&registry, scheduler.clone(), Arc::new(providers));

        Self {
            cache,
            scheduler,
            coordinator,
        }
    }
}

pub fn payload(server_group: &str) -> OnDemandPayload {
    OnDemandPayload::from([
        ("id".to_owned(), json!(server_group)),
        ("serverGroupName".to_owned(), json!(server_group)),
        ("region".to_owned(), json!("us-east-1")),
        ("account".to_owned(), json!("prod")),
    ])
}

pub fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

/// An authoritative result holding one server group and its `instances`.
pub fn server_group_result(
    agent_type: &str,
    server_group: &str,
    instances: usize,
) -> OnDemandResult {
    let cache_result = CacheResult::authoritative(BTreeMap::from([
        (
            "serverGroups".to_owned(),
            vec![CacheData::new(server_group)],
        ),
        ("instances".to_owned(), records("i-", instances)),
    ]));

    OnDemandResult::new(agent_type)
        .with_authoritative_types(ids(&["serverGroups"]))
        .with_cache_result(cache_result)
}
