//! Helpers for testing the on-demand coordination.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - The collaborators in here record every call made to them. Assert on the recorded calls
//!    rather than on log output, e.g. `assert!(cache.calls().is_empty())`.
//!
//!  - [`MetricsCapture::lines`] drains the captured metrics, so call it once per assertion block.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use cadence::{SpyMetricSink, StatsdClient};
use serde_json::Value;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use cachedriver_service::agent::{Agent, OnDemandAgent};
use cachedriver_service::cache::{CacheData, CacheResult, ProviderCache};
use cachedriver_service::metrics::MetricsClient;
use cachedriver_service::ondemand::{
    OnDemandMetrics, OnDemandPayload, OnDemandResult, OnDemandType, PendingRequest,
};
use cachedriver_service::scheduler::{AgentLock, AgentScheduler};

/// The cache type test agents store their on-demand requests under.
pub const ON_DEMAND_CACHE_TYPE: &str = "onDemand";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `cachedriver_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("cachedriver_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Builds `count` records with ids `{prefix}1` to `{prefix}{count}`.
pub fn records(prefix: &str, count: usize) -> Vec<CacheData> {
    (1..=count)
        .map(|n| CacheData::new(format!("{prefix}{n}")))
        .collect()
}

/// A call made to the [`InMemoryProviderCache`].
#[derive(Clone, Debug, PartialEq)]
pub enum CacheCall {
    PutCacheResult {
        source_agent_type: String,
        authoritative_types: Vec<String>,
        cache_result: CacheResult,
    },
    AddCacheResult {
        source_agent_type: String,
        authoritative_types: Vec<String>,
        cache_result: CacheResult,
    },
    EvictDeletedItems {
        ty: String,
        ids: Vec<String>,
    },
    PutCacheData {
        ty: String,
        id: String,
    },
}

/// A provider cache held in memory, which records every mutation.
#[derive(Debug, Default)]
pub struct InMemoryProviderCache {
    calls: Mutex<Vec<CacheCall>>,
    records: Mutex<BTreeMap<String, BTreeMap<String, CacheData>>>,
    fail_writes: bool,
}

impl InMemoryProviderCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A cache rejecting every result written to it.
    pub fn failing_writes() -> Arc<Self> {
        Arc::new(Self {
            fail_writes: true,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<CacheCall> {
        self.calls.lock().unwrap().clone()
    }

    /// The ids stored under `ty`, in order.
    pub fn ids(&self, ty: &str) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .get(ty)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, call: CacheCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn merge(&self, cache_result: &CacheResult) {
        let mut records = self.records.lock().unwrap();
        for (ty, data) in cache_result.cache_results() {
            let stored = records.entry(ty.clone()).or_default();
            for record in data {
                stored.insert(record.id.clone(), record.clone());
            }
        }
    }
}

#[async_trait]
impl ProviderCache for InMemoryProviderCache {
    async fn put_cache_result(
        &self,
        source_agent_type: &str,
        authoritative_types: &[String],
        cache_result: &CacheResult,
    ) -> Result<()> {
        self.record(CacheCall::PutCacheResult {
            source_agent_type: source_agent_type.to_owned(),
            authoritative_types: authoritative_types.to_vec(),
            cache_result: cache_result.clone(),
        });
        if self.fail_writes {
            bail!("cache is read-only");
        }

        {
            let mut records = self.records.lock().unwrap();
            for ty in authoritative_types {
                records.remove(ty);
            }
        }
        self.merge(cache_result);
        Ok(())
    }

    async fn add_cache_result(
        &self,
        source_agent_type: &str,
        authoritative_types: &[String],
        cache_result: &CacheResult,
    ) -> Result<()> {
        self.record(CacheCall::AddCacheResult {
            source_agent_type: source_agent_type.to_owned(),
            authoritative_types: authoritative_types.to_vec(),
            cache_result: cache_result.clone(),
        });
        if self.fail_writes {
            bail!("cache is read-only");
        }

        self.merge(cache_result);
        Ok(())
    }

    async fn evict_deleted_items(&self, ty: &str, ids: &[String]) -> Result<()> {
        self.record(CacheCall::EvictDeletedItems {
            ty: ty.to_owned(),
            ids: ids.to_vec(),
        });

        if let Some(stored) = self.records.lock().unwrap().get_mut(ty) {
            for id in ids {
                stored.remove(id);
            }
        }
        Ok(())
    }

    async fn put_cache_data(&self, ty: &str, data: CacheData) -> Result<()> {
        self.record(CacheCall::PutCacheData {
            ty: ty.to_owned(),
            id: data.id.clone(),
        });

        self.records
            .lock()
            .unwrap()
            .entry(ty.to_owned())
            .or_default()
            .insert(data.id.clone(), data);
        Ok(())
    }

    async fn get_all(&self, ty: &str) -> Result<Vec<CacheData>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(ty)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// A call made to the [`ScriptedScheduler`], with the agent type it concerned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchedulerCall {
    TryLock(String),
    LockValid(String),
    TryRelease(String),
}

/// An agent scheduler whose lock decisions are fixed upfront.
#[derive(Debug)]
pub struct ScriptedScheduler {
    atomic: bool,
    denied: HashSet<String>,
    deny_all: bool,
    expire_locks: bool,
    fail_release: bool,
    lock_delay: Option<Duration>,
    calls: Mutex<Vec<SchedulerCall>>,
}

impl ScriptedScheduler {
    fn new(atomic: bool) -> Self {
        Self {
            atomic,
            denied: HashSet::new(),
            deny_all: false,
            expire_locks: false,
            fail_release: false,
            lock_delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// An exclusion-enforcing scheduler granting every lock.
    pub fn atomic() -> Self {
        Self::new(true)
    }

    /// A last-writer-wins scheduler.
    pub fn non_atomic() -> Self {
        Self::new(false)
    }

    /// Every lock is held elsewhere.
    pub fn denying_locks(mut self) -> Self {
        self.deny_all = true;
        self
    }

    /// The lock of this agent type is held elsewhere.
    pub fn denying_lock_of(mut self, agent_type: &str) -> Self {
        self.denied.insert(agent_type.to_owned());
        self
    }

    /// Locks expire before they are validated.
    pub fn expiring_locks(mut self) -> Self {
        self.expire_locks = true;
        self
    }

    /// Locks cannot be released.
    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    /// Every lock takes `delay` to be acquired.
    pub fn slow_locks(mut self, delay: Duration) -> Self {
        self.lock_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<SchedulerCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: SchedulerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl AgentScheduler for ScriptedScheduler {
    fn is_atomic(&self) -> bool {
        self.atomic
    }

    async fn try_lock(&self, agent: &dyn Agent) -> Result<Option<AgentLock>> {
        let agent_type = agent.agent_type();
        self.record(SchedulerCall::TryLock(agent_type.to_owned()));
        if let Some(delay) = self.lock_delay {
            std::thread::sleep(delay);
        }

        if self.deny_all || self.denied.contains(agent_type) {
            return Ok(None);
        }
        let token = uuid::Uuid::new_v4().to_string();
        Ok(Some(AgentLock::new(agent_type, token)))
    }

    async fn lock_valid(&self, lock: &AgentLock) -> Result<bool> {
        self.record(SchedulerCall::LockValid(lock.agent_type().to_owned()));
        Ok(!self.expire_locks)
    }

    async fn try_release(&self, lock: AgentLock) -> Result<bool> {
        self.record(SchedulerCall::TryRelease(lock.agent_type().to_owned()));
        Ok(!self.fail_release)
    }
}

/// What a [`TestAgent`] does when it is invoked.
#[derive(Clone, Debug)]
pub enum Refresh {
    Result(OnDemandResult),
    NoResult,
    Fail(String),
    Panic(String),
}

/// An on-demand agent with a scripted refresh.
#[derive(Debug)]
pub struct TestAgent {
    provider_name: String,
    agent_type: String,
    handles: Vec<(OnDemandType, String)>,
    refresh: Refresh,
    metrics: Option<OnDemandMetrics>,
    store_requests: bool,
    invocations: AtomicUsize,
}

impl TestAgent {
    /// An agent handling nothing, which returns no result.
    pub fn new(provider_name: &str, agent_type: &str) -> Self {
        Self {
            provider_name: provider_name.to_owned(),
            agent_type: agent_type.to_owned(),
            handles: Vec::new(),
            refresh: Refresh::NoResult,
            metrics: Some(OnDemandMetrics::new(provider_name, agent_type, "test")),
            store_requests: false,
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn handling(mut self, on_demand_type: OnDemandType, cloud_provider: &str) -> Self {
        self.handles.push((on_demand_type, cloud_provider.to_owned()));
        self
    }

    pub fn refreshing(mut self, refresh: Refresh) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn returning(self, result: OnDemandResult) -> Self {
        self.refreshing(Refresh::Result(result))
    }

    pub fn with_metrics(mut self, metrics: OnDemandMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn without_metrics(mut self) -> Self {
        self.metrics = None;
        self
    }

    /// Stores each request under [`ON_DEMAND_CACHE_TYPE`], keyed by the payload `"id"`.
    pub fn storing_requests(mut self) -> Self {
        self.store_requests = true;
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    async fn store_request(&self, cache: &dyn ProviderCache, data: &OnDemandPayload) -> Result<()> {
        let Some(id) = data.get("id").and_then(Value::as_str) else {
            bail!("request without id");
        };
        let mut record = CacheData::new(id);
        record.attributes = data.clone();
        let store = cache.put_cache_data(ON_DEMAND_CACHE_TYPE, record);
        match &self.metrics {
            Some(metrics) => metrics.on_demand_store(store).await,
            None => store.await,
        }
    }
}

impl Agent for TestAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    fn as_on_demand(&self) -> Option<&dyn OnDemandAgent> {
        Some(self)
    }
}

#[async_trait]
impl OnDemandAgent for TestAgent {
    fn metrics(&self) -> Option<&OnDemandMetrics> {
        self.metrics.as_ref()
    }

    fn handles(&self, on_demand_type: &OnDemandType, cloud_provider: &str) -> bool {
        self.handles
            .iter()
            .any(|(ty, provider)| ty == on_demand_type && provider == cloud_provider)
    }

    async fn handle(
        &self,
        cache: &dyn ProviderCache,
        data: &OnDemandPayload,
    ) -> Result<Option<OnDemandResult>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.store_requests {
            self.store_request(cache, data).await?;
        }

        match &self.refresh {
            Refresh::Result(result) => Ok(Some(result.clone())),
            Refresh::NoResult => Ok(None),
            Refresh::Fail(message) => bail!("{message}"),
            Refresh::Panic(message) => panic!("{message}"),
        }
    }

    async fn pending_on_demand_requests(
        &self,
        cache: &dyn ProviderCache,
    ) -> Result<Vec<PendingRequest>> {
        let stored = cache.get_all(ON_DEMAND_CACHE_TYPE).await?;
        Ok(stored
            .into_iter()
            .map(|record| {
                let mut request = record.attributes;
                request.insert("id".to_owned(), Value::String(record.id));
                request
            })
            .collect())
    }
}

/// Captures metrics sent through a dedicated client.
#[derive(Debug)]
pub struct MetricsCapture {
    rx: crossbeam_channel::Receiver<Vec<u8>>,
    client: Arc<MetricsClient>,
}

impl MetricsCapture {
    /// Creates a client with the `test` prefix and no global tags.
    pub fn new() -> Self {
        let (rx, sink) = SpyMetricSink::new();
        let client = MetricsClient::new(StatsdClient::from_sink("test", sink), BTreeMap::new());
        Self {
            rx,
            client: Arc::new(client),
        }
    }

    pub fn client(&self) -> Arc<MetricsClient> {
        self.client.clone()
    }

    /// Drains all metrics sent so far.
    pub fn lines(&self) -> Vec<String> {
        self.rx
            .try_iter()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .collect()
    }
}

impl Default for MetricsCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the names of the given metric lines, e.g. `ondemand.count` for
/// `test.ondemand.count:1|c|#...`.
pub fn metric_names(lines: &[String]) -> Vec<&str> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("test."))
        .filter_map(|line| line.split(':').next())
        .collect()
}
