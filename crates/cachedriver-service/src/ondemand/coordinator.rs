//! Fans on-demand requests out to the agents handling them.
//!
//! Background runs of an agent and on-demand refreshes of the same agent write to the same cache
//! partition. Under an atomic scheduler every refresh therefore holds the agent lock, and the lock
//! is validated again after the (possibly slow) fetch, right before anything is written:
//!
//! lock → handle → validate lock → write → evict → release
//!
//! Each agent runs inside its own failure boundary. Errors and panics of one agent are logged and
//! counted, but never affect the other agents or the caller.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;

use crate::agent::{Agent, AgentRegistry, OnDemandAgent};
use crate::cache::{ProviderCache, ProviderRegistry};
use crate::scheduler::{AgentLock, AgentScheduler};

use super::{OnDemandCacheResult, OnDemandError, OnDemandPayload, OnDemandType, PendingRequest};

/// What a single agent contributed to an on-demand request.
#[derive(Debug, PartialEq)]
enum AgentOutcome {
    /// The request did not resolve to anything the agent caches.
    NoResult,
    /// The agent lock was held elsewhere, or lost while the agent was fetching.
    Contended,
    /// The agent has no instrumentation, its result was dropped.
    Uninstrumented,
    /// The result held neither records nor evictions, the cache was not touched.
    Unchanged,
    /// The result was written, along with the ids which have to be reported to the caller.
    Written(BTreeMap<String, Vec<String>>),
}

#[derive(Debug, Default)]
struct Aggregate {
    pending: bool,
    cached_identifiers: BTreeMap<String, Vec<String>>,
}

impl Aggregate {
    fn add(&mut self, outcome: AgentOutcome) {
        match outcome {
            AgentOutcome::Contended => self.pending = true,
            AgentOutcome::Written(identifiers) if !identifiers.is_empty() => {
                self.pending = true;
                for (ty, ids) in identifiers {
                    self.cached_identifiers.entry(ty).or_default().extend(ids);
                }
            }
            _ => {}
        }
    }

    fn into_result(self) -> OnDemandCacheResult {
        if self.pending {
            OnDemandCacheResult::pending(self.cached_identifiers)
        } else {
            OnDemandCacheResult::successful()
        }
    }
}

/// Coordinates on-demand refreshes of all registered on-demand agents.
pub struct OnDemandCoordinator {
    agents: Vec<Arc<dyn Agent>>,
    scheduler: Arc<dyn AgentScheduler>,
    providers: Arc<dyn ProviderRegistry>,
}

impl OnDemandCoordinator {
    pub fn new(
        registry: &AgentRegistry,
        scheduler: Arc<dyn AgentScheduler>,
        providers: Arc<dyn ProviderRegistry>,
    ) -> Self {
        Self {
            agents: registry.on_demand_agents().cloned().collect(),
            scheduler,
            providers,
        }
    }

    fn matching_agents<'a>(
        &'a self,
        on_demand_type: &'a OnDemandType,
        cloud_provider: &'a str,
    ) -> impl Iterator<Item = (&'a dyn Agent, &'a dyn OnDemandAgent)> + Send + 'a {
        self.agents.iter().filter_map(move |agent| {
            let on_demand = agent.as_on_demand()?;
            on_demand
                .handles(on_demand_type, cloud_provider)
                .then_some((agent.as_ref(), on_demand))
        })
    }

    /// Whether any agent handles requests of this type for the cloud provider.
    pub fn handles(&self, on_demand_type: &OnDemandType, cloud_provider: &str) -> bool {
        self.matching_agents(on_demand_type, cloud_provider)
            .next()
            .is_some()
    }

    /// Refreshes the data described by `data` with every agent handling the request.
    pub async fn handle(
        &self,
        on_demand_type: &OnDemandType,
        cloud_provider: &str,
        data: &OnDemandPayload,
    ) -> OnDemandCacheResult {
        let mut aggregate = Aggregate::default();

        for (agent, on_demand) in self.matching_agents(on_demand_type, cloud_provider) {
            let run = self.process_agent(agent, on_demand, on_demand_type, data);
            let outcome = AssertUnwindSafe(run)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(OnDemandError::Panicked(panic_message(&*panic))));

            match outcome {
                Ok(outcome) => aggregate.add(outcome),
                Err(error) => report_failure(agent, on_demand, on_demand_type, &error),
            }
        }

        let result = aggregate.into_result();
        metric!(
            counter("ondemand.requests") += 1,
            "on_demand_type" => on_demand_type.as_str(),
            "status" => result.status.as_str(),
        );
        result
    }

    /// Lists the requests which have not been picked up by a regular agent run yet.
    ///
    /// Atomic schedulers complete every request synchronously, so there is nothing pending.
    pub async fn pending_on_demand_requests(
        &self,
        on_demand_type: &OnDemandType,
        cloud_provider: &str,
    ) -> Vec<PendingRequest> {
        if self.scheduler.is_atomic() {
            return Vec::new();
        }

        let mut pending = Vec::new();
        for (agent, on_demand) in self.matching_agents(on_demand_type, cloud_provider) {
            let Some(cache) = self.provider_cache(agent, on_demand_type) else {
                continue;
            };
            match on_demand.pending_on_demand_requests(cache.as_ref()).await {
                Ok(requests) => pending.extend(requests),
                Err(error) => tracing::warn!(
                    provider = agent.provider_name(),
                    agent_type = %on_demand.on_demand_agent_type(),
                    on_demand_type = %on_demand_type,
                    error = %error,
                    "Failed to list pending on-demand requests",
                ),
            }
        }
        pending
    }

    /// Looks up a single pending request by id, returning the first match of any agent.
    pub async fn pending_on_demand_request(
        &self,
        on_demand_type: &OnDemandType,
        cloud_provider: &str,
        id: &str,
    ) -> Option<PendingRequest> {
        if self.scheduler.is_atomic() {
            return None;
        }

        for (agent, on_demand) in self.matching_agents(on_demand_type, cloud_provider) {
            let Some(cache) = self.provider_cache(agent, on_demand_type) else {
                continue;
            };
            match on_demand.pending_on_demand_request(cache.as_ref(), id).await {
                Ok(Some(request)) => return Some(request),
                Ok(None) => {}
                Err(error) => tracing::warn!(
                    provider = agent.provider_name(),
                    agent_type = %on_demand.on_demand_agent_type(),
                    on_demand_type = %on_demand_type,
                    error = %error,
                    "Failed to look up pending on-demand request",
                ),
            }
        }
        None
    }

    fn provider_cache(
        &self,
        agent: &dyn Agent,
        on_demand_type: &OnDemandType,
    ) -> Option<Arc<dyn ProviderCache>> {
        let cache = self.providers.provider_cache(agent.provider_name());
        if cache.is_none() {
            tracing::warn!(
                provider = agent.provider_name(),
                agent_type = agent.agent_type(),
                on_demand_type = %on_demand_type,
                "No cache registered for provider",
            );
        }
        cache
    }

    async fn process_agent(
        &self,
        agent: &dyn Agent,
        on_demand: &dyn OnDemandAgent,
        on_demand_type: &OnDemandType,
        data: &OnDemandPayload,
    ) -> Result<AgentOutcome, OnDemandError> {
        let start = Instant::now();
        let cache = self
            .providers
            .provider_cache(agent.provider_name())
            .ok_or_else(|| OnDemandError::UnknownProvider(agent.provider_name().to_owned()))?;

        let atomic = self.scheduler.is_atomic();
        let lock = if atomic {
            match self
                .scheduler
                .try_lock(agent)
                .await
                .map_err(OnDemandError::Lock)?
            {
                Some(lock) => Some(lock),
                None => {
                    tracing::debug!(
                        provider = agent.provider_name(),
                        agent_type = agent.agent_type(),
                        "Agent is locked elsewhere, on-demand update has to be retried",
                    );
                    metric!(
                        counter("ondemand.lock.contended") += 1,
                        "provider" => agent.provider_name(),
                    );
                    return Ok(AgentOutcome::Contended);
                }
            }
        } else {
            None
        };

        // A panicking agent must not keep its lock until expiry.
        let refresh = self.refresh(agent, on_demand, cache.as_ref(), lock.as_ref(), atomic, data);
        let refreshed = AssertUnwindSafe(refresh)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(OnDemandError::Panicked(panic_message(&*panic))));

        if let Some(lock) = lock {
            match &refreshed {
                // the lock is gone already
                Ok(AgentOutcome::Contended) => {}
                Ok(AgentOutcome::Written(_)) => match self.scheduler.try_release(lock).await {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(OnDemandError::StaleWrite(anyhow::anyhow!(
                            "agent lock was not held anymore"
                        )));
                    }
                    Err(error) => return Err(OnDemandError::StaleWrite(error)),
                },
                _ => self.release_unused(agent, lock).await,
            }
        }

        let outcome = refreshed?;
        if let AgentOutcome::Written(_) | AgentOutcome::Unchanged = outcome {
            let elapsed = start.elapsed();
            if let Some(metrics) = on_demand.metrics() {
                metrics.record_total_run_time(elapsed);
            }
            tracing::info!(
                provider = agent.provider_name(),
                agent_type = %on_demand.on_demand_agent_type(),
                on_demand_type = %on_demand_type,
                elapsed_ms = elapsed.as_millis() as u64,
                "Handled on-demand update",
            );
        }
        Ok(outcome)
    }

    /// Runs the agent and writes its result, without touching the agent lock.
    async fn refresh(
        &self,
        agent: &dyn Agent,
        on_demand: &dyn OnDemandAgent,
        cache: &dyn ProviderCache,
        lock: Option<&AgentLock>,
        atomic: bool,
        data: &OnDemandPayload,
    ) -> Result<AgentOutcome, OnDemandError> {
        if let Some(metrics) = on_demand.metrics() {
            metrics.count_on_demand();
        }

        let Some(result) = on_demand
            .handle(cache, data)
            .await
            .map_err(OnDemandError::Handle)?
        else {
            return Ok(AgentOutcome::NoResult);
        };

        if let Some(lock) = lock {
            let valid = self
                .scheduler
                .lock_valid(lock)
                .await
                .map_err(OnDemandError::Lock)?;
            if !valid {
                tracing::debug!(
                    provider = agent.provider_name(),
                    agent_type = agent.agent_type(),
                    "Agent lock expired during on-demand update, dropping the result",
                );
                metric!(
                    counter("ondemand.lock.contended") += 1,
                    "provider" => agent.provider_name(),
                );
                return Ok(AgentOutcome::Contended);
            }
        }

        let Some(metrics) = on_demand.metrics() else {
            tracing::warn!(
                provider = agent.provider_name(),
                agent_type = %on_demand.on_demand_agent_type(),
                "On-demand agent has no instrumentation, dropping its result",
            );
            return Ok(AgentOutcome::Uninstrumented);
        };

        if result.cache_result.is_none() && result.evictions.is_empty() {
            return Ok(AgentOutcome::Unchanged);
        }

        let mut cached_identifiers = BTreeMap::new();
        if let Some(cache_result) = &result.cache_result {
            metrics
                .cache_write(async {
                    if cache_result.is_partial() {
                        cache
                            .add_cache_result(
                                &result.source_agent_type,
                                &result.authoritative_types,
                                cache_result,
                            )
                            .await
                    } else {
                        cache
                            .put_cache_result(
                                &result.source_agent_type,
                                &result.authoritative_types,
                                cache_result,
                            )
                            .await
                    }
                })
                .await
                .map_err(OnDemandError::CacheWrite)?;

            // Non-atomic schedulers give no guarantee the write is visible, so callers are told
            // what was written and check back.
            if !atomic && !cache_result.is_empty() {
                cached_identifiers = cache_result.identifiers_by_type();
            }
        }

        if !result.evictions.is_empty() {
            metrics
                .cache_evict(async {
                    for (ty, ids) in &result.evictions {
                        cache.evict_deleted_items(ty, ids).await?;
                    }
                    Ok::<_, anyhow::Error>(())
                })
                .await
                .map_err(OnDemandError::Evict)?;
        }

        Ok(AgentOutcome::Written(cached_identifiers))
    }

    /// Releases a lock under which nothing was written.
    async fn release_unused(&self, agent: &dyn Agent, lock: AgentLock) {
        match self.scheduler.try_release(lock).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                provider = agent.provider_name(),
                agent_type = agent.agent_type(),
                "Agent lock was not held anymore",
            ),
            Err(error) => tracing::warn!(
                provider = agent.provider_name(),
                agent_type = agent.agent_type(),
                error = %error,
                "Failed to release agent lock",
            ),
        }
    }
}

fn report_failure(
    agent: &dyn Agent,
    on_demand: &dyn OnDemandAgent,
    on_demand_type: &OnDemandType,
    error: &OnDemandError,
) {
    if let Some(metrics) = on_demand.metrics() {
        metrics.count_error();
    }

    let agent_type = on_demand.on_demand_agent_type();
    if error.is_stale_write() {
        metric!(
            counter("ondemand.stale_write_suspected") += 1,
            "provider" => agent.provider_name(),
            "agent_type" => agent_type.as_str(),
        );
        tracing::error!(
            provider = agent.provider_name(),
            agent_type = %agent_type,
            on_demand_type = %on_demand_type,
            error = error as &dyn std::error::Error,
            "On-demand update possibly overwrote newer data",
        );
    } else {
        tracing::warn!(
            provider = agent.provider_name(),
            agent_type = %agent_type,
            on_demand_type = %on_demand_type,
            error = error as &dyn std::error::Error,
            "Failed to handle on-demand update",
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
