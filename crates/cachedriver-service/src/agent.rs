//! Caching agents and their optional capabilities.
//!
//! Every agent implements the base [`Agent`] trait. Agents which support synchronous refreshes
//! additionally implement [`OnDemandAgent`], agents which bring their own cadence implement
//! [`CustomScheduledAgent`]. The capabilities are exposed through [`Agent::as_on_demand`] and
//! [`Agent::as_custom_scheduled`], and are resolved once when the agent is registered with the
//! [`AgentRegistry`].

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::cache::ProviderCache;
use crate::ondemand::{
    OnDemandMetrics, OnDemandPayload, OnDemandResult, OnDemandType, PendingRequest,
};

/// Override value which makes an agent use the default interval.
pub const USE_DEFAULT_INTERVAL: i64 = -1;

/// A unit of work which fetches one slice of upstream state into the cache.
pub trait Agent: Send + Sync {
    /// The type of this agent, unique within its provider.
    fn agent_type(&self) -> &str;

    /// The name of the provider whose cache this agent writes to.
    fn provider_name(&self) -> &str;

    fn as_on_demand(&self) -> Option<&dyn OnDemandAgent> {
        None
    }

    fn as_custom_scheduled(&self) -> Option<&dyn CustomScheduledAgent> {
        None
    }
}

/// An agent that can be asked to refresh a narrow slice of data right away.
#[async_trait]
pub trait OnDemandAgent: Agent {
    /// The agent type used in logs and metrics of on-demand refreshes.
    fn on_demand_agent_type(&self) -> String {
        format!("{}-OnDemand", self.agent_type())
    }

    /// The instrumentation of this agent.
    ///
    /// Agents without instrumentation are invoked, but their results are never written.
    fn metrics(&self) -> Option<&OnDemandMetrics>;

    /// Whether this agent handles requests of the given type for the given cloud provider.
    fn handles(&self, on_demand_type: &OnDemandType, cloud_provider: &str) -> bool;

    /// Fetches the data described by `data` and returns what should be cached.
    ///
    /// `None` means the request did not resolve to anything this agent caches.
    async fn handle(
        &self,
        cache: &dyn ProviderCache,
        data: &OnDemandPayload,
    ) -> Result<Option<OnDemandResult>>;

    /// Lists the on-demand requests of this agent which have not been picked up by a regular
    /// agent run yet.
    async fn pending_on_demand_requests(
        &self,
        cache: &dyn ProviderCache,
    ) -> Result<Vec<PendingRequest>>;

    /// Looks up a single pending request by its `"id"` attribute.
    async fn pending_on_demand_request(
        &self,
        cache: &dyn ProviderCache,
        id: &str,
    ) -> Result<Option<PendingRequest>> {
        let pending = self.pending_on_demand_requests(cache).await?;
        Ok(pending
            .into_iter()
            .find(|request| request.get("id").and_then(Value::as_str) == Some(id)))
    }
}

/// An agent that overrides the default cadence.
///
/// Each value may be [`USE_DEFAULT_INTERVAL`] to keep the configured default.
pub trait CustomScheduledAgent: Agent {
    fn poll_interval_millis(&self) -> i64 {
        USE_DEFAULT_INTERVAL
    }

    fn error_interval_millis(&self) -> i64 {
        USE_DEFAULT_INTERVAL
    }

    fn timeout_millis(&self) -> i64 {
        USE_DEFAULT_INTERVAL
    }
}

/// The optional capabilities of an agent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AgentCapabilities {
    Plain,
    OnDemand,
    CustomInterval,
    Both,
}

impl AgentCapabilities {
    pub fn of(agent: &dyn Agent) -> Self {
        match (
            agent.as_on_demand().is_some(),
            agent.as_custom_scheduled().is_some(),
        ) {
            (false, false) => Self::Plain,
            (true, false) => Self::OnDemand,
            (false, true) => Self::CustomInterval,
            (true, true) => Self::Both,
        }
    }

    pub fn is_on_demand(self) -> bool {
        matches!(self, Self::OnDemand | Self::Both)
    }

    pub fn is_custom_interval(self) -> bool {
        matches!(self, Self::CustomInterval | Self::Both)
    }
}

/// An agent together with its capabilities.
#[derive(Clone)]
pub struct RegisteredAgent {
    agent: Arc<dyn Agent>,
    capabilities: AgentCapabilities,
}

impl RegisteredAgent {
    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn capabilities(&self) -> AgentCapabilities {
        self.capabilities
    }
}

impl fmt::Debug for RegisteredAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredAgent")
            .field("provider_name", &self.agent.provider_name())
            .field("agent_type", &self.agent.agent_type())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// All agents known to this instance, registered once at startup.
#[derive(Clone, Debug, Default)]
pub struct AgentRegistry {
    agents: Vec<RegisteredAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        let capabilities = AgentCapabilities::of(agent.as_ref());
        tracing::debug!(
            provider = agent.provider_name(),
            agent_type = agent.agent_type(),
            ?capabilities,
            "Registered caching agent"
        );
        self.agents.push(RegisteredAgent {
            agent,
            capabilities,
        });
    }

    pub fn agents(&self) -> impl Iterator<Item = &RegisteredAgent> {
        self.agents.iter()
    }

    /// Returns the agents of one provider.
    pub fn provider_agents<'a>(
        &'a self,
        provider_name: &'a str,
    ) -> impl Iterator<Item = &'a RegisteredAgent> + 'a {
        self.agents
            .iter()
            .filter(move |registered| registered.agent.provider_name() == provider_name)
    }

    /// Returns all agents that support on-demand refreshes.
    pub fn on_demand_agents(&self) -> impl Iterator<Item = &Arc<dyn Agent>> {
        self.agents
            .iter()
            .filter(|registered| registered.capabilities.is_on_demand())
            .map(|registered| &registered.agent)
    }
}
