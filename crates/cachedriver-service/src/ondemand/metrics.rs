//! Instrumentation of on-demand agents.
//!
//! Every on-demand agent owns one [`OnDemandMetrics`], tagged with its provider, agent type and
//! the kind of requests it handles. The instrumented regions time a unit of work and report the
//! timer when the work is done, regardless of whether it succeeded, failed or was dropped.
//!
//! Reported metrics:
//!
//! - `ondemand.read`, `ondemand.transform`, `ondemand.store`: timers of the agent's own steps.
//! - `ondemand.cache_write`, `ondemand.evict`: timers of the cache mutations.
//! - `ondemand.count`, `ondemand.error`: counters of invocations and failed invocations.
//! - `ondemand.total`: timer of a complete on-demand run of the agent.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::metrics::prelude::*;
use crate::metrics::{self, MetricsClient};

#[derive(Clone)]
pub struct OnDemandMetrics {
    provider: String,
    agent_type: String,
    on_demand_type: String,
    client: Option<Arc<MetricsClient>>,
}

impl OnDemandMetrics {
    /// Creates instrumentation reporting to the globally configured statsd client.
    pub fn new(
        provider: impl Into<String>,
        agent_type: impl Into<String>,
        on_demand_type: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            agent_type: agent_type.into(),
            on_demand_type: on_demand_type.into(),
            client: None,
        }
    }

    /// Reports to `client` instead of the global client.
    pub fn with_client(mut self, client: Arc<MetricsClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Times reading data from the cloud provider.
    pub async fn read_data<F: Future>(&self, f: F) -> F::Output {
        self.timed("ondemand.read", f).await
    }

    /// Times transforming provider data into cache records.
    pub async fn transform_data<F: Future>(&self, f: F) -> F::Output {
        self.timed("ondemand.transform", f).await
    }

    /// Times storing the request itself, so it can be tracked as pending.
    pub async fn on_demand_store<F: Future>(&self, f: F) -> F::Output {
        self.timed("ondemand.store", f).await
    }

    /// Times writing a result into the cache.
    pub async fn cache_write<F: Future>(&self, f: F) -> F::Output {
        self.timed("ondemand.cache_write", f).await
    }

    /// Times evicting records from the cache.
    pub async fn cache_evict<F: Future>(&self, f: F) -> F::Output {
        self.timed("ondemand.evict", f).await
    }

    pub fn count_on_demand(&self) {
        self.count("ondemand.count");
    }

    pub fn count_error(&self) {
        self.count("ondemand.error");
    }

    pub fn record_total_run_time(&self, elapsed: Duration) {
        self.time("ondemand.total", elapsed);
    }

    async fn timed<F: Future>(&self, name: &'static str, f: F) -> F::Output {
        let _guard = RegionTimer {
            metrics: self,
            name,
            start: Instant::now(),
        };
        f.await
    }

    fn count(&self, name: &str) {
        self.emit(|client| {
            client.send_metric(
                client
                    .count_with_tags(name, 1)
                    .with_tag("provider", &self.provider)
                    .with_tag("agent_type", &self.agent_type)
                    .with_tag("on_demand_type", &self.on_demand_type),
            );
        })
    }

    fn time(&self, name: &str, elapsed: Duration) {
        self.emit(|client| {
            client.send_metric(
                client
                    .time_with_tags(name, elapsed)
                    .with_tag("provider", &self.provider)
                    .with_tag("agent_type", &self.agent_type)
                    .with_tag("on_demand_type", &self.on_demand_type),
            );
        })
    }

    fn emit<F: FnOnce(&MetricsClient)>(&self, f: F) {
        match &self.client {
            Some(client) => f(client),
            None => metrics::with_client(f),
        }
    }
}

impl fmt::Debug for OnDemandMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnDemandMetrics")
            .field("provider", &self.provider)
            .field("agent_type", &self.agent_type)
            .field("on_demand_type", &self.on_demand_type)
            .finish()
    }
}

/// Reports the time spent in an instrumented region when dropped.
struct RegionTimer<'a> {
    metrics: &'a OnDemandMetrics,
    name: &'static str,
    start: Instant,
}

impl Drop for RegionTimer<'_> {
    fn drop(&mut self) {
        self.metrics.time(self.name, self.start.elapsed());
    }
}
