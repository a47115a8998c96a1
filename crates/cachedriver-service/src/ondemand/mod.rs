//! On-demand cache updates.
//!
//! An on-demand update asks the agents responsible for a resource to refresh it right away
//! instead of waiting for their next scheduled run. The [`OnDemandCacheUpdater`] is the interface
//! exposed to callers. It either dispatches to the [`OnDemandCoordinator`], or, when cache writes
//! are disabled, to the [`NoopOnDemandCacheUpdater`].
//!
//! Callers only ever see one of two outcomes: [`OnDemandCacheStatus::Successful`] when the
//! refreshed data is visible, or [`OnDemandCacheStatus::Pending`] when they should check back.

use async_trait::async_trait;

mod coordinator;
mod error;
mod metrics;
mod types;

pub use coordinator::OnDemandCoordinator;
pub use error::OnDemandError;
pub use metrics::OnDemandMetrics;
pub use types::*;

#[async_trait]
pub trait OnDemandCacheUpdater: Send + Sync {
    /// Whether requests of this type can be handled for the cloud provider.
    fn handles(&self, on_demand_type: &OnDemandType, cloud_provider: &str) -> bool;

    /// Refreshes the data described by `data`.
    async fn handle(
        &self,
        on_demand_type: &OnDemandType,
        cloud_provider: &str,
        data: &OnDemandPayload,
    ) -> OnDemandCacheResult;

    async fn pending_on_demand_requests(
        &self,
        on_demand_type: &OnDemandType,
        cloud_provider: &str,
    ) -> Vec<PendingRequest>;

    async fn pending_on_demand_request(
        &self,
        on_demand_type: &OnDemandType,
        cloud_provider: &str,
        id: &str,
    ) -> Option<PendingRequest>;
}

#[async_trait]
impl OnDemandCacheUpdater for OnDemandCoordinator {
    fn handles(&self, on_demand_type: &OnDemandType, cloud_provider: &str) -> bool {
        OnDemandCoordinator::handles(self, on_demand_type, cloud_provider)
    }

    async fn handle(
        &self,
        on_demand_type: &OnDemandType,
        cloud_provider: &str,
        data: &OnDemandPayload,
    ) -> OnDemandCacheResult {
        OnDemandCoordinator::handle(self, on_demand_type, cloud_provider, data).await
    }

    async fn pending_on_demand_requests(
        &self,
        on_demand_type: &OnDemandType,
        cloud_provider: &str,
    ) -> Vec<PendingRequest> {
        OnDemandCoordinator::pending_on_demand_requests(self, on_demand_type, cloud_provider).await
    }

    async fn pending_on_demand_request(
        &self,
        on_demand_type: &OnDemandType,
        cloud_provider: &str,
        id: &str,
    ) -> Option<PendingRequest> {
        OnDemandCoordinator::pending_on_demand_request(self, on_demand_type, cloud_provider, id)
            .await
    }
}

/// Accepts every request without doing anything, used when cache writes are disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopOnDemandCacheUpdater;

#[async_trait]
impl OnDemandCacheUpdater for NoopOnDemandCacheUpdater {
    fn handles(&self, _on_demand_type: &OnDemandType, _cloud_provider: &str) -> bool {
        false
    }

    async fn handle(
        &self,
        _on_demand_type: &OnDemandType,
        _cloud_provider: &str,
        _data: &OnDemandPayload,
    ) -> OnDemandCacheResult {
        OnDemandCacheResult::successful()
    }

    async fn pending_on_demand_requests(
        &self,
        _on_demand_type: &OnDemandType,
        _cloud_provider: &str,
    ) -> Vec<PendingRequest> {
        Vec::new()
    }

    async fn pending_on_demand_request(
        &self,
        _on_demand_type: &OnDemandType,
        _cloud_provider: &str,
        _id: &str,
    ) -> Option<PendingRequest> {
        None
    }
}
