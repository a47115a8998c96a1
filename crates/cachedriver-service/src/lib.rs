//! On-demand cache coordination for the cloud resource cache.
//!
//! The cache is populated by many caching agents polling their cloud provider on independent
//! schedules. This crate coordinates the synchronous "on-demand" refreshes which ask a narrow set
//! of those agents to re-fetch and recache data right away, and the interval policy that controls
//! the background cadence of the same agents.
//!
//! The main entry point is [`services::create_on_demand_updater`], which builds an
//! [`OnDemandCacheUpdater`](ondemand::OnDemandCacheUpdater) from the [`Config`](config::Config).

#[macro_use]
pub mod metrics;

pub mod agent;
pub mod cache;
pub mod config;
pub mod interval;
pub mod logging;
pub mod ondemand;
pub mod scheduler;
pub mod services;
