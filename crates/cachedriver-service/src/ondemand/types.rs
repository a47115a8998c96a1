use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{CacheResult, Evictions};

/// The agent specific description of what to refresh.
pub type OnDemandPayload = BTreeMap<String, Value>;

/// An on-demand request that is waiting to be picked up by a regular agent run.
pub type PendingRequest = BTreeMap<String, Value>;

/// The kind of resource an on-demand request refers to.
///
/// Names compare case-insensitively. Besides the well-known kinds defined as constants, any name
/// is accepted so that agents can introduce their own kinds.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OnDemandType(Cow<'static, str>);

impl OnDemandType {
    pub const SERVER_GROUP: Self = Self::from_static("ServerGroup");
    pub const SECURITY_GROUP: Self = Self::from_static("SecurityGroup");
    pub const LOAD_BALANCER: Self = Self::from_static("LoadBalancer");
    pub const JOB: Self = Self::from_static("Job");
    pub const TARGET_GROUP: Self = Self::from_static("TargetGroup");
    pub const CLOUD_FORMATION: Self = Self::from_static("CloudFormation");
    pub const MANIFEST: Self = Self::from_static("Manifest");
    pub const FUNCTION: Self = Self::from_static("Function");

    const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for OnDemandType {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for OnDemandType {}

impl Hash for OnDemandType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.0.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for OnDemandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for OnDemandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OnDemandType({})", self.0)
    }
}

impl From<&str> for OnDemandType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// What a single agent produced for an on-demand request.
#[derive(Clone, Debug, PartialEq)]
pub struct OnDemandResult {
    pub source_agent_type: String,
    /// The types whose records are replaced by an authoritative [`CacheResult`].
    pub authoritative_types: Vec<String>,
    pub cache_result: Option<CacheResult>,
    pub evictions: Evictions,
}

impl OnDemandResult {
    pub fn new(source_agent_type: impl Into<String>) -> Self {
        Self {
            source_agent_type: source_agent_type.into(),
            authoritative_types: Vec::new(),
            cache_result: None,
            evictions: Evictions::new(),
        }
    }

    pub fn with_authoritative_types(mut self, types: Vec<String>) -> Self {
        self.authoritative_types = types;
        self
    }

    pub fn with_cache_result(mut self, cache_result: CacheResult) -> Self {
        self.cache_result = Some(cache_result);
        self
    }

    pub fn with_evictions(mut self, evictions: Evictions) -> Self {
        self.evictions = evictions;
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnDemandCacheStatus {
    /// The refreshed data is visible in the cache.
    Successful,
    /// The caller has to check back later, either because an agent was busy, or because the
    /// written data may not be visible yet.
    Pending,
}

impl OnDemandCacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Successful => "SUCCESSFUL",
            Self::Pending => "PENDING",
        }
    }
}

/// The aggregate outcome of an on-demand request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnDemandCacheResult {
    pub status: OnDemandCacheStatus,
    /// The ids written by the request, grouped by type. Only populated for pending results of
    /// non-atomic schedulers.
    pub cached_identifiers: BTreeMap<String, Vec<String>>,
}

impl OnDemandCacheResult {
    pub fn successful() -> Self {
        Self {
            status: OnDemandCacheStatus::Successful,
            cached_identifiers: BTreeMap::new(),
        }
    }

    pub fn pending(cached_identifiers: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            status: OnDemandCacheStatus::Pending,
            cached_identifiers,
        }
    }
}
