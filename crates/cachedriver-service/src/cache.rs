//! Cache records and the per-provider cache view written to by agents.
//!
//! The storage engine behind the cache is not part of this crate. Agents and the on-demand
//! coordinator only ever talk to a [`ProviderCache`], a view of the cache scoped to a single
//! cloud provider, which is resolved by name through a [`ProviderRegistry`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Removal instructions, as a list of ids per cache type.
pub type Evictions = BTreeMap<String, Vec<String>>;

/// A single cacheable record.
///
/// The type of the record is not part of the record itself, but the key under which it is grouped
/// in a [`CacheResult`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheData {
    pub id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Ids of related records, grouped by the related type.
    #[serde(default)]
    pub relationships: BTreeMap<String, Vec<String>>,
}

impl CacheData {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_relationship(mut self, related_type: impl Into<String>, ids: Vec<String>) -> Self {
        self.relationships.insert(related_type.into(), ids);
        self
    }
}

/// How a [`CacheResult`] is merged into the cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    /// Replaces everything stored under the authoritative types of the writing agent.
    Authoritative,
    /// Adds to the stored records, leaving records which are not part of the result untouched.
    Partial,
}

/// Records grouped by cache type, produced by one agent run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheResult {
    kind: ResultKind,
    cache_results: BTreeMap<String, Vec<CacheData>>,
}

impl CacheResult {
    pub fn authoritative(cache_results: BTreeMap<String, Vec<CacheData>>) -> Self {
        Self {
            kind: ResultKind::Authoritative,
            cache_results,
        }
    }

    pub fn partial(cache_results: BTreeMap<String, Vec<CacheData>>) -> Self {
        Self {
            kind: ResultKind::Partial,
            cache_results,
        }
    }

    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    pub fn is_partial(&self) -> bool {
        self.kind == ResultKind::Partial
    }

    pub fn cache_results(&self) -> &BTreeMap<String, Vec<CacheData>> {
        &self.cache_results
    }

    /// Returns `true` if no type holds any record.
    pub fn is_empty(&self) -> bool {
        self.cache_results.values().all(Vec::is_empty)
    }

    /// The ids of all records, grouped by type. Types without records are omitted.
    pub fn identifiers_by_type(&self) -> BTreeMap<String, Vec<String>> {
        self.cache_results
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(ty, records)| {
                let ids = records.iter().map(|record| record.id.clone()).collect();
                (ty.clone(), ids)
            })
            .collect()
    }
}

/// A view of the cache scoped to one cloud provider.
#[async_trait]
pub trait ProviderCache: Send + Sync {
    /// Replaces all records of `authoritative_types` with the ones in `cache_result`.
    ///
    /// Records of other types in the result are merged additively.
    async fn put_cache_result(
        &self,
        source_agent_type: &str,
        authoritative_types: &[String],
        cache_result: &CacheResult,
    ) -> Result<()>;

    /// Merges `cache_result` into the cache without removing anything.
    async fn add_cache_result(
        &self,
        source_agent_type: &str,
        authoritative_types: &[String],
        cache_result: &CacheResult,
    ) -> Result<()>;

    /// Removes the given records of one type.
    async fn evict_deleted_items(&self, ty: &str, ids: &[String]) -> Result<()>;

    /// Stores a single record, which agents use to keep track of their on-demand requests.
    async fn put_cache_data(&self, ty: &str, data: CacheData) -> Result<()>;

    /// Returns all records of the given type.
    async fn get_all(&self, ty: &str) -> Result<Vec<CacheData>>;
}

/// Resolves provider names to their cache views.
pub trait ProviderRegistry: Send + Sync {
    fn provider_cache(&self, provider_name: &str) -> Option<Arc<dyn ProviderCache>>;
}

/// A fixed set of provider caches, keyed by provider name.
#[derive(Clone, Default)]
pub struct ProviderCaches {
    caches: HashMap<String, Arc<dyn ProviderCache>>,
}

impl ProviderCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider_name: impl Into<String>, cache: Arc<dyn ProviderCache>) {
        self.caches.insert(provider_name.into(), cache);
    }

    pub fn with(mut self, provider_name: impl Into<String>, cache: Arc<dyn ProviderCache>) -> Self {
        self.insert(provider_name, cache);
        self
    }
}

impl fmt::Debug for ProviderCaches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.caches.keys()).finish()
    }
}

impl ProviderRegistry for ProviderCaches {
    fn provider_cache(&self, provider_name: &str) -> Option<Arc<dyn ProviderCache>> {
        self.caches.get(provider_name).cloned()
    }
}
