//! The locking contract of the agent scheduler.
//!
//! Schedulers running agents across several instances hand out [`AgentLock`]s to guarantee that
//! only a single run of an agent writes to its cache partition at a time. Locks are optimistic:
//! they can expire or be taken over while the holder is still busy, so they have to be validated
//! before anything is written.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

use crate::agent::Agent;

/// Exclusive write rights to the partition of one agent, for a single run.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentLock {
    agent_type: String,
    token: String,
}

impl AgentLock {
    pub fn new(agent_type: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            token: token.into(),
        }
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    /// The scheduler specific value identifying this lock.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for AgentLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the token is an opaque secret of the scheduler
        f.debug_struct("AgentLock")
            .field("agent_type", &self.agent_type)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait AgentScheduler: Send + Sync {
    /// Whether this scheduler enforces mutual exclusion of agent runs.
    ///
    /// Non-atomic schedulers accept that the last writer wins, and never hand out locks.
    fn is_atomic(&self) -> bool;

    /// Tries to acquire the lock of `agent`, returning `None` if it is held elsewhere.
    async fn try_lock(&self, agent: &dyn Agent) -> Result<Option<AgentLock>>;

    /// Checks that `lock` is still held by us.
    async fn lock_valid(&self, lock: &AgentLock) -> Result<bool>;

    /// Releases `lock`, returning `false` if it was not held anymore.
    async fn try_release(&self, lock: AgentLock) -> Result<bool>;
}
