use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::config::Environment;

/// A slot of render concurrency.
///
/// Obtained from [`Budget::try_acquire`] or [`Budget::acquire`]. The slot goes
/// back to the pool when the token is passed to [`Budget::release`] or when it
/// is dropped, whichever happens first.
#[derive(Debug)]
pub struct BudgetToken {
    /// Who holds the slot, usually `"{run_id}/{sku}"`.
    pub holder: String,
    /// Timestamp when the slot was acquired.
    pub acquired_at: DateTime<Utc>,
    _permit: OwnedSemaphorePermit,
}

impl BudgetToken {
    fn new(holder: impl Into<String>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            holder: holder.into(),
            acquired_at: Utc::now(),
            _permit: permit,
        }
    }
}

/// Concurrency ceiling for in-flight render jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub limit: usize,
}

impl BudgetConfig {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    /// Default ceiling for an environment: small in dev, large in prod.
    pub fn for_environment(environment: Environment) -> Self {
        let limit = match environment {
            Environment::Dev => 2,
            Environment::Staging => 10,
            Environment::Prod => 50,
        };
        Self { limit }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self::for_environment(Environment::Dev)
    }
}

/// Admission gate bounding the number of concurrently submitted or polling
/// render jobs.
#[async_trait]
pub trait Budget: Send + Sync {
    /// Take a slot if one is free. Never waits.
    async fn try_acquire(
        &self,
        holder: &str,
    ) -> anyhow::Result<Option<BudgetToken>>;

    /// Take a slot, suspending until one is free. Waiters are served in
    /// arrival order.
    async fn acquire(&self, holder: &str) -> anyhow::Result<BudgetToken>;

    /// Return a slot to the pool.
    async fn release(&self, token: BudgetToken) -> anyhow::Result<()>;

    /// Returns (in-flight, limit).
    async fn utilization(&self) -> anyhow::Result<(usize, usize)>;

    async fn has_budget(&self) -> anyhow::Result<bool>;
}

/// Default in-memory implementation of [`Budget`] backed by a tokio
/// semaphore.
pub struct InMemoryBudget {
    config: BudgetConfig,
    semaphore: Arc<Semaphore>,
}

impl std::fmt::Debug for InMemoryBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBudget")
            .field("limit", &self.config.limit)
            .field("available", &self.semaphore.available_permits())
            .finish()
    }
}

impl InMemoryBudget {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            semaphore: Arc::new(Semaphore::new(config.limit)),
        }
    }

    pub fn limit(&self) -> usize {
        self.config.limit
    }

    fn in_flight(&self) -> usize {
        self.config
            .limit
            .saturating_sub(self.semaphore.available_permits())
    }
}

#[async_trait]
impl Budget for InMemoryBudget {
    async fn try_acquire(
        &self,
        holder: &str,
    ) -> anyhow::Result<Option<BudgetToken>> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(Some(BudgetToken::new(holder, permit))),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => bail!("budget has been closed"),
        }
    }

    async fn acquire(&self, holder: &str) -> anyhow::Result<BudgetToken> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("budget has been closed")?;
        Ok(BudgetToken::new(holder, permit))
    }

    async fn release(&self, token: BudgetToken) -> anyhow::Result<()> {
        drop(token);
        Ok(())
    }

    async fn utilization(&self) -> anyhow::Result<(usize, usize)> {
        Ok((self.in_flight(), self.config.limit))
    }

    async fn has_budget(&self) -> anyhow::Result<bool> {
        Ok(self.semaphore.available_permits() > 0)
    }
}
