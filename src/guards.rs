//! Entry guard selection
//!
//! Guards move through three pools:
//!
//! - **sampled**: drawn once from the guard-capable relays
//! - **filtered**: reached before, or demoted from primary
//! - **primary**: the guards circuits actually start from
//!
//! A router is in at most one pool. Selection prefers a random primary; if
//! none is reachable, filtered then sampled candidates are tried in order and
//! the first that connects is promoted, demoting the primary it displaces.
//! Pool mutations happen under one lock; connection attempts happen outside it.

use crate::config::ClientConfig;
use crate::error::{Result, TorError};
use crate::protocol::relay::{RouterDescriptor, RouterIdentity};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

/// Opens a link to a guard
///
/// `Connection` is whatever the caller needs to keep: a
/// [`crate::protocol::Channel`] in the client, a marker in tests.
#[async_trait]
pub trait GuardConnector: Send + Sync {
    type Connection: Send;

    async fn connect(&self, guard: &RouterDescriptor) -> Result<Self::Connection>;
}

/// Persisted guard pools, by router identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardPoolState {
    pub sampled: Vec<RouterIdentity>,
    pub filtered: Vec<RouterIdentity>,
    pub primary: Vec<RouterIdentity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pool {
    Sampled,
    Filtered,
    Primary,
}

#[derive(Debug, Default)]
struct GuardPools {
    sampled: Vec<RouterDescriptor>,
    filtered: Vec<RouterDescriptor>,
    primary: Vec<RouterDescriptor>,
    /// Replaced as bad; never sampled again
    bad: Vec<RouterDescriptor>,
}

impl GuardPools {
    fn pool_mut(&mut self, pool: Pool) -> &mut Vec<RouterDescriptor> {
        match pool {
            Pool::Sampled => &mut self.sampled,
            Pool::Filtered => &mut self.filtered,
            Pool::Primary => &mut self.primary,
        }
    }

    fn locate(&self, router: &RouterDescriptor) -> Option<Pool> {
        if self.primary.iter().any(|g| g.same_router(router)) {
            Some(Pool::Primary)
        } else if self.filtered.iter().any(|g| g.same_router(router)) {
            Some(Pool::Filtered)
        } else if self.sampled.iter().any(|g| g.same_router(router)) {
            Some(Pool::Sampled)
        } else {
            None
        }
    }

    fn remove(&mut self, router: &RouterDescriptor) -> Option<Pool> {
        let pool = self.locate(router)?;
        self.pool_mut(pool).retain(|g| !g.same_router(router));
        Some(pool)
    }

    fn contains(&self, router: &RouterDescriptor) -> bool {
        self.locate(router).is_some()
    }
}

/// Sampled/filtered/primary guard pools
pub struct GuardSystem {
    pools: Mutex<GuardPools>,
    /// Every guard-capable relay, for re-sampling
    candidates: Vec<RouterDescriptor>,
    sample_size: usize,
    primary_size: usize,
    rng: Mutex<StdRng>,
}

impl GuardSystem {
    /// Sample guards from `relays`
    pub fn new(relays: &[RouterDescriptor], config: &ClientConfig, mut rng: StdRng) -> Self {
        let mut candidates: Vec<RouterDescriptor> = relays
            .iter()
            .filter(|r| r.is_guard() && r.flags.v2_dir)
            .cloned()
            .collect();
        candidates.shuffle(&mut rng);
        let sampled: Vec<RouterDescriptor> = candidates
            .iter()
            .take(config.guard_sample_size)
            .cloned()
            .collect();
        log::info!(
            "🛡️ Sampled {} guards from {} candidates",
            sampled.len(),
            candidates.len()
        );

        Self {
            pools: Mutex::new(GuardPools {
                sampled,
                ..Default::default()
            }),
            candidates,
            sample_size: config.guard_sample_size,
            primary_size: config.primary_guards,
            rng: Mutex::new(rng),
        }
    }

    /// Rebuild pools from persisted identities
    ///
    /// Identities no longer present in `relays` are dropped; the sample is
    /// topped up from the remaining candidates, never drawing from `exclude`.
    pub fn restore(
        state: &GuardPoolState,
        relays: &[RouterDescriptor],
        config: &ClientConfig,
        rng: StdRng,
        exclude: &[&RouterDescriptor],
    ) -> Self {
        let mut system = Self::new(relays, config, rng);
        let resolve = |ids: &[RouterIdentity]| -> Vec<RouterDescriptor> {
            ids.iter()
                .filter_map(|id| relays.iter().find(|r| r.identity().matches(id)))
                .cloned()
                .collect()
        };
        let mut pools = GuardPools {
            sampled: resolve(&state.sampled),
            filtered: resolve(&state.filtered),
            primary: resolve(&state.primary),
            bad: Vec::new(),
        };
        pools.primary.truncate(system.primary_size);
        system.pools = Mutex::new(pools);
        system.top_up(exclude);
        log::info!("🛡️ Restored guard pools ({} primary)", state.primary.len());
        system
    }

    fn pools(&self) -> MutexGuard<'_, GuardPools> {
        self.pools
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Draw new sampled guards until the sample is full again
    fn top_up(&self, exclude: &[&RouterDescriptor]) {
        let mut pools = self.pools();
        let held = pools.sampled.len() + pools.filtered.len() + pools.primary.len();
        if held >= self.sample_size {
            return;
        }
        let mut fresh: Vec<RouterDescriptor> = self
            .candidates
            .iter()
            .filter(|c| !pools.contains(c))
            .filter(|c| !pools.bad.iter().any(|b| b.same_router(c)))
            .filter(|c| !exclude.iter().any(|e| e.same_router(c)))
            .cloned()
            .collect();
        fresh.shuffle(&mut *self.rng());
        fresh.truncate(self.sample_size - held);
        pools.sampled.extend(fresh);
    }

    pub fn primary(&self) -> Vec<RouterDescriptor> {
        self.pools().primary.clone()
    }

    pub fn filtered(&self) -> Vec<RouterDescriptor> {
        self.pools().filtered.clone()
    }

    pub fn sampled(&self) -> Vec<RouterDescriptor> {
        self.pools().sampled.clone()
    }

    pub fn contains(&self, router: &RouterDescriptor) -> bool {
        self.pools().contains(router)
    }

    /// Pick a reachable primary guard and return it with its connection
    ///
    /// Routers matching `exclude` are never tried.
    pub async fn get_random_primary<C: GuardConnector>(
        &self,
        connector: &C,
        exclude: &[&RouterDescriptor],
    ) -> Result<(RouterDescriptor, C::Connection)> {
        let excluded = |r: &RouterDescriptor| exclude.iter().any(|e| e.same_router(r));

        let (primary, fallbacks) = {
            let pools = self.pools();
            let mut primaries: Vec<RouterDescriptor> =
                pools.primary.iter().filter(|g| !excluded(g)).cloned().collect();
            primaries.shuffle(&mut *self.rng());
            let fallbacks: Vec<(Pool, RouterDescriptor)> = pools
                .filtered
                .iter()
                .map(|g| (Pool::Filtered, g.clone()))
                .chain(pools.sampled.iter().map(|g| (Pool::Sampled, g.clone())))
                .filter(|(_, g)| !excluded(g))
                .collect();
            (primaries.into_iter().next(), fallbacks)
        };

        if let Some(guard) = &primary {
            match connector.connect(guard).await {
                Ok(connection) => {
                    log::debug!("🛡️ Using primary guard {}", guard.nickname);
                    return Ok((guard.clone(), connection));
                }
                Err(e) => log::warn!("⚠️ Primary guard {} unreachable: {}", guard.nickname, e),
            }
        }

        for (pool, candidate) in fallbacks {
            match connector.connect(&candidate).await {
                Ok(connection) => {
                    self.promote(&candidate, pool, primary.as_ref());
                    return Ok((candidate, connection));
                }
                Err(e) => log::debug!("Guard candidate {} failed: {}", candidate.nickname, e),
            }
        }

        Err(TorError::NoRelaysAvailable("no reachable guard".into()))
    }

    fn promote(&self, guard: &RouterDescriptor, from: Pool, displaced: Option<&RouterDescriptor>) {
        let mut pools = self.pools();
        // A concurrent selection may have promoted it already
        if pools.primary.iter().any(|g| g.same_router(guard)) {
            return;
        }
        pools.pool_mut(from).retain(|g| !g.same_router(guard));

        let demote = match displaced {
            Some(d) => Some(d.clone()),
            None if pools.primary.len() >= self.primary_size => pools.primary.first().cloned(),
            None => None,
        };
        if let Some(demoted) = demote {
            if pools.remove(&demoted) == Some(Pool::Primary) {
                log::info!("🛡️ Demoting guard {} to filtered", demoted.nickname);
                pools.filtered.push(demoted);
            }
        }

        log::info!("🛡️ Promoted guard {} to primary", guard.nickname);
        pools.primary.push(guard.clone());
    }

    /// Drop `bad` from the pools and draw its replacement
    ///
    /// A bad primary is replaced by the first filtered (or sampled) guard;
    /// a bad sampled/filtered guard by a fresh sample. Fresh samples never
    /// come from `exclude`. Returns `None` when `bad` is not a guard.
    pub fn replace_bad(
        &self,
        bad: &RouterDescriptor,
        exclude: &[&RouterDescriptor],
    ) -> Option<RouterDescriptor> {
        let removed_from = {
            let mut pools = self.pools();
            let pool = pools.remove(bad)?;
            pools.bad.push(bad.clone());
            pool
        };
        log::warn!("🚫 Guard {} marked bad", bad.nickname);
        let sampled_before = self.pools().sampled.len();
        self.top_up(exclude);

        let mut pools = self.pools();
        let replacement = match removed_from {
            Pool::Primary => {
                let next = if !pools.filtered.is_empty() {
                    Some(pools.filtered.remove(0))
                } else if !pools.sampled.is_empty() {
                    Some(pools.sampled.remove(0))
                } else {
                    None
                };
                if let Some(guard) = &next {
                    pools.primary.push(guard.clone());
                }
                next
            }
            Pool::Filtered | Pool::Sampled if pools.sampled.len() > sampled_before => {
                pools.sampled.last().cloned()
            }
            Pool::Filtered | Pool::Sampled => None,
        };
        replacement
    }

    /// Snapshot the pools for persistence
    pub fn state(&self) -> GuardPoolState {
        let pools = self.pools();
        let ids = |v: &[RouterDescriptor]| v.iter().map(|r| r.identity()).collect();
        GuardPoolState {
            sampled: ids(&pools.sampled),
            filtered: ids(&pools.filtered),
            primary: ids(&pools.primary),
        }
    }
}
