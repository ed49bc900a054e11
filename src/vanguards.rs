//! Vanguards
//!
//! A [`VanguardLayer`] is a fixed array of slots, each holding a middle relay
//! and the unix time at which it rotates out (3 to 14 days after selection).
//! [`VanguardsLite`] pairs the guard pools with one second-layer vanguard
//! set: circuits run guard → second-layer vanguard → anything.

use crate::config::ClientConfig;
use crate::error::{Result, TorError};
use crate::guards::{GuardConnector, GuardPoolState, GuardSystem};
use crate::protocol::relay::{RelaySelector, RouterDescriptor, RouterIdentity};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// An occupied vanguard slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vanguard {
    pub router: RouterDescriptor,
    /// Unix time after which the slot is refilled
    pub rotation_deadline: u64,
}

impl Vanguard {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.rotation_deadline
    }
}

/// Persisted vanguard slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VanguardRecord {
    pub identity: RouterIdentity,
    pub rotation_deadline: u64,
}

/// Fixed-size set of vanguard slots
#[derive(Debug, Clone)]
pub struct VanguardLayer {
    slots: Vec<Option<Vanguard>>,
    min_lifetime: Duration,
    max_lifetime: Duration,
}

impl VanguardLayer {
    pub fn new(size: usize, min_lifetime: Duration, max_lifetime: Duration) -> Self {
        Self {
            slots: vec![None; size],
            min_lifetime,
            max_lifetime,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots
    pub fn vanguards(&self) -> impl Iterator<Item = &Vanguard> {
        self.slots.iter().flatten()
    }

    pub fn contains(&self, router: &RouterDescriptor) -> bool {
        self.vanguards().any(|v| v.router.same_router(router))
    }

    /// A uniformly chosen occupied slot
    pub fn get_random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Vanguard> {
        let occupied: Vec<&Vanguard> = self.vanguards().collect();
        occupied.choose(rng).copied()
    }

    fn draw<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        candidates: &[RouterDescriptor],
        exclusions: &[&RouterDescriptor],
        now: u64,
    ) -> Option<Vanguard> {
        let pool: Vec<&RouterDescriptor> = candidates
            .iter()
            .filter(|c| !self.contains(c))
            .filter(|c| !exclusions.iter().any(|e| e.same_router(c)))
            .collect();
        let router = (*pool.choose(rng)?).clone();
        let lifetime = rng.gen_range(self.min_lifetime.as_secs()..=self.max_lifetime.as_secs());
        Some(Vanguard {
            router,
            rotation_deadline: now + lifetime,
        })
    }

    /// Refill every empty or expired slot
    ///
    /// Candidates already in this layer or matching `exclusions` (guards and
    /// peer layers) are skipped. Returns how many slots were filled.
    pub fn fix_all<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        candidates: &[RouterDescriptor],
        exclusions: &[&RouterDescriptor],
        now: u64,
    ) -> usize {
        let mut filled = 0;
        for index in 0..self.slots.len() {
            let stale = match &self.slots[index] {
                Some(vanguard) => vanguard.is_expired(now),
                None => true,
            };
            if !stale {
                continue;
            }
            if let Some(expired) = self.slots[index].take() {
                log::debug!("🔄 Vanguard {} rotated out", expired.router.nickname);
            }
            self.slots[index] = self.draw(rng, candidates, exclusions, now);
            if self.slots[index].is_some() {
                filled += 1;
            }
        }
        filled
    }

    /// Empty every slot holding one of `routers`; returns how many were emptied
    pub fn evict(&mut self, routers: &[&RouterDescriptor]) -> usize {
        let mut evicted = 0;
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(v) if routers.iter().any(|r| r.same_router(&v.router))) {
                *slot = None;
                evicted += 1;
            }
        }
        evicted
    }

    /// Remove `bad` and immediately draw its replacement
    ///
    /// Returns `None` if `bad` is not in this layer or nothing could replace it.
    pub fn replace_bad<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        bad: &RouterDescriptor,
        candidates: &[RouterDescriptor],
        exclusions: &[&RouterDescriptor],
        now: u64,
    ) -> Option<RouterDescriptor> {
        let index = self
            .slots
            .iter()
            .position(|s| matches!(s, Some(v) if v.router.same_router(bad)))?;
        self.slots[index] = None;

        let mut excluded: Vec<&RouterDescriptor> = exclusions.to_vec();
        excluded.push(bad);
        self.slots[index] = self.draw(rng, candidates, &excluded, now);
        self.slots[index].as_ref().map(|v| v.router.clone())
    }

    pub fn records(&self) -> Vec<VanguardRecord> {
        self.vanguards()
            .map(|v| VanguardRecord {
                identity: v.router.identity(),
                rotation_deadline: v.rotation_deadline,
            })
            .collect()
    }

    /// Refill slots from persisted records; unknown routers leave the slot empty
    pub fn restore(&mut self, records: &[VanguardRecord], relays: &[RouterDescriptor]) {
        for (slot, record) in self.slots.iter_mut().zip(records) {
            *slot = relays
                .iter()
                .find(|r| r.identity().matches(&record.identity))
                .map(|router| Vanguard {
                    router: router.clone(),
                    rotation_deadline: record.rotation_deadline,
                });
        }
    }
}

/// Snapshot of guard and vanguard state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    pub guards: GuardPoolState,
    pub second_layer: Vec<VanguardRecord>,
}

/// Guards plus one second-layer vanguard set
pub struct VanguardsLite {
    guards: GuardSystem,
    second_layer: Mutex<VanguardLayer>,
    relays: RelaySelector,
    rng: Mutex<StdRng>,
}

impl VanguardsLite {
    pub fn new(relays: RelaySelector, config: &ClientConfig, mut rng: StdRng) -> Self {
        let guard_rng = StdRng::from_rng(&mut rng).unwrap_or_else(|_| StdRng::seed_from_u64(0));
        let guards = GuardSystem::new(relays.relays(), config, guard_rng);
        let layer = VanguardLayer::new(
            config.vanguard_layer_size,
            config.vanguard_min_lifetime,
            config.vanguard_max_lifetime,
        );
        let lite = Self {
            guards,
            second_layer: Mutex::new(layer),
            relays,
            rng: Mutex::new(rng),
        };
        lite.fix_all();
        lite
    }

    /// Rebuild from persisted state, then refill anything missing or expired
    pub fn restore(
        state: &PoolState,
        relays: RelaySelector,
        config: &ClientConfig,
        mut rng: StdRng,
    ) -> Self {
        let guard_rng = StdRng::from_rng(&mut rng).unwrap_or_else(|_| StdRng::seed_from_u64(0));
        let mut layer = VanguardLayer::new(
            config.vanguard_layer_size,
            config.vanguard_min_lifetime,
            config.vanguard_max_lifetime,
        );
        layer.restore(&state.second_layer, relays.relays());
        let vanguards: Vec<&RouterDescriptor> = layer.vanguards().map(|v| &v.router).collect();
        let guards = GuardSystem::restore(
            &state.guards,
            relays.relays(),
            config,
            guard_rng,
            &vanguards,
        );
        let lite = Self {
            guards,
            second_layer: Mutex::new(layer),
            relays,
            rng: Mutex::new(rng),
        };
        lite.fix_all();
        lite
    }

    fn layer(&self) -> MutexGuard<'_, VanguardLayer> {
        self.second_layer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn guards(&self) -> &GuardSystem {
        &self.guards
    }

    pub fn relays(&self) -> &RelaySelector {
        &self.relays
    }

    pub fn second_layer(&self) -> VanguardLayer {
        self.layer().clone()
    }

    fn middle_candidates(&self) -> Vec<RouterDescriptor> {
        self.relays.middles().into_iter().cloned().collect()
    }

    /// Every router held by the guard pools
    fn guard_routers(&self) -> Vec<RouterDescriptor> {
        let mut held = self.guards.primary();
        held.extend(self.guards.filtered());
        held.extend(self.guards.sampled());
        held
    }

    /// Every router held by the second layer
    fn vanguard_routers(&self) -> Vec<RouterDescriptor> {
        self.layer().vanguards().map(|v| v.router.clone()).collect()
    }

    /// Refill empty or expired second-layer slots, never reusing a guard
    ///
    /// A vanguard that has become a guard loses its slot first.
    pub fn fix_all(&self) -> usize {
        let guards = self.guard_routers();
        let exclusions: Vec<&RouterDescriptor> = guards.iter().collect();
        let candidates = self.middle_candidates();
        let mut layer = self.layer();
        let evicted = layer.evict(&exclusions);
        if evicted > 0 {
            log::warn!("⚠️ Evicted {} vanguards that are also guards", evicted);
        }
        let filled = layer.fix_all(&mut *self.rng(), &candidates, &exclusions, unix_now());
        drop(layer);
        if filled > 0 {
            log::info!("🛡️ Filled {} second-layer vanguard slots", filled);
        }
        filled
    }

    /// Entry guard for a new circuit, avoiding `existing`
    pub async fn get_entry_guard<C: GuardConnector>(
        &self,
        connector: &C,
        existing: &[&RouterDescriptor],
    ) -> Result<(RouterDescriptor, C::Connection)> {
        self.guards.get_random_primary(connector, existing).await
    }

    /// Second-layer vanguard not matching any of `existing`
    pub fn get_second_layer_vanguard(
        &self,
        existing: &[&RouterDescriptor],
    ) -> Result<RouterDescriptor> {
        let now = unix_now();
        if self.layer().vanguards().any(|v| v.is_expired(now)) {
            self.fix_all();
        }

        let layer = self.layer();
        let usable: Vec<&Vanguard> = layer
            .vanguards()
            .filter(|v| !existing.iter().any(|e| e.same_router(&v.router)))
            .collect();
        if usable.is_empty() {
            drop(layer);
            if self.fix_all() == 0 {
                return Err(TorError::NoRelaysAvailable(
                    "no usable second-layer vanguard".into(),
                ));
            }
            return self.get_second_layer_vanguard(existing);
        }
        let chosen = usable
            .choose(&mut *self.rng())
            .map(|v| v.router.clone())
            .ok_or_else(|| TorError::NoRelaysAvailable("no second-layer vanguard".into()))?;
        Ok(chosen)
    }

    /// Replace `bad` wherever it is held, returning the replacement
    pub fn replace_bad_relay(&self, bad: &RouterDescriptor) -> Result<RouterDescriptor> {
        let replacement = if self.layer().contains(bad) {
            let guards = self.guard_routers();
            let exclusions: Vec<&RouterDescriptor> = guards.iter().collect();
            let candidates = self.middle_candidates();
            self.layer()
                .replace_bad(&mut *self.rng(), bad, &candidates, &exclusions, unix_now())
        } else {
            let vanguards = self.vanguard_routers();
            let exclusions: Vec<&RouterDescriptor> = vanguards.iter().collect();
            self.guards.replace_bad(bad, &exclusions)
        };
        replacement.ok_or_else(|| {
            TorError::NoRelaysAvailable(format!(
                "{} is not a guard or vanguard with a replacement",
                bad.nickname
            ))
        })
    }

    pub fn state(&self) -> PoolState {
        PoolState {
            guards: self.guards.state(),
            second_layer: self.layer().records(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guards::tests::{guard_router, ScriptedConnector};
    use crate::protocol::relay::tests::test_router;

    const DAY: u64 = 24 * 60 * 60;

    fn layer(size: usize) -> VanguardLayer {
        VanguardLayer::new(
            size,
            Duration::from_secs(3 * DAY),
            Duration::from_secs(14 * DAY),
        )
    }

    fn middles(range: std::ops::RangeInclusive<u8>) -> Vec<RouterDescriptor> {
        range.map(test_router).collect()
    }

    #[test]
    fn test_fix_all_fills_with_deadlines() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = layer(4);
        let candidates = middles(1..=10);
        assert_eq!(layer.fix_all(&mut rng, &candidates, &[], 1_000), 4);
        assert_eq!(layer.vanguards().count(), 4);
        for v in layer.vanguards() {
            assert!(v.rotation_deadline >= 1_000 + 3 * DAY);
            assert!(v.rotation_deadline <= 1_000 + 14 * DAY);
        }
        // nothing stale, nothing refilled
        assert_eq!(layer.fix_all(&mut rng, &candidates, &[], 2_000), 0);
    }

    #[test]
    fn test_no_duplicates_and_exclusions_respected() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut layer = layer(3);
        let candidates = middles(1..=4);
        let guard = test_router(1);
        layer.fix_all(&mut rng, &candidates, &[&guard], 0);

        let held: Vec<u8> = layer.vanguards().map(|v| v.router.fingerprint[0]).collect();
        assert_eq!(held.len(), 3);
        assert!(!held.contains(&1));
        let mut unique = held.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_exclusion_by_identity_not_object() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut layer = layer(1);
        let candidates = middles(1..=2);
        // same ed25519 identity, different RSA fingerprint
        let mut refreshed = test_router(50);
        refreshed.ed25519_id = test_router(1).ed25519_id;
        layer.fix_all(&mut rng, &candidates, &[&refreshed], 0);
        assert_eq!(layer.vanguards().next().unwrap().router.fingerprint, [2; 20]);
    }

    #[test]
    fn test_expired_slots_rotate() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut layer = layer(2);
        let candidates = middles(1..=8);
        layer.fix_all(&mut rng, &candidates, &[], 0);
        assert_eq!(layer.fix_all(&mut rng, &candidates, &[], 15 * DAY), 2);
        assert!(layer.vanguards().all(|v| !v.is_expired(15 * DAY)));
    }

    #[test]
    fn test_replace_bad() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = layer(2);
        let candidates = middles(1..=3);
        layer.fix_all(&mut rng, &candidates, &[], 0);
        let bad = layer.vanguards().next().unwrap().router.clone();

        let replacement = layer
            .replace_bad(&mut rng, &bad, &candidates, &[], 0)
            .unwrap();
        assert!(!replacement.same_router(&bad));
        assert!(!layer.contains(&bad));
        assert_eq!(layer.vanguards().count(), 2);
        assert!(layer
            .replace_bad(&mut rng, &test_router(99), &candidates, &[], 0)
            .is_none());
    }

    #[test]
    fn test_get_random_empty_layer() {
        let mut rng = StdRng::seed_from_u64(6);
        assert!(layer(3).get_random(&mut rng).is_none());
    }

    fn lite() -> VanguardsLite {
        let mut relays: Vec<RouterDescriptor> = (1..=4).map(guard_router).collect();
        relays.extend(middles(10..=20));
        let config = ClientConfig {
            guard_sample_size: 4,
            ..Default::default()
        };
        VanguardsLite::new(RelaySelector::new(relays), &config, StdRng::seed_from_u64(7))
    }

    #[tokio::test]
    async fn test_vanguards_never_guards() {
        let lite = lite();
        let (guard, _) = lite
            .get_entry_guard(&ScriptedConnector::refusing(&[]), &[])
            .await
            .unwrap();
        assert!(lite.guards().primary().iter().any(|g| g.same_router(&guard)));
        for _ in 0..20 {
            let v = lite.get_second_layer_vanguard(&[]).unwrap();
            assert!(!lite.guards().contains(&v));
            let replacement = lite.replace_bad_relay(&v).unwrap();
            assert!(!replacement.same_router(&v));
        }
        for n in 1..=4 {
            assert!(!lite.second_layer().contains(&guard_router(n)));
        }
    }

    #[test]
    fn test_replace_bad_guard_goes_to_guard_pools() {
        let lite = lite();
        let sampled = lite.guards().sampled();
        let bad = sampled.first().unwrap();
        lite.replace_bad_relay(bad).unwrap_err();
        assert!(!lite.guards().contains(bad));
    }

    #[test]
    fn test_guard_replacement_never_takes_a_vanguard() {
        let relays: Vec<RouterDescriptor> = (1..=6).map(guard_router).collect();
        let config = ClientConfig {
            guard_sample_size: 4,
            ..Default::default()
        };
        for seed in 0..50 {
            let lite = VanguardsLite::new(
                RelaySelector::new(relays.clone()),
                &config,
                StdRng::seed_from_u64(seed),
            );
            let bad = lite.guards().sampled()[0].clone();
            let _ = lite.replace_bad_relay(&bad);
            assert!(!lite.guards().contains(&bad));
            assert!(
                lite.second_layer()
                    .vanguards()
                    .all(|v| !lite.guards().contains(&v.router)),
                "seed {} left a guard in the second layer",
                seed
            );
        }
    }

    #[test]
    fn test_restored_vanguard_that_is_a_guard_is_evicted() {
        let far = unix_now() + 10 * DAY;
        let state = PoolState {
            guards: GuardPoolState {
                primary: vec![guard_router(1).identity()],
                ..Default::default()
            },
            second_layer: vec![VanguardRecord {
                identity: guard_router(1).identity(),
                rotation_deadline: far,
            }],
        };
        let restored = VanguardsLite::restore(
            &state,
            lite().relays().clone(),
            &ClientConfig {
                guard_sample_size: 4,
                ..Default::default()
            },
            StdRng::seed_from_u64(10),
        );
        assert!(restored.guards().primary()[0].same_router(&guard_router(1)));
        assert!(!restored.second_layer().contains(&guard_router(1)));
        assert!(restored
            .second_layer()
            .vanguards()
            .all(|v| !restored.guards().contains(&v.router)));
    }

    #[test]
    fn test_second_layer_avoids_existing() {
        let lite = lite();
        let held: Vec<RouterDescriptor> =
            lite.second_layer().vanguards().map(|v| v.router.clone()).collect();
        let (last, rest) = held.split_last().unwrap();
        let existing: Vec<&RouterDescriptor> = rest.iter().collect();
        let chosen = lite.get_second_layer_vanguard(&existing).unwrap();
        assert!(chosen.same_router(last));
    }

    #[test]
    fn test_state_round_trip() {
        let lite = lite();
        let state = lite.state();
        assert_eq!(state.second_layer.len(), 4);

        let json = serde_json::to_string(&state).unwrap();
        let loaded: PoolState = serde_json::from_str(&json).unwrap();
        let restored = VanguardsLite::restore(
            &loaded,
            lite.relays().clone(),
            &ClientConfig {
                guard_sample_size: 4,
                ..Default::default()
            },
            StdRng::seed_from_u64(8),
        );
        assert_eq!(restored.state().second_layer, state.second_layer);
    }
}
