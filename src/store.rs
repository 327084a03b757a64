//! Local value store with per-item expiry and randomized republish.
//!
//! Items are keyed by `(key, value)` since several values may share a key.
//! Each item owns one scheduler [`Owner`] under which its next republish job
//! is queued. Expiry is lazy: the republish job drops an expired item instead
//! of rescheduling, and reads filter expired items out.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use rand::Rng;
use rand_distr::{Beta, Distribution};
use tracing::trace;

use crate::config::Config;
use crate::id::NodeId;
use crate::node::{Ctx, Job, NodeTask};
use crate::scheduler::{Owner, Timestamp};

/// One stored value and its bookkeeping.
#[derive(Clone, Debug)]
pub struct StoredItem {
    pub expiration: Timestamp,
    /// Distance from the key to the farthest node that acknowledged the last
    /// network-wide store of this item.
    pub max_distance: Option<NodeId>,
    owner: Owner,
}

/// A direct replica push decided by a churn reaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemPush {
    pub key: NodeId,
    pub value: Vec<u8>,
    /// Remaining lifetime at the time of the push.
    pub ttl: u64,
}

#[derive(Debug)]
pub struct ValueStore {
    /// Address of the owning node, used to route republish jobs back.
    addr: SocketAddr,
    republish_time: u64,
    republish_time_delta: u64,
    republish_threshold: u32,
    items: BTreeMap<NodeId, BTreeMap<Vec<u8>, StoredItem>>,
    /// Close-contact removals since the last forced republish.
    removed_close: u32,
}

impl ValueStore {
    pub fn new(addr: SocketAddr, config: &Config) -> Self {
        Self {
            addr,
            republish_time: config.republish_time,
            republish_time_delta: config.republish_time_delta,
            republish_threshold: config.republish_threshold,
            items: BTreeMap::new(),
            removed_close: 0,
        }
    }

    /// Store or refresh `(key, value)` for `ttl` milliseconds.
    ///
    /// The expiration only ever moves forward. The item's republish job is
    /// replaced with a freshly drawn one. Returns the resulting expiration.
    pub fn store(&mut self, ctx: &mut Ctx<'_>, key: NodeId, value: Vec<u8>, ttl: u64) -> Timestamp {
        let now = ctx.now();
        let wanted = now.saturating_add(ttl);
        let delay = self.random_republish_time(ctx);

        let values = self.items.entry(key).or_default();
        let owner = match values.get_mut(&value) {
            Some(item) => {
                item.expiration = item.expiration.max(wanted);
                ctx.scheduler.cancel_all(item.owner);
                item.owner
            }
            None => {
                let owner = ctx.scheduler.new_owner();
                values.insert(
                    value.clone(),
                    StoredItem {
                        expiration: wanted,
                        max_distance: None,
                        owner,
                    },
                );
                owner
            }
        };
        let expiration = values.get(&value).map_or(wanted, |item| item.expiration);

        trace!(%key, expiration, next_republish = delay, "stored item");
        self.schedule_republish(ctx, owner, key, value, delay);
        expiration
    }

    /// Live values under `key`.
    pub fn get_items(&self, now: Timestamp, key: &NodeId) -> Vec<Vec<u8>> {
        self.items
            .get(key)
            .map(|values| {
                values
                    .iter()
                    .filter(|(_, item)| item.expiration > now)
                    .map(|(value, _)| value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, key: &NodeId, value: &[u8]) -> Option<&StoredItem> {
        self.items.get(key)?.get(value)
    }

    /// Number of items, expired ones included until their republish job
    /// notices.
    pub fn len(&self) -> usize {
        self.items.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn live_len(&self, now: Timestamp) -> usize {
        self.items
            .values()
            .flat_map(BTreeMap::values)
            .filter(|item| item.expiration > now)
            .count()
    }

    /// Remove an item and its republish job.
    pub fn delete(&mut self, ctx: &mut Ctx<'_>, key: &NodeId, value: &[u8]) -> bool {
        let Some(values) = self.items.get_mut(key) else {
            return false;
        };
        let Some(item) = values.remove(value) else {
            return false;
        };
        if values.is_empty() {
            self.items.remove(key);
        }
        ctx.scheduler.cancel_all(item.owner);
        true
    }

    /// Handle a firing republish job.
    ///
    /// Returns the remaining lifetime when the item should be pushed to the
    /// network again; in that case the next republish is already scheduled.
    /// An expired item is dropped and `None` is returned.
    pub fn republish_item(&mut self, ctx: &mut Ctx<'_>, key: &NodeId, value: &[u8]) -> Option<u64> {
        let now = ctx.now();
        let item = self.get(key, value)?;
        let (expiration, owner) = (item.expiration, item.owner);

        if now >= expiration {
            trace!(%key, expiration, "item expired");
            self.delete(ctx, key, value);
            return None;
        }

        let delay = self.random_republish_time(ctx);
        ctx.scheduler.cancel_all(owner);
        self.schedule_republish(ctx, owner, *key, value.to_vec(), delay);
        Some(expiration - now)
    }

    pub fn set_max_distance(&mut self, key: &NodeId, value: &[u8], distance: NodeId) {
        if let Some(item) = self.items.get_mut(key).and_then(|values| values.get_mut(value)) {
            item.max_distance = Some(distance);
        }
    }

    /// Items that should be pushed directly to a newly seen contact.
    ///
    /// An item is pushed when the contact is closer to its key than the item's
    /// last known replication boundary, or when this node has joined, the
    /// contact is close to the holder, and the key lies in the holder's close
    /// range.
    pub fn on_new_contact<F>(
        &self,
        now: Timestamp,
        contact: &NodeId,
        is_close: bool,
        joined: bool,
        in_close_range: F,
    ) -> Vec<ItemPush>
    where
        F: Fn(&NodeId) -> bool,
    {
        let mut pushes = Vec::new();
        for (key, values) in &self.items {
            let near_holder = joined && is_close && in_close_range(key);
            for (value, item) in values {
                if item.expiration <= now {
                    continue;
                }
                let inside_boundary = item
                    .max_distance
                    .is_some_and(|boundary| key.distance(contact) < boundary);
                if inside_boundary || near_holder {
                    pushes.push(ItemPush {
                        key: *key,
                        value: value.clone(),
                        ttl: item.expiration - now,
                    });
                }
            }
        }
        pushes
    }

    /// React to a contact leaving the routing table.
    ///
    /// Once `republish_threshold` close contacts have gone, every item whose
    /// key lies in the holder's close range is republished within the next
    /// `republish_time_delta`. Returns how many items were rescheduled.
    pub fn on_remove_contact<F>(&mut self, ctx: &mut Ctx<'_>, is_close: bool, in_close_range: F) -> usize
    where
        F: Fn(&NodeId) -> bool,
    {
        if !is_close {
            return 0;
        }
        self.removed_close += 1;
        if self.removed_close < self.republish_threshold {
            return 0;
        }
        self.removed_close = 0;

        let now = ctx.now();
        let due: Vec<(NodeId, Vec<u8>, Owner)> = self
            .items
            .iter()
            .filter(|(key, _)| in_close_range(*key))
            .flat_map(|(key, values)| {
                values
                    .iter()
                    .filter(|(_, item)| item.expiration > now)
                    .map(move |(value, item)| (*key, value.clone(), item.owner))
            })
            .collect();

        for (key, value, owner) in &due {
            let delay = ctx.rng.gen_range(0..=self.republish_time_delta);
            ctx.scheduler.cancel_all(*owner);
            self.schedule_republish(ctx, *owner, *key, value.clone(), delay);
        }
        trace!(items = due.len(), "forced early republish after close-contact churn");
        due.len()
    }

    /// Drop every item and cancel every republish job.
    pub fn clear(&mut self, ctx: &mut Ctx<'_>) {
        for item in self.items.values().flat_map(BTreeMap::values) {
            ctx.scheduler.cancel_all(item.owner);
        }
        self.items.clear();
        self.removed_close = 0;
    }

    /// Draw the delay until an item's next republish.
    ///
    /// `period - delta + 2 * delta * (1 - X)` with `X ~ Beta(2, 0.5)`, so the
    /// delay stays within `[period - delta, period + delta]` and skews early.
    pub fn random_republish_time(&self, ctx: &mut Ctx<'_>) -> u64 {
        let x = Beta::new(2.0, 0.5).map_or(1.0, |beta| beta.sample(&mut *ctx.rng));
        let base = self.republish_time.saturating_sub(self.republish_time_delta);
        let spread = 2.0 * self.republish_time_delta as f64 * (1.0 - x);
        base + spread.round() as u64
    }

    fn schedule_republish(&self, ctx: &mut Ctx<'_>, owner: Owner, key: NodeId, value: Vec<u8>, delay: u64) {
        ctx.scheduler.schedule_after(
            delay,
            owner,
            Job::Node {
                addr: self.addr,
                task: NodeTask::Republish { key, value },
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::MemoryTransport;
    use crate::scheduler::Scheduler;
    use rand::{rngs::StdRng, SeedableRng};

    struct Harness {
        scheduler: Scheduler<Job>,
        transport: MemoryTransport,
        rng: StdRng,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                scheduler: Scheduler::with_virtual_clock(),
                transport: MemoryTransport::new(),
                rng: StdRng::seed_from_u64(11),
            }
        }

        fn ctx(&mut self) -> Ctx<'_> {
            Ctx::new(&mut self.scheduler, &mut self.transport, &mut self.rng)
        }

        /// Run jobs up to `t`, collecting the republish tasks that fired.
        fn advance_to(&mut self, t: Timestamp) -> Vec<(NodeId, Vec<u8>)> {
            let mut fired = Vec::new();
            while let Some(job) = self.scheduler.advance_until(t) {
                if let Job::Node {
                    task: NodeTask::Republish { key, value },
                    ..
                } = job
                {
                    fired.push((key, value));
                }
            }
            fired
        }
    }

    fn store_for(config: &Config) -> ValueStore {
        ValueStore::new("127.0.0.1:9000".parse().unwrap(), config)
    }

    #[test]
    fn expiration_never_moves_backwards() {
        let mut h = Harness::new();
        let mut store = store_for(&Config::default());
        let key = NodeId::from_u64(1);

        let first = store.store(&mut h.ctx(), key, b"v".to_vec(), 10_000);
        assert_eq!(first, 10_000);
        let second = store.store(&mut h.ctx(), key, b"v".to_vec(), 10);
        assert_eq!(second, 10_000, "shorter ttl must not shrink expiration");
        assert_eq!(store.len(), 1);
        assert_eq!(h.scheduler.len(), 1, "refresh replaces the republish job");
    }

    #[test]
    fn multiple_values_share_a_key() {
        let mut h = Harness::new();
        let mut store = store_for(&Config::default());
        let key = NodeId::from_u64(1);
        store.store(&mut h.ctx(), key, b"a".to_vec(), 100);
        store.store(&mut h.ctx(), key, b"b".to_vec(), 100);
        assert_eq!(store.get_items(0, &key), vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(store.get_items(0, &NodeId::from_u64(2)).is_empty());
    }

    #[test]
    fn expired_items_are_hidden_then_dropped_by_republish() {
        let config = Config::default().with_republish(1_000, 100);
        let mut h = Harness::new();
        let mut store = store_for(&config);
        let key = NodeId::from_u64(1);
        store.store(&mut h.ctx(), key, b"v".to_vec(), 500);

        assert_eq!(store.get_items(499, &key).len(), 1);
        assert!(store.get_items(500, &key).is_empty());
        assert_eq!(store.live_len(500), 0);
        assert_eq!(store.len(), 1, "lazy expiry keeps the record until republish");

        let fired = h.advance_to(2_000);
        assert_eq!(fired.len(), 1);
        let remaining = store.republish_item(&mut h.ctx(), &key, b"v");
        assert_eq!(remaining, None);
        assert!(store.is_empty());
        assert!(h.scheduler.is_empty(), "expired item is not rescheduled");
    }

    #[test]
    fn live_item_republish_reschedules_with_remaining_ttl() {
        let config = Config::default().with_republish(1_000, 100);
        let mut h = Harness::new();
        let mut store = store_for(&config);
        let key = NodeId::from_u64(1);
        store.store(&mut h.ctx(), key, b"v".to_vec(), 10_000);

        let fired = h.advance_to(1_100);
        assert_eq!(fired.len(), 1);
        let now = h.scheduler.now();
        assert!((900..=1_100).contains(&now));
        let remaining = store.republish_item(&mut h.ctx(), &key, b"v");
        assert_eq!(remaining, Some(10_000 - now));
        assert_eq!(h.scheduler.len(), 1);
    }

    #[test]
    fn republish_interval_stays_in_window() {
        let config = Config::default().with_republish(10_000, 2_000);
        let mut h = Harness::new();
        let store = store_for(&config);
        let mut total = 0u64;
        for _ in 0..500 {
            let t = store.random_republish_time(&mut h.ctx());
            assert!((8_000..=12_000).contains(&t), "interval {t} out of window");
            total += t;
        }
        let mean = total / 500;
        assert!(mean < 10_000, "Beta(2, 0.5) skews republish early, mean {mean}");
    }

    #[test]
    fn new_contact_inside_boundary_gets_push() {
        let mut h = Harness::new();
        let mut store = store_for(&Config::default());
        let key = NodeId::from_u64(0);
        store.store(&mut h.ctx(), key, b"v".to_vec(), 1_000);

        let nowhere = |_: &NodeId| false;
        assert!(store.on_new_contact(0, &NodeId::from_u64(3), false, true, nowhere).is_empty());

        store.set_max_distance(&key, b"v", NodeId::from_u64(8));
        let pushes = store.on_new_contact(100, &NodeId::from_u64(3), false, true, nowhere);
        assert_eq!(
            pushes,
            vec![ItemPush {
                key,
                value: b"v".to_vec(),
                ttl: 900
            }]
        );
        assert!(store.on_new_contact(100, &NodeId::from_u64(9), false, true, nowhere).is_empty());
    }

    #[test]
    fn close_contact_after_join_gets_push() {
        let mut h = Harness::new();
        let mut store = store_for(&Config::default());
        let key = NodeId::from_u64(5);
        store.store(&mut h.ctx(), key, b"v".to_vec(), 1_000);
        let everywhere = |_: &NodeId| true;
        assert!(store.on_new_contact(0, &NodeId::from_u64(1), true, false, everywhere).is_empty());
        assert_eq!(store.on_new_contact(0, &NodeId::from_u64(1), true, true, everywhere).len(), 1);
    }

    #[test]
    fn threshold_of_close_removals_forces_early_republish() {
        let config = Config::default()
            .with_republish(100_000, 1_000)
            .with_republish_threshold(2);
        let mut h = Harness::new();
        let mut store = store_for(&config);
        store.store(&mut h.ctx(), NodeId::from_u64(1), b"near".to_vec(), 1_000_000);
        store.store(&mut h.ctx(), NodeId::from_u64(2), b"far".to_vec(), 1_000_000);
        let near_only = |k: &NodeId| *k == NodeId::from_u64(1);

        assert_eq!(store.on_remove_contact(&mut h.ctx(), false, near_only), 0);
        assert_eq!(store.on_remove_contact(&mut h.ctx(), true, near_only), 0);
        assert_eq!(store.on_remove_contact(&mut h.ctx(), true, near_only), 1);

        let fired = h.advance_to(1_000);
        assert_eq!(fired, vec![(NodeId::from_u64(1), b"near".to_vec())]);
        assert_eq!(h.scheduler.len(), 1, "far item keeps its regular schedule");
    }

    #[test]
    fn clear_cancels_every_job() {
        let mut h = Harness::new();
        let mut store = store_for(&Config::default());
        for i in 0..4 {
            store.store(&mut h.ctx(), NodeId::from_u64(i), b"v".to_vec(), 1_000);
        }
        assert_eq!(h.scheduler.len(), 4);
        store.clear(&mut h.ctx());
        assert!(store.is_empty());
        assert!(h.scheduler.is_empty());
    }
}
