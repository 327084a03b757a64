//! Routing table: a partition of the id space into k-buckets.
//!
//! The table starts as a single bucket covering `[MIN, MAX]`. Only the bucket
//! holding the local id (the *holder* bucket) is ever split, so resolution is
//! fine-grained near the local node and coarse far away. The half produced by
//! the most recent split that does not contain the local id is the *sibling*
//! bucket; when force-K is enabled it may evict stale or distant contacts in
//! favour of closer ones.
//!
//! Buckets live in an arena keyed by [`BucketHandle`]. A `BTreeMap` from each
//! bucket's inclusive upper bound to its handle answers "which bucket covers
//! this id" with one range query.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::contact::{Contact, NodeInfo};
use crate::id::NodeId;
use crate::kbucket::{AddOutcome, KBucket};
use crate::scheduler::Timestamp;

/// Stable handle of a bucket in the routing table's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketHandle(u32);

/// Kademlia routing table anchored at a holder id.
#[derive(Debug)]
pub struct RoutingTable {
    holder_id: NodeId,
    k: usize,
    force_k: bool,
    buckets: HashMap<BucketHandle, KBucket>,
    /// Inclusive upper bound of every bucket, mapped to its handle.
    index: BTreeMap<NodeId, BucketHandle>,
    holder: BucketHandle,
    sibling: Option<BucketHandle>,
    next_handle: u32,
    /// Distance from the holder to its k-th closest contact. Refreshed
    /// whenever membership changes.
    close_radius: Option<NodeId>,
}

impl RoutingTable {
    /// Create a table with one bucket covering the whole id space.
    pub fn new(holder_id: NodeId, k: usize, force_k: bool) -> Self {
        let mut table = Self {
            holder_id,
            k,
            force_k,
            buckets: HashMap::new(),
            index: BTreeMap::new(),
            holder: BucketHandle(0),
            sibling: None,
            next_handle: 0,
            close_radius: None,
        };
        table.holder = table.insert_bucket(KBucket::new(NodeId::MIN, NodeId::MAX, k));
        table
    }

    pub fn holder_id(&self) -> NodeId {
        self.holder_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Total number of contacts across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.values().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(KBucket::is_empty)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn holder_bucket(&self) -> &KBucket {
        self.bucket(self.holder)
    }

    pub fn sibling_bucket(&self) -> Option<&KBucket> {
        self.sibling.map(|h| self.bucket(h))
    }

    /// Buckets in ascending range order.
    pub fn buckets(&self) -> impl Iterator<Item = &KBucket> {
        self.index.values().map(move |h| self.bucket(*h))
    }

    /// Every contact in the table, in ascending id order.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets().flat_map(KBucket::list_contacts)
    }

    pub fn get_contact(&self, id: &NodeId) -> Option<&Contact> {
        self.bucket(self.handle_for(id)).get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get_contact(id).is_some()
    }

    /// Insert or refresh a contact.
    ///
    /// Returns the insertion outcome and whether the contact is close to the
    /// holder afterwards. The holder's own id is never stored.
    pub fn add_contact(&mut self, contact: Contact) -> (AddOutcome, bool) {
        if contact.id == self.holder_id {
            return (AddOutcome::Full, false);
        }

        loop {
            let handle = self.handle_for(&contact.id);
            let outcome = self.bucket_mut(handle).add(contact);
            if outcome != AddOutcome::Full {
                if outcome == AddOutcome::Success {
                    self.refresh_close_radius();
                }
                return (outcome, self.is_close_to_holder(&contact.id));
            }

            if handle == self.holder {
                if self.bucket(handle).is_atomic() {
                    return (AddOutcome::Full, false);
                }
                self.split_holder();
                continue;
            }

            if self.force_k && Some(handle) == self.sibling {
                let budget = self.k.saturating_sub(self.holder_bucket().len());
                if budget > 0 {
                    let holder_id = self.holder_id;
                    let outcome = self.bucket_mut(handle).add_force_k(contact, &holder_id, budget);
                    if outcome == AddOutcome::Success {
                        trace!(peer = %contact.id, budget, "force-k replaced sibling contact");
                        self.refresh_close_radius();
                        return (outcome, self.is_close_to_holder(&contact.id));
                    }
                }
            }
            return (AddOutcome::Full, false);
        }
    }

    /// Remove a contact.
    ///
    /// Returns whether it was present and whether it was close to the holder
    /// just before removal.
    pub fn remove_contact(&mut self, id: &NodeId) -> (bool, bool) {
        let handle = self.handle_for(id);
        if !self.bucket(handle).contains(id) {
            return (false, false);
        }
        let was_close = self.is_close_to_holder(id);
        self.bucket_mut(handle).remove(id);
        self.refresh_close_radius();
        (true, was_close)
    }

    /// Up to `count` contacts ordered by ascending XOR distance to `target`.
    ///
    /// Buckets are visited in order of the smallest distance any id in their
    /// range can have to `target`. Bucket ranges are aligned prefixes, so
    /// those distance ranges are disjoint and collection can stop as soon as
    /// `count` contacts are in hand.
    pub fn get_closest_contacts(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        let mut order: Vec<(NodeId, &KBucket)> = self
            .buckets
            .values()
            .map(|b| (range_distance(target, b), b))
            .collect();
        order.sort_by_key(|(d, _)| *d);

        let mut found: Vec<Contact> = Vec::with_capacity(count + self.k);
        for (_, bucket) in order {
            found.extend(bucket.list_contacts().copied());
            if found.len() >= count {
                break;
            }
        }

        let by_distance = |a: &Contact, b: &Contact| target.cmp_distance(&a.id, &b.id);
        if found.len() > count {
            found.select_nth_unstable_by(count - 1, by_distance);
            found.truncate(count);
        }
        found.sort_by(by_distance);
        found
    }

    /// Distance from the holder to its k-th closest contact, if the table
    /// knows at least k contacts.
    pub fn close_radius(&self) -> Option<NodeId> {
        self.close_radius
    }

    fn refresh_close_radius(&mut self) {
        let closest = self.get_closest_contacts(&self.holder_id, self.k);
        self.close_radius = if closest.len() < self.k {
            None
        } else {
            closest.last().map(|c| self.holder_id.distance(&c.id))
        };
    }

    /// Whether `id` lies within the holder's close range: no farther from the
    /// holder than its k-th closest contact. Everything is in range while the
    /// table holds fewer than k contacts.
    pub fn in_close_range(&self, id: &NodeId) -> bool {
        match self.close_radius() {
            Some(radius) => self.holder_id.distance(id) <= radius,
            None => true,
        }
    }

    /// Whether `id` is a holder-bucket member or falls in the close range.
    pub fn is_close_to_holder(&self, id: &NodeId) -> bool {
        self.holder_bucket().contains(id) || self.in_close_range(id)
    }

    /// Record lookup activity toward `target` for refresh bookkeeping.
    pub fn mark_lookup(&mut self, target: &NodeId, now: Timestamp) {
        let handle = self.handle_for(target);
        self.bucket_mut(handle).mark_lookup(now);
    }

    /// Ranges `(low, high)` of buckets that saw no lookup for `interval`.
    pub fn stale_buckets(&self, now: Timestamp, interval: u64) -> Vec<(NodeId, NodeId)> {
        self.buckets()
            .filter(|b| b.last_lookup().saturating_add(interval) <= now)
            .map(|b| (b.low(), b.high()))
            .collect()
    }

    /// Every known contact's identity and address, for rejoining later.
    pub fn bootstrap_contacts(&self) -> Vec<NodeInfo> {
        self.contacts().map(Contact::info).collect()
    }

    fn handle_for(&self, id: &NodeId) -> BucketHandle {
        match self.index.range(*id..).next() {
            Some((_, handle)) => *handle,
            None => unreachable!("bucket ranges cover the whole id space"),
        }
    }

    fn bucket(&self, handle: BucketHandle) -> &KBucket {
        match self.buckets.get(&handle) {
            Some(bucket) => bucket,
            None => unreachable!("dangling bucket handle {handle:?}"),
        }
    }

    fn bucket_mut(&mut self, handle: BucketHandle) -> &mut KBucket {
        match self.buckets.get_mut(&handle) {
            Some(bucket) => bucket,
            None => unreachable!("dangling bucket handle {handle:?}"),
        }
    }

    fn insert_bucket(&mut self, bucket: KBucket) -> BucketHandle {
        let handle = BucketHandle(self.next_handle);
        self.next_handle += 1;
        self.index.insert(bucket.high(), handle);
        self.buckets.insert(handle, bucket);
        handle
    }

    fn split_holder(&mut self) {
        let Some(old) = self.buckets.remove(&self.holder) else {
            unreachable!("holder bucket missing from arena");
        };
        self.index.remove(&old.high());

        let (lower, upper) = old.split();
        let (near, far) = if lower.covers(&self.holder_id) {
            (lower, upper)
        } else {
            (upper, lower)
        };
        trace!(
            holder_len = near.len(),
            sibling_len = far.len(),
            depth = self.buckets.len() + 1,
            "split holder bucket"
        );
        self.holder = self.insert_bucket(near);
        self.sibling = Some(self.insert_bucket(far));
    }
}

/// Smallest XOR distance between `target` and any id in an aligned range.
fn range_distance(target: &NodeId, bucket: &KBucket) -> NodeId {
    let free = bucket.low() ^ bucket.high();
    let mut bytes = *(*target ^ bucket.low()).as_bytes();
    for (b, f) in bytes.iter_mut().zip(free.as_bytes()) {
        *b &= !f;
    }
    NodeId::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ID_BYTES;
    use proptest::prelude::*;
    use std::net::SocketAddr;

    fn contact_for(id: NodeId, last_seen: Timestamp) -> Contact {
        Contact::new(NodeInfo::new(id, SocketAddr::from(([10, 0, 0, 1], 4000))), last_seen)
    }

    fn id_with_first_byte(b: u8, tail: u8) -> NodeId {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = b;
        bytes[ID_BYTES - 1] = tail;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn starts_with_one_bucket_over_whole_space() {
        let table = RoutingTable::new(NodeId::MIN, 4, true);
        assert_eq!(table.bucket_count(), 1);
        assert_eq!(table.holder_bucket().low(), NodeId::MIN);
        assert_eq!(table.holder_bucket().high(), NodeId::MAX);
        assert!(table.sibling_bucket().is_none());
    }

    #[test]
    fn holder_id_is_never_stored() {
        let mut table = RoutingTable::new(NodeId::from_u64(7), 4, true);
        let (outcome, _) = table.add_contact(contact_for(NodeId::from_u64(7), 0));
        assert_eq!(outcome, AddOutcome::Full);
        assert!(table.is_empty());
    }

    #[test]
    fn full_holder_bucket_splits() {
        let mut table = RoutingTable::new(NodeId::MIN, 2, false);
        table.add_contact(contact_for(id_with_first_byte(0x80, 1), 0));
        table.add_contact(contact_for(id_with_first_byte(0x90, 1), 0));
        let (outcome, _) = table.add_contact(contact_for(id_with_first_byte(0x10, 1), 0));
        assert_eq!(outcome, AddOutcome::Success);
        assert_eq!(table.bucket_count(), 2);
        assert_eq!(table.holder_bucket().high(), NodeId::MAX >> 1);
        assert_eq!(table.sibling_bucket().map(KBucket::len), Some(2));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn far_buckets_stay_saturated() {
        let mut table = RoutingTable::new(NodeId::MIN, 2, false);
        table.add_contact(contact_for(id_with_first_byte(0x80, 1), 0));
        table.add_contact(contact_for(id_with_first_byte(0x90, 1), 0));
        table.add_contact(contact_for(id_with_first_byte(0x10, 1), 0));
        let (outcome, close) = table.add_contact(contact_for(id_with_first_byte(0xa0, 1), 0));
        assert_eq!(outcome, AddOutcome::Full);
        assert!(!close);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn sibling_force_k_admits_closer_contact() {
        let mut table = RoutingTable::new(NodeId::MIN, 2, true);
        table.add_contact(contact_for(id_with_first_byte(0xf0, 1), 0));
        table.add_contact(contact_for(id_with_first_byte(0xe0, 1), 5));
        // splits: sibling holds 0xe0/0xf0, holder bucket is empty
        let (outcome, _) = table.add_contact(contact_for(id_with_first_byte(0x81, 1), 9));
        assert_eq!(outcome, AddOutcome::Success);
        assert!(table.contains(&id_with_first_byte(0x81, 1)));
        assert!(!table.contains(&id_with_first_byte(0xf0, 1)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn remove_reports_closeness() {
        let mut table = RoutingTable::new(NodeId::MIN, 4, true);
        let id = NodeId::from_u64(3);
        table.add_contact(contact_for(id, 0));
        assert_eq!(table.remove_contact(&id), (true, true));
        assert_eq!(table.remove_contact(&id), (false, false));
    }

    #[test]
    fn closest_contacts_are_sorted_by_distance() {
        let mut table = RoutingTable::new(NodeId::MIN, 3, true);
        for b in [0x01u8, 0x02, 0x04, 0x40, 0x80, 0xc0, 0x20] {
            table.add_contact(contact_for(id_with_first_byte(b, 0), 0));
        }
        let target = id_with_first_byte(0x41, 0);
        let closest = table.get_closest_contacts(&target, 3);
        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0].id, id_with_first_byte(0x40, 0));
        for pair in closest.windows(2) {
            assert!(target.distance(&pair[0].id) < target.distance(&pair[1].id));
        }
    }

    #[test]
    fn stale_buckets_follow_lookup_marks() {
        let mut table = RoutingTable::new(NodeId::MIN, 1, false);
        table.add_contact(contact_for(id_with_first_byte(0x80, 0), 0));
        table.add_contact(contact_for(id_with_first_byte(0x01, 0), 0));
        assert_eq!(table.bucket_count(), 2);

        table.mark_lookup(&id_with_first_byte(0x90, 0), 1_000);
        let stale = table.stale_buckets(1_500, 1_000);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, NodeId::MIN);
        assert_eq!(table.bootstrap_contacts().len(), 2);
    }

    #[test]
    fn close_radius_tracks_membership() {
        let mut table = RoutingTable::new(NodeId::MIN, 2, true);
        let (near, mid, far) = (NodeId::from_u64(1), NodeId::from_u64(2), NodeId::from_u64(8));
        table.add_contact(contact_for(near, 0));
        assert_eq!(table.close_radius(), None);
        assert!(table.in_close_range(&far));

        table.add_contact(contact_for(far, 0));
        assert_eq!(table.close_radius(), Some(far));
        table.add_contact(contact_for(mid, 0));
        assert_eq!(table.close_radius(), Some(mid), "a closer contact shrinks the radius");
        assert!(!table.in_close_range(&NodeId::from_u64(3)));

        table.remove_contact(&mid);
        assert_eq!(table.close_radius(), Some(far));
        table.remove_contact(&near);
        assert_eq!(table.close_radius(), None);
    }

    proptest! {
        #[test]
        fn closest_matches_brute_force(
            holder in any::<[u8; ID_BYTES]>(),
            ids in proptest::collection::vec(any::<[u8; ID_BYTES]>(), 1..80),
            target in any::<[u8; ID_BYTES]>(),
        ) {
            let holder = NodeId::from_bytes(holder);
            let target = NodeId::from_bytes(target);
            let mut table = RoutingTable::new(holder, 4, true);
            for (t, raw) in ids.iter().enumerate() {
                table.add_contact(contact_for(NodeId::from_bytes(*raw), t as Timestamp));
            }

            for bucket in table.buckets() {
                prop_assert!(bucket.len() <= 4);
            }

            let mut all: Vec<NodeId> = table.contacts().map(|c| c.id).collect();
            all.sort_by(|a, b| target.cmp_distance(a, b));
            let got: Vec<NodeId> = table.get_closest_contacts(&target, 4).iter().map(|c| c.id).collect();
            let want: Vec<NodeId> = all.into_iter().take(4).collect();
            prop_assert_eq!(got, want);

            let mut by_holder: Vec<NodeId> = table.contacts().map(|c| holder.distance(&c.id)).collect();
            by_holder.sort();
            prop_assert_eq!(table.close_radius(), by_holder.get(3).copied());
        }

        #[test]
        fn ranges_partition_id_space(
            holder in any::<[u8; ID_BYTES]>(),
            ids in proptest::collection::vec(any::<[u8; ID_BYTES]>(), 1..60),
        ) {
            let mut table = RoutingTable::new(NodeId::from_bytes(holder), 2, true);
            for raw in &ids {
                table.add_contact(contact_for(NodeId::from_bytes(*raw), 0));
            }
            let ranges: Vec<(NodeId, NodeId)> = table.buckets().map(|b| (b.low(), b.high())).collect();
            prop_assert_eq!(ranges[0].0, NodeId::MIN);
            prop_assert_eq!(ranges[ranges.len() - 1].1, NodeId::MAX);
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].1 + 1u32, pair[1].0);
            }
            prop_assert!(table.holder_bucket().covers(&table.holder_id()));
        }
    }
}
