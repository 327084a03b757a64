//! Fixed-capacity contact container covering one contiguous id range.

use std::collections::BTreeMap;

use crate::contact::Contact;
use crate::id::NodeId;
use crate::scheduler::Timestamp;

/// Outcome of inserting a contact into a bucket or the routing table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Contact was inserted.
    Success,
    /// Capacity or policy rejected the contact. A routing decision, not an error.
    Full,
    /// Contact was already present; its address and `last_seen` were updated.
    Existed,
}

/// A k-bucket: at most `capacity` contacts whose ids lie in `[low, high]`.
#[derive(Clone, Debug)]
pub struct KBucket {
    low: NodeId,
    high: NodeId,
    capacity: usize,
    contacts: BTreeMap<NodeId, Contact>,
    /// Last time a lookup touched this range. Drives routing-table refresh.
    last_lookup: Timestamp,
}

impl KBucket {
    pub fn new(low: NodeId, high: NodeId, capacity: usize) -> Self {
        assert!(low <= high, "bucket range is inverted");
        assert!(capacity > 0, "bucket capacity must be positive");
        Self {
            low,
            high,
            capacity,
            contacts: BTreeMap::new(),
            last_lookup: 0,
        }
    }

    pub fn low(&self) -> NodeId {
        self.low
    }

    pub fn high(&self) -> NodeId {
        self.high
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.capacity
    }

    pub fn covers(&self, id: &NodeId) -> bool {
        *id >= self.low && *id <= self.high
    }

    /// True when the range cannot be halved any further.
    pub fn is_atomic(&self) -> bool {
        self.low == self.high
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.contacts.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Contact> {
        self.contacts.get(id)
    }

    pub fn last_lookup(&self) -> Timestamp {
        self.last_lookup
    }

    pub fn mark_lookup(&mut self, now: Timestamp) {
        self.last_lookup = self.last_lookup.max(now);
    }

    /// Insert or refresh a contact.
    ///
    /// A known id is refreshed even when the bucket is full.
    ///
    /// # Panics
    /// Panics if `contact.id` lies outside the bucket's range.
    pub fn add(&mut self, contact: Contact) -> AddOutcome {
        assert!(
            self.covers(&contact.id),
            "contact {} outside bucket range [{}, {}]",
            contact.id,
            self.low,
            self.high
        );

        if let Some(existing) = self.contacts.get_mut(&contact.id) {
            existing.addr = contact.addr;
            existing.last_seen = existing.last_seen.max(contact.last_seen);
            return AddOutcome::Existed;
        }
        if self.is_full() {
            return AddOutcome::Full;
        }
        self.contacts.insert(contact.id, contact);
        AddOutcome::Success
    }

    /// Insert into a full bucket by evicting its least useful contact.
    ///
    /// Only the `count` incumbents closest to `holder` are considered. Each
    /// gets a distance rank (the farthest is 0) and a recency rank (the least
    /// recently seen is 0); the lowest summed rank is evicted, ties going to
    /// the farther contact. The new contact is rejected with
    /// [`AddOutcome::Full`] unless it is closer to `holder` than the farthest
    /// considered incumbent.
    pub fn add_force_k(&mut self, contact: Contact, holder: &NodeId, count: usize) -> AddOutcome {
        if self.contains(&contact.id) || !self.is_full() {
            return self.add(contact);
        }
        assert!(self.covers(&contact.id), "contact {} outside bucket range", contact.id);

        let count = count.min(self.contacts.len());
        if count == 0 {
            return AddOutcome::Full;
        }

        let mut considered: Vec<&Contact> = self.contacts.values().collect();
        considered.sort_by(|a, b| holder.cmp_distance(&a.id, &b.id));
        considered.truncate(count);
        // farthest first: index is the distance rank
        considered.reverse();

        let farthest = considered[0];
        if holder.distance(&contact.id) >= holder.distance(&farthest.id) {
            return AddOutcome::Full;
        }

        let mut by_recency: Vec<usize> = (0..considered.len()).collect();
        by_recency.sort_by_key(|&i| considered[i].last_seen);
        let mut recency_rank = vec![0usize; considered.len()];
        for (rank, &i) in by_recency.iter().enumerate() {
            recency_rank[i] = rank;
        }

        let mut victim = 0;
        let mut best = usize::MAX;
        for (distance_rank, recency) in recency_rank.iter().enumerate() {
            let weight = distance_rank + recency;
            if weight < best {
                best = weight;
                victim = distance_rank;
            }
        }

        let victim_id = considered[victim].id;
        self.contacts.remove(&victim_id);
        self.add(contact)
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        self.contacts.remove(id)
    }

    pub fn least_recently_seen(&self) -> Option<&Contact> {
        self.contacts.values().min_by_key(|c| (c.last_seen, c.id))
    }

    /// Contacts in ascending id order.
    pub fn list_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.values()
    }

    /// Up to `count` contacts sorted by distance to `target`.
    pub fn closest_to(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut out: Vec<Contact> = self.contacts.values().copied().collect();
        out.sort_by(|a, b| target.cmp_distance(&a.id, &b.id));
        out.truncate(count);
        out
    }

    /// Halve the range, moving every contact into the half that covers it.
    ///
    /// Returns `(lower, upper)` where lower covers `[low, low + w]` and upper
    /// covers `[low + w + 1, high]` with `w = (high - low) / 2`.
    ///
    /// # Panics
    /// Panics if the range holds a single id.
    pub fn split(self) -> (KBucket, KBucket) {
        assert!(!self.is_atomic(), "cannot split a single-id bucket");
        let width = (self.high - self.low) >> 1;
        let mid = self.low + width;

        let mut lower = KBucket::new(self.low, mid, self.capacity);
        let mut upper = KBucket::new(mid + 1u32, self.high, self.capacity);
        lower.last_lookup = self.last_lookup;
        upper.last_lookup = self.last_lookup;

        let total = self.contacts.len();
        for (id, contact) in self.contacts {
            let half = if id <= mid { &mut lower } else { &mut upper };
            half.contacts.insert(id, contact);
        }
        assert_eq!(lower.len() + upper.len(), total, "split lost contacts");
        (lower, upper)
    }
}
