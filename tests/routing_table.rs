use std::net::SocketAddr;

use kad_dht::{AddOutcome, Contact, KBucket, NodeId, NodeInfo, RoutingTable};
use rand::{rngs::StdRng, SeedableRng};

fn contact(id: NodeId) -> Contact {
    let port = u16::from_be_bytes([id.as_bytes()[0], id.as_bytes()[19]]);
    Contact::new(NodeInfo::new(id, SocketAddr::from(([10, 0, 0, 1], port))), 0)
}

fn top_byte(byte: u8) -> NodeId {
    let mut id = [0u8; 20];
    id[0] = byte;
    NodeId::from_bytes(id)
}

#[test]
fn routing_table_orders_contacts_by_distance() {
    let mut table = RoutingTable::new(NodeId::from_u64(0x00), 4, true);
    for raw in [0x10, 0x20, 0x08] {
        table.add_contact(contact(NodeId::from_u64(raw)));
    }

    let closest = table.get_closest_contacts(&NodeId::from_u64(0x18), 3);
    let ids: Vec<NodeId> = closest.iter().map(|c| c.id).collect();
    assert_eq!(
        ids,
        vec![NodeId::from_u64(0x10), NodeId::from_u64(0x08), NodeId::from_u64(0x20)]
    );
}

#[test]
fn routing_table_respects_bucket_capacity() {
    let mut table = RoutingTable::new(NodeId::from_u64(0x00), 2, false);
    let outcomes: Vec<AddOutcome> = [0x80, 0xC0, 0xA0]
        .into_iter()
        .map(|byte| table.add_contact(contact(top_byte(byte))).0)
        .collect();

    assert_eq!(outcomes, vec![AddOutcome::Success, AddOutcome::Success, AddOutcome::Full]);
    assert_eq!(table.len(), 2);
    assert_eq!(table.bucket_count(), 2, "only the holder bucket split");
    assert!(table.holder_bucket().is_empty());
}

#[test]
fn bucket_capacity_and_removal() {
    let mut bucket = KBucket::new(NodeId::from_u64(0), NodeId::from_u64(255), 4);
    for raw in 1..=4 {
        assert_eq!(bucket.add(contact(NodeId::from_u64(raw))), AddOutcome::Success);
    }
    assert_eq!(bucket.add(contact(NodeId::from_u64(5))), AddOutcome::Full);
    assert!(bucket.remove(&NodeId::from_u64(2)).is_some());
    assert_eq!(bucket.add(contact(NodeId::from_u64(5))), AddOutcome::Success);
    assert_eq!(bucket.len(), 4);
}

#[test]
fn only_the_holder_side_keeps_splitting() {
    let holder = NodeId::from_u64(0x1234);
    let mut table = RoutingTable::new(holder, 3, false);
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..500 {
        table.add_contact(contact(NodeId::random(&mut rng)));
    }

    assert!(table.holder_bucket().covers(&holder));
    let buckets: Vec<&KBucket> = table.buckets().collect();
    assert_eq!(buckets.len(), table.bucket_count());
    assert!(buckets.iter().all(|b| b.len() <= 3));
    assert_eq!(buckets.iter().map(|b| b.len()).sum::<usize>(), table.len());

    // Every non-holder bucket is half of a range that contains the holder,
    // so ranges shrink geometrically toward the holder.
    for bucket in buckets.iter().filter(|b| !b.covers(&holder)) {
        let width = bucket.high() - bucket.low();
        let sibling_low = bucket.low() ^ (width + 1u32);
        let sibling_high = sibling_low + width;
        assert!(
            sibling_low <= holder && holder <= sibling_high,
            "bucket [{}, {}] is not adjacent to the holder path",
            bucket.low(),
            bucket.high()
        );
    }
}

#[test]
fn removed_contacts_are_reported_once() {
    let mut table = RoutingTable::new(NodeId::from_u64(0), 4, true);
    table.add_contact(contact(NodeId::from_u64(7)));

    assert_eq!(table.remove_contact(&NodeId::from_u64(7)), (true, true));
    assert_eq!(table.remove_contact(&NodeId::from_u64(7)), (false, false));
    assert!(table.get_closest_contacts(&NodeId::from_u64(7), 4).is_empty());
}
