use overlay_dht::core::RoutingTable;
use overlay_dht::{PeerDescriptor, PeerId};

fn make_peer_id(byte: u8) -> PeerId {
    let mut id = [0u8; 32];
    id[0] = byte;
    PeerId::from_bytes(id)
}

fn make_contact(byte: u8) -> PeerDescriptor {
    PeerDescriptor::new(make_peer_id(byte))
}

#[test]
fn routing_table_orders_contacts_by_distance() {
    let mut table = RoutingTable::new(make_peer_id(0x00), 4);

    for contact in [make_contact(0x10), make_contact(0x20), make_contact(0x08)] {
        table.update(contact);
    }

    let closest = table.closest(&make_peer_id(0x18), 3);
    let ids: Vec<u8> = closest.iter().map(|c| c.peer_id.as_bytes()[0]).collect();
    assert_eq!(ids, vec![0x10, 0x08, 0x20]);
}

#[test]
fn routing_table_respects_bucket_capacity() {
    let mut table = RoutingTable::new(make_peer_id(0x00), 2);

    for contact in [make_contact(0x80), make_contact(0xC0), make_contact(0xA0)] {
        table.update(contact);
    }

    let closest = table.closest(&make_peer_id(0x90), 10);
    let ids: Vec<u8> = closest.iter().map(|c| c.peer_id.as_bytes()[0]).collect();
    assert_eq!(closest.len(), 2, "full bucket keeps its oldest entries");
    assert!(ids.contains(&0x80));
    assert!(ids.contains(&0xC0));
}

#[test]
fn routing_table_never_stores_its_owner() {
    let owner = make_peer_id(0x42);
    let mut table = RoutingTable::new(owner, 4);
    table.update(PeerDescriptor::new(owner));
    table.update(make_contact(0x01));

    assert_eq!(table.len(), 1);
    assert!(!table.contains(&owner));
}

#[test]
fn removed_contacts_leave_lookups() {
    let mut table = RoutingTable::new(make_peer_id(0x00), 4);
    table.update(make_contact(0x10));
    table.update(make_contact(0x11));

    assert!(table.remove(&make_peer_id(0x10)));
    assert!(!table.remove(&make_peer_id(0x10)), "second removal is a no-op");
    let closest = table.closest(&make_peer_id(0x10), 4);
    assert_eq!(closest, vec![make_contact(0x11)]);
}

#[test]
fn bounded_contact_list_keeps_the_closest_ids() {
    use overlay_dht::identity::xor_distance;
    use overlay_dht::SortedContactList;
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..20 {
        let mut owner = [0u8; 32];
        rng.fill_bytes(&mut owner);
        let owner = PeerId::from_bytes(owner);
        let mut list = SortedContactList::new(owner, Some(8));

        let mut all = Vec::new();
        for _ in 0..64 {
            let mut id = [0u8; 32];
            rng.fill_bytes(&mut id);
            let id = PeerId::from_bytes(id);
            list.add_contact(PeerDescriptor::new(id));
            all.push(id);
        }

        all.sort_by_key(|id| xor_distance(id, &owner));
        all.truncate(8);
        assert_eq!(list.get_contact_ids(), all.as_slice());
    }
}
