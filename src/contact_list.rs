//! Distance-ordered contact list used as a lookup shortlist and as the
//! long-lived neighbor list.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::identity::{distance_cmp, xor_distance, PeerDescriptor, PeerId};

/// Anything the list can key by peer id.
pub trait HasPeerId {
    fn peer_id(&self) -> PeerId;
}

impl HasPeerId for PeerDescriptor {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

#[derive(Clone, Debug)]
struct ContactState<C> {
    contact: C,
    contacted: bool,
    active: bool,
}

/// Contacts ordered by ascending XOR distance to an owner id.
///
/// The owner id is never stored. When a `max_size` is set the list keeps only
/// the closest entries: inserting into a full list evicts the farthest entry,
/// or drops the newcomer when it is the farthest. Operations naming an unknown
/// id are no-ops.
#[derive(Clone, Debug)]
pub struct SortedContactList<C> {
    owner: PeerId,
    max_size: Option<usize>,
    contacts: HashMap<PeerId, ContactState<C>>,
    /// Ids sorted by ascending distance to `owner`.
    ids: Vec<PeerId>,
}

impl<C: HasPeerId + Clone> SortedContactList<C> {
    pub fn new(owner: PeerId, max_size: Option<usize>) -> Self {
        Self {
            owner,
            max_size,
            contacts: HashMap::new(),
            ids: Vec::new(),
        }
    }

    pub fn owner(&self) -> PeerId {
        self.owner
    }

    /// Insert a contact; returns whether the list changed.
    pub fn add_contact(&mut self, contact: C) -> bool {
        let id = contact.peer_id();
        if id == self.owner || self.contacts.contains_key(&id) {
            return false;
        }
        if self.max_size == Some(0) {
            return false;
        }

        let pos = self
            .ids
            .binary_search_by(|probe| self.compare_ids(probe, &id))
            .unwrap_or_else(|pos| pos);

        if let Some(max) = self.max_size {
            if self.ids.len() >= max {
                if pos >= self.ids.len() {
                    return false;
                }
                if let Some(farthest) = self.ids.pop() {
                    self.contacts.remove(&farthest);
                }
            }
        }

        self.ids.insert(pos, id);
        self.contacts.insert(
            id,
            ContactState {
                contact,
                contacted: false,
                active: false,
            },
        );
        true
    }

    pub fn add_contacts(&mut self, contacts: impl IntoIterator<Item = C>) {
        for contact in contacts {
            self.add_contact(contact);
        }
    }

    pub fn get_contact(&self, id: &PeerId) -> Option<&C> {
        self.contacts.get(id).map(|state| &state.contact)
    }

    pub fn set_contacted(&mut self, id: &PeerId) {
        if let Some(state) = self.contacts.get_mut(id) {
            state.contacted = true;
        }
    }

    pub fn set_active(&mut self, id: &PeerId) {
        if let Some(state) = self.contacts.get_mut(id) {
            state.active = true;
        }
    }

    pub fn is_contacted(&self, id: &PeerId) -> bool {
        self.contacts.get(id).is_some_and(|state| state.contacted)
    }

    pub fn is_active(&self, id: &PeerId) -> bool {
        self.contacts.get(id).is_some_and(|state| state.active)
    }

    /// Up to `limit` contacts not yet contacted, closest first.
    pub fn get_uncontacted_contacts(&self, limit: usize) -> Vec<C> {
        self.ids
            .iter()
            .filter_map(|id| self.contacts.get(id))
            .filter(|state| !state.contacted)
            .take(limit)
            .map(|state| state.contact.clone())
            .collect()
    }

    pub fn get_active_contacts(&self) -> Vec<C> {
        self.ids
            .iter()
            .filter_map(|id| self.contacts.get(id))
            .filter(|state| state.active)
            .map(|state| state.contact.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.contacts.values().filter(|state| state.active).count()
    }

    /// All contacts, closest first.
    pub fn get_all_contacts(&self) -> Vec<C> {
        self.ids
            .iter()
            .filter_map(|id| self.contacts.get(id))
            .map(|state| state.contact.clone())
            .collect()
    }

    pub fn get_contact_ids(&self) -> &[PeerId] {
        &self.ids
    }

    pub fn get_closest_contact_id(&self) -> Option<PeerId> {
        self.ids.first().copied()
    }

    /// Order two ids by their XOR distance to the owner.
    pub fn compare_ids(&self, a: &PeerId, b: &PeerId) -> Ordering {
        distance_cmp(&xor_distance(&self.owner, a), &xor_distance(&self.owner, b))
    }

    pub fn remove_contact(&mut self, id: &PeerId) -> bool {
        if self.contacts.remove(id).is_none() {
            return false;
        }
        self.ids.retain(|existing| existing != id);
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PEER_ID_LEN;

    fn id(value: u8) -> PeerId {
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes[PEER_ID_LEN - 1] = value;
        PeerId::from_bytes(bytes)
    }

    fn descriptor(value: u8) -> PeerDescriptor {
        PeerDescriptor::new(id(value))
    }

    #[test]
    fn compares_ids_by_distance_to_owner() {
        let list: SortedContactList<PeerDescriptor> = SortedContactList::new(id(0), None);
        assert_eq!(list.compare_ids(&id(0), &id(1)), Ordering::Less);
        assert_eq!(list.compare_ids(&id(1), &id(4)), Ordering::Less);
        assert_eq!(list.compare_ids(&id(4), &id(1)), Ordering::Greater);
        assert_eq!(list.compare_ids(&id(3), &id(3)), Ordering::Equal);
    }

    #[test]
    fn keeps_contacts_sorted_and_skips_owner() {
        let mut list = SortedContactList::new(id(0), None);
        for value in [3, 1, 0, 4, 2, 1] {
            list.add_contact(descriptor(value));
        }
        assert_eq!(list.get_contact_ids(), &[id(1), id(2), id(3), id(4)]);
        assert_eq!(list.get_closest_contact_id(), Some(id(1)));
        assert!(list.get_contact(&id(0)).is_none(), "owner must never be stored");
    }

    #[test]
    fn bounded_list_evicts_farthest() {
        let mut list = SortedContactList::new(id(0), Some(3));
        for value in [4, 3, 2, 1] {
            list.add_contact(descriptor(value));
        }
        assert_eq!(list.len(), 3);
        assert_eq!(list.get_contact_ids(), &[id(1), id(2), id(3)]);

        assert!(!list.add_contact(descriptor(9)), "a farther newcomer is dropped");
        assert_eq!(list.get_contact_ids(), &[id(1), id(2), id(3)]);
    }

    #[test]
    fn uncontacted_and_active_flags() {
        let mut list = SortedContactList::new(id(0), None);
        list.add_contacts([1, 2, 3, 4].map(descriptor));
        list.set_contacted(&id(1));
        list.set_contacted(&id(3));
        list.set_active(&id(3));
        list.set_active(&id(77));

        let uncontacted: Vec<PeerId> = list
            .get_uncontacted_contacts(5)
            .iter()
            .map(|c| c.peer_id)
            .collect();
        assert_eq!(uncontacted, vec![id(2), id(4)]);
        assert_eq!(list.get_uncontacted_contacts(1).len(), 1);
        assert_eq!(list.active_count(), 1);
        assert!(list.is_active(&id(3)));
        assert!(!list.is_active(&id(1)));
    }

    #[test]
    fn remove_contact_reports_presence() {
        let mut list = SortedContactList::new(id(0), None);
        list.add_contacts([1, 2].map(descriptor));
        assert!(list.remove_contact(&id(1)));
        assert!(!list.remove_contact(&id(1)));
        assert!(!list.remove_contact(&id(42)));
        assert_eq!(list.get_contact_ids(), &[id(2)]);
    }
}
