//! Transport-agnostic Kademlia logic.
//!
//! - **Routing**: [`RoutingTable`], k-buckets with ping-before-evict
//! - **Contacts**: [`DhtPeer`], a descriptor bound to a [`DhtNetwork`]
//! - **Node State Machine**: [`DhtNode`], the join lookup and the handlers
//!   behind `getClosestPeers` and `ping`

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::config::DhtConfig;
use crate::contact_list::{HasPeerId, SortedContactList};
use crate::identity::{distance_cmp, xor_distance, PeerDescriptor, PeerId, PEER_ID_LEN};

const BUCKET_COUNT: usize = PEER_ID_LEN * 8;

// ============================================================================
// Routing Table
// ============================================================================

/// Find the bucket index for a peer relative to self.
///
/// The bucket index is the position of the first differing bit (0..=255).
/// Bucket 0 is the furthest, bucket 255 the closest.
fn bucket_index(self_id: &PeerId, other: &PeerId) -> usize {
    let dist = xor_distance(self_id, other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    BUCKET_COUNT - 1
}

/// A single k-bucket, oldest contact first.
#[derive(Debug, Default, Clone)]
struct Bucket {
    contacts: Vec<PeerDescriptor>,
}

#[derive(Debug)]
enum BucketTouchOutcome {
    Inserted,
    /// Moved to the back; the stored descriptor is replaced by the newer one.
    Refreshed,
    Full {
        new_contact: PeerDescriptor,
        oldest: PeerDescriptor,
    },
}

/// A full bucket waiting for its oldest contact to answer a ping.
#[derive(Clone, Debug)]
struct PendingBucketUpdate {
    bucket_index: usize,
    oldest: PeerDescriptor,
    new_contact: PeerDescriptor,
}

impl Bucket {
    fn touch(&mut self, contact: PeerDescriptor, k: usize) -> BucketTouchOutcome {
        if let Some(pos) = self.position(&contact.peer_id) {
            self.contacts.remove(pos);
            self.contacts.push(contact);
            return BucketTouchOutcome::Refreshed;
        }
        match self.contacts.first() {
            Some(oldest) if self.contacts.len() >= k => BucketTouchOutcome::Full {
                oldest: oldest.clone(),
                new_contact: contact,
            },
            _ => {
                self.contacts.push(contact);
                BucketTouchOutcome::Inserted
            }
        }
    }

    fn refresh(&mut self, id: &PeerId) -> bool {
        match self.position(id) {
            Some(pos) => {
                let existing = self.contacts.remove(pos);
                self.contacts.push(existing);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &PeerId) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.contacts.remove(pos);
                true
            }
            None => false,
        }
    }

    fn position(&self, id: &PeerId) -> Option<usize> {
        self.contacts.iter().position(|c| &c.peer_id == id)
    }
}

/// Kademlia routing table with one bucket per bit of the id.
///
/// Buckets prefer long-lived contacts: a newcomer only replaces the oldest
/// entry of a full bucket when that entry fails a ping.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: PeerId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: PeerId, k: usize) -> Self {
        Self {
            self_id,
            k,
            buckets: vec![Bucket::default(); BUCKET_COUNT],
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Add or refresh a contact; full buckets keep their current entries.
    pub fn update(&mut self, contact: PeerDescriptor) {
        let _ = self.update_with_pending(contact);
    }

    /// Add or refresh a contact, returning the eviction candidate when the
    /// bucket is full.
    fn update_with_pending(&mut self, contact: PeerDescriptor) -> Option<PendingBucketUpdate> {
        if contact.peer_id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, &contact.peer_id);
        match self.buckets[idx].touch(contact, self.k) {
            BucketTouchOutcome::Inserted | BucketTouchOutcome::Refreshed => None,
            BucketTouchOutcome::Full {
                new_contact,
                oldest,
            } => Some(PendingBucketUpdate {
                bucket_index: idx,
                oldest,
                new_contact,
            }),
        }
    }

    /// The `k` known contacts closest to `target`.
    pub fn closest(&self, target: &PeerId, k: usize) -> Vec<PeerDescriptor> {
        let mut all: Vec<PeerDescriptor> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect();
        all.sort_by(|a, b| {
            distance_cmp(
                &xor_distance(&a.peer_id, target),
                &xor_distance(&b.peer_id, target),
            )
        });
        all.truncate(k);
        all
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.buckets[bucket_index(&self.self_id, id)]
            .position(id)
            .is_some()
    }

    pub fn remove(&mut self, id: &PeerId) -> bool {
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].remove(id)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live oldest contacts are refreshed; dead ones make room for the newcomer.
    fn apply_ping_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) {
        let k = self.k;
        let bucket = &mut self.buckets[pending.bucket_index];
        if oldest_alive {
            bucket.refresh(&pending.oldest.peer_id);
            return;
        }

        let _ = bucket.remove(&pending.oldest.peer_id);
        if bucket.position(&pending.new_contact.peer_id).is_some() {
            return;
        }
        if bucket.contacts.len() < k {
            bucket.contacts.push(pending.new_contact);
        }
    }
}

// ============================================================================
// Network Trait
// ============================================================================

/// RPC seam between the lookup logic and whatever carries the calls.
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// Ask `to` for the contacts it knows closest to `target`.
    async fn get_closest_peers(&self, to: &PeerDescriptor, target: PeerId) -> Result<Vec<PeerDescriptor>>;

    /// Liveness check used by ping-before-evict.
    async fn ping(&self, to: &PeerDescriptor) -> Result<()>;
}

/// A remote peer together with the network used to reach it.
pub struct DhtPeer<N: DhtNetwork> {
    descriptor: PeerDescriptor,
    network: Arc<N>,
}

impl<N: DhtNetwork> Clone for DhtPeer<N> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            network: self.network.clone(),
        }
    }
}

impl<N: DhtNetwork> HasPeerId for DhtPeer<N> {
    fn peer_id(&self) -> PeerId {
        self.descriptor.peer_id
    }
}

impl<N: DhtNetwork> DhtPeer<N> {
    pub fn new(descriptor: PeerDescriptor, network: Arc<N>) -> Self {
        Self {
            descriptor,
            network,
        }
    }

    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.descriptor
    }

    pub async fn get_closest_peers(&self, target: PeerId) -> Result<Vec<PeerDescriptor>> {
        self.network.get_closest_peers(&self.descriptor, target).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.network.ping(&self.descriptor).await
    }
}

// ============================================================================
// DHT Node
// ============================================================================

/// Kademlia node: a routing table, a long-lived neighbor list and the
/// [`DhtNetwork`] used to query other peers.
///
/// Generic over the network so tests can use an in-memory mock while a real
/// node uses [`crate::net::RpcDhtNetwork`].
///
/// # Key Methods
///
/// * [`join_dht`](Self::join_dht) - iterative lookup of our own id from entry points
/// * [`observe_contact`](Self::observe_contact) - feed the routing table
/// * [`handle_get_closest_peers`](Self::handle_get_closest_peers) - incoming `getClosestPeers`
/// * [`handle_ping`](Self::handle_ping) - incoming `ping`
pub struct DhtNode<N: DhtNetwork> {
    local: PeerDescriptor,
    config: DhtConfig,
    routing: Arc<Mutex<RoutingTable>>,
    neighbors: Mutex<SortedContactList<PeerDescriptor>>,
    network: Arc<N>,
}

impl<N: DhtNetwork> DhtNode<N> {
    pub fn new(local: PeerDescriptor, network: N, config: DhtConfig) -> Self {
        let id = local.peer_id;
        Self {
            routing: Arc::new(Mutex::new(RoutingTable::new(id, config.k))),
            neighbors: Mutex::new(SortedContactList::new(id, Some(config.neighbor_list_size))),
            network: Arc::new(network),
            local,
            config,
        }
    }

    pub fn local_descriptor(&self) -> &PeerDescriptor {
        &self.local
    }

    pub fn peer_id(&self) -> PeerId {
        self.local.peer_id
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    /// Record a peer in the routing table.
    ///
    /// If its bucket is full, a background task pings the oldest entry and
    /// evicts it only when the ping fails.
    pub async fn observe_contact(&self, contact: PeerDescriptor) {
        if contact.peer_id == self.local.peer_id {
            return;
        }
        let pending = {
            let mut rt = self.routing.lock().await;
            rt.update_with_pending(contact)
        };
        if let Some(update) = pending {
            self.spawn_bucket_refresh(update);
        }
    }

    fn spawn_bucket_refresh(&self, pending: PendingBucketUpdate) {
        let network = self.network.clone();
        let routing = self.routing.clone();
        tokio::spawn(async move {
            let alive = match network.ping(&pending.oldest).await {
                Ok(()) => true,
                Err(err) => {
                    debug!(peer = %pending.oldest, "ping failed: {err:#}");
                    false
                }
            };
            routing.lock().await.apply_ping_result(pending, alive);
        });
    }

    /// Drop a peer from the routing table and the neighbor list.
    pub async fn remove_contact(&self, id: &PeerId) {
        self.routing.lock().await.remove(id);
        self.neighbors.lock().await.remove_contact(id);
    }

    /// Incoming `getClosestPeers`: the caller becomes a contact and a neighbor.
    pub async fn handle_get_closest_peers(
        &self,
        caller: &PeerDescriptor,
        target: PeerId,
    ) -> Vec<PeerDescriptor> {
        let closest = {
            let rt = self.routing.lock().await;
            let mut closest = rt.closest(&target, self.config.k + 1);
            closest.retain(|c| c.peer_id != caller.peer_id);
            closest.truncate(self.config.k);
            closest
        };
        self.observe_contact(caller.clone()).await;
        self.neighbors.lock().await.add_contact(caller.clone());
        trace!(caller = %caller, returned = closest.len(), "answered getClosestPeers");
        closest
    }

    /// Incoming `ping`; echoes the nonce.
    pub async fn handle_ping(&self, caller: &PeerDescriptor, nonce: String) -> String {
        self.observe_contact(caller.clone()).await;
        nonce
    }

    /// Iteratively look up our own id starting from `entry_points` and return
    /// the accepted neighbor set.
    ///
    /// Rounds query `alpha` uncontacted contacts concurrently. A round that
    /// does not bring a closer contact is retried once against `k` contacts;
    /// the lookup stops when `k` contacts answered or nothing improves.
    /// Failed contacts stay contacted and inactive.
    pub async fn join_dht(&self, entry_points: &[PeerDescriptor]) -> Vec<PeerDescriptor> {
        let own_id = self.local.peer_id;
        for entry in entry_points {
            self.observe_contact(entry.clone()).await;
        }

        let alpha = self.config.alpha.max(1);
        let k = self.config.k.max(1);
        let mut shortlist: SortedContactList<DhtPeer<N>> = SortedContactList::new(own_id, None);
        let seeds = self.routing.lock().await.closest(&own_id, alpha);
        shortlist.add_contacts(
            seeds
                .into_iter()
                .map(|descriptor| DhtPeer::new(descriptor, self.network.clone())),
        );

        let mut escalated = false;
        loop {
            let width = if escalated { k } else { alpha };
            let batch = shortlist.get_uncontacted_contacts(width);
            if batch.is_empty() {
                break;
            }
            for peer in &batch {
                shortlist.set_contacted(&peer.peer_id());
            }

            let before = shortlist.get_closest_contact_id();
            let responses = join_all(batch.iter().map(|peer| peer.get_closest_peers(own_id))).await;
            for (peer, response) in batch.iter().zip(responses) {
                match response {
                    Ok(found) => {
                        shortlist.set_active(&peer.peer_id());
                        self.observe_contact(peer.descriptor().clone()).await;
                        for descriptor in found {
                            if descriptor.peer_id == own_id {
                                continue;
                            }
                            self.observe_contact(descriptor.clone()).await;
                            shortlist.add_contact(DhtPeer::new(descriptor, self.network.clone()));
                        }
                    }
                    Err(err) => debug!(peer = %peer.descriptor(), "getClosestPeers failed: {err:#}"),
                }
            }

            if shortlist.active_count() >= k {
                break;
            }
            let improved = match (before, shortlist.get_closest_contact_id()) {
                (Some(before), Some(after)) => {
                    shortlist.compare_ids(&after, &before) == std::cmp::Ordering::Less
                }
                (None, Some(_)) => true,
                _ => false,
            };
            if improved {
                escalated = false;
            } else if !escalated {
                trace!("no closer contact; widening the next round to k");
                escalated = true;
            } else {
                break;
            }
        }

        let accepted: Vec<PeerDescriptor> = shortlist
            .get_active_contacts()
            .into_iter()
            .map(|peer| peer.descriptor().clone())
            .collect();
        self.neighbors
            .lock()
            .await
            .add_contacts(accepted.iter().cloned());
        info!(peer = %self.local, neighbors = accepted.len(), "joined dht");
        accepted
    }

    /// The long-lived neighbor list, closest first.
    pub async fn neighbors(&self) -> Vec<PeerDescriptor> {
        self.neighbors.lock().await.get_all_contacts()
    }

    pub async fn neighbor_count(&self) -> usize {
        self.neighbors.lock().await.len()
    }

    pub async fn routing_table_size(&self) -> usize {
        self.routing.lock().await.len()
    }

    pub async fn closest_known(&self, target: &PeerId, limit: usize) -> Vec<PeerDescriptor> {
        self.routing.lock().await.closest(target, limit)
    }
}
