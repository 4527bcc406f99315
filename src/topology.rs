// Palaver - Line-oriented talker server over CRLF text with a flooding peer mesh
// Copyright (C) 2026  mossfet
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::observer::{Dispatch, Outgoing};
use crate::protocol::{MeshDatagram, PeerSet, ServerId, TYPE_I_AM, TYPE_PEER_SET};

/// What some origin last claimed its direct peers to be.
pub struct PeerSetEntry {
    pub peers: BTreeSet<ServerId>,
    pub version: u64,

    /// Last time a claim for this origin arrived; drives stale pruning.
    refreshed: Instant,
}

/// Eventually-consistent, fully-replicated view of the peer graph.
///
/// Our own direct-peer set is maintained locally from link lifecycle
/// events and advertised in PEER-SET broadcasts under a version counter
/// bumped on every membership change. Everyone else's entries come only
/// from their broadcasts and are merged monotonically by version.
pub struct TopologyObserver {
    local_id: ServerId,
    local_peers: BTreeSet<ServerId>,
    local_version: u64,
    routes: HashMap<ServerId, PeerSetEntry>,
    route_ttl: Duration,
}

impl TopologyObserver {
    pub fn new(local_id: ServerId, route_ttl: Duration) -> Self {
        Self {
            local_id,
            local_peers: BTreeSet::new(),
            local_version: 0,
            routes: HashMap::new(),
            route_ttl,
        }
    }

    pub fn local_version(&self) -> u64 {
        self.local_version
    }

    pub fn route(&self, origin: &ServerId) -> Option<&PeerSetEntry> {
        self.routes.get(origin)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// A link reached UP. Returns the PEER-SET broadcast to send when the
    /// membership actually changed.
    pub fn link_up(&mut self, remote: ServerId) -> Option<Outgoing> {
        if !self.local_peers.insert(remote) {
            return None;
        }

        Some(self.bump())
    }

    /// The last UP link to a remote closed.
    pub fn link_down(&mut self, remote: &ServerId) -> Option<Outgoing> {
        if !self.local_peers.remove(remote) {
            return None;
        }

        Some(self.bump())
    }

    /// Periodic re-advertisement, same version while nothing changed;
    /// recipients treat the repeat as a refresh no-op.
    pub fn refresh(&self) -> Outgoing {
        self.peer_set_outgoing()
    }

    pub fn on_datagram(&mut self, datagram: &MeshDatagram, dispatch: &mut Dispatch) {
        match datagram.dtype.as_str() {
            TYPE_I_AM => self.on_i_am(datagram, dispatch),
            TYPE_PEER_SET => self.on_peer_set(datagram),
            _ => (),
        }
    }

    fn on_i_am(&mut self, datagram: &MeshDatagram, dispatch: &mut Dispatch) {
        // Only the direct neighbour's own I-AM asserts reachability over
        // this hop. One forwarded from further out (origin differing from
        // the link's HELLO-authenticated remote) proves nothing here.
        if dispatch.arrival != Some(datagram.id.origin) {
            return;
        }

        self.touch(&datagram.id.origin);

        if self.local_peers.insert(datagram.id.origin) {
            let outgoing = self.bump();
            dispatch.broadcast(outgoing);
        }
    }

    fn on_peer_set(&mut self, datagram: &MeshDatagram) {
        let origin = datagram.id.origin;

        // We are the authority on our own entry.
        if origin == self.local_id {
            return;
        }

        match PeerSet::parse(&datagram.payload) {
            Ok(set) => self.apply_peer_set(origin, set),
            Err(_) => warn!("Discarding unparseable peer set (origin = {})", origin),
        }
    }

    /// Merge a claim, monotonically per origin: never replace an entry
    /// with a strictly older version.
    pub fn apply_peer_set(&mut self, origin: ServerId, set: PeerSet) {
        use std::collections::hash_map::Entry;

        match self.routes.entry(origin) {
            Entry::Vacant(slot) => {
                slot.insert(PeerSetEntry {
                    peers: set.peers,
                    version: set.version,
                    refreshed: Instant::now(),
                });
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();

                if set.version > entry.version {
                    entry.peers = set.peers;
                    entry.version = set.version;
                    entry.refreshed = Instant::now();
                } else if set.version == entry.version {
                    if set.peers == entry.peers {
                        entry.refreshed = Instant::now();
                    } else {
                        // Two different sets under one version: that
                        // origin is buggy. Keep what we have.
                        warn!(
                            "VERSION_COLLISION (origin = {}) (version = {})",
                            origin, set.version
                        );
                    }
                }
            }
        }
    }

    /// Servers findable from here: BFS over the replicated peer sets,
    /// starting at the local id.
    pub fn reachable(&self) -> BTreeSet<ServerId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();

        seen.insert(self.local_id);
        queue.push_back(self.local_id);

        while let Some(node) = queue.pop_front() {
            let peers = if node == self.local_id {
                &self.local_peers
            } else {
                match self.routes.get(&node) {
                    Some(entry) => &entry.peers,
                    None => continue,
                }
            };

            for peer in peers {
                if seen.insert(*peer) {
                    queue.push_back(*peer);
                }
            }
        }

        seen
    }

    /// Drop entries that went unrefreshed past the TTL. Live origins
    /// re-advertise every refresh interval, so anything this old is gone
    /// or partitioned beyond knowing. Returns how many were dropped.
    pub fn prune_stale(&mut self) -> usize {
        let ttl = self.route_ttl;
        let before = self.routes.len();

        self.routes.retain(|_, entry| entry.refreshed.elapsed() <= ttl);

        before - self.routes.len()
    }

    fn bump(&mut self) -> Outgoing {
        self.local_version += 1;
        self.peer_set_outgoing()
    }

    fn peer_set_outgoing(&self) -> Outgoing {
        let body = PeerSet {
            version: self.local_version,
            peers: self.local_peers.clone(),
        }
        .to_payload();

        Outgoing::new(TYPE_PEER_SET, body)
    }

    fn touch(&mut self, origin: &ServerId) {
        if let Some(entry) = self.routes.get_mut(origin) {
            entry.refreshed = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    #[allow(unused_imports)]
    use super::*;

    use crate::protocol::MessageId;

    fn id(tail: u8) -> ServerId {
        format!("{:032x}", tail).parse().unwrap()
    }

    fn set(version: u64, peers: &[u8]) -> PeerSet {
        PeerSet {
            version,
            peers: peers.iter().map(|tail| id(*tail)).collect(),
        }
    }

    fn topology() -> TopologyObserver {
        TopologyObserver::new(id(1), Duration::from_secs(300))
    }

    fn i_am(origin: ServerId) -> MeshDatagram {
        MeshDatagram {
            id: MessageId { origin, counter: 1 },
            dtype: TYPE_I_AM.to_string(),
            ttl: Some(0),
            recipient: None,
            reply_to: None,
            speaker: None,
            payload: Vec::new(),
        }
    }

    #[test]
    fn link_changes_bump_the_version_once() {
        let mut topology = topology();

        assert!(topology.link_up(id(2)).is_some());
        assert_eq!(topology.local_version(), 1);

        // Same peer again: no membership change, no broadcast.
        assert!(topology.link_up(id(2)).is_none());
        assert_eq!(topology.local_version(), 1);

        assert!(topology.link_down(&id(2)).is_some());
        assert_eq!(topology.local_version(), 2);
        assert!(topology.link_down(&id(2)).is_none());
    }

    #[test]
    fn refresh_reuses_the_version() {
        let mut topology = topology();
        topology.link_up(id(2));

        let outgoing = topology.refresh();
        let advertised = PeerSet::parse(&outgoing.payload).unwrap();

        assert_eq!(advertised, set(1, &[2]));
        assert_eq!(topology.local_version(), 1);
    }

    #[test]
    fn versions_merge_monotonically() {
        let mut topology = topology();

        topology.apply_peer_set(id(2), set(2, &[1, 3]));
        topology.apply_peer_set(id(2), set(1, &[4]));

        assert_eq!(topology.route(&id(2)).unwrap().version, 2);
        assert_eq!(topology.route(&id(2)).unwrap().peers, set(2, &[1, 3]).peers);

        topology.apply_peer_set(id(2), set(3, &[5]));

        assert_eq!(topology.route(&id(2)).unwrap().version, 3);
        assert_eq!(topology.route(&id(2)).unwrap().peers, set(3, &[5]).peers);
    }

    #[test]
    fn reapplying_a_claim_is_a_noop() {
        let mut topology = topology();

        topology.apply_peer_set(id(2), set(2, &[1, 3]));
        topology.apply_peer_set(id(2), set(2, &[1, 3]));

        assert_eq!(topology.route_count(), 1);
        assert_eq!(topology.route(&id(2)).unwrap().version, 2);
    }

    #[test]
    fn equal_version_divergence_is_ignored() {
        let mut topology = topology();

        topology.apply_peer_set(id(2), set(2, &[1, 3]));
        topology.apply_peer_set(id(2), set(2, &[1, 4]));

        assert_eq!(topology.route(&id(2)).unwrap().peers, set(2, &[1, 3]).peers);
    }

    #[test]
    fn reachability_walks_the_replicated_graph() {
        let mut topology = topology();

        // Line: 1 - 2 - 3.
        topology.link_up(id(2));
        topology.apply_peer_set(id(2), set(1, &[1, 3]));
        topology.apply_peer_set(id(3), set(1, &[2]));

        let reachable = topology.reachable();
        assert_eq!(reachable, [id(1), id(2), id(3)].into_iter().collect());

        // 2 drops 3: reachability contracts, the orphan entry stays.
        topology.apply_peer_set(id(2), set(2, &[1]));

        let reachable = topology.reachable();
        assert_eq!(reachable, [id(1), id(2)].into_iter().collect());
        assert!(topology.route(&id(3)).is_some());
    }

    #[test]
    fn i_am_from_the_neighbour_itself_adds_a_peer() {
        let mut topology = topology();
        let mut dispatch = Dispatch::new(id(1));
        dispatch.arrival = Some(id(2));

        topology.on_datagram(&i_am(id(2)), &mut dispatch);

        assert!(topology.reachable().contains(&id(2)));
        assert_eq!(topology.local_version(), 1);

        // The membership change queued a PEER-SET follow-up.
        let follow_up = dispatch.next_broadcast().unwrap();
        assert_eq!(follow_up.dtype, TYPE_PEER_SET);
    }

    #[test]
    fn forwarded_i_am_is_ignored() {
        let mut topology = topology();
        let mut dispatch = Dispatch::new(id(1));
        dispatch.arrival = Some(id(2));

        // Origin 3 arriving over the link to 2: not a direct neighbour.
        topology.on_datagram(&i_am(id(3)), &mut dispatch);

        assert!(!topology.reachable().contains(&id(3)));
        assert_eq!(topology.local_version(), 0);
        assert!(dispatch.next_broadcast().is_none());
    }

    #[test]
    fn own_peer_set_claims_are_not_merged() {
        let mut topology = topology();
        let mut dispatch = Dispatch::new(id(1));

        let datagram = MeshDatagram {
            id: MessageId {
                origin: id(1),
                counter: 5,
            },
            dtype: TYPE_PEER_SET.to_string(),
            ttl: None,
            recipient: None,
            reply_to: None,
            speaker: None,
            payload: set(9, &[7]).to_payload(),
        };

        topology.on_datagram(&datagram, &mut dispatch);

        assert_eq!(topology.route_count(), 0);
    }

    #[test]
    fn stale_routes_are_pruned() {
        let mut topology = TopologyObserver::new(id(1), Duration::from_millis(10));

        topology.apply_peer_set(id(2), set(1, &[1]));
        std::thread::sleep(Duration::from_millis(25));
        topology.apply_peer_set(id(3), set(1, &[1]));

        assert_eq!(topology.prune_stale(), 1);
        assert!(topology.route(&id(2)).is_none());
        assert!(topology.route(&id(3)).is_some());
    }
}
