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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use tokio::sync::{mpsc, watch};

use crate::error::CloseReason;
use crate::observer::{Dispatch, MeshObserver, ObserverRegistry, Outgoing};
use crate::protocol::{Hello, MeshDatagram, MessageId, ServerId, PROTOCOL_VERSION};
use crate::seen::SeenSet;

pub type LinkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Handshaking,
    Up,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Inbound,
    Outbound,
}

/// One peer connection, owned by the mesh.
///
/// The socket itself lives in a pump task; the link holds the sending
/// half of its write queue and the shutdown trigger, so everything here
/// is mutated from the event-loop task only.
pub struct PeerLink {
    addr: SocketAddr,
    direction: LinkDirection,
    state: LinkState,

    /// HELLO-authenticated identity, set at the UP transition.
    remote: Option<ServerId>,

    close_reason: Option<CloseReason>,
    tx_records: mpsc::UnboundedSender<Bytes>,
    tx_shutdown: watch::Sender<bool>,
    handshake_deadline: Instant,
}

impl PeerLink {
    pub fn new(
        addr: SocketAddr,
        direction: LinkDirection,
        tx_records: mpsc::UnboundedSender<Bytes>,
        tx_shutdown: watch::Sender<bool>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            addr,
            direction,
            state: LinkState::Connecting,
            remote: None,
            close_reason: None,
            tx_records,
            tx_shutdown,
            handshake_deadline: Instant::now() + handshake_timeout,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn remote(&self) -> Option<ServerId> {
        self.remote
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Queue one framed record for the pump task to write.
    pub fn send(&self, line: Bytes) {
        if let Err(e) = self.tx_records.send(line) {
            error!("Unable to queue record (addr = {}): {}", self.addr, e);
        }
    }

    /// Begin draining. The pump task flushes what is queued, bounded by
    /// the drain grace, then reports the link closed.
    pub fn close(&mut self, reason: CloseReason) {
        if matches!(self.state, LinkState::Draining | LinkState::Closed) {
            return;
        }

        debug!("Closing peer link (addr = {}) (reason = {})", self.addr, reason);

        self.state = LinkState::Draining;
        self.close_reason = Some(reason);

        let _ = self.tx_shutdown.send(true);
    }
}

/// Outcome of a HELLO on a handshaking link.
pub enum HelloOutcome {
    /// Link is UP with this remote.
    Established(ServerId),

    /// The link must close with this reason.
    Reject(CloseReason),

    /// Link is UP; an older link to the same remote lost the tie-break
    /// and must close.
    Supersede(ServerId, LinkId),
}

/// Central hub: the peer link set, the dedup cache, the message counter,
/// and the observer registry.
///
/// Flooding discipline: a datagram is forwarded to every UP link except
/// the one it arrived on, and an id is processed at most once while it
/// stays in the seen set. Together those terminate propagation even on
/// cyclic graphs.
pub struct MeshServer {
    local_id: ServerId,
    counter: u64,
    links: HashMap<LinkId, PeerLink>,
    next_link: LinkId,
    seen: SeenSet,
    registry: ObserverRegistry,
}

impl MeshServer {
    pub fn new(local_id: ServerId, seen_capacity: usize) -> Self {
        Self {
            local_id,
            counter: 0,
            links: HashMap::new(),
            next_link: 1,
            seen: SeenSet::new(seen_capacity),
            registry: ObserverRegistry::new(),
        }
    }

    pub fn local_id(&self) -> ServerId {
        self.local_id
    }

    pub fn register(&mut self, observer: MeshObserver) {
        self.registry.register(observer);
    }

    pub fn registry_mut(&mut self) -> &mut ObserverRegistry {
        &mut self.registry
    }

    pub fn add_link(&mut self, link: PeerLink) -> LinkId {
        let id = self.next_link;
        self.next_link += 1;
        self.links.insert(id, link);

        id
    }

    pub fn link(&self, link_id: LinkId) -> Option<&PeerLink> {
        self.links.get(&link_id)
    }

    pub fn remove_link(&mut self, link_id: LinkId) -> Option<PeerLink> {
        self.links.remove(&link_id).map(|mut link| {
            link.state = LinkState::Closed;
            link
        })
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Queue our HELLO on a fresh link and start the handshake clock
    /// running against it.
    pub fn begin_handshake(&mut self, link_id: LinkId) {
        let hello = Hello::new(self.local_id).to_bytes();

        if let Some(link) = self.links.get_mut(&link_id) {
            link.send(hello);
            link.state = LinkState::Handshaking;
        }
    }

    /// Handle the remote HELLO on a handshaking link.
    pub fn on_hello(&mut self, link_id: LinkId, hello: &Hello) -> HelloOutcome {
        let (state, direction) = match self.links.get(&link_id) {
            Some(link) => (link.state(), link.direction()),
            None => return HelloOutcome::Reject(CloseReason::Protocol),
        };

        if state != LinkState::Handshaking {
            return HelloOutcome::Reject(CloseReason::Protocol);
        }

        if hello.protocol_version != PROTOCOL_VERSION {
            warn!(
                "Rejecting peer with incompatible protocol (addr = {}) (version = {})",
                self.links[&link_id].addr(),
                hello.protocol_version
            );

            return HelloOutcome::Reject(CloseReason::Protocol);
        }

        // Self-loop: we dialed our own listener, or were dialed by a clone.
        if hello.server_id == self.local_id {
            return HelloOutcome::Reject(CloseReason::Protocol);
        }

        let mut superseded = None;

        if let Some(existing) = self.up_link_for(&hello.server_id) {
            let existing_direction = match self.links.get(&existing) {
                Some(link) => link.direction(),
                None => direction,
            };

            if existing_direction == direction {
                return HelloOutcome::Reject(CloseReason::DuplicatePeer);
            }

            // Crossed dial. Both ends must keep the same link: the one
            // dialed by the numerically greater server id survives.
            let keep_inbound = hello.server_id > self.local_id;
            let new_wins = (direction == LinkDirection::Inbound) == keep_inbound;

            if !new_wins {
                return HelloOutcome::Reject(CloseReason::DuplicatePeer);
            }

            superseded = Some(existing);
        }

        if let Some(link) = self.links.get_mut(&link_id) {
            link.remote = Some(hello.server_id);
            link.state = LinkState::Up;
        }

        match superseded {
            Some(existing) => HelloOutcome::Supersede(hello.server_id, existing),
            None => HelloOutcome::Established(hello.server_id),
        }
    }

    /// Originate a broadcast: fresh id, local observers first, then every
    /// UP link.
    pub fn broadcast(&mut self, outgoing: Outgoing, dispatch: &mut Dispatch) -> MessageId {
        let id = self.broadcast_inner(outgoing, dispatch);
        self.drain_follow_ups(dispatch);

        id
    }

    /// Send on exactly one link. The id still goes through the seen set,
    /// so an echo looping back does not re-trigger observers.
    pub fn unicast(&mut self, link_id: LinkId, outgoing: Outgoing) -> MessageId {
        let datagram = self.make_datagram(outgoing);
        let id = datagram.id;
        self.seen.insert(id);

        if let Some(link) = self.links.get(&link_id) {
            if link.state() == LinkState::Up {
                link.send(datagram.to_bytes());
            }
        }

        id
    }

    /// The receive path: dedup, forward with split horizon, then notify.
    pub fn on_peer_record(
        &mut self,
        link_id: LinkId,
        datagram: MeshDatagram,
        dispatch: &mut Dispatch,
    ) {
        if self.seen.contains(&datagram.id) {
            debug!("Dropping duplicate datagram (id = {})", datagram.id);
            return;
        }

        self.seen.insert(datagram.id);

        let mut datagram = datagram;
        let forward = match datagram.ttl {
            Some(0) => false,
            Some(ttl) => {
                datagram.ttl = Some(ttl - 1);
                true
            }
            None => true,
        };

        if forward {
            let line = datagram.to_bytes();

            for (id, link) in &self.links {
                // Split horizon: never back on the arrival link.
                if *id == link_id || link.state() != LinkState::Up {
                    continue;
                }

                link.send(line.clone());
            }
        }

        // Observers hear it whether or not the ttl stopped forwarding.
        dispatch.arrival = self.links.get(&link_id).and_then(|link| link.remote());
        self.registry.notify(&datagram, dispatch);
        dispatch.arrival = None;

        self.drain_follow_ups(dispatch);
    }

    /// UP peers, sorted by id for stable /peers output.
    pub fn peers(&self) -> Vec<(ServerId, SocketAddr)> {
        let mut peers: Vec<_> = self
            .links
            .values()
            .filter(|link| link.state() == LinkState::Up)
            .filter_map(|link| link.remote().map(|remote| (remote, link.addr())))
            .collect();

        peers.sort();

        peers
    }

    pub fn up_link_for(&self, remote: &ServerId) -> Option<LinkId> {
        self.links
            .iter()
            .find(|(_, link)| link.state() == LinkState::Up && link.remote() == Some(*remote))
            .map(|(id, _)| *id)
    }

    pub fn close_link(&mut self, link_id: LinkId, reason: CloseReason) {
        if let Some(link) = self.links.get_mut(&link_id) {
            link.close(reason);
        }
    }

    pub fn close_all(&mut self, reason: CloseReason) {
        for link in self.links.values_mut() {
            link.close(reason);
        }
    }

    /// Links that outstayed the handshake clock.
    pub fn sweep_handshakes(&self) -> Vec<LinkId> {
        let now = Instant::now();

        self.links
            .iter()
            .filter(|(_, link)| {
                matches!(link.state(), LinkState::Connecting | LinkState::Handshaking)
                    && now >= link.handshake_deadline
            })
            .map(|(id, _)| *id)
            .collect()
    }

    fn broadcast_inner(&mut self, outgoing: Outgoing, dispatch: &mut Dispatch) -> MessageId {
        let datagram = self.make_datagram(outgoing);
        let id = datagram.id;
        self.seen.insert(id);

        // Local observers first; the speaker's own echo depends on it.
        dispatch.arrival = None;
        self.registry.notify(&datagram, dispatch);

        let line = datagram.to_bytes();

        for link in self.links.values() {
            if link.state() == LinkState::Up {
                link.send(line.clone());
            }
        }

        id
    }

    /// Broadcasts queued by observers during dispatch go out after the
    /// round that queued them, which keeps observer re-entrancy flat.
    fn drain_follow_ups(&mut self, dispatch: &mut Dispatch) {
        while let Some(outgoing) = dispatch.next_broadcast() {
            self.broadcast_inner(outgoing, dispatch);
        }
    }

    fn make_datagram(&mut self, outgoing: Outgoing) -> MeshDatagram {
        self.counter += 1;

        MeshDatagram {
            id: MessageId {
                origin: self.local_id,
                counter: self.counter,
            },
            dtype: outgoing.dtype,
            ttl: outgoing.ttl,
            recipient: outgoing.recipient,
            reply_to: None,
            speaker: outgoing.speaker,
            payload: outgoing.payload,
        }
    }
}
