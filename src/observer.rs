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

use std::collections::{HashMap, VecDeque};

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::{MeshDatagram, ServerId, TYPE_I_AM, TYPE_PEER_SET, TYPE_SPEECH};
use crate::topology::TopologyObserver;

/// A broadcast request before the mesh has assigned it a message id.
pub struct Outgoing {
    pub dtype: String,
    pub payload: Vec<u8>,
    pub ttl: Option<u64>,
    pub recipient: Option<ServerId>,
    pub speaker: Option<String>,
}

impl Outgoing {
    pub fn new(dtype: &str, payload: Vec<u8>) -> Self {
        Self {
            dtype: dtype.to_string(),
            payload,
            ttl: None,
            recipient: None,
            speaker: None,
        }
    }

    pub fn ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn recipient(mut self, recipient: ServerId) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub fn speaker(mut self, speaker: &str) -> Self {
        self.speaker = Some(speaker.to_string());
        self
    }
}

/// Effect queue threaded through a dispatch round.
///
/// Observers run on the event-loop task and never touch sockets; what they
/// want done is queued here and applied by the caller once notification
/// returns. Follow-up broadcasts queued during dispatch keep re-entrancy
/// borrow-clean: the mesh drains them after the current round.
pub struct Dispatch {
    /// Identity of this server, for recipient filtering.
    pub local_id: ServerId,

    /// HELLO-authenticated remote id of the link the datagram arrived on.
    /// None when the datagram originated locally.
    pub arrival: Option<ServerId>,

    chat_lines: Vec<Bytes>,
    broadcasts: VecDeque<Outgoing>,
}

impl Dispatch {
    pub fn new(local_id: ServerId) -> Self {
        Self {
            local_id,
            arrival: None,
            chat_lines: Vec::new(),
            broadcasts: VecDeque::new(),
        }
    }

    /// Queue a line for every local client connection.
    pub fn chat(&mut self, line: Bytes) {
        self.chat_lines.push(line);
    }

    /// Queue a follow-up broadcast on the mesh.
    pub fn broadcast(&mut self, outgoing: Outgoing) {
        self.broadcasts.push_back(outgoing);
    }

    pub(crate) fn next_broadcast(&mut self) -> Option<Outgoing> {
        self.broadcasts.pop_front()
    }

    pub fn take_chat_lines(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.chat_lines)
    }
}

/// Relays SPEECH datagrams to every local client.
///
/// The speaker's own terminal sees the utterance exactly once because the
/// originating server notifies its observers before the datagram reaches
/// any peer link.
pub struct SpeechObserver;

impl SpeechObserver {
    pub fn new() -> Self {
        Self
    }

    fn on_datagram(&mut self, datagram: &MeshDatagram, dispatch: &mut Dispatch) {
        let speaker = datagram.speaker.as_deref().unwrap_or("anon");

        let mut line = BytesMut::with_capacity(speaker.len() + 7 + datagram.payload.len());
        line.put_slice(speaker.as_bytes());
        line.put_slice(b" says: ");
        line.put_slice(&datagram.payload);

        dispatch.chat(line.freeze());
    }
}

/// One registered subscriber.
///
/// Tagged-variant dispatch: the in-tree observers are plain variants and
/// `Hook` is a function-valued entry for taps and extensions. No
/// hierarchy to walk.
pub enum MeshObserver {
    Speech(SpeechObserver),
    Topology(TopologyObserver),
    Hook {
        interests: Vec<String>,

        /// A filtered hook is skipped when the datagram is addressed to
        /// some other server; a generic one still sees it.
        recipient_filtered: bool,

        callback: Box<dyn FnMut(&MeshDatagram, &mut Dispatch) + Send>,
    },
}

impl MeshObserver {
    fn interests(&self) -> Vec<String> {
        match self {
            MeshObserver::Speech(_) => vec![TYPE_SPEECH.to_string()],
            MeshObserver::Topology(_) => {
                vec![TYPE_I_AM.to_string(), TYPE_PEER_SET.to_string()]
            }
            MeshObserver::Hook { interests, .. } => interests.clone(),
        }
    }

    fn recipient_filtered(&self) -> bool {
        match self {
            MeshObserver::Hook {
                recipient_filtered, ..
            } => *recipient_filtered,
            _ => false,
        }
    }

    fn notify(&mut self, datagram: &MeshDatagram, dispatch: &mut Dispatch) {
        match self {
            MeshObserver::Speech(observer) => observer.on_datagram(datagram, dispatch),
            MeshObserver::Topology(observer) => observer.on_datagram(datagram, dispatch),
            MeshObserver::Hook { callback, .. } => callback(datagram, dispatch),
        }
    }
}

/// Maps datagram types to their subscribers, in registration order.
pub struct ObserverRegistry {
    observers: Vec<MeshObserver>,
    by_type: HashMap<String, Vec<usize>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
            by_type: HashMap::new(),
        }
    }

    pub fn register(&mut self, observer: MeshObserver) {
        let index = self.observers.len();

        for interest in observer.interests() {
            self.by_type.entry(interest).or_default().push(index);
        }

        self.observers.push(observer);
    }

    pub fn topology_mut(&mut self) -> Option<&mut TopologyObserver> {
        self.observers.iter_mut().find_map(|observer| match observer {
            MeshObserver::Topology(topology) => Some(topology),
            _ => None,
        })
    }

    /// Notify every subscriber of the datagram's type. The caller
    /// guarantees at-most-once per message id; this only routes.
    pub fn notify(&mut self, datagram: &MeshDatagram, dispatch: &mut Dispatch) {
        let indices = match self.by_type.get(&datagram.dtype) {
            Some(indices) => indices.clone(),
            None => return,
        };

        let addressed_elsewhere = datagram
            .recipient
            .map_or(false, |recipient| recipient != dispatch.local_id);

        for index in indices {
            let observer = &mut self.observers[index];

            if addressed_elsewhere && observer.recipient_filtered() {
                continue;
            }

            observer.notify(datagram, dispatch);
        }
    }
}
