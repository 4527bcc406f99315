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
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use bytes::{Bytes, BytesMut};

use futures::sink::SinkExt;

use crate::config::Config;
use crate::error::{CloseReason, PalaverError, PalaverResult};
use crate::framing::LineCodec;
use crate::mesh::{HelloOutcome, LinkDirection, LinkId, LinkState, MeshServer, PeerLink};
use crate::observer::{Dispatch, MeshObserver, Outgoing, SpeechObserver};
use crate::protocol::{Hello, PeerRecord, ServerId, TYPE_I_AM, TYPE_SPEECH};
use crate::topology::TopologyObserver;

pub struct Talker {
    /// Client listener; humans and netcat speak lines here.
    listener: TcpListener,

    /// Mesh hub: peer links, dedup cache, observer registry.
    mesh: MeshServer,

    /// Connected clients by socket address.
    ///
    /// The key is cleared as soon as the client disconnects.
    clients: HashMap<SocketAddr, ClientRegistry>,

    /// Peer listeners already bound, keyed by the requested address, so
    /// /peer-listen stays idempotent per bind.
    peer_listeners: HashMap<String, SocketAddr>,

    /// Main event loop receiver.
    ///
    /// Every pump, accept, dial, and timer task reports here; all server
    /// state is touched only while handling these messages.
    rx: mpsc::UnboundedReceiver<Message>,

    /// Main event loop sender, cloned into every spawned task.
    tx: mpsc::UnboundedSender<Message>,

    /// Flipped once at shutdown; peer accept loops watch it.
    tx_stop: watch::Sender<bool>,

    config: Config,
}

/// Enum of message variants & data passed to the main loop and computed
/// there.
enum Message {
    /// A complete record from a client connection.
    ClientLine(SocketAddr, BytesMut),

    /// Upon client disconnect or force disconnect.
    ClientClosed(SocketAddr, CloseReason),

    /// A complete record from a peer link.
    PeerRecord(LinkId, BytesMut),

    /// Upon peer link disconnect or force disconnect.
    PeerClosed(LinkId, CloseReason),

    /// A freshly-accepted inbound peer socket.
    PeerInbound(TcpStream, SocketAddr),

    /// Outcome of an outbound dial; the requesting client, when there is
    /// one, gets the command feedback.
    PeerDialed(String, Option<SocketAddr>, std::io::Result<TcpStream>),

    /// Upon repeating timer of `refresh_interval`.
    RefreshTick,

    /// Upon repeating 1 s timer: handshake deadlines.
    SweepTick,

    /// External stop request.
    Stop,
}

struct ClientRegistry {
    /// Display name attached to utterances.
    name: String,

    /// Client sending channel; the pump writes whatever arrives here.
    tx_lines: mpsc::UnboundedSender<Bytes>,

    /// Client shutdown sender channel. Will drop the connection once
    /// sent, after the drain grace.
    tx_shutdown: watch::Sender<bool>,

    /// Reason recorded by whoever initiated the close.
    close_reason: Option<CloseReason>,
}

/// Which connection a pump task is speaking for.
#[derive(Clone, Copy)]
enum ConnKey {
    Client(SocketAddr),
    Peer(LinkId),
}

impl ConnKey {
    fn line_message(&self, line: BytesMut) -> Message {
        match self {
            ConnKey::Client(addr) => Message::ClientLine(*addr, line),
            ConnKey::Peer(link_id) => Message::PeerRecord(*link_id, line),
        }
    }

    fn closed_message(&self, reason: CloseReason) -> Message {
        match self {
            ConnKey::Client(addr) => Message::ClientClosed(*addr, reason),
            ConnKey::Peer(link_id) => Message::PeerClosed(*link_id, reason),
        }
    }
}

/// Stops a running server from outside its loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(Message::Stop);
    }
}

impl Talker {
    pub async fn new<A>(listen: A, id: Option<ServerId>, config: Config) -> PalaverResult<Talker>
    where
        A: ToSocketAddrs,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (tx_stop, _) = watch::channel(false);

        let local_id = id.unwrap_or_else(ServerId::generate);

        let mut mesh = MeshServer::new(local_id, config.mesh.seen_capacity);
        mesh.register(MeshObserver::Speech(SpeechObserver::new()));
        mesh.register(MeshObserver::Topology(TopologyObserver::new(
            local_id,
            Duration::from_secs(config.mesh.route_ttl),
        )));

        Ok(Self {
            listener: TcpListener::bind(listen).await?,
            mesh,
            clients: HashMap::new(),
            peer_listeners: HashMap::new(),
            rx,
            tx,
            tx_stop,
            config,
        })
    }

    pub fn server_id(&self) -> ServerId {
        self.mesh.local_id()
    }

    pub fn local_addr(&self) -> PalaverResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.tx.clone(),
        }
    }

    /// Bind a peer listener and start accepting links on it. Idempotent
    /// per requested address.
    pub async fn add_peer_listener(&mut self, addr: &str) -> PalaverResult<SocketAddr> {
        if let Some(bound) = self.peer_listeners.get(addr) {
            return Ok(*bound);
        }

        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;

        self.peer_listeners.insert(addr.to_string(), bound);

        info!("Peer listener bound (addr = {})", bound);

        let tx = self.tx.clone();
        let mut rx_stop = self.tx_stop.subscribe();

        tokio::spawn(async move {
            loop {
                select! {
                    _ = rx_stop.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            if tx.send(Message::PeerInbound(stream, addr)).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Peer accept failed: {}", e),
                    }
                }
            }
        });

        Ok(bound)
    }

    /// Dial an outbound peer link. The outcome lands back on the event
    /// loop; nothing blocks here.
    pub fn connect_peer(&self, target: &str, requester: Option<SocketAddr>) {
        let target = target.to_string();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let result = TcpStream::connect(target.as_str()).await;

            let _ = tx.send(Message::PeerDialed(target, requester, result));
        });
    }

    /// Start the main event loop.
    ///
    /// Everything that touches server state runs here, one message at a
    /// time; handlers must not block on I/O.
    pub async fn up(&mut self) -> PalaverResult<()> {
        self.start_timers();

        info!(
            "Started processing connections (id = {}) (addr = {})",
            self.mesh.local_id(),
            self.listener.local_addr()?
        );

        loop {
            select! {
                _ = tokio::signal::ctrl_c() => {
                    break;
                }
                Ok((stream, addr)) = self.listener.accept() => {
                    self.register_client(stream, addr);
                }
                Some(message) = self.rx.recv() => {
                    if self.handle_message(message).await {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;

        Ok(())
    }

    async fn handle_message(&mut self, message: Message) -> bool {
        match message {
            Message::ClientLine(addr, line) => self.on_client_line(addr, line).await,
            Message::ClientClosed(addr, pump_reason) => {
                let reason = self
                    .clients
                    .get(&addr)
                    .and_then(|client| client.close_reason)
                    .unwrap_or(pump_reason);

                debug!("Client disconnected (addr = {}) (reason = {})", addr, reason);

                self.clients.remove(&addr);
            }
            Message::PeerRecord(link_id, line) => self.on_peer_line(link_id, line),
            Message::PeerClosed(link_id, pump_reason) => {
                self.on_peer_closed(link_id, pump_reason)
            }
            Message::PeerInbound(stream, addr) => {
                debug!("Peer connected (addr = {})", addr);

                self.register_peer(stream, addr, LinkDirection::Inbound);
            }
            Message::PeerDialed(target, requester, result) => {
                self.on_peer_dialed(&target, requester, result)
            }
            Message::RefreshTick => self.on_refresh_tick(),
            Message::SweepTick => self.on_sweep_tick(),
            Message::Stop => return true,
        }

        false
    }

    async fn on_client_line(&mut self, addr: SocketAddr, line: BytesMut) {
        if line.first() == Some(&b'/') {
            self.on_client_command(addr, &line).await;
            return;
        }

        // Bare newlines from interactive clients are not speech.
        if line.is_empty() {
            return;
        }

        let name = match self.clients.get(&addr) {
            Some(client) => client.name.clone(),
            None => return,
        };

        let mut dispatch = Dispatch::new(self.mesh.local_id());
        self.mesh.broadcast(
            Outgoing::new(TYPE_SPEECH, line.to_vec()).speaker(&name),
            &mut dispatch,
        );
        self.apply_effects(&mut dispatch);
    }

    async fn on_client_command(&mut self, addr: SocketAddr, line: &[u8]) {
        let text = match std::str::from_utf8(line) {
            Ok(text) => text.to_string(),
            Err(_) => {
                self.client_error(addr, "bad-args", "command is not text");
                return;
            }
        };

        let mut words = text[1..].split_whitespace();
        let command = words.next().unwrap_or("").to_string();
        let args: Vec<&str> = words.collect();

        match command.as_str() {
            "peer-listen" => self.cmd_peer_listen(addr, &args).await,
            "peer-connect" => self.cmd_peer_connect(addr, &args),
            "peers" => self.cmd_peers(addr),
            "name" => self.cmd_name(addr, &args),
            "quit" => self.close_client(addr, CloseReason::Quit),
            _ => self.client_error(addr, "unknown-command", &command),
        }
    }

    async fn cmd_peer_listen(&mut self, addr: SocketAddr, args: &[&str]) {
        let target = match join_host_port(args) {
            Some(target) => target,
            None => {
                self.client_error(addr, "bad-args", "usage: /peer-listen <host> <port>");
                return;
            }
        };

        match self.add_peer_listener(&target).await {
            Ok(bound) => self.client_ok(addr, &format!("peer-listen {}", bound)),
            Err(e) => self.client_error(addr, "bind-failed", &e.to_string()),
        }
    }

    fn cmd_peer_connect(&mut self, addr: SocketAddr, args: &[&str]) {
        let target = match join_host_port(args) {
            Some(target) => target,
            None => {
                self.client_error(addr, "bad-args", "usage: /peer-connect <host> <port>");
                return;
            }
        };

        self.connect_peer(&target, Some(addr));
        self.client_ok(addr, &format!("peer-connect dialing {}", target));
    }

    fn cmd_peers(&mut self, addr: SocketAddr) {
        let peers = self.mesh.peers();

        if let Some(client) = self.clients.get(&addr) {
            for (remote, peer_addr) in peers {
                Self::client_send(
                    &addr,
                    client,
                    Bytes::from(format!("PEER {} {}", remote, peer_addr).into_bytes()),
                );
            }
        }
    }

    fn cmd_name(&mut self, addr: SocketAddr, args: &[&str]) {
        let nick = match args {
            [nick] if valid_name(nick) => nick.to_string(),
            [_] => {
                self.client_error(addr, "invalid-name", "names are [A-Za-z0-9._-], 32 max");
                return;
            }
            _ => {
                self.client_error(addr, "bad-args", "usage: /name <nick>");
                return;
            }
        };

        if let Some(client) = self.clients.get_mut(&addr) {
            client.name = nick.clone();
        }

        self.client_ok(addr, &format!("name {}", nick));
    }

    fn on_peer_line(&mut self, link_id: LinkId, line: BytesMut) {
        // Records racing a close die with the link.
        match self.mesh.link(link_id).map(|link| link.state()) {
            None | Some(LinkState::Draining) | Some(LinkState::Closed) => return,
            _ => (),
        }

        let record = match PeerRecord::parse(&line) {
            Ok(record) => record,
            Err(_) => {
                warn!("Malformed peer record (link = {})", link_id);
                self.mesh.close_link(link_id, CloseReason::Malformed);
                return;
            }
        };

        match record {
            PeerRecord::Hello(hello) => self.on_peer_hello(link_id, &hello),
            PeerRecord::Datagram(datagram) => {
                // Datagrams are only legal once the handshake is done.
                if self.mesh.link(link_id).map(|link| link.state()) != Some(LinkState::Up) {
                    self.mesh.close_link(link_id, CloseReason::Protocol);
                    return;
                }

                let mut dispatch = Dispatch::new(self.mesh.local_id());
                self.mesh.on_peer_record(link_id, datagram, &mut dispatch);
                self.apply_effects(&mut dispatch);
            }
        }
    }

    fn on_peer_hello(&mut self, link_id: LinkId, hello: &Hello) {
        match self.mesh.on_hello(link_id, hello) {
            HelloOutcome::Established(remote) => self.peer_established(link_id, remote),
            HelloOutcome::Supersede(remote, losing) => {
                self.mesh.close_link(losing, CloseReason::DuplicatePeer);
                self.peer_established(link_id, remote);
            }
            HelloOutcome::Reject(reason) => self.mesh.close_link(link_id, reason),
        }
    }

    fn peer_established(&mut self, link_id: LinkId, remote: ServerId) {
        if let Some(link) = self.mesh.link(link_id) {
            info!(
                "Peer link up (addr = {}) (remote = {})",
                link.addr(),
                remote
            );
        }

        // Announce ourselves on this hop only; ttl=0 keeps the assertion
        // from travelling further than it is true.
        self.mesh
            .unicast(link_id, Outgoing::new(TYPE_I_AM, Vec::new()).ttl(0));

        let follow_up = self
            .mesh
            .registry_mut()
            .topology_mut()
            .and_then(|topology| topology.link_up(remote));

        self.broadcast_follow_up(follow_up);
    }

    fn on_peer_closed(&mut self, link_id: LinkId, pump_reason: CloseReason) {
        let link = match self.mesh.remove_link(link_id) {
            Some(link) => link,
            None => return,
        };

        let reason = link.close_reason().unwrap_or(pump_reason);

        info!(
            "Peer link closed (addr = {}) (reason = {})",
            link.addr(),
            reason
        );

        let remote = match link.remote() {
            Some(remote) => remote,
            None => return,
        };

        // A superseded duplicate closing must not evict the survivor.
        if self.mesh.up_link_for(&remote).is_some() {
            return;
        }

        let follow_up = self
            .mesh
            .registry_mut()
            .topology_mut()
            .and_then(|topology| topology.link_down(&remote));

        self.broadcast_follow_up(follow_up);
    }

    fn on_peer_dialed(
        &mut self,
        target: &str,
        requester: Option<SocketAddr>,
        result: std::io::Result<TcpStream>,
    ) {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Peer dial failed (target = {}): {}", target, e);

                if let Some(requester) = requester {
                    self.client_error(requester, "connect-failed", target);
                }

                return;
            }
        };

        match stream.peer_addr() {
            Ok(addr) => {
                debug!("Peer dial succeeded (addr = {})", addr);
                self.register_peer(stream, addr, LinkDirection::Outbound);
            }
            Err(e) => {
                warn!("Peer dial lost its socket (target = {}): {}", target, e);

                if let Some(requester) = requester {
                    self.client_error(requester, "connect-failed", target);
                }
            }
        }
    }

    fn on_refresh_tick(&mut self) {
        let pruned = self
            .mesh
            .registry_mut()
            .topology_mut()
            .map(|topology| topology.prune_stale())
            .unwrap_or(0);

        if pruned > 0 {
            debug!("Pruned stale routes (count = {})", pruned);
        }

        // With no links up there is nobody to refresh.
        if self.mesh.peers().is_empty() {
            return;
        }

        let refresh = self
            .mesh
            .registry_mut()
            .topology_mut()
            .map(|topology| topology.refresh());

        self.broadcast_follow_up(refresh);
    }

    fn on_sweep_tick(&mut self) {
        for link_id in self.mesh.sweep_handshakes() {
            warn!("Peer handshake timed out (link = {})", link_id);
            self.mesh.close_link(link_id, CloseReason::HandshakeTimeout);
        }
    }

    fn broadcast_follow_up(&mut self, follow_up: Option<Outgoing>) {
        if let Some(outgoing) = follow_up {
            let mut dispatch = Dispatch::new(self.mesh.local_id());
            self.mesh.broadcast(outgoing, &mut dispatch);
            self.apply_effects(&mut dispatch);
        }
    }

    /// Apply what observers queued during a dispatch round: chat fanout
    /// to every local client.
    fn apply_effects(&mut self, dispatch: &mut Dispatch) {
        for line in dispatch.take_chat_lines() {
            for (addr, client) in &self.clients {
                Self::client_send(addr, client, line.clone());
            }
        }
    }

    fn register_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        let (tx_lines, rx_lines) = mpsc::unbounded_channel();
        let (tx_shutdown, rx_shutdown) = watch::channel(false);

        let name = format!("anon-{:04x}", rand::random::<u16>());

        debug!("Client connected (addr = {}) (name = {})", addr, name);

        self.clients.insert(
            addr,
            ClientRegistry {
                name,
                tx_lines,
                tx_shutdown,
                close_reason: None,
            },
        );

        spawn_connection(
            stream,
            self.config.general.max_line_length,
            rx_lines,
            rx_shutdown,
            Duration::from_secs(self.config.general.drain_grace),
            self.tx.clone(),
            ConnKey::Client(addr),
        );
    }

    fn register_peer(&mut self, stream: TcpStream, addr: SocketAddr, direction: LinkDirection) {
        let (tx_records, rx_records) = mpsc::unbounded_channel();
        let (tx_shutdown, rx_shutdown) = watch::channel(false);

        let link = PeerLink::new(
            addr,
            direction,
            tx_records,
            tx_shutdown,
            Duration::from_secs(self.config.mesh.handshake_timeout),
        );

        let link_id = self.mesh.add_link(link);

        // Both sides speak first: our HELLO goes out immediately.
        self.mesh.begin_handshake(link_id);

        spawn_connection(
            stream,
            self.config.general.max_line_length,
            rx_records,
            rx_shutdown,
            Duration::from_secs(self.config.general.drain_grace),
            self.tx.clone(),
            ConnKey::Peer(link_id),
        );
    }

    fn close_client(&mut self, addr: SocketAddr, reason: CloseReason) {
        if let Some(client) = self.clients.get_mut(&addr) {
            client.close_reason = Some(reason);

            let _ = client.tx_shutdown.send(true);
        }
    }

    fn client_send(addr: &SocketAddr, client: &ClientRegistry, line: Bytes) {
        if let Err(e) = client.tx_lines.send(line) {
            error!("Unable to send line to client (addr = {}): {}", addr, e);
        }
    }

    fn client_ok(&self, addr: SocketAddr, detail: &str) {
        if let Some(client) = self.clients.get(&addr) {
            Self::client_send(&addr, client, Bytes::from(format!("OK {}", detail).into_bytes()));
        }
    }

    fn client_error(&self, addr: SocketAddr, code: &str, detail: &str) {
        if let Some(client) = self.clients.get(&addr) {
            Self::client_send(
                &addr,
                client,
                Bytes::from(format!("ERR {} {}", code, detail).into_bytes()),
            );
        }
    }

    /// Starts background timers.
    ///
    /// PEER-SET refresh and the handshake sweep initialize here.
    fn start_timers(&mut self) {
        let tx = self.tx.clone();
        let refresh_interval = Duration::from_secs(self.config.mesh.refresh_interval);

        tokio::spawn(async move {
            loop {
                sleep(refresh_interval).await;

                if tx.send(Message::RefreshTick).is_err() {
                    break;
                }
            }
        });

        let tx = self.tx.clone();

        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(1)).await;

                if tx.send(Message::SweepTick).is_err() {
                    break;
                }
            }
        });
    }

    /// Stop accepting, close everything with SHUTDOWN, and wait for the
    /// connection set to empty, bounded by the shutdown grace.
    async fn shutdown(&mut self) {
        info!(
            "Shutting down (clients = {}) (links = {})",
            self.clients.len(),
            self.mesh.link_count()
        );

        let _ = self.tx_stop.send(true);

        for client in self.clients.values_mut() {
            client.close_reason = Some(CloseReason::Shutdown);

            let _ = client.tx_shutdown.send(true);
        }

        self.mesh.close_all(CloseReason::Shutdown);

        let grace = sleep(Duration::from_secs(self.config.general.shutdown_grace));
        tokio::pin!(grace);

        while !self.clients.is_empty() || self.mesh.link_count() > 0 {
            select! {
                _ = &mut grace => {
                    warn!(
                        "Shutdown grace expired (clients = {}) (links = {})",
                        self.clients.len(),
                        self.mesh.link_count()
                    );
                    break;
                }
                Some(message) = self.rx.recv() => match message {
                    Message::ClientClosed(addr, _) => {
                        self.clients.remove(&addr);
                    }
                    Message::PeerClosed(link_id, _) => {
                        self.mesh.remove_link(link_id);
                    }
                    _ => (),
                }
            }
        }

        info!("Shutdown complete");
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn join_host_port(args: &[&str]) -> Option<String> {
    match args {
        [host, port] => {
            port.parse::<u16>().ok()?;

            Some(format!("{}:{}", host, port))
        }
        _ => None,
    }
}

/// Pump one socket: decoded records go up to the event loop, queued lines
/// go out, and a shutdown flip drains what is left under the grace timer.
///
/// Generic over the stream so tests can run it on in-memory duplexes.
fn spawn_connection<S>(
    stream: S,
    max_line_length: usize,
    mut rx_lines: mpsc::UnboundedReceiver<Bytes>,
    mut rx_shutdown: watch::Receiver<bool>,
    drain_grace: Duration,
    tx: mpsc::UnboundedSender<Message>,
    key: ConnKey,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut frame = Framed::new(stream, LineCodec::new(max_line_length));

        let reason = loop {
            select! {
                _ = rx_shutdown.changed() => {
                    drain(&mut frame, &mut rx_lines, drain_grace).await;

                    break CloseReason::Shutdown;
                }
                Some(line) = rx_lines.recv() => {
                    if let Err(e) = frame.send(line).await {
                        debug!("Write failed: {}", e);

                        break CloseReason::Io;
                    }
                }
                record = frame.next() => match record {
                    Some(Ok(line)) => {
                        if tx.send(key.line_message(line)).is_err() {
                            break CloseReason::Shutdown;
                        }
                    }
                    Some(Err(PalaverError::Oversize(limit))) => {
                        warn!("Connection exceeded frame limit (bytes = {})", limit);

                        // Tell a human client why before hanging up.
                        if let ConnKey::Client(_) = key {
                            let notice =
                                format!("ERR oversize line exceeds {} bytes", limit);
                            let _ = frame.send(Bytes::from(notice.into_bytes())).await;
                        }

                        break CloseReason::Oversize;
                    }
                    Some(Err(_)) => break CloseReason::Io,
                    None => break CloseReason::Eof,
                }
            }
        };

        // Declare the disconnect; dropping the frame closes the socket.
        let _ = tx.send(key.closed_message(reason));
    });
}

/// Flush queued writes, bounded by the drain grace timer.
async fn drain<S>(
    frame: &mut Framed<S, LineCodec>,
    rx_lines: &mut mpsc::UnboundedReceiver<Bytes>,
    grace: Duration,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    rx_lines.close();

    let deadline = sleep(grace);
    tokio::pin!(deadline);

    loop {
        let line = select! {
            _ = &mut deadline => break,
            line = rx_lines.recv() => match line {
                Some(line) => line,
                None => break,
            }
        };

        select! {
            _ = &mut deadline => break,
            sent = frame.send(line) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}
