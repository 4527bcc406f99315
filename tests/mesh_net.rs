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

//! Multi-server scenarios over real sockets: speech relay, flood dedup,
//! handshake rejection, and topology movement, all observed through the
//! client protocol alone.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use palaver::config::Config;
use palaver::protocol::ServerId;
use palaver::talker::{ShutdownHandle, Talker};

struct Server {
    id: ServerId,
    client_addr: SocketAddr,
    peer_addr: SocketAddr,
    handle: ShutdownHandle,
}

fn test_config() -> Config {
    let mut config = Config::default();

    // Keep the handshake-timeout scenario fast.
    config.mesh.handshake_timeout = 1;

    config
}

async fn start_server() -> Server {
    let mut talker = Talker::new("127.0.0.1:0", None, test_config())
        .await
        .expect("bind client listener");

    let client_addr = talker.local_addr().unwrap();
    let peer_addr = talker
        .add_peer_listener("127.0.0.1:0")
        .await
        .expect("bind peer listener");
    let id = talker.server_id();
    let handle = talker.shutdown_handle();

    tokio::spawn(async move {
        let _ = talker.up().await;
    });

    Server {
        id,
        client_addr,
        peer_addr,
        handle,
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).await.expect("connect client");
        let (read, writer) = stream.into_split();

        Client {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    async fn recv(&mut self) -> String {
        let mut line = String::new();

        let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .expect("read failed");

        assert!(n > 0, "connection closed while expecting a line");

        line.trim_end_matches(|c| c == '\r' || c == '\n').to_string()
    }

    async fn expect(&mut self, want: &str) {
        assert_eq!(self.recv().await, want);
    }

    async fn assert_silent(&mut self, ms: u64) {
        let mut line = String::new();

        match timeout(Duration::from_millis(ms), self.reader.read_line(&mut line)).await {
            Err(_) => (),
            Ok(Ok(0)) => panic!("connection closed while expecting silence"),
            Ok(Ok(_)) => panic!("unexpected line: {:?}", line),
            Ok(Err(e)) => panic!("read failed: {}", e),
        }
    }

    /// Issue /peers and gather the PEER lines; the answer has no
    /// terminator, so the burst ends at a short silence.
    async fn peers(&mut self) -> Vec<String> {
        self.send("/peers").await;

        let mut peers = Vec::new();

        loop {
            let mut line = String::new();

            match timeout(Duration::from_millis(400), self.reader.read_line(&mut line)).await {
                Ok(Ok(n)) if n > 0 => {
                    peers.push(line.trim_end_matches(|c| c == '\r' || c == '\n').to_string())
                }
                _ => break,
            }
        }

        peers
    }

    async fn wait_for_peers(&mut self, want: usize) -> Vec<String> {
        for _ in 0..50 {
            let peers = self.peers().await;

            if peers.len() == want {
                return peers;
            }

            sleep(Duration::from_millis(100)).await;
        }

        panic!("peer count never reached {}", want);
    }
}

async fn named_client(addr: SocketAddr, name: &str) -> Client {
    let mut client = Client::connect(addr).await;

    client.send(&format!("/name {}", name)).await;
    client.expect(&format!("OK name {}", name)).await;

    client
}

async fn link(client: &mut Client, peer_addr: SocketAddr) {
    let target = format!("127.0.0.1:{}", peer_addr.port());

    client
        .send(&format!("/peer-connect 127.0.0.1 {}", peer_addr.port()))
        .await;
    client
        .expect(&format!("OK peer-connect dialing {}", target))
        .await;
}

#[tokio::test]
async fn two_node_speech_reaches_both_clients_exactly_once() {
    let a = start_server().await;
    let b = start_server().await;

    let mut alice = named_client(a.client_addr, "alice").await;
    let mut bob = named_client(b.client_addr, "bob").await;

    link(&mut alice, b.peer_addr).await;
    alice.wait_for_peers(1).await;

    alice.send("hello world").await;

    alice.expect("alice says: hello world").await;
    bob.expect("alice says: hello world").await;

    alice.assert_silent(500).await;
    bob.assert_silent(500).await;

    a.handle.stop();
    b.handle.stop();
}

#[tokio::test]
async fn triangle_delivers_exactly_once_despite_the_cycle() {
    let a = start_server().await;
    let b = start_server().await;
    let c = start_server().await;

    let mut alice = named_client(a.client_addr, "alice").await;
    let mut second = Client::connect(b.client_addr).await;
    let mut third = Client::connect(c.client_addr).await;

    // Full triangle: three links.
    link(&mut alice, b.peer_addr).await;
    link(&mut alice, c.peer_addr).await;

    let mut b_dialer = Client::connect(b.client_addr).await;
    link(&mut b_dialer, c.peer_addr).await;

    alice.wait_for_peers(2).await;
    b_dialer.wait_for_peers(2).await;

    alice.send("x").await;

    alice.expect("alice says: x").await;
    second.expect("alice says: x").await;
    third.expect("alice says: x").await;

    alice.assert_silent(500).await;
    second.assert_silent(500).await;
    third.assert_silent(500).await;

    a.handle.stop();
    b.handle.stop();
    c.handle.stop();
}

#[tokio::test]
async fn self_connect_is_refused() {
    let a = start_server().await;

    let mut client = Client::connect(a.client_addr).await;
    link(&mut client, a.peer_addr).await;

    // Give the handshake time to complete and fail.
    sleep(Duration::from_millis(700)).await;

    assert!(client.peers().await.is_empty());

    a.handle.stop();
}

#[tokio::test]
async fn line_topology_shows_direct_peers_and_contracts_on_severance() {
    let a = start_server().await;
    let b = start_server().await;
    let c = start_server().await;

    let mut on_a = Client::connect(a.client_addr).await;
    let mut on_b = Client::connect(b.client_addr).await;

    // Line: A - B - C.
    link(&mut on_a, b.peer_addr).await;
    link(&mut on_b, c.peer_addr).await;

    let peers_of_a = on_a.wait_for_peers(1).await;
    assert!(peers_of_a[0].starts_with("PEER "));
    assert!(peers_of_a[0].contains(&b.id.to_string()));

    let peers_of_b = on_b.wait_for_peers(2).await;
    assert!(peers_of_b.iter().any(|line| line.contains(&a.id.to_string())));
    assert!(peers_of_b.iter().any(|line| line.contains(&c.id.to_string())));

    // Sever B - C by stopping C outright.
    c.handle.stop();

    let peers_of_b = on_b.wait_for_peers(1).await;
    assert!(peers_of_b[0].contains(&a.id.to_string()));

    let peers_of_a = on_a.wait_for_peers(1).await;
    assert!(peers_of_a[0].contains(&b.id.to_string()));

    a.handle.stop();
    b.handle.stop();
}

#[tokio::test]
async fn duplicate_dial_leaves_exactly_one_link_up() {
    let a = start_server().await;
    let b = start_server().await;

    let mut on_b = Client::connect(b.client_addr).await;

    link(&mut on_b, a.peer_addr).await;
    let peers = on_b.wait_for_peers(1).await;
    assert!(peers[0].contains(&a.id.to_string()));

    // Dial the same server again: the newcomer must lose the tie-break.
    link(&mut on_b, a.peer_addr).await;

    // Still exactly one after everything settles, on both sides.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(on_b.peers().await.len(), 1);

    let mut on_a = Client::connect(a.client_addr).await;
    assert_eq!(on_a.wait_for_peers(1).await.len(), 1);

    a.handle.stop();
    b.handle.stop();
}

#[tokio::test]
async fn malformed_peer_record_kills_only_that_link() {
    let a = start_server().await;
    let b = start_server().await;

    let mut alice = named_client(a.client_addr, "alice").await;
    let mut bob = Client::connect(b.client_addr).await;

    link(&mut alice, b.peer_addr).await;
    alice.wait_for_peers(1).await;

    // A rogue peer completes the handshake, then spews garbage.
    let rogue = TcpStream::connect(a.peer_addr).await.unwrap();
    let (read, mut write) = rogue.into_split();
    let mut reader = BufReader::new(read);

    let mut hello = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut hello))
        .await
        .expect("timed out waiting for HELLO")
        .unwrap();
    assert!(hello.starts_with("HELLO "));

    write
        .write_all(format!("HELLO {} 1\r\n", "ab".repeat(16)).as_bytes())
        .await
        .unwrap();
    write.write_all(b"GARBAGE\r\n").await.unwrap();

    // The server closes the rogue link: reads drain to EOF.
    let eof = async {
        loop {
            let mut line = String::new();

            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
        }
    };
    timeout(Duration::from_secs(5), eof)
        .await
        .expect("rogue link was not closed");

    // The healthy link is unaffected.
    alice.send("still here").await;
    alice.expect("alice says: still here").await;
    bob.expect("alice says: still here").await;

    a.handle.stop();
    b.handle.stop();
}

#[tokio::test]
async fn silent_peer_is_dropped_at_the_handshake_deadline() {
    let a = start_server().await;

    let mute = TcpStream::connect(a.peer_addr).await.unwrap();
    let (read, _write) = mute.into_split();
    let mut reader = BufReader::new(read);

    // Their HELLO arrives; we never answer.
    let mut hello = String::new();
    reader.read_line(&mut hello).await.unwrap();
    assert!(hello.starts_with("HELLO "));

    let eof = async {
        loop {
            let mut line = String::new();

            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
        }
    };
    timeout(Duration::from_secs(5), eof)
        .await
        .expect("handshake deadline never fired");

    a.handle.stop();
}
