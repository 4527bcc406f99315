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

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, digit1};
use nom::combinator::{all_consuming, map, map_res};
use nom::multi::many0;
use nom::sequence::{preceded, separated_pair, tuple};
use nom::IResult;

use crate::error::{PalaverError, PalaverResult};

pub const PROTOCOL_VERSION: u8 = 1;

/// Chat utterance; payload is the raw utterance bytes, speaker rides in
/// the `from` attribute.
pub const TYPE_SPEECH: &str = "SPEECH";

/// Presence assertion sent on a link once it is up. Carried with ttl=0 so
/// it is never forwarded past the direct neighbour.
pub const TYPE_I_AM: &str = "I-AM";

/// Replicated direct-peer listing, versioned per origin.
pub const TYPE_PEER_SET: &str = "PEER-SET";

/// Stable identity of a server instance, unique across the mesh.
///
/// 128 random bits chosen at startup (or pinned with `--id`), rendered as
/// 32 hex digits on the wire. Ordered by raw bytes for deterministic
/// tie-breaks only.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId([u8; 16]);

impl ServerId {
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// First four hex digits, for log lines and default client names.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..2])
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({})", hex::encode(self.0))
    }
}

impl FromStr for ServerId {
    type Err = PalaverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| PalaverError::InvalidServerId)?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| PalaverError::InvalidServerId)?;

        Ok(Self(bytes))
    }
}

/// Unique identity of a datagram: assigned exactly once at the origin and
/// never rewritten on forwarding. Two datagrams are the same iff their
/// message ids are equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MessageId {
    pub origin: ServerId,
    pub counter: u64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.counter)
    }
}

/// Connection-setup record, first line in both directions on a peer link.
#[derive(Debug, Clone, PartialEq)]
pub struct Hello {
    pub server_id: ServerId,

    /// Not validated at parse time; an incompatible version closes the
    /// link with PROTOCOL rather than MALFORMED.
    pub protocol_version: u8,
}

impl Hello {
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(format!("HELLO {} {}", self.server_id, self.protocol_version).into_bytes())
    }
}

/// A mesh datagram.
///
/// Wire form is one CRLF-terminated line,
/// `MSG <origin> <counter> <TYPE> [key=value ...] <payload>`, with the
/// payload as unpadded base64 (`-` when empty) and attributes in any
/// order. Text keeps packet captures and replay by hand cheap; mesh links
/// carry low volume.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshDatagram {
    pub id: MessageId,

    /// Uppercase tag from an open set; observers key on it.
    pub dtype: String,

    /// Hop budget. Absent means unlimited; zero on arrival means deliver
    /// locally but do not forward.
    pub ttl: Option<u64>,

    /// Addressed server. Forwarding ignores it; recipient-filtered
    /// observers on other servers skip the datagram.
    pub recipient: Option<ServerId>,

    /// Correlation handle reserved for scatter-gather layers; carried but
    /// unused here.
    pub reply_to: Option<MessageId>,

    /// Display name of the speaking client, SPEECH only.
    pub speaker: Option<String>,

    pub payload: Vec<u8>,
}

impl MeshDatagram {
    pub fn to_bytes(&self) -> Bytes {
        let mut line = format!("MSG {} {} {}", self.id.origin, self.id.counter, self.dtype);

        if let Some(ttl) = self.ttl {
            line.push_str(&format!(" ttl={}", ttl));
        }

        if let Some(recipient) = &self.recipient {
            line.push_str(&format!(" to={}", recipient));
        }

        if let Some(reply_to) = &self.reply_to {
            line.push_str(&format!(" re={}", reply_to));
        }

        if let Some(speaker) = &self.speaker {
            line.push_str(&format!(" from={}", speaker));
        }

        if self.payload.is_empty() {
            line.push_str(" -");
        } else {
            line.push(' ');
            line.push_str(&base64::encode_config(&self.payload, base64::STANDARD_NO_PAD));
        }

        Bytes::from(line.into_bytes())
    }
}

/// Any record a peer may legally send.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerRecord {
    Hello(Hello),
    Datagram(MeshDatagram),
}

impl PeerRecord {
    /// Parse one framed record. Anything unparseable is MALFORMED and
    /// costs the sender its link.
    pub fn parse(line: &[u8]) -> PalaverResult<PeerRecord> {
        let line = std::str::from_utf8(line).map_err(|_| PalaverError::MalformedRecord)?;

        match all_consuming(alt((hello, datagram)))(line) {
            Ok((_, record)) => Ok(record),
            Err(_) => Err(PalaverError::MalformedRecord),
        }
    }
}

/// PEER-SET payload body: `<version> <peer> <peer> ...` in ASCII, for the
/// same reason the outer wire format is text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSet {
    pub version: u64,
    pub peers: BTreeSet<ServerId>,
}

impl PeerSet {
    pub fn to_payload(&self) -> Vec<u8> {
        let mut body = self.version.to_string();

        for peer in &self.peers {
            body.push(' ');
            body.push_str(&peer.to_string());
        }

        body.into_bytes()
    }

    pub fn parse(payload: &[u8]) -> PalaverResult<PeerSet> {
        let text = std::str::from_utf8(payload).map_err(|_| PalaverError::MalformedRecord)?;
        let mut fields = text.split_whitespace();

        let version = fields
            .next()
            .ok_or(PalaverError::MalformedRecord)?
            .parse()
            .map_err(|_| PalaverError::MalformedRecord)?;

        let mut peers = BTreeSet::new();

        for field in fields {
            peers.insert(field.parse()?);
        }

        Ok(PeerSet { version, peers })
    }
}

fn hex_id(input: &str) -> IResult<&str, ServerId> {
    map_res(
        take_while1(|c: char| c.is_ascii_hexdigit()),
        |s: &str| s.parse::<ServerId>(),
    )(input)
}

fn decimal(input: &str) -> IResult<&str, u64> {
    map_res(digit1, |s: &str| s.parse::<u64>())(input)
}

fn dtype_token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '-')(
        input,
    )
}

fn attr(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        take_while1(|c: char| c.is_ascii_lowercase()),
        char('='),
        take_while1(|c: char| c != ' '),
    )(input)
}

fn payload_token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c != ' ')(input)
}

fn hello(input: &str) -> IResult<&str, PeerRecord> {
    map(
        tuple((
            preceded(tag("HELLO "), hex_id),
            preceded(char(' '), map_res(digit1, |s: &str| s.parse::<u8>())),
        )),
        |(server_id, protocol_version)| {
            PeerRecord::Hello(Hello {
                server_id,
                protocol_version,
            })
        },
    )(input)
}

fn datagram(input: &str) -> IResult<&str, PeerRecord> {
    map_res(
        tuple((
            preceded(tag("MSG "), hex_id),
            preceded(char(' '), decimal),
            preceded(char(' '), dtype_token),
            many0(preceded(char(' '), attr)),
            preceded(char(' '), payload_token),
        )),
        |(origin, counter, dtype, attrs, payload)| {
            build_datagram(origin, counter, dtype, attrs, payload).map(PeerRecord::Datagram)
        },
    )(input)
}

fn build_datagram(
    origin: ServerId,
    counter: u64,
    dtype: &str,
    attrs: Vec<(&str, &str)>,
    payload: &str,
) -> Result<MeshDatagram, PalaverError> {
    let mut datagram = MeshDatagram {
        id: MessageId { origin, counter },
        dtype: dtype.to_string(),
        ttl: None,
        recipient: None,
        reply_to: None,
        speaker: None,
        payload: decode_payload(payload)?,
    };

    for (key, value) in attrs {
        match key {
            "ttl" => {
                datagram.ttl = Some(value.parse().map_err(|_| PalaverError::MalformedRecord)?)
            }
            "to" => datagram.recipient = Some(value.parse()?),
            "re" => datagram.reply_to = Some(parse_message_id(value)?),
            "from" => datagram.speaker = Some(value.to_string()),
            // The attribute set is open; unknown keys pass through.
            _ => (),
        }
    }

    Ok(datagram)
}

fn decode_payload(token: &str) -> Result<Vec<u8>, PalaverError> {
    if token == "-" {
        return Ok(Vec::new());
    }

    base64::decode_config(token, base64::STANDARD_NO_PAD).map_err(|_| PalaverError::MalformedRecord)
}

fn parse_message_id(value: &str) -> Result<MessageId, PalaverError> {
    let (origin, counter) = value.split_once(':').ok_or(PalaverError::MalformedRecord)?;

    Ok(MessageId {
        origin: origin.parse()?,
        counter: counter.parse().map_err(|_| PalaverError::MalformedRecord)?,
    })
}

#[cfg(test)]
mod tests {
    #[allow(unused_imports)]
    use super::*;

    const ALPHA: &str = "000102030405060708090a0b0c0d0e0f";
    const BRAVO: &str = "f0e0d0c0b0a090807060504030201000";

    fn alpha() -> ServerId {
        ALPHA.parse().unwrap()
    }

    #[test]
    fn parse_valid_hello() {
        let record = PeerRecord::parse(format!("HELLO {} 1", ALPHA).as_bytes()).unwrap();

        assert_eq!(
            record,
            PeerRecord::Hello(Hello {
                server_id: alpha(),
                protocol_version: 1,
            })
        );
    }

    #[test]
    fn hello_version_is_not_checked_at_parse_time() {
        let record = PeerRecord::parse(format!("HELLO {} 9", ALPHA).as_bytes()).unwrap();

        match record {
            PeerRecord::Hello(hello) => assert_eq!(hello.protocol_version, 9),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn parse_bare_datagram() {
        let record = PeerRecord::parse(format!("MSG {} 7 SPEECH aGk", ALPHA).as_bytes()).unwrap();

        match record {
            PeerRecord::Datagram(datagram) => {
                assert_eq!(datagram.id.origin, alpha());
                assert_eq!(datagram.id.counter, 7);
                assert_eq!(datagram.dtype, "SPEECH");
                assert_eq!(datagram.ttl, None);
                assert_eq!(datagram.payload, b"hi");
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn empty_payload_is_a_dash() {
        let datagram = MeshDatagram {
            id: MessageId {
                origin: alpha(),
                counter: 1,
            },
            dtype: "I-AM".to_string(),
            ttl: Some(0),
            recipient: None,
            reply_to: None,
            speaker: None,
            payload: Vec::new(),
        };

        let line = datagram.to_bytes();

        assert_eq!(&line[..], format!("MSG {} 1 I-AM ttl=0 -", ALPHA).as_bytes());
        assert_eq!(PeerRecord::parse(&line).unwrap(), PeerRecord::Datagram(datagram));
    }

    #[test]
    fn round_trip_with_every_attribute() {
        let datagram = MeshDatagram {
            id: MessageId {
                origin: alpha(),
                counter: 42,
            },
            dtype: "SPEECH".to_string(),
            ttl: Some(5),
            recipient: Some(BRAVO.parse().unwrap()),
            reply_to: Some(MessageId {
                origin: BRAVO.parse().unwrap(),
                counter: 9,
            }),
            speaker: Some("alice".to_string()),
            payload: b"hello world".to_vec(),
        };

        let line = datagram.to_bytes();

        assert_eq!(PeerRecord::parse(&line).unwrap(), PeerRecord::Datagram(datagram));
    }

    #[test]
    fn attribute_order_is_free() {
        let one =
            PeerRecord::parse(format!("MSG {} 3 SPEECH ttl=2 from=bob eA", ALPHA).as_bytes())
                .unwrap();
        let two =
            PeerRecord::parse(format!("MSG {} 3 SPEECH from=bob ttl=2 eA", ALPHA).as_bytes())
                .unwrap();

        assert_eq!(one, two);
    }

    #[test]
    fn unknown_attributes_are_ignored() {
        let record =
            PeerRecord::parse(format!("MSG {} 3 SPEECH hops=9 eA", ALPHA).as_bytes()).unwrap();

        match record {
            PeerRecord::Datagram(datagram) => assert_eq!(datagram.payload, b"x"),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(PeerRecord::parse(b"GARBAGE").is_err());
        assert!(PeerRecord::parse(b"").is_err());
        assert!(PeerRecord::parse(b"MSG").is_err());
        assert!(PeerRecord::parse(format!("MSG {} x SPEECH eA", ALPHA).as_bytes()).is_err());
        assert!(PeerRecord::parse(format!("MSG {} 3 speech eA", ALPHA).as_bytes()).is_err());
        assert!(PeerRecord::parse(format!("MSG {} 3 SPEECH", ALPHA).as_bytes()).is_err());
        assert!(PeerRecord::parse(format!("MSG {} 3 SPEECH eA extra junk", ALPHA).as_bytes()).is_err());
        assert!(PeerRecord::parse(format!("MSG {} 3 SPEECH ttl=abc eA", ALPHA).as_bytes()).is_err());
        assert!(PeerRecord::parse(b"HELLO nothex 1").is_err());
        assert!(PeerRecord::parse(format!("HELLO {}", ALPHA).as_bytes()).is_err());
    }

    #[test]
    fn rejects_invalid_payload_base64() {
        assert!(PeerRecord::parse(format!("MSG {} 3 SPEECH !!!", ALPHA).as_bytes()).is_err());
    }

    #[test]
    fn server_id_ordering_follows_bytes() {
        let low: ServerId = ALPHA.parse().unwrap();
        let high: ServerId = BRAVO.parse().unwrap();

        assert!(low < high);
    }

    #[test]
    fn server_id_rejects_bad_hex() {
        assert!("zz".parse::<ServerId>().is_err());
        assert!("0011".parse::<ServerId>().is_err());
    }

    #[test]
    fn peer_set_round_trip() {
        let set = PeerSet {
            version: 12,
            peers: vec![alpha(), BRAVO.parse().unwrap()].into_iter().collect(),
        };

        assert_eq!(PeerSet::parse(&set.to_payload()).unwrap(), set);
    }

    #[test]
    fn peer_set_with_no_peers() {
        let set = PeerSet {
            version: 3,
            peers: BTreeSet::new(),
        };

        assert_eq!(&set.to_payload()[..], b"3");
        assert_eq!(PeerSet::parse(b"3").unwrap(), set);
    }

    #[test]
    fn peer_set_rejects_garbage() {
        assert!(PeerSet::parse(b"").is_err());
        assert!(PeerSet::parse(b"notanumber").is_err());
        assert!(PeerSet::parse(b"3 nothex").is_err());
    }
}
