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

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PalaverError {
    #[error("IO error {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record")]
    MalformedRecord,

    #[error("Line exceeds {0} bytes")]
    Oversize(usize),

    #[error("Invalid server id")]
    InvalidServerId,

    #[error("Config error {0}")]
    Config(#[from] toml::de::Error),
}

pub type PalaverResult<T> = std::result::Result<T, PalaverError>;

/// Why a connection was (or is being) closed.
///
/// Logged once when the connection is reaped. Faults stay confined to the
/// connection carrying them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Socket-level failure.
    Io,

    /// Orderly close from the remote side.
    Eof,

    /// Unparseable peer record.
    Malformed,

    /// HELLO version mismatch, self-connect, or record before HELLO.
    Protocol,

    /// HELLO did not complete in time.
    HandshakeTimeout,

    /// Framing limit exceeded.
    Oversize,

    /// A second link to an already-connected server lost the tie-break.
    DuplicatePeer,

    /// Operator-triggered close.
    Shutdown,

    /// Client asked to leave.
    Quit,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            CloseReason::Io => "IO",
            CloseReason::Eof => "EOF",
            CloseReason::Malformed => "MALFORMED",
            CloseReason::Protocol => "PROTOCOL",
            CloseReason::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            CloseReason::Oversize => "OVERSIZE",
            CloseReason::DuplicatePeer => "DUPLICATE_PEER",
            CloseReason::Shutdown => "SHUTDOWN",
            CloseReason::Quit => "QUIT",
        };

        write!(f, "{}", token)
    }
}
