// Palaver - Line-oriented talker server over CRLF text with a flooding peer mesh
// Copyright (C) 2026  mossfet

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use serde::Deserialize;

use crate::error::PalaverResult;

/// Tunables, loadable from an optional TOML file.
///
/// Every field is defaulted, so a missing file or an empty one is a valid
/// configuration. Listener addresses and the server identity come from the
/// command line, not from here.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default, rename(deserialize = "General"))]
    pub general: General,

    #[serde(default, rename(deserialize = "Mesh"))]
    pub mesh: Mesh,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct General {
    /// Maximum accepted line length in bytes, clients and peers alike.
    /// A connection breaching it is closed with OVERSIZE.
    pub max_line_length: usize,

    /// Seconds a closing connection may spend draining queued writes.
    pub drain_grace: u64,

    /// Seconds the server waits for connections to wind down on shutdown.
    pub shutdown_grace: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Mesh {
    /// Capacity of the duplicate-suppression cache, in message ids.
    ///
    /// Size this above the in-flight burst size times the graph diameter;
    /// an evicted id can be re-processed if a forwarding loop outlives it.
    pub seen_capacity: usize,

    /// Seconds between periodic PEER-SET refresh broadcasts.
    pub refresh_interval: u64,

    /// Seconds a route table entry survives without a refresh.
    ///
    /// Also the horizon for forgetting servers that went unreachable.
    pub route_ttl: u64,

    /// Seconds a peer link may spend in the HELLO handshake.
    pub handshake_timeout: u64,
}

impl Default for General {
    fn default() -> Self {
        Self {
            max_line_length: 64 * 1024,
            drain_grace: 2,
            shutdown_grace: 5,
        }
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self {
            seen_capacity: 10_000,
            refresh_interval: 30,
            route_ttl: 300,
            handshake_timeout: 5,
        }
    }
}

impl Config {
    /// Load from a TOML file, or fall back to the defaults when no path
    /// was given.
    pub fn load(path: Option<&str>) -> PalaverResult<Config> {
        match path {
            Some(path) => Ok(toml::from_slice(&std::fs::read(path)?)?),
            None => Ok(Config::default()),
        }
    }
}
