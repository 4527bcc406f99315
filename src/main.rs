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

#[macro_use]
extern crate log;

use std::env::var;
use std::process;

use clap::Parser;

use palaver::config::Config;
use palaver::protocol::ServerId;
use palaver::talker::Talker;

/// Launcher flags. Addresses and identity live here; tunables come from
/// the optional config file.
#[derive(Parser, Debug)]
#[command(
    name = "palaver",
    version,
    about = "Line-oriented talker server with a flooding peer mesh"
)]
struct Opts {
    /// Client listener address (host:port).
    #[arg(long)]
    listen: String,

    /// Peer listener address (host:port).
    #[arg(long)]
    peer_listen: Option<String>,

    /// Outbound peer to dial at startup; repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Fixed server id, 32 hex digits; random when omitted. Reusing an
    /// id across restarts invites stale-dedup trouble.
    #[arg(long)]
    id: Option<String>,

    /// Path to the TOML config file; PALAVER_CONFIG works too.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    process::exit(run(Opts::parse()).await);
}

async fn run(opts: Opts) -> i32 {
    let config_path = opts.config.clone().or_else(|| var("PALAVER_CONFIG").ok());

    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to load config: {}", e);
            return 1;
        }
    };

    let id = match opts.id.as_deref().map(|s| s.parse::<ServerId>()) {
        Some(Ok(id)) => Some(id),
        Some(Err(e)) => {
            error!("Unable to parse server id: {}", e);
            return 1;
        }
        None => None,
    };

    let mut talker = match Talker::new(opts.listen.as_str(), id, config).await {
        Ok(talker) => talker,
        Err(e) => {
            error!(
                "Unable to bind client listener (addr = {}): {}",
                opts.listen, e
            );
            return 2;
        }
    };

    if let Some(peer_listen) = &opts.peer_listen {
        if let Err(e) = talker.add_peer_listener(peer_listen).await {
            error!(
                "Unable to bind peer listener (addr = {}): {}",
                peer_listen, e
            );
            return 2;
        }
    }

    for peer in &opts.peers {
        talker.connect_peer(peer, None);
    }

    match talker.up().await {
        Ok(()) => 0,
        Err(e) => {
            error!("Fatal: {}", e);
            1
        }
    }
}
