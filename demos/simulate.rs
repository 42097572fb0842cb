//! An example which simulates a whole peer group locally (on one machine).
//!
//! Run this example as follows
//!     RUST_LOG=paxos_agreement=info cargo run --example simulate

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate paxos_agreement;

use std::thread;
use std::time::Duration;

use paxos_agreement::configurations::get_config;
use paxos_agreement::paxos::{Fate, Peer};

fn main() {
    env_logger::init();

    let addresses = get_config("Config");
    info!("Configurations = {:?}\n", addresses);

    let peers: Vec<Peer<String>> = (0..addresses.len())
        .map(|index| Peer::new(addresses.clone(), index))
        .collect();

    // Peers take turns proposing; the group ends up with one agreed value
    // per instance regardless of who proposed it.
    let instances = 5;
    for seq in 0..instances {
        let proposer = (seq as usize) % peers.len();
        peers[proposer].start(seq, format!("value {} from peer {}", seq, proposer));
    }

    for seq in 0..instances {
        let value = wait_decided(&peers, seq);
        println!("seq {} -> {:?}", seq, value);
    }

    for peer in &peers {
        peer.kill();
    }
}

// Polls until every peer reports a decision for seq.
fn wait_decided(peers: &[Peer<String>], seq: i64) -> String {
    loop {
        let mut decided = 0;
        let mut value = None;

        for peer in peers {
            if let (Fate::Decided, Some(v)) = peer.status(seq) {
                decided += 1;
                value = Some(v);
            }
        }

        if decided == peers.len() {
            return value.expect("A decided instance always carries a value");
        }

        thread::sleep(Duration::from_millis(20));
    }
}
