//! A script used to start one passive peer, which serves the other members
//! of the group until the process is terminated.
//!
//! You can run this example as follows
//!     RUST_LOG=paxos_agreement=info cargo run --example start_peer -- <peer_index> Config
//! where <peer_index> is this peer's position in the membership table.

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate paxos_agreement;

use std::env;
use std::thread;
use std::time::Duration;

use paxos_agreement::configurations::get_config;
use paxos_agreement::paxos::Peer;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    info!("{:?}", args);

    match args.len() {
        3 => {
            let index = &args[1];
            let index: usize = match index.parse() {
                Ok(n) => n,
                Err(_) => {
                    eprintln!("Error: second argument not an usize");
                    return;
                }
            };

            let config_file_name = &args[2];
            let addresses = get_config(config_file_name);

            let _peer: Peer<String> = Peer::new(addresses, index);

            // The dispatch thread does all the work; this process only has
            // to stay alive.
            loop {
                thread::sleep(Duration::from_secs(1));
            }
        }
        _ => {
            panic!("Expected 2 arguments (excluding file name)");
        }
    }
}
