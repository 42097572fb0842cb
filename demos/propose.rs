//! A script used to start one peer which proposes values: either the values
//! passed on the command line, or values read interactively from the
//! standard input.
//!
//! You can run this example as follows
//!     RUST_LOG=paxos_agreement=info cargo run --example propose -- <peer_index> Config
//! to type one proposal at a time, or
//!     RUST_LOG=paxos_agreement=info cargo run --example propose -- <peer_index> Config v1 v2 ...
//! to propose v1, v2, etc. at consecutive instances.

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate paxos_agreement;
#[macro_use]
extern crate text_io;

use std::env;
use std::io;
use std::io::prelude::*;
use std::thread;
use std::time::Duration;

use paxos_agreement::configurations::get_config;
use paxos_agreement::paxos::{Fate, Peer};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    info!("{:?}", args);

    match args.len() {
        len if len >= 3 => {
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

            let peer: Peer<String> = Peer::new(addresses, index);

            if len == 3 {
                loop {
                    print!("Enter the proposal: ");
                    io::stdout().flush().expect("Could not flush stdout");
                    let value: String = read!();
                    propose_next(&peer, value);
                }
            } else {
                for value in args.iter().skip(3) {
                    propose_next(&peer, value.clone());
                }
            }
        }
        _ => {
            panic!("Expected 2 arguments (excluding file name)");
        }
    }
}

// Proposes `value` at the next free instance and waits for the outcome. The
// decided value may differ from the proposed one when another peer got to
// the instance first.
fn propose_next(peer: &Peer<String>, value: String) {
    let seq = peer.max() + 1;
    peer.start(seq, value);

    loop {
        if let (Fate::Decided, Some(decided)) = peer.status(seq) {
            println!("seq {} -> {:?}", seq, decided);
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
}
