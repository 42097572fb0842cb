//! A module that contains functions required to read, parse and return the
//! peer membership table from the file `Config.toml` at the root of this
//! crate. Each peer is a `[peerN]` section with `host` and `port` entries;
//! the index N is the peer's identity everywhere else in the crate.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use config::{Config, File};

pub fn get_config(file_name: &str) -> Vec<SocketAddrV4> {
    let c = read_config(file_name);
    parse_config(&c)
}

fn read_config(file_name: &str) -> HashMap<String, HashMap<String, String>> {
    let mut c = Config::default();
    c.merge(File::with_name(file_name)).expect("Could not read the configuration file");
    c.try_into::<HashMap<String, HashMap<String, String>>>()
        .expect("Could not parse the configuration file")
}

fn parse_config(c: &HashMap<String, HashMap<String, String>>) -> Vec<SocketAddrV4> {
    let mut peers: Vec<(usize, SocketAddrV4)> = c
        .iter()
        .map(|(key, value)| {
            let index = key
                .trim_start_matches("peer")
                .parse()
                .expect("Peer sections must be named peer0, peer1, ...");
            let address = SocketAddrV4::new(
                Ipv4Addr::from_str(&value["host"]).expect("Could not parse the host"),
                value["port"].parse().expect("Could not parse the port"),
            );
            (index, address)
        })
        .collect();

    // The section order in the file is irrelevant; the index is the truth.
    peers.sort_by_key(|&(index, _)| index);
    peers.into_iter().map(|(_, address)| address).collect()
}
