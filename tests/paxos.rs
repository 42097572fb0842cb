//! Whole-group tests: several peers on loopback ports, talking through the
//! real transport. Every test uses its own port range, and the socket-heavy
//! ones run serialised.

extern crate env_logger;
extern crate paxos_agreement;
extern crate serial_test;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread;
use std::time::Duration;

use serial_test::serial;

use paxos_agreement::paxos::{Fate, Peer};

fn addresses(count: usize, base_port: u16) -> Vec<SocketAddrV4> {
    (0..count)
        .map(|index| SocketAddrV4::new(Ipv4Addr::LOCALHOST, base_port + index as u16))
        .collect()
}

fn group(count: usize, base_port: u16) -> Vec<Peer<String>> {
    let addresses = addresses(count, base_port);
    (0..count).map(|index| Peer::new(addresses.clone(), index)).collect()
}

// How many peers have decided seq, also checking the agreement invariant:
// no two peers may have decided differently.
fn decided_count(peers: &[Peer<String>], seq: i64) -> (usize, Option<String>) {
    let mut count = 0;
    let mut decided: Option<String> = None;

    for peer in peers {
        if let (Fate::Decided, Some(value)) = peer.status(seq) {
            if let Some(previous) = &decided {
                assert_eq!(
                    previous, &value,
                    "two peers decided differently for seq {}",
                    seq
                );
            }
            decided = Some(value);
            count += 1;
        }
    }

    (count, decided)
}

// Polls with growing pauses until `want` peers have decided seq; panics if
// the group never gets there.
fn wait_decided(peers: &[Peer<String>], seq: i64, want: usize) -> String {
    let mut pause = Duration::from_millis(10);

    for _ in 0..30 {
        let (count, value) = decided_count(peers, seq);
        if count >= want {
            return value.unwrap();
        }

        thread::sleep(pause);
        if pause < Duration::from_secs(1) {
            pause *= 2;
        }
    }

    panic!("seq {} was not decided by {} peers in time", seq, want);
}

fn shutdown(peers: &[Peer<String>]) {
    for peer in peers {
        peer.kill();
    }
    // Give the dispatch threads a poll cycle to notice and free the ports.
    thread::sleep(Duration::from_millis(200));
}

#[test]
#[serial]
fn single_proposer_reaches_everyone() {
    let _ = env_logger::try_init();
    let peers = group(3, 22010);

    peers[0].start(0, "x".to_string());

    assert_eq!(wait_decided(&peers, 0, peers.len()), "x");
    for peer in &peers {
        assert_eq!(peer.max(), 0);
    }

    shutdown(&peers);
}

#[test]
#[serial]
fn instances_agree_independently() {
    let _ = env_logger::try_init();
    let peers = group(3, 22020);

    // Out-of-order proposals at scattered seqs, from different peers.
    peers[0].start(7, "seven".to_string());
    peers[1].start(3, "three".to_string());
    peers[2].start(5, "five".to_string());

    assert_eq!(wait_decided(&peers, 3, peers.len()), "three");
    assert_eq!(wait_decided(&peers, 5, peers.len()), "five");
    assert_eq!(wait_decided(&peers, 7, peers.len()), "seven");

    for peer in &peers {
        assert_eq!(peer.max(), 7);
        assert_eq!(peer.status(4).0, Fate::Pending);
    }

    shutdown(&peers);
}

#[test]
#[serial]
fn concurrent_proposers_converge() {
    let _ = env_logger::try_init();
    let peers = group(5, 22030);

    peers[0].start(0, "a".to_string());
    peers[1].start(0, "b".to_string());
    peers[2].start(0, "c".to_string());

    let value = wait_decided(&peers, 0, peers.len());
    assert!(
        value == "a" || value == "b" || value == "c",
        "the decided value {:?} was never proposed",
        value
    );

    shutdown(&peers);
}

#[test]
#[serial]
fn laggards_catch_up_through_a_later_proposer() {
    let _ = env_logger::try_init();
    let all = addresses(5, 22040);

    // Only a bare majority is up when the value gets decided.
    let mut peers: Vec<Peer<String>> =
        (0..3).map(|index| Peer::new(all.clone(), index)).collect();

    peers[0].start(5, "v".to_string());
    wait_decided(&peers, 5, 3);

    // The two laggards join. They learn nothing on their own: recovery
    // relies on some proposer running the instance again.
    for index in 3..5 {
        peers.push(Peer::new(all.clone(), index));
    }
    peers[1].start(5, "w".to_string());

    assert_eq!(wait_decided(&peers, 5, 5), "v");

    shutdown(&peers);
}

#[test]
#[serial]
fn watermarks_forget_old_instances() {
    let _ = env_logger::try_init();
    let peers = group(3, 22050);

    for seq in 0..=9 {
        let proposer = (seq % 3) as usize;
        peers[proposer].start(seq, format!("v{}", seq));
        wait_decided(&peers, seq, peers.len());
    }

    for peer in &peers {
        peer.done(5);
    }

    // Watermarks only travel on Decide messages, so one more decided round
    // per peer spreads everyone's watermark to everyone else.
    for (index, peer) in peers.iter().enumerate() {
        let seq = 10 + index as i64;
        peer.start(seq, format!("v{}", seq));
        wait_decided(&peers, seq, peers.len());
    }

    for peer in &peers {
        assert_eq!(peer.min(), 6);
        assert_eq!(peer.status(3).0, Fate::Forgotten);

        let (fate, value) = peer.status(7);
        assert_eq!(fate, Fate::Decided);
        assert_eq!(value, Some("v7".to_string()));
    }

    shutdown(&peers);
}

#[test]
#[serial]
fn a_silent_peer_pins_the_watermark() {
    let _ = env_logger::try_init();
    let peers = group(3, 22060);

    for seq in 0..3 {
        peers[0].start(seq, format!("v{}", seq));
        wait_decided(&peers, seq, peers.len());
    }

    // Peers 0 and 1 race far ahead; peer 2 never calls done.
    peers[0].done(100);
    peers[1].done(100);

    for (index, peer) in peers.iter().enumerate().take(2) {
        let seq = 3 + index as i64;
        peer.start(seq, format!("v{}", seq));
        wait_decided(&peers, seq, peers.len());
    }

    for peer in &peers {
        assert_eq!(peer.min(), 0);
    }

    // Nothing was forgotten: the slowest peer still owns every decision.
    for seq in 0..3 {
        let (count, _) = decided_count(&peers, seq);
        assert_eq!(count, peers.len());
    }

    shutdown(&peers);
}

#[test]
#[serial]
fn unreliable_delivery_still_converges() {
    let _ = env_logger::try_init();
    let peers = group(3, 22070);

    for peer in &peers {
        peer.set_unreliable(true);
    }

    // Every peer proposes at every instance. A peer whose Decide message
    // got dropped then still converges, because its own proposer re-runs
    // the instance and adopts the already-chosen value.
    let instances = 20;
    for seq in 0..instances {
        for (index, peer) in peers.iter().enumerate() {
            peer.start(seq, format!("v{} from {}", seq, index));
        }
    }

    for seq in 0..instances {
        wait_decided(&peers, seq, peers.len());
    }

    for peer in &peers {
        peer.set_unreliable(false);
    }

    shutdown(&peers);
}
