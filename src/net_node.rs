//! A module which contains the definition of a struct which can be used to
//! exchange request/response datagrams with other peers over UDP.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use bincode::{deserialize, serialize};
use log::Level;
use net2::UdpBuilder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::message::{Reply, Request, Response, Rpc};

/// A call whose reply has not arrived after this long counts as unreachable.
pub const CALL_TIMEOUT: Duration = Duration::from_millis(300);

// How long the dispatch loop blocks in recv before rechecking the kill flag.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

// Large enough for any encoded request or response datagram.
const BUFFER_SIZE: usize = 65_536;

/// One peer's endpoint: receives requests on the peer's own address and
/// sends each reply back to the source of the request datagram.
pub struct NetNode<T> {
    socket: UdpSocket,

    // Dummy data tied to the type of the values carried in the messages.
    value: PhantomData<T>,
}

impl<T> NetNode<T>
where
    T: Serialize + DeserializeOwned + Clone + Debug,
{
    /// Binds the peer's socket. A peer without its endpoint is useless, so a
    /// failure to bind aborts construction.
    pub fn bind(address: &SocketAddrV4) -> Self {
        let socket = UdpBuilder::new_v4()
            .expect("Could not construct UdpBuilder")
            // Lets a peer rebind an address that a recently killed peer held
            // without waiting out the kernel's lingering socket state.
            .reuse_address(true)
            .expect("Could not reuse address")
            .bind(address)
            .expect("Could not bind to address");

        socket
            .set_read_timeout(Some(POLL_TIMEOUT))
            .expect("Could not set the read timeout");

        NetNode { socket, value: PhantomData }
    }

    /// Waits for the next request datagram. Returns `None` on timeout or on
    /// a datagram that does not decode; the dispatch loop treats both as
    /// "nothing to serve" and rechecks the kill flag.
    pub fn recv_request(&self) -> Option<(Uuid, Rpc<T>, SocketAddr)> {
        let mut data_received = vec![0; BUFFER_SIZE];

        let (number_of_bytes, source) = match self.socket.recv_from(&mut data_received) {
            Ok(received) => received,
            Err(_) => return None,
        };

        match deserialize::<Request<T>>(&data_received[..number_of_bytes]) {
            Ok(request) => Some((request.id, request.rpc, source)),
            Err(e) => {
                warn!("Dropping an undecodable datagram from {:?}: {:?}.", source, e);
                None
            }
        }
    }

    /// Sends the reply for the request `id` back to `destination`, the
    /// source address of the request datagram.
    pub fn reply(&self, id: Uuid, reply: Reply<T>, destination: &SocketAddr) {
        let encoded: Vec<u8> =
            serialize(&Response { id, reply }).expect("Could not serialize the response");

        // A vanished caller is its own problem: it will time out and count
        // this vote as not received.
        if self.socket.send_to(&encoded[..], destination).is_err() {
            if log_enabled!(Level::Debug) {
                debug!("Could not send a reply to {:?}.", destination);
            }
        }
    }

    /// One remote procedure call: sends `rpc` to `destination` and waits for
    /// the matching response. `None` means the peer was unreachable within
    /// `CALL_TIMEOUT`, which the protocol treats as a vote not received.
    ///
    /// Every call runs on a fresh ephemeral socket, so responses to earlier,
    /// abandoned calls can never be mistaken for the one awaited here; the
    /// request id filters out any stray that still finds its way in.
    pub fn call(destination: &SocketAddrV4, rpc: Rpc<T>) -> Option<Reply<T>> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;

        let id = Uuid::new_v4();
        let encoded: Vec<u8> =
            serialize(&Request { id, rpc }).expect("Could not serialize the request");
        socket.send_to(&encoded[..], destination).ok()?;

        let deadline = Instant::now() + CALL_TIMEOUT;
        let mut data_received = vec![0; BUFFER_SIZE];

        loop {
            // The read timeout shrinks to whatever is left of the call
            // window, so duplicates and strays cannot stretch the wait past
            // the deadline.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::new(0, 0) {
                return None;
            }
            socket.set_read_timeout(Some(remaining)).ok()?;

            let number_of_bytes = match socket.recv_from(&mut data_received) {
                Ok((number_of_bytes, _source)) => number_of_bytes,
                Err(_) => return None, // timed out
            };

            if let Ok(response) = deserialize::<Response<T>>(&data_received[..number_of_bytes]) {
                if response.id == id {
                    return Some(response.reply);
                }
            }
            // A duplicate or a stray; keep waiting for our response.
        }
    }
}
