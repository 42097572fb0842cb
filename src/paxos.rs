//! The module that contains the peer of the agreement protocol: the acceptor
//! handlers, the proposer driver, the forget watermarks and the query
//! surface. It also contains the main logic of the algorithm.
//!
//! A group of peers agrees on a sequence of values, one per instance, where
//! an instance is identified by a non-negative sequence number and instances
//! are independent of each other. Any peer may propose at any instance;
//! a majority of acceptors decides. Nothing is persisted: a killed peer is
//! gone, it does not recover.

use std::cmp;
use std::collections::HashMap;
use std::fmt::Debug;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::Level;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::message::{
    AcceptArgs, AcceptReply, DecideArgs, PrepareArgs, PrepareReply, ProposalNumber, Reply, Rpc,
    Vote,
};
use crate::net_node::NetNode;

/// What a peer currently knows about one instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fate {
    /// Agreement was reached and this peer knows the chosen value.
    Decided,

    /// No decision has been observed here yet.
    Pending,

    /// The instance fell below the forget threshold; its state is gone.
    Forgotten,
}

// The fraction of requests and replies an unreliable peer drops.
const DROP_RATE: f64 = 0.1;

/// The acceptor and learner state of a single instance.
struct Instance<T> {
    // The highest number this peer has promised by answering a Prepare.
    promised: Option<ProposalNumber>,

    // The number of the highest proposal this peer has accepted, and the
    // value that came with it. Never exceeds `promised`.
    accepted_number: Option<ProposalNumber>,

    accepted_value: Option<T>,

    // Set once a decision for this instance has been seen or driven here.
    decided: bool,
}

// Implemented by hand so that T itself does not need to be Default.
impl<T> Default for Instance<T> {
    fn default() -> Self {
        Instance {
            promised: None,
            accepted_number: None,
            accepted_value: None,
            decided: false,
        }
    }
}

// Everything guarded by the one peer mutex.
struct Shared<T> {
    // The live instances by sequence number. Instances below the forget
    // threshold are swept out by `min`.
    instances: HashMap<i64, Instance<T>>,

    // The highest sequence number each peer has declared safe to forget,
    // -1 until that peer says otherwise. The local slot moves on `done`;
    // the other slots move when those peers' Decide messages arrive.
    dones: Vec<i64>,
}

struct Inner<T> {
    me: usize,

    peers: Vec<SocketAddrV4>,

    majority: usize,

    node: NetNode<T>,

    shared: Mutex<Shared<T>>,

    // The clock component of the last proposal number handed out, kept so
    // that successive numbers strictly increase even within one clock tick.
    last_clock: Mutex<u64>,

    dead: AtomicBool,

    unreliable: AtomicBool,
}

/// One member of a fixed peer group. The peer embeds the proposer, acceptor
/// and learner role for every instance; the application proposes with
/// `start`, observes outcomes with `status` and releases old instances with
/// `done`.
///
/// A `Peer` is a cheap handle: clones share the same underlying state, and
/// the internal dispatch and proposer threads hold clones of their own.
pub struct Peer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Peer<T> {
    fn clone(&self) -> Self {
        Peer { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Peer<T>
where
    T: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static,
{
    /// Creates a peer with the fixed membership `peers` and its own position
    /// `me` in it, binds the endpoint at `peers[me]` and starts serving.
    pub fn new(peers: Vec<SocketAddrV4>, me: usize) -> Self {
        let node = NetNode::bind(&peers[me]);
        let majority = peers.len() / 2 + 1;
        let dones = vec![-1; peers.len()];

        let peer = Peer {
            inner: Arc::new(Inner {
                me,
                peers,
                majority,
                node,
                shared: Mutex::new(Shared { instances: HashMap::new(), dones }),
                last_clock: Mutex::new(0),
                dead: AtomicBool::new(false),
                unreliable: AtomicBool::new(false),
            }),
        };

        let server = peer.clone();
        thread::spawn(move || server.dispatch_loop());

        peer
    }

    /// Asks the group to agree on `value` for the instance `seq`. Returns at
    /// once; the proposer runs detached and the outcome is observed through
    /// `status`. Proposing below the forget threshold is silently ignored.
    pub fn start(&self, seq: i64, value: T) {
        if seq < self.min() {
            return;
        }

        if log_enabled!(Level::Info) {
            info!("[{}] I will propose {:?} for seq {}.", self.inner.me, value, seq);
        }

        let proposer = self.clone();
        thread::spawn(move || proposer.propose(seq, value));
    }

    /// What this peer knows about `seq`, without any network traffic.
    /// Instances below the forget threshold report `Forgotten`; computing
    /// the threshold sweeps forgettable instances as a side effect.
    pub fn status(&self, seq: i64) -> (Fate, Option<T>) {
        if seq < self.min() {
            return (Fate::Forgotten, None);
        }

        let shared = self.inner.shared.lock().unwrap();
        match shared.instances.get(&seq) {
            Some(instance) if instance.decided => {
                (Fate::Decided, instance.accepted_value.clone())
            }
            _ => (Fate::Pending, None),
        }
    }

    /// Declares every instance at or below `seq` unnecessary for this peer.
    /// Moving the watermark backwards is a no-op. Instances are forgotten
    /// only once every peer has waved them off; see `min`.
    pub fn done(&self, seq: i64) {
        let mut shared = self.inner.shared.lock().unwrap();
        shared.dones[self.inner.me] = cmp::max(shared.dones[self.inner.me], seq);
    }

    /// The highest instance this peer has touched, or -1 before the first.
    pub fn max(&self) -> i64 {
        let shared = self.inner.shared.lock().unwrap();
        shared.instances.keys().max().copied().unwrap_or(-1)
    }

    /// One more than the lowest watermark any peer has reported so far.
    ///
    /// Decided instances at or below that watermark are swept out here.
    /// The protocol never retransmits a decision on its own, so a peer must
    /// hold every decided instance until the whole group has declared it
    /// unnecessary; one silent peer therefore pins the threshold at 0.
    /// Undecided instances survive the sweep, so a late Decide can still
    /// record its value.
    pub fn min(&self) -> i64 {
        let mut shared = self.inner.shared.lock().unwrap();

        let threshold = shared.dones.iter().min().copied().unwrap_or(-1);

        shared
            .instances
            .retain(|&seq, instance| seq > threshold || !instance.decided);

        threshold + 1
    }

    /// Shuts the peer down: the dispatch loop exits at its next poll.
    /// In-flight proposers are not cancelled; once the group's endpoints go
    /// away their calls merely time out, and they loop on harmlessly until
    /// the process exits.
    pub fn kill(&self) {
        self.inner.dead.store(true, Ordering::SeqCst);
    }

    /// Makes this peer drop a fraction of the requests and replies it
    /// serves, to exercise the retry paths. Off by default.
    pub fn set_unreliable(&self, unreliable: bool) {
        self.inner.unreliable.store(unreliable, Ordering::SeqCst);
    }

    // Handlers
    //
    // Both the dispatch loop and the proposer's self-calls go through these
    // three methods, so a proposer must never hold the peer mutex when it
    // invokes its own acceptor.

    /// Handles a Prepare: promises `args.number` if it beats every number
    /// promised for this instance so far, and reports what was already
    /// accepted. A fresh instance has promised nothing, so the first
    /// Prepare always succeeds.
    pub fn prepare(&self, args: PrepareArgs) -> PrepareReply<T> {
        let mut shared = self.inner.shared.lock().unwrap();
        let instance = shared.instances.entry(args.seq).or_default();

        if Some(args.number) > instance.promised {
            instance.promised = Some(args.number);

            if log_enabled!(Level::Debug) {
                debug!(
                    "[{}] I promised {:?} for seq {}.",
                    self.inner.me, args.number, args.seq
                );
            }

            PrepareReply {
                vote: Vote::Ok,
                accepted_number: instance.accepted_number,
                accepted_value: instance.accepted_value.clone(),
            }
        } else {
            PrepareReply {
                vote: Vote::Reject,
                accepted_number: None,
                accepted_value: None,
            }
        }
    }

    /// Handles an Accept: takes the value unless a strictly higher number
    /// has been promised since. The promised number itself is honoured,
    /// because its Accept is the second half of the very proposal the
    /// promise was given to.
    pub fn accept(&self, args: AcceptArgs<T>) -> AcceptReply {
        let mut shared = self.inner.shared.lock().unwrap();
        let instance = shared.instances.entry(args.seq).or_default();

        if Some(args.number) >= instance.promised {
            instance.promised = Some(args.number);
            instance.accepted_number = Some(args.number);
            instance.accepted_value = Some(args.value);

            if log_enabled!(Level::Debug) {
                debug!(
                    "[{}] I accepted {:?} for seq {}.",
                    self.inner.me, args.number, args.seq
                );
            }

            AcceptReply { vote: Vote::Ok }
        } else {
            AcceptReply { vote: Vote::Reject }
        }
    }

    /// Handles a Decide: records the chosen value and the sender's forget
    /// watermark. Replays are harmless: only one value can ever be chosen
    /// per instance, so a second Decide overwrites with the same value.
    pub fn decide(&self, args: DecideArgs<T>) {
        let mut shared = self.inner.shared.lock().unwrap();

        let instance = shared.instances.entry(args.seq).or_default();
        instance.promised = Some(args.number);
        instance.accepted_number = Some(args.number);
        instance.accepted_value = Some(args.value);
        instance.decided = true;

        if let Some(done) = shared.dones.get_mut(args.sender) {
            *done = args.done;
        }

        if log_enabled!(Level::Info) {
            info!("[{}] seq {} is decided at {:?}.", self.inner.me, args.seq, args.number);
        }
    }

    // The proposer driver

    // Drives `seq` towards a decision: one full prepare/accept/decide round
    // per attempt, with a fresh number per round, until a decision is
    // observed locally. Competing proposers make each other restart; message
    // loss merely costs votes, which costs rounds.
    fn propose(&self, seq: i64, value: T) {
        loop {
            match self.status(seq) {
                (Fate::Pending, _) => {}
                // Either some proposer (maybe this one) drove the decision
                // through, or the instance aged out meanwhile.
                _ => return,
            }

            let number = self.next_number();

            let (promises, chosen) = self.run_prepare(seq, number, &value);
            if promises < self.inner.majority {
                self.pause_between_rounds();
                continue;
            }

            let accepts = self.run_accept(seq, number, &chosen);
            if accepts < self.inner.majority {
                self.pause_between_rounds();
                continue;
            }

            self.finish(seq, number, chosen);
            return;
        }
    }

    // Phase 1: collects promises, together with the value this round is now
    // bound to carry. That is the value accepted under the highest number
    // any promiser reported, or our own value when nobody reported any.
    fn run_prepare(&self, seq: i64, number: ProposalNumber, value: &T) -> (usize, T) {
        let args = PrepareArgs { seq, number };

        let mut promises = 0;
        let mut best_number: Option<ProposalNumber> = None;
        let mut best_value: Option<T> = None;

        for (index, address) in self.inner.peers.iter().enumerate() {
            // The local acceptor is invoked directly; only the other peers
            // are reached through the transport.
            let reply = if index == self.inner.me {
                Some(self.prepare(args))
            } else {
                match NetNode::call(address, Rpc::Prepare(args)) {
                    Some(Reply::Prepare(reply)) => Some(reply),
                    _ => None, // unreachable: a vote not received
                }
            };

            if let Some(reply) = reply {
                if reply.vote == Vote::Ok {
                    promises += 1;
                    if reply.accepted_number > best_number {
                        best_number = reply.accepted_number;
                        best_value = reply.accepted_value;
                    }
                }
            }
        }

        let chosen = match best_value {
            Some(accepted) => accepted,
            None => value.clone(),
        };

        (promises, chosen)
    }

    // Phase 2: asks every peer to accept the chosen value for this round.
    fn run_accept(&self, seq: i64, number: ProposalNumber, chosen: &T) -> usize {
        let mut accepts = 0;

        for (index, address) in self.inner.peers.iter().enumerate() {
            let args = AcceptArgs { seq, number, value: chosen.clone() };

            let reply = if index == self.inner.me {
                Some(self.accept(args))
            } else {
                match NetNode::call(address, Rpc::Accept(args)) {
                    Some(Reply::Accept(reply)) => Some(reply),
                    _ => None,
                }
            };

            if let Some(reply) = reply {
                if reply.vote == Vote::Ok {
                    accepts += 1;
                }
            }
        }

        accepts
    }

    // Phase 3: records the decision here first, then fans it out to every
    // other peer with our forget watermark piggybacked. Fire and forget:
    // a peer that misses this learns the value from whichever proposer runs
    // the instance next.
    fn finish(&self, seq: i64, number: ProposalNumber, chosen: T) {
        let done = {
            let mut shared = self.inner.shared.lock().unwrap();

            let instance = shared.instances.entry(seq).or_default();
            instance.promised = Some(number);
            instance.accepted_number = Some(number);
            instance.accepted_value = Some(chosen.clone());
            instance.decided = true;

            shared.dones[self.inner.me]
        };

        if log_enabled!(Level::Info) {
            info!("[{}] I drove seq {} to a decision at {:?}.", self.inner.me, seq, number);
        }

        for (index, address) in self.inner.peers.iter().enumerate() {
            if index == self.inner.me {
                continue;
            }

            let args = DecideArgs {
                seq,
                number,
                value: chosen.clone(),
                sender: self.inner.me,
                done,
            };

            let _ = NetNode::call(address, Rpc::Decide(args));
        }
    }

    // Produces a number strictly above every number this peer has produced
    // before, ordered across peers by (clock, peer index).
    fn next_number(&self) -> ProposalNumber {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(0);

        let mut last_clock = self.inner.last_clock.lock().unwrap();
        *last_clock = cmp::max(now, *last_clock + 1);

        ProposalNumber { clock: *last_clock, peer: self.inner.me as u64 }
    }

    // Proposers dueling at one instance can starve each other indefinitely;
    // a short random pause between failed rounds breaks the symmetry.
    fn pause_between_rounds(&self) {
        let jitter = rand::thread_rng().gen_range(10, 50);
        thread::sleep(Duration::from_millis(jitter));
    }

    // The dispatch loop

    // Serves incoming requests until the peer is killed. When the peer is
    // marked unreliable, a fraction of requests and replies is dropped on
    // the floor, as a lossy network would drop them.
    fn dispatch_loop(&self) {
        while !self.is_dead() {
            let (id, rpc, source) = match self.inner.node.recv_request() {
                Some(received) => received,
                None => continue,
            };

            if self.is_unreliable() && rand::thread_rng().gen::<f64>() < DROP_RATE {
                continue; // the request was "lost"
            }

            let reply = match rpc {
                Rpc::Prepare(args) => Reply::Prepare(self.prepare(args)),
                Rpc::Accept(args) => Reply::Accept(self.accept(args)),
                Rpc::Decide(args) => {
                    self.decide(args);
                    Reply::Decide
                }
            };

            if self.is_unreliable() && rand::thread_rng().gen::<f64>() < DROP_RATE {
                continue; // the reply was "lost"
            }

            self.inner.node.reply(id, reply, &source);
        }
    }

    fn is_dead(&self) -> bool {
        self.inner.dead.load(Ordering::SeqCst)
    }

    fn is_unreliable(&self) -> bool {
        self.inner.unreliable.load(Ordering::SeqCst)
    }
}
