//! A module which contains the definition of the proposal numbers that order
//! competing attempts, and of the messages which peers exchange.

use uuid::Uuid;

/// A globally unique, totally ordered identifier for one proposal attempt.
///
/// The ordering is lexicographic on `(clock, peer)`: later attempts beat
/// earlier ones, and attempts made at the same instant are ordered by the
/// proposing peer's index, so two peers can never produce the same number.
/// "No proposal yet" is represented as `Option<ProposalNumber>`; `None`
/// sorts below every generated number.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProposalNumber {
    // Nanoseconds since the epoch at generation time, bumped where needed so
    // that successive numbers from one peer strictly increase.
    pub clock: u64,

    // The index of the generating peer, breaking ties between peers whose
    // clocks read the same instant.
    pub peer: u64,
}

/// How an acceptor answered a Prepare or an Accept.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Vote {
    Ok,
    Reject,
}

/// Phase 1a: asks an acceptor to promise to ignore older attempts at `seq`.
#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
pub struct PrepareArgs {
    pub seq: i64,

    pub number: ProposalNumber,
}

/// Phase 1b: the promise. It carries whatever the acceptor had already
/// accepted for the instance, which the proposer is bound to adopt.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PrepareReply<T> {
    pub vote: Vote,

    // The number and value of the highest proposal accepted so far, or None
    // on both when the acceptor has accepted nothing for this instance.
    pub accepted_number: Option<ProposalNumber>,

    pub accepted_value: Option<T>,
}

/// Phase 2a: asks an acceptor to accept a concrete value for `seq`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AcceptArgs<T> {
    pub seq: i64,

    pub number: ProposalNumber,

    pub value: T,
}

/// Phase 2b: whether the acceptor took the value.
#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
pub struct AcceptReply {
    pub vote: Vote,
}

/// Phase 3: announces the chosen value once a majority accepted it. It also
/// piggybacks the sender's forget watermark, which is how watermarks travel
/// between peers at all.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DecideArgs<T> {
    pub seq: i64,

    pub number: ProposalNumber,

    pub value: T,

    // The index of the deciding peer, naming the watermark slot to update.
    pub sender: usize,

    // The sender's own forget watermark at the time of the decision.
    pub done: i64,
}

/// An enum which contains every request a peer can serve.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Rpc<T> {
    Prepare(PrepareArgs),
    Accept(AcceptArgs<T>),
    Decide(DecideArgs<T>),
}

/// The reply to the matching `Rpc` variant. Decide carries no payload; the
/// arrival of the reply is the acknowledgement.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Reply<T> {
    Prepare(PrepareReply<T>),
    Accept(AcceptReply),
    Decide,
}

/// A request datagram. The id pairs the request with its response, so that a
/// caller can discard strays belonging to calls it already gave up on.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request<T> {
    pub id: Uuid,

    pub rpc: Rpc<T>,
}

/// A response datagram, echoing the id of the request it answers.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response<T> {
    pub id: Uuid,

    pub reply: Reply<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_order_by_clock_then_peer() {
        let a = ProposalNumber { clock: 1, peer: 2 };
        let b = ProposalNumber { clock: 2, peer: 0 };
        let c = ProposalNumber { clock: 2, peer: 1 };

        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn absent_number_sorts_below_any_generated_one() {
        let smallest = ProposalNumber { clock: 0, peer: 0 };
        assert!(None < Some(smallest));
    }
}
