//! Fan one acceptor call out to every peer and insist on a quorum of answers.  Ordering between
//! concurrent fan-outs is Paxos's problem, not this module's.

use std::sync::Arc;

use biometrics::{Collector, Counter};
use indicio::{clue, ERROR};
use zerror_core::ErrorCore;

use confdb_pb::{
    AcceptorService, Context, Error, PaxosRequest, PaxosResponse, ReadServerRequest,
    ReadServerResponse,
};

use crate::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static BROADCAST: Counter = Counter::new("confdb.quorum.broadcast");
static PEER_FAILURE: Counter = Counter::new("confdb.quorum.peer_failure");
static QUORUM_NOT_REACHED: Counter = Counter::new("confdb.quorum.not_reached");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&BROADCAST);
    collector.register_counter(&PEER_FAILURE);
    collector.register_counter(&QUORUM_NOT_REACHED);
}

/////////////////////////////////////////////// Peer ///////////////////////////////////////////////

/// One cluster member:  a name for error messages and an acceptor to call.  Production peers
/// wrap network stubs; tests wire acceptors in directly.
pub struct Peer {
    name: String,
    acceptor: Arc<dyn AcceptorService>,
}

impl Peer {
    pub fn new(name: impl Into<String>, acceptor: Arc<dyn AcceptorService>) -> Self {
        Self {
            name: name.into(),
            acceptor,
        }
    }
}

/////////////////////////////////////////// QuorumClient ///////////////////////////////////////////

/// A QuorumClient invokes the whole cluster and succeeds only on a majority of answers.
pub struct QuorumClient {
    peers: Vec<Peer>,
    quorum: usize,
}

impl QuorumClient {
    /// Create a client over the peers.  The override may raise the majority, never lower it.
    pub fn new(peers: Vec<Peer>, quorum_override: usize) -> Self {
        let majority = peers.len() / 2 + 1;
        let quorum = std::cmp::max(majority, quorum_override);
        Self { peers, quorum }
    }

    /// The number of successes required of every broadcast.
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Broadcast a read_server call.
    pub fn read_server(&self, req: &ReadServerRequest) -> Result<Vec<ReadServerResponse>, Error> {
        let ctx = Context::default();
        self.broadcast("read_server", |acceptor| {
            acceptor.read_server(&ctx, req.clone())
        })
    }

    /// Broadcast a paxos call.
    pub fn paxos(&self, req: &PaxosRequest) -> Result<Vec<PaxosResponse>, Error> {
        let ctx = Context::default();
        self.broadcast("paxos", |acceptor| acceptor.paxos(&ctx, req.clone()))
    }

    fn broadcast<T, F>(&self, what: &str, f: F) -> Result<Vec<T>, Error>
    where
        T: Send,
        F: Fn(&dyn AcceptorService) -> Result<T, Error> + Send + Sync,
    {
        BROADCAST.click();
        let results: Vec<(&str, Result<T, Error>)> = std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for peer in &self.peers {
                let f = &f;
                handles.push((
                    peer.name.as_str(),
                    scope.spawn(move || f(peer.acceptor.as_ref())),
                ));
            }
            handles
                .into_iter()
                .map(|(name, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::logic_error("peer call panicked")));
                    (name, result)
                })
                .collect()
        });
        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(t) => successes.push(t),
                Err(err) => {
                    PEER_FAILURE.click();
                    clue!(COLLECTOR, ERROR, {
                        quorum: {
                            call: what,
                            peer: name,
                            error: err.to_string(),
                        },
                    });
                    failures.push(format!("{}: {}", name, err));
                }
            }
        }
        if successes.len() < self.quorum {
            QUORUM_NOT_REACHED.click();
            return Err(Error::QuorumNotReached {
                core: ErrorCore::default(),
                what: format!("{}: {}", what, failures.join("; ")),
            });
        }
        Ok(successes)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned {
        response: Result<ReadServerResponse, Error>,
    }

    impl AcceptorService for Canned {
        fn read_server(
            &self,
            _: &Context,
            _: ReadServerRequest,
        ) -> Result<ReadServerResponse, Error> {
            self.response.clone()
        }

        fn paxos(&self, _: &Context, _: PaxosRequest) -> Result<PaxosResponse, Error> {
            Err(Error::logic_error("not under test"))
        }
    }

    fn up() -> Peer {
        Peer::new(
            "up",
            Arc::new(Canned {
                response: Ok(ReadServerResponse::Empty),
            }),
        )
    }

    fn down(name: &str) -> Peer {
        Peer::new(
            name,
            Arc::new(Canned {
                response: Err(Error::transport_failure("connection refused")),
            }),
        )
    }

    #[test]
    fn quorum_is_a_majority() {
        assert_eq!(2, QuorumClient::new(vec![up(), up(), up()], 0).quorum());
        assert_eq!(3, QuorumClient::new(vec![up(), up(), up(), up()], 0).quorum());
        assert_eq!(1, QuorumClient::new(vec![up()], 0).quorum());
    }

    #[test]
    fn quorum_override_raises_never_lowers() {
        assert_eq!(3, QuorumClient::new(vec![up(), up(), up()], 3).quorum());
        assert_eq!(2, QuorumClient::new(vec![up(), up(), up()], 1).quorum());
    }

    #[test]
    fn broadcast_tolerates_a_minority_down() {
        let client = QuorumClient::new(vec![up(), up(), down("s3")], 0);
        let req = ReadServerRequest::default();
        let replies = client.read_server(&req).unwrap();
        assert_eq!(2, replies.len());
    }

    #[test]
    fn broadcast_names_failing_peers() {
        let client = QuorumClient::new(vec![up(), down("s2"), down("s3")], 0);
        let req = ReadServerRequest::default();
        match client.read_server(&req) {
            Err(Error::QuorumNotReached { what, .. }) => {
                assert!(what.contains("s2"));
                assert!(what.contains("s3"));
            }
            _ => panic!("bad case"),
        }
    }
}
