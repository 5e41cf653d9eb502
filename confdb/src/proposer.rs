//! The proposer runs one Paxos round for a (db, key, version).  It exists to install a value,
//! but phase 1 can force it to carry someone else's:  whatever the quorum has already accepted
//! wins over the caller's intent.

use biometrics::{Collector, Counter};
use indicio::{clue, ERROR};
use serde_json::Value;
use utilz::time::now;

use confdb_pb::{Error, PaxosPhase, PaxosRequest, PaxosResponse};

use crate::quorum::QuorumClient;
use crate::value;
use crate::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PROPOSE: Counter = Counter::new("confdb.proposer.propose");
static VALUE_PRESERVED: Counter = Counter::new("confdb.proposer.value_preserved");
static NOTHING_TO_PROPOSE: Counter = Counter::new("confdb.proposer.nothing_to_propose");
static ACCEPT_DROPPED: Counter = Counter::new("confdb.proposer.accept_dropped");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&PROPOSE);
    collector.register_counter(&VALUE_PRESERVED);
    collector.register_counter(&NOTHING_TO_PROPOSE);
    collector.register_counter(&ACCEPT_DROPPED);
}

////////////////////////////////////////////// propose /////////////////////////////////////////////

/// Run one Paxos round.  With a value, try to install it; with None, finalize whatever a
/// majority member already accepted (the reader's repair path).
///
/// Seconds resolution is enough for seqs:  two proposers in the same second collide and one
/// round is lost, which the retry loop above absorbs.
pub fn propose(
    cluster: &QuorumClient,
    db: &str,
    key: &str,
    version: u64,
    obj: Option<&Value>,
) -> Result<(), Error> {
    PROPOSE.click();
    let seq = now::millis() / 1_000;
    let mut octets = match obj {
        Some(obj) => Some(value::encode(obj)?),
        None => None,
    };
    let promise = PaxosRequest {
        db: db.to_owned(),
        key: key.to_owned(),
        version,
        seq,
        phase: PaxosPhase::Promise,
    };
    let mut accepted_seq = 0;
    for reply in cluster.paxos(&promise)? {
        if let PaxosResponse::Promised {
            accepted_seq: seen,
            value,
        } = reply
        {
            // The crux of the protocol:  the most recently accepted value across the quorum
            // replaces whatever we set out to propose.
            if seen > accepted_seq {
                accepted_seq = seen;
                octets = Some(value);
            }
        }
    }
    if accepted_seq > 0 {
        VALUE_PRESERVED.click();
    }
    let octets = match octets {
        Some(octets) => octets,
        None => {
            // Nothing accepted anywhere and nothing to install; the read loop will settle on
            // Empty by itself.
            NOTHING_TO_PROPOSE.click();
            return Ok(());
        }
    };
    let accept = PaxosRequest {
        db: db.to_owned(),
        key: key.to_owned(),
        version,
        seq,
        phase: PaxosPhase::Accept { value: octets },
    };
    // A failed accept cannot be repaired in place; the whole round must be retried by whoever
    // needs durability.  Retrying here could livelock against a competing proposer.
    if let Err(err) = cluster.paxos(&accept) {
        ACCEPT_DROPPED.click();
        clue!(COLLECTOR, ERROR, {
            propose: {
                db: db,
                key: key,
                version: version,
                accept_dropped: err.to_string(),
            },
        });
    }
    Ok(())
}
