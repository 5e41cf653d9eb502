//! The read protocol.  A key counts as finalized only when every replica in a quorum returns
//! the identical reply; anything less kicks off a Paxos round on the highest version seen and
//! tries again.

use std::collections::BTreeMap;

use biometrics::{Collector, Counter};
use serde_json::{json, Value};
use zerror_core::ErrorCore;

use confdb_pb::{Error, ReadQuery, ReadServerRequest, ReadServerResponse};

use crate::proposer;
use crate::quorum::QuorumClient;
use crate::value;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static READ_REPAIR: Counter = Counter::new("confdb.reader.repair");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&READ_REPAIR);
}

////////////////////////////////////////////// Readout /////////////////////////////////////////////

/// What a read returns to callers.
#[derive(Clone, Debug, PartialEq)]
pub enum Readout {
    /// Every key in the db, at its highest finalized version.
    Keys {
        db: String,
        keys: BTreeMap<String, u64>,
    },
    /// One key.  version and value are None when the key has no finalized record.
    Record {
        db: String,
        key: String,
        version: Option<u64>,
        value: Option<Value>,
    },
}

impl Readout {
    /// Render the way the command line prints it.
    pub fn to_json(&self) -> Value {
        match self {
            Readout::Keys { db, keys } => {
                json!({ "db": db, "keys": keys })
            }
            Readout::Record {
                db,
                key,
                version,
                value,
            } => {
                json!({ "db": db, "key": key, "version": version, "value": value })
            }
        }
    }
}

//////////////////////////////////////////////// get ///////////////////////////////////////////////

/// Read one key (finalizing it if replicas diverge), or list every key when none is given.
pub fn get(cluster: &QuorumClient, db: &str, key: Option<&str>) -> Result<Readout, Error> {
    match key {
        Some(key) => read_key(cluster, db, key),
        None => list_keys(cluster, db),
    }
}

fn list_keys(cluster: &QuorumClient, db: &str) -> Result<Readout, Error> {
    let req = ReadServerRequest {
        db: db.to_owned(),
        query: ReadQuery::All,
    };
    let mut keys: BTreeMap<String, u64> = BTreeMap::new();
    for reply in cluster.read_server(&req)? {
        if let ReadServerResponse::Keys { pairs } = reply {
            for pair in pairs {
                let slot = keys.entry(pair.key).or_insert(pair.version);
                if *slot < pair.version {
                    *slot = pair.version;
                }
            }
        }
    }
    Ok(Readout::Keys {
        db: db.to_owned(),
        keys,
    })
}

fn read_key(cluster: &QuorumClient, db: &str, key: &str) -> Result<Readout, Error> {
    let req = ReadServerRequest {
        db: db.to_owned(),
        query: ReadQuery::Key {
            key: key.to_owned(),
        },
    };
    let mut last_err: Option<Error> = None;
    for _ in 0..cluster.quorum() {
        let replies = match cluster.read_server(&req) {
            Ok(replies) => replies,
            Err(err) => {
                last_err = Some(err);
                continue;
            }
        };
        if replies.iter().all(|reply| *reply == replies[0]) {
            match &replies[0] {
                ReadServerResponse::Empty => {
                    return Ok(Readout::Record {
                        db: db.to_owned(),
                        key: key.to_owned(),
                        version: None,
                        value: None,
                    });
                }
                ReadServerResponse::Record { version, value } => {
                    let value = value::decode(value)?;
                    return Ok(Readout::Record {
                        db: db.to_owned(),
                        key: key.to_owned(),
                        version: Some(*version),
                        value: Some(value),
                    });
                }
                ReadServerResponse::Keys { .. } => {
                    return Err(Error::logic_error("listing reply to a keyed read"));
                }
            }
        }
        // The quorum does not agree on a version-value for this key yet.  Run a round on the
        // highest version seen to finalize it, then look again.
        let highest = replies
            .iter()
            .filter_map(|reply| match reply {
                ReadServerResponse::Record { version, .. } => Some(*version),
                _ => None,
            })
            .max();
        if let Some(highest) = highest {
            READ_REPAIR.click();
            if let Err(err) = proposer::propose(cluster, db, key, highest, None) {
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::QuorumNotReached {
        core: ErrorCore::default(),
        what: format!("read of {}:{} did not converge", db, key),
    }))
}
