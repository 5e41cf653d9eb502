//! The acceptor half of the protocol:  a pure state transition over persisted records, wrapped
//! in one store transaction per call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use biometrics::{Collector, Counter};
use utilz::time::now;
use zerror_core::ErrorCore;

use confdb_pb::{
    AcceptorService, Context, Error, KeyVersion, PaxosPhase, PaxosRequest, PaxosResponse,
    ReadQuery, ReadServerRequest, ReadServerResponse, MAX_CLOCK_SKEW_SECS,
};

use crate::store::{Edit, Record, Store};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static READ_SERVER: Counter = Counter::new("confdb.acceptor.read_server");
static PAXOS: Counter = Counter::new("confdb.acceptor.paxos");
static PROMISE_GRANTED: Counter = Counter::new("confdb.acceptor.promise");
static PROMISE_STALE: Counter = Counter::new("confdb.acceptor.promise.stale");
static ACCEPT_APPLIED: Counter = Counter::new("confdb.acceptor.accept");
static ACCEPT_STALE: Counter = Counter::new("confdb.acceptor.accept.stale");
static CLOCKS_OUT_OF_SYNC: Counter = Counter::new("confdb.acceptor.clocks_out_of_sync");
static TLS_AUTH_FAILED: Counter = Counter::new("confdb.acceptor.tls_auth_failed");
static PRUNED: Counter = Counter::new("confdb.acceptor.pruned");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&READ_SERVER);
    collector.register_counter(&PAXOS);
    collector.register_counter(&PROMISE_GRANTED);
    collector.register_counter(&PROMISE_STALE);
    collector.register_counter(&ACCEPT_APPLIED);
    collector.register_counter(&ACCEPT_STALE);
    collector.register_counter(&CLOCKS_OUT_OF_SYNC);
    collector.register_counter(&TLS_AUTH_FAILED);
    collector.register_counter(&PRUNED);
}

///////////////////////////////////////////// Acceptor /////////////////////////////////////////////

/// An Acceptor serves every db under one store root.  Stores open lazily and stay open; the
/// per-db mutex is the exclusive transaction the Paxos transition runs under.
pub struct Acceptor {
    root: PathBuf,
    stores: Mutex<HashMap<String, Arc<Mutex<Store>>>>,
}

impl Acceptor {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    fn store(&self, db: &str) -> Result<Arc<Mutex<Store>>, Error> {
        let mut stores = self.stores.lock().unwrap();
        if let Some(store) = stores.get(db) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(Mutex::new(Store::open(&self.root, db)?));
        stores.insert(db.to_owned(), Arc::clone(&store));
        Ok(store)
    }

    fn store_existing(&self, db: &str) -> Result<Arc<Mutex<Store>>, Error> {
        let mut stores = self.stores.lock().unwrap();
        if let Some(store) = stores.get(db) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(Mutex::new(Store::open_existing(&self.root, db)?));
        stores.insert(db.to_owned(), Arc::clone(&store));
        Ok(store)
    }

    fn check_subject(ctx: &Context) -> Result<(), Error> {
        if ctx.subject().is_none() {
            TLS_AUTH_FAILED.click();
            return Err(Error::TlsAuthFailed {
                core: ErrorCore::default(),
            });
        }
        Ok(())
    }
}

impl AcceptorService for Acceptor {
    fn read_server(
        &self,
        ctx: &Context,
        req: ReadServerRequest,
    ) -> Result<ReadServerResponse, Error> {
        READ_SERVER.click();
        Self::check_subject(ctx)?;
        let store = self.store_existing(&req.db)?;
        let store = store.lock().unwrap();
        Ok(match req.query {
            ReadQuery::All => {
                let pairs = store
                    .list_finalized()
                    .into_iter()
                    .map(|(key, version)| KeyVersion { key, version })
                    .collect();
                ReadServerResponse::Keys { pairs }
            }
            ReadQuery::Key { key } => match store.latest_finalized(&key) {
                Some(record) => ReadServerResponse::Record {
                    version: record.version,
                    value: record.value.clone(),
                },
                None => ReadServerResponse::Empty,
            },
            ReadQuery::Exact { key, version } => match store.finalized_at(&key, version) {
                Some(record) => ReadServerResponse::Record {
                    version,
                    value: record.value.clone(),
                },
                None => ReadServerResponse::Empty,
            },
        })
    }

    fn paxos(&self, ctx: &Context, req: PaxosRequest) -> Result<PaxosResponse, Error> {
        PAXOS.click();
        // Out-of-sync clocks can block further rounds; refuse them before touching state.
        let now_secs = now::millis() / 1_000;
        if now_secs.abs_diff(req.seq) > MAX_CLOCK_SKEW_SECS {
            CLOCKS_OUT_OF_SYNC.click();
            return Err(Error::ClocksOutOfSync {
                core: ErrorCore::default(),
                seq: req.seq,
                now: now_secs,
            });
        }
        Self::check_subject(ctx)?;
        let store = self.store(&req.db)?;
        let mut store = store.lock().unwrap();
        // An absent record behaves as freshly created with zeros.
        let current = match store.get(&req.key, req.version) {
            Some(record) => record.clone(),
            None => Record {
                key: req.key.clone(),
                version: req.version,
                ..Record::default()
            },
        };
        match req.phase {
            PaxosPhase::Promise => {
                if req.seq > current.promised_seq {
                    let mut edit = Edit::default();
                    edit.put(Record {
                        promised_seq: req.seq,
                        ..current.clone()
                    });
                    store.apply(edit)?;
                    PROMISE_GRANTED.click();
                    // The crux of the protocol:  hand back whatever was already accepted so the
                    // proposer must carry it into phase 2.
                    Ok(PaxosResponse::Promised {
                        accepted_seq: current.accepted_seq,
                        value: current.value,
                    })
                } else {
                    PROMISE_STALE.click();
                    Err(stale(&req))
                }
            }
            PaxosPhase::Accept { value } => {
                if req.seq >= current.promised_seq {
                    let mut edit = Edit::default();
                    edit.put(Record {
                        key: req.key.clone(),
                        version: req.version,
                        promised_seq: req.seq,
                        accepted_seq: req.seq,
                        value,
                    });
                    // Collect versions of this key below its highest finalized version.  This
                    // is housekeeping; Paxos is indifferent to it.
                    let mut versions = store.versions(&req.key);
                    if !versions.contains(&req.version) {
                        versions.push(req.version);
                    }
                    let mut max_finalized = req.version;
                    for &version in &versions {
                        if version > max_finalized
                            && store.finalized_at(&req.key, version).is_some()
                        {
                            max_finalized = version;
                        }
                    }
                    for &version in &versions {
                        if version < max_finalized {
                            PRUNED.click();
                            edit.del(&req.key, version);
                        }
                    }
                    store.apply(edit)?;
                    ACCEPT_APPLIED.click();
                    Ok(PaxosResponse::Accepted)
                } else {
                    ACCEPT_STALE.click();
                    Err(stale(&req))
                }
            }
        }
    }
}

fn stale(req: &PaxosRequest) -> Error {
    Error::StaleProposalSeq {
        core: ErrorCore::default(),
        key: req.key.clone(),
        version: req.version,
        seq: req.seq,
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
