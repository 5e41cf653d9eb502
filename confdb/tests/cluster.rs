//! Multi-node scenarios against three in-process acceptors wired straight into the quorum
//! client.  The transport injects the peer subject in production; a shim stands in for it here.

use std::fs::remove_dir_all;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use confdb::{proposer, reader, writer, Acceptor, Peer, QuorumClient, Readout};
use confdb_pb::{
    AcceptorService, Context, Error, PaxosPhase, PaxosRequest, PaxosResponse, ReadQuery,
    ReadServerRequest, ReadServerResponse,
};

///////////////////////////////////////////// fixtures /////////////////////////////////////////////

fn test_root(root: &str, line: u32) -> PathBuf {
    let root: String = root
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let path = PathBuf::from(format!("{}_{}", root, line));
    if path.exists() {
        remove_dir_all(&path).expect("could not prepare for test");
    }
    path
}

/// Forwards to an in-process acceptor with the subject the TLS layer would have supplied.
struct Authenticated {
    inner: Arc<Acceptor>,
}

impl AcceptorService for Authenticated {
    fn read_server(
        &self,
        ctx: &Context,
        req: ReadServerRequest,
    ) -> Result<ReadServerResponse, Error> {
        self.inner.read_server(&ctx.with_subject("confdb-test"), req)
    }

    fn paxos(&self, ctx: &Context, req: PaxosRequest) -> Result<PaxosResponse, Error> {
        self.inner.paxos(&ctx.with_subject("confdb-test"), req)
    }
}

/// A peer that dropped off the network.
struct Down;

impl AcceptorService for Down {
    fn read_server(&self, _: &Context, _: ReadServerRequest) -> Result<ReadServerResponse, Error> {
        Err(Error::transport_failure("connection refused"))
    }

    fn paxos(&self, _: &Context, _: PaxosRequest) -> Result<PaxosResponse, Error> {
        Err(Error::transport_failure("connection refused"))
    }
}

fn acceptors(root: &PathBuf) -> Vec<Arc<Acceptor>> {
    ["s1", "s2", "s3"]
        .iter()
        .map(|name| Arc::new(Acceptor::new(root.join(name))))
        .collect()
}

fn cluster(acceptors: &[Arc<Acceptor>]) -> QuorumClient {
    let peers = acceptors
        .iter()
        .enumerate()
        .map(|(i, acceptor)| {
            Peer::new(
                format!("s{}", i + 1),
                Arc::new(Authenticated {
                    inner: Arc::clone(acceptor),
                }) as Arc<dyn AcceptorService>,
            )
        })
        .collect();
    QuorumClient::new(peers, 0)
}

fn cluster_with_one_down(acceptors: &[Arc<Acceptor>]) -> QuorumClient {
    let mut peers: Vec<Peer> = acceptors
        .iter()
        .take(2)
        .enumerate()
        .map(|(i, acceptor)| {
            Peer::new(
                format!("s{}", i + 1),
                Arc::new(Authenticated {
                    inner: Arc::clone(acceptor),
                }) as Arc<dyn AcceptorService>,
            )
        })
        .collect();
    peers.push(Peer::new("s3", Arc::new(Down)));
    QuorumClient::new(peers, 0)
}

fn seq_now() -> u64 {
    utilz::time::now::millis() / 1_000
}

fn record_of(readout: &Readout) -> (Option<u64>, Option<serde_json::Value>) {
    match readout {
        Readout::Record { version, value, .. } => (*version, value.clone()),
        Readout::Keys { .. } => panic!("expected a record readout"),
    }
}

///////////////////////////////////////////// scenarios ////////////////////////////////////////////

#[test]
fn single_writer_happy_path() {
    let root = test_root(module_path!(), line!());
    let acceptors = acceptors(&root);
    let full = cluster(&acceptors);
    let readout = writer::put(&full, "dbA", "s", "k", 1, json!({"x": 1})).unwrap();
    assert_eq!((Some(1), Some(json!({"x": 1}))), record_of(&readout));
    let readout = reader::get(&full, "dbA", Some("k")).unwrap();
    assert_eq!((Some(1), Some(json!({"x": 1}))), record_of(&readout));
    // One node down:  reads still serve and still agree.
    let degraded = cluster_with_one_down(&acceptors);
    let readout = reader::get(&degraded, "dbA", Some("k")).unwrap();
    assert_eq!((Some(1), Some(json!({"x": 1}))), record_of(&readout));
}

#[test]
fn read_of_absent_key() {
    let root = test_root(module_path!(), line!());
    let acceptors = acceptors(&root);
    let full = cluster(&acceptors);
    writer::put(&full, "dbA", "s", "k", 1, json!({"x": 1})).unwrap();
    let readout = reader::get(&full, "dbA", Some("nope")).unwrap();
    assert_eq!((None, None), record_of(&readout));
}

#[test]
fn concurrent_writers_same_version() {
    let root = test_root(module_path!(), line!());
    let acceptors = acceptors(&root);
    let full = cluster(&acceptors);
    writer::put(&full, "dbA", "s", "k", 1, json!({"a": 0})).unwrap();
    let results: Vec<Result<Readout, Error>> = std::thread::scope(|scope| {
        let one = scope.spawn(|| writer::put(&full, "dbA", "s", "k", 2, json!({"a": 1})));
        let two = scope.spawn(|| writer::put(&full, "dbA", "s", "k", 2, json!({"a": 2})));
        vec![one.join().unwrap(), two.join().unwrap()]
    });
    // Same-second seqs collide; at most one writer can lose its round.
    assert!(results.iter().any(|r| r.is_ok()));
    let first = reader::get(&full, "dbA", Some("k")).unwrap();
    let (version, value) = record_of(&first);
    assert_eq!(Some(2), version);
    assert!(value == Some(json!({"a": 1})) || value == Some(json!({"a": 2})));
    // Every subsequent read returns the same answer.
    for _ in 0..3 {
        assert_eq!(first, reader::get(&full, "dbA", Some("k")).unwrap());
    }
    // And every replica holds it.
    let req = ReadServerRequest {
        db: "dbA".to_owned(),
        query: ReadQuery::Key {
            key: "k".to_owned(),
        },
    };
    let ctx = Context::default().with_subject("confdb-test");
    let replies: Vec<ReadServerResponse> = acceptors
        .iter()
        .map(|a| a.read_server(&ctx, req.clone()).unwrap())
        .collect();
    assert_eq!(replies[0], replies[1]);
    assert_eq!(replies[0], replies[2]);
}

#[test]
fn reader_repairs_half_written_state() {
    let root = test_root(module_path!(), line!());
    let acceptors = acceptors(&root);
    let full = cluster(&acceptors);
    // A proposer that died mid-round:  promised everywhere, accepted only on s1.
    let seq = seq_now() - 5;
    let promise = PaxosRequest {
        db: "dbA".to_owned(),
        key: "k".to_owned(),
        version: 1,
        seq,
        phase: PaxosPhase::Promise,
    };
    full.paxos(&promise).unwrap();
    let value = confdb::value::encode(&json!({"v": "V"})).unwrap();
    let accept = PaxosRequest {
        db: "dbA".to_owned(),
        key: "k".to_owned(),
        version: 1,
        seq,
        phase: PaxosPhase::Accept { value },
    };
    let ctx = Context::default().with_subject("confdb-test");
    acceptors[0].paxos(&ctx, accept).unwrap();
    // A fresh read triggers a round and finalizes V on every replica.
    let readout = reader::get(&full, "dbA", Some("k")).unwrap();
    assert_eq!((Some(1), Some(json!({"v": "V"}))), record_of(&readout));
    let req = ReadServerRequest {
        db: "dbA".to_owned(),
        query: ReadQuery::Key {
            key: "k".to_owned(),
        },
    };
    let replies: Vec<ReadServerResponse> = acceptors
        .iter()
        .map(|a| a.read_server(&ctx, req.clone()).unwrap())
        .collect();
    assert!(replies.iter().all(|r| *r == replies[0]));
    assert_ne!(ReadServerResponse::Empty, replies[0]);
}

#[test]
fn stale_seq_rejected_by_every_acceptor() {
    let root = test_root(module_path!(), line!());
    let acceptors = acceptors(&root);
    let full = cluster(&acceptors);
    let promise = PaxosRequest {
        db: "dbA".to_owned(),
        key: "k".to_owned(),
        version: 1,
        seq: seq_now() - 20,
        phase: PaxosPhase::Promise,
    };
    match full.paxos(&promise) {
        Err(Error::QuorumNotReached { what, .. }) => {
            assert!(what.contains("ClocksOutOfSync"));
        }
        _ => panic!("bad case"),
    }
}

#[test]
fn credential_mismatch_rejected() {
    let root = test_root(module_path!(), line!());
    let acceptors = acceptors(&root);
    let full = cluster(&acceptors);
    writer::put(&full, "dbA", "a", "k", 1, json!({"x": 1})).unwrap();
    let cred_before = reader::get(&full, "dbA", Some("dbA")).unwrap();
    match writer::put(&full, "dbA", "b", "k", 2, json!({"x": 2})) {
        Err(Error::AuthenticationFailed { .. }) => {}
        _ => panic!("bad case"),
    }
    // Neither the credential nor the key moved.
    assert_eq!(cred_before, reader::get(&full, "dbA", Some("dbA")).unwrap());
    let readout = reader::get(&full, "dbA", Some("k")).unwrap();
    assert_eq!((Some(1), Some(json!({"x": 1}))), record_of(&readout));
}

#[test]
fn credential_rotation() {
    let root = test_root(module_path!(), line!());
    let acceptors = acceptors(&root);
    let full = cluster(&acceptors);
    writer::put(&full, "dbA", "old", "k", 1, json!({"x": 1})).unwrap();
    // key == db means the value is the new secret.
    let readout = writer::put(&full, "dbA", "old", "dbA", 1, json!("new")).unwrap();
    let (version, value) = record_of(&readout);
    assert_eq!(Some(1), version);
    let value = value.unwrap();
    let guid = value["guid"].as_str().unwrap();
    let hmac = value["hmac"].as_str().unwrap();
    assert_eq!(hmac, writer::credential_hmac("new", guid));
    // The old secret no longer authenticates; the new one does.
    match writer::put(&full, "dbA", "old", "k", 2, json!({"x": 2})) {
        Err(Error::AuthenticationFailed { .. }) => {}
        _ => panic!("bad case"),
    }
    writer::put(&full, "dbA", "new", "k", 2, json!({"x": 2})).unwrap();
}

#[test]
fn rotation_requires_a_string_secret() {
    let root = test_root(module_path!(), line!());
    let acceptors = acceptors(&root);
    let full = cluster(&acceptors);
    writer::put(&full, "dbA", "s", "k", 1, json!({"x": 1})).unwrap();
    match writer::put(&full, "dbA", "s", "dbA", 1, json!({"not": "a string"})) {
        Err(Error::InvalidValue { .. }) => {}
        _ => panic!("bad case"),
    }
}

#[test]
fn key_listing_merges_max_versions() {
    let root = test_root(module_path!(), line!());
    let acceptors = acceptors(&root);
    let full = cluster(&acceptors);
    writer::put(&full, "dbA", "s", "k1", 1, json!(1)).unwrap();
    writer::put(&full, "dbA", "s", "k2", 1, json!(1)).unwrap();
    writer::put(&full, "dbA", "s", "k2", 2, json!(2)).unwrap();
    writer::put(&full, "dbA", "s", "k3", 1, json!(3)).unwrap();
    let expected: Vec<(String, u64)> = vec![
        ("dbA".to_owned(), 0),
        ("k1".to_owned(), 1),
        ("k2".to_owned(), 2),
        ("k3".to_owned(), 1),
    ];
    for client in [&full, &cluster_with_one_down(&acceptors)] {
        match reader::get(client, "dbA", None).unwrap() {
            Readout::Keys { db, keys } => {
                assert_eq!("dbA", db);
                let got: Vec<(String, u64)> = keys.into_iter().collect();
                assert_eq!(expected, got);
            }
            Readout::Record { .. } => panic!("expected a listing"),
        }
    }
}

#[test]
fn repair_with_nothing_accepted_settles_empty() {
    let root = test_root(module_path!(), line!());
    let acceptors = acceptors(&root);
    let full = cluster(&acceptors);
    writer::put(&full, "dbA", "s", "k", 1, json!(1)).unwrap();
    // A promise-only round leaves no finalized record; the repair path has nothing to
    // propose and the read settles on Empty.
    let promise = PaxosRequest {
        db: "dbA".to_owned(),
        key: "ghost".to_owned(),
        version: 1,
        seq: seq_now() - 3,
        phase: PaxosPhase::Promise,
    };
    full.paxos(&promise).unwrap();
    proposer::propose(&full, "dbA", "ghost", 1, None).unwrap();
    let readout = reader::get(&full, "dbA", Some("ghost")).unwrap();
    assert_eq!((None, None), record_of(&readout));
}
