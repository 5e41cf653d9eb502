//! The per-db acceptor table.  One append-only log file per db, replayed into memory on open.
//! Appending a [LogEntry] and syncing it is the commit point; a caller that decides not to
//! append has rolled back for free.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{create_dir_all, remove_file, rename, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use biometrics::{Collector, Counter};
use buffertk::{stack_pack, v64, Packable, Unpackable};
use prototk_derive::Message;
use sha2::{Digest, Sha256};
use tatl::{HeyListen, Stationary};
use utilz::lockfile::Lockfile;
use zerror_core::ErrorCore;

use confdb_pb::{Error, Preamble};

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// Rewrite the log once it holds this many bytes per live byte.
const LOG_ROLLOVER_RATIO: u64 = 2;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static LOCK_OBTAINED: Counter = Counter::new("confdb.store.lock_obtained");
static LOCK_NOT_OBTAINED: Counter = Counter::new("confdb.store.lock_not_obtained");
static LOCK_NOT_OBTAINED_MONITOR: Stationary =
    Stationary::new("confdb.store.lock_not_obtained", &LOCK_NOT_OBTAINED);

static APPLY: Counter = Counter::new("confdb.store.apply");
static ROLLOVER: Counter = Counter::new("confdb.store.rollover");

static TORN_TAIL: Counter = Counter::new("confdb.store.torn_tail");
static TORN_TAIL_MONITOR: Stationary = Stationary::new("confdb.store.torn_tail", &TORN_TAIL);

static CORRUPTION: Counter = Counter::new("confdb.store.corruption");
static CORRUPTION_MONITOR: Stationary = Stationary::new("confdb.store.corruption", &CORRUPTION);

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&LOCK_OBTAINED);
    collector.register_counter(&LOCK_NOT_OBTAINED);
    collector.register_counter(&APPLY);
    collector.register_counter(&ROLLOVER);
    collector.register_counter(&TORN_TAIL);
    collector.register_counter(&CORRUPTION);
}

pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&LOCK_NOT_OBTAINED_MONITOR);
    hey_listen.register_stationary(&TORN_TAIL_MONITOR);
    hey_listen.register_stationary(&CORRUPTION_MONITOR);
}

/////////////////////////////////////////////// paths //////////////////////////////////////////////

/// The store file for a db.  Db names hash into a two-level fan-out so that no directory grows
/// with the number of dbs.
pub fn store_path<P: AsRef<Path>>(root: P, db: &str) -> PathBuf {
    let digest = Sha256::digest(db.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        write!(hex, "{:02x}", byte).expect("unable to write to string");
    }
    root.as_ref()
        .join("paxosdb")
        .join(&hex[0..3])
        .join(&hex[3..6])
        .join(format!("{}.store", hex))
}

fn lockfile_path(store: &Path) -> PathBuf {
    let mut path = store.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

fn tmp_path(store: &Path) -> PathBuf {
    let mut path = store.as_os_str().to_owned();
    path.push(".tmp");
    PathBuf::from(path)
}

////////////////////////////////////////////// Record //////////////////////////////////////////////

/// One Paxos instance's durable state.  The value is non-empty iff accepted_seq is positive.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Record {
    #[prototk(1, string)]
    pub key: String,
    #[prototk(2, uint64)]
    pub version: u64,
    #[prototk(3, uint64)]
    pub promised_seq: u64,
    #[prototk(4, uint64)]
    pub accepted_seq: u64,
    #[prototk(5, bytes)]
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
struct RecordKey {
    #[prototk(1, string)]
    key: String,
    #[prototk(2, uint64)]
    version: u64,
}

///////////////////////////////////////////// LogEntry /////////////////////////////////////////////

/// One committed transaction.  Within an entry, deletes are applied after puts, matching the
/// accept-then-prune order of the Paxos accept path.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
struct LogEntry {
    #[prototk(1, message)]
    puts: Vec<Record>,
    #[prototk(2, message)]
    dels: Vec<RecordKey>,
}

/////////////////////////////////////////////// Edit ///////////////////////////////////////////////

/// An edit puts some records and deletes others.
#[derive(Debug, Default)]
pub struct Edit {
    entry: LogEntry,
}

impl Edit {
    pub fn put(&mut self, record: Record) {
        self.entry.puts.push(record);
    }

    pub fn del(&mut self, key: &str, version: u64) {
        self.entry.dels.push(RecordKey {
            key: key.to_owned(),
            version,
        });
    }
}

////////////////////////////////////////////// Parsed //////////////////////////////////////////////

enum Parsed {
    Entry(LogEntry, usize),
    Torn,
    Corrupt(String),
}

/////////////////////////////////////////////// Store //////////////////////////////////////////////

/// A Store holds every acceptor record for one db.
pub struct Store {
    path: PathBuf,
    _lockfile: Lockfile,
    log: File,
    log_bytes: u64,
    records: BTreeMap<(String, u64), Record>,
    poison: Option<Error>,
}

impl Store {
    /// Open the store for `db` under `root`, creating it if this is the db's first contact.
    pub fn open<P: AsRef<Path>>(root: P, db: &str) -> Result<Self, Error> {
        let path = store_path(root, db);
        if let Some(dir) = path.parent() {
            create_dir_all(dir)?;
        }
        Self::open_path(path)
    }

    /// Open the store for `db` only if a previous Paxos call created it.
    pub fn open_existing<P: AsRef<Path>>(root: P, db: &str) -> Result<Self, Error> {
        let path = store_path(root, db);
        if !path.is_file() {
            return Err(Error::NotInitialized {
                core: ErrorCore::default(),
                db: db.to_owned(),
            });
        }
        Self::open_path(path)
    }

    fn open_path(path: PathBuf) -> Result<Self, Error> {
        let lockfile = match Lockfile::lock(lockfile_path(&path))? {
            Some(lockfile) => {
                LOCK_OBTAINED.click();
                lockfile
            }
            None => {
                LOCK_NOT_OBTAINED.click();
                return Err(Error::LockNotObtained {
                    core: ErrorCore::default(),
                    path: lockfile_path(&path).to_string_lossy().to_string(),
                });
            }
        };
        let (records, log_bytes) = Self::replay(&path)?;
        let log = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            _lockfile: lockfile,
            log,
            log_bytes,
            records,
            poison: None,
        })
    }

    /// Look up one record.
    pub fn get(&self, key: &str, version: u64) -> Option<&Record> {
        self.records.get(&(key.to_owned(), version))
    }

    /// Every version this key has a record for, accepted or merely promised.
    pub fn versions(&self, key: &str) -> Vec<u64> {
        self.records
            .range((key.to_owned(), 0)..=(key.to_owned(), u64::MAX))
            .map(|((_, version), _)| *version)
            .collect()
    }

    /// Every finalized (key, version) in this db.
    pub fn list_finalized(&self) -> Vec<(String, u64)> {
        self.records
            .values()
            .filter(|r| r.accepted_seq > 0)
            .map(|r| (r.key.clone(), r.version))
            .collect()
    }

    /// The finalized record with the highest version for this key.
    pub fn latest_finalized(&self, key: &str) -> Option<&Record> {
        self.records
            .range((key.to_owned(), 0)..=(key.to_owned(), u64::MAX))
            .map(|(_, record)| record)
            .filter(|r| r.accepted_seq > 0)
            .next_back()
    }

    /// The record at exactly (key, version), if finalized.
    pub fn finalized_at(&self, key: &str, version: u64) -> Option<&Record> {
        self.get(key, version).filter(|r| r.accepted_seq > 0)
    }

    /// Apply an edit to the store.  The edit is committed once this returns Ok.
    pub fn apply(&mut self, edit: Edit) -> Result<(), Error> {
        if let Some(poison) = &self.poison {
            return Err(poison.clone());
        }
        APPLY.click();
        let body = stack_pack(&edit.entry).to_vec();
        let pre = Preamble::for_message(&body);
        let pre_sz: v64 = pre.pack_sz().into();
        assert!(pre.pack_sz() < 128);
        let header = stack_pack(pre_sz).pack(pre).to_vec();
        let res = self.log.write_all(&header);
        self.poison(res)?;
        let res = self.log.write_all(&body);
        self.poison(res)?;
        let res = self.log.flush();
        self.poison(res)?;
        let res = self.log.sync_data();
        self.poison(res)?;
        Self::absorb(&mut self.records, edit.entry);
        self.log_bytes += (header.len() + body.len()) as u64;
        if self.log_bytes > LOG_ROLLOVER_RATIO * self.live_bytes() {
            self.rollover()?;
        }
        Ok(())
    }

    /// Rewrite the log as a single snapshot transaction.
    pub fn rollover(&mut self) -> Result<(), Error> {
        ROLLOVER.click();
        let entry = LogEntry {
            puts: self.records.values().cloned().collect(),
            dels: Vec::new(),
        };
        let body = stack_pack(&entry).to_vec();
        let pre = Preamble::for_message(&body);
        let pre_sz: v64 = pre.pack_sz().into();
        let header = stack_pack(pre_sz).pack(pre).to_vec();
        let tmp = tmp_path(&self.path);
        if tmp.exists() {
            let res = remove_file(&tmp);
            self.poison(res)?;
        }
        let res = File::create(&tmp);
        let mut fout = self.poison(res)?;
        let res = fout.write_all(&header);
        self.poison(res)?;
        let res = fout.write_all(&body);
        self.poison(res)?;
        let res = fout.sync_data();
        self.poison(res)?;
        let res = rename(&tmp, &self.path);
        self.poison(res)?;
        let res = OpenOptions::new().append(true).open(&self.path);
        self.log = self.poison(res)?;
        self.log_bytes = (header.len() + body.len()) as u64;
        Ok(())
    }

    fn live_bytes(&self) -> u64 {
        self.records.values().map(|r| r.pack_sz() as u64).sum()
    }

    fn absorb(records: &mut BTreeMap<(String, u64), Record>, entry: LogEntry) {
        for record in entry.puts {
            records.insert((record.key.clone(), record.version), record);
        }
        for del in entry.dels {
            records.remove(&(del.key, del.version));
        }
    }

    fn replay(path: &Path) -> Result<(BTreeMap<(String, u64), Record>, u64), Error> {
        if path.is_dir() {
            return Err(Error::corruption("store file is a directory"));
        }
        let mut records = BTreeMap::new();
        if !path.is_file() {
            return Ok((records, 0));
        }
        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;
        let mut consumed = 0usize;
        while consumed < buf.len() {
            match Self::parse_entry(&buf[consumed..]) {
                Parsed::Entry(entry, sz) => {
                    Self::absorb(&mut records, entry);
                    consumed += sz;
                }
                Parsed::Torn => {
                    // A torn tail never committed.  Drop it.
                    TORN_TAIL.click();
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(consumed as u64)?;
                    file.sync_data()?;
                    break;
                }
                Parsed::Corrupt(what) => {
                    CORRUPTION.click();
                    return Err(Error::corruption(format!(
                        "{} at offset {}",
                        what, consumed
                    )));
                }
            }
        }
        Ok((records, consumed as u64))
    }

    fn parse_entry(buf: &[u8]) -> Parsed {
        let pre_sz = buf[0] as usize;
        if pre_sz >= 128 {
            return Parsed::Corrupt("preamble length does not fit one varint byte".to_owned());
        }
        if buf.len() < 1 + pre_sz {
            return Parsed::Torn;
        }
        let pre = match Preamble::unpack(&buf[1..1 + pre_sz]) {
            Ok((pre, _)) => pre,
            Err(_) => {
                return Parsed::Corrupt("unparseable preamble".to_owned());
            }
        };
        let length = pre.length as usize;
        if buf.len() < 1 + pre_sz + length {
            return Parsed::Torn;
        }
        let body = &buf[1 + pre_sz..1 + pre_sz + length];
        if !pre.verifies(body) {
            // Indistinguishable from a torn write only when nothing follows.
            if buf.len() == 1 + pre_sz + length {
                return Parsed::Torn;
            }
            return Parsed::Corrupt("checksum mismatch".to_owned());
        }
        match LogEntry::unpack(body) {
            Ok((entry, _)) => Parsed::Entry(entry, 1 + pre_sz + length),
            Err(_) => Parsed::Corrupt("unparseable log entry".to_owned()),
        }
    }

    fn poison<T, E>(&mut self, res: Result<T, E>) -> Result<T, Error>
    where
        Error: From<E>,
    {
        match res {
            Ok(t) => Ok(t),
            Err(e) => {
                if self.poison.is_none() {
                    self.poison = Some(e.into());
                }
                Err(self.poison.as_ref().unwrap().clone())
            }
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::fs::{metadata, remove_dir_all, OpenOptions};

    use guacamole::Guacamole;
    use proptest::prelude::*;

    use super::*;

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

    fn record(key: &str, version: u64, promised: u64, accepted: u64, value: &[u8]) -> Record {
        Record {
            key: key.to_owned(),
            version,
            promised_seq: promised,
            accepted_seq: accepted,
            value: value.to_vec(),
        }
    }

    #[test]
    fn store_path_fans_out() {
        let path = store_path("/data", "dbA");
        let display = path.to_string_lossy();
        assert!(display.starts_with("/data/paxosdb/"));
        assert!(display.ends_with(".store"));
        let components: Vec<_> = path.components().collect();
        // /data/paxosdb/xxx/yyy/<64 hex>.store
        assert_eq!(6, components.len());
        assert_eq!(store_path("/data", "dbA"), path);
        assert_ne!(store_path("/data", "dbB"), path);
    }

    #[test]
    fn open_existing_requires_first_contact() {
        let root = test_root(module_path!(), line!());
        if let Err(Error::NotInitialized { .. }) = Store::open_existing(&root, "dbA") {
        } else {
            panic!("bad case");
        }
        drop(Store::open(&root, "dbA").unwrap());
        Store::open_existing(&root, "dbA").unwrap();
    }

    #[test]
    fn records_survive_reopen() {
        let root = test_root(module_path!(), line!());
        let mut store = Store::open(&root, "dbA").unwrap();
        let mut edit = Edit::default();
        edit.put(record("k", 1, 10, 10, b"payload"));
        store.apply(edit).unwrap();
        drop(store);
        let store = Store::open(&root, "dbA").unwrap();
        assert_eq!(
            Some(&record("k", 1, 10, 10, b"payload")),
            store.get("k", 1)
        );
    }

    #[test]
    fn dels_win_within_one_edit() {
        let root = test_root(module_path!(), line!());
        let mut store = Store::open(&root, "dbA").unwrap();
        let mut edit = Edit::default();
        edit.put(record("k", 1, 10, 10, b"old"));
        store.apply(edit).unwrap();
        let mut edit = Edit::default();
        edit.put(record("k", 1, 11, 11, b"new"));
        edit.del("k", 1);
        store.apply(edit).unwrap();
        assert_eq!(None, store.get("k", 1));
    }

    #[test]
    fn finalized_views() {
        let root = test_root(module_path!(), line!());
        let mut store = Store::open(&root, "dbA").unwrap();
        let mut edit = Edit::default();
        edit.put(record("k", 1, 10, 10, b"one"));
        edit.put(record("k", 2, 11, 0, b""));
        edit.put(record("l", 1, 12, 12, b"ell"));
        store.apply(edit).unwrap();
        assert_eq!(
            vec![("k".to_owned(), 1), ("l".to_owned(), 1)],
            store.list_finalized()
        );
        assert_eq!(Some(&record("k", 1, 10, 10, b"one")), store.latest_finalized("k"));
        assert_eq!(Some(&record("k", 1, 10, 10, b"one")), store.finalized_at("k", 1));
        assert_eq!(None, store.finalized_at("k", 2));
        assert_eq!(vec![1, 2], store.versions("k"));
    }

    #[test]
    fn torn_tail_truncated() {
        let root = test_root(module_path!(), line!());
        let mut store = Store::open(&root, "dbA").unwrap();
        let mut edit = Edit::default();
        edit.put(record("k", 1, 10, 10, b"payload"));
        store.apply(edit).unwrap();
        let path = store_path(&root, "dbA");
        let good = metadata(&path).unwrap().len();
        drop(store);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[9, 1, 2]).unwrap();
        drop(file);
        let store = Store::open(&root, "dbA").unwrap();
        assert_eq!(
            Some(&record("k", 1, 10, 10, b"payload")),
            store.get("k", 1)
        );
        assert_eq!(good, metadata(&path).unwrap().len());
    }

    #[test]
    fn corruption_mid_log_fails_open() {
        let root = test_root(module_path!(), line!());
        let mut store = Store::open(&root, "dbA").unwrap();
        for i in 0..2 {
            let mut edit = Edit::default();
            edit.put(record("k", i, 10 + i, 10 + i, b"payload"));
            store.apply(edit).unwrap();
        }
        drop(store);
        let path = store_path(&root, "dbA");
        let mut buf = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut buf).unwrap();
        // Flip a byte inside the first entry's body.
        let idx = 1 + buf[0] as usize + 2;
        buf[idx] ^= 0xff;
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap()
            .write_all(&buf)
            .unwrap();
        if let Err(Error::Corruption { .. }) = Store::open(&root, "dbA") {
        } else {
            panic!("bad case");
        }
    }

    #[test]
    fn rollover_compacts() {
        let root = test_root(module_path!(), line!());
        let mut store = Store::open(&root, "dbA").unwrap();
        // Repeatedly overwrite one record; dead log space forces rollover.
        for i in 1..100u64 {
            let mut edit = Edit::default();
            edit.put(record("k", 1, i, i, &vec![0xabu8; 256]));
            store.apply(edit).unwrap();
        }
        let path = store_path(&root, "dbA");
        let len = metadata(&path).unwrap().len();
        assert!(len < 3 * 300, "log did not compact: {} bytes", len);
        drop(store);
        let store = Store::open(&root, "dbA").unwrap();
        assert_eq!(99, store.get("k", 1).unwrap().accepted_seq);
    }

    #[test]
    fn lockfile_excludes_second_opener() {
        let root = test_root(module_path!(), line!());
        let store = Store::open(&root, "dbA").unwrap();
        if let Err(Error::LockNotObtained { .. }) = Store::open(&root, "dbA") {
        } else {
            panic!("bad case");
        }
        drop(store);
        Store::open(&root, "dbA").unwrap();
    }

    #[test]
    fn random_workload_survives_reopens() {
        let root = test_root(module_path!(), line!());
        let mut guac = Guacamole::new(0x1eaf);
        let mut model: BTreeMap<(String, u64), Record> = BTreeMap::new();
        let mut store = Store::open(&root, "dbA").unwrap();
        for i in 0..500u64 {
            let mut byte = [0u8; 1];
            guac.generate(&mut byte);
            let key = format!("key-{}", byte[0] % 7);
            let version = u64::from(byte[0] % 3);
            let mut edit = Edit::default();
            if byte[0] % 11 == 0 {
                edit.del(&key, version);
                model.remove(&(key.clone(), version));
            } else {
                let rec = record(&key, version, i + 1, i + 1, &byte);
                model.insert((key.clone(), version), rec.clone());
                edit.put(rec);
            }
            store.apply(edit).unwrap();
            if byte[0] % 17 == 0 {
                drop(store);
                store = Store::open(&root, "dbA").unwrap();
            }
        }
        drop(store);
        let store = Store::open(&root, "dbA").unwrap();
        for ((key, version), rec) in model.iter() {
            assert_eq!(Some(rec), store.get(key, *version));
        }
        assert_eq!(model.len(), store.versions("key-0").len()
            + store.versions("key-1").len()
            + store.versions("key-2").len()
            + store.versions("key-3").len()
            + store.versions("key-4").len()
            + store.versions("key-5").len()
            + store.versions("key-6").len());
    }

    proptest! {
        #[test]
        fn absorb_matches_model(ops in proptest::collection::vec(
            (0u8..3, 0u64..4, 0u64..100), 0..64)
        ) {
            let mut records = BTreeMap::new();
            let mut model: BTreeMap<(String, u64), Record> = BTreeMap::new();
            for (op, version, seq) in ops {
                let key = format!("k{}", op);
                let mut entry = LogEntry::default();
                if op == 2 {
                    entry.dels.push(RecordKey { key: key.clone(), version });
                    model.remove(&(key.clone(), version));
                } else {
                    let rec = record(&key, version, seq, seq, b"v");
                    entry.puts.push(rec.clone());
                    model.insert((key.clone(), version), rec);
                }
                Store::absorb(&mut records, entry);
            }
            prop_assert_eq!(model, records);
        }
    }
}
