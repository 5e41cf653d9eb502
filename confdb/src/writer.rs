//! The write protocol.  Writers prove knowledge of the db's secret against a credential record
//! stored at (db, key=db) and maintained through the same Paxos rounds as everything else.

use std::fmt::Write as _;

use biometrics::{Collector, Counter};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use zerror_core::ErrorCore;

use confdb_pb::Error;

use crate::proposer;
use crate::quorum::QuorumClient;
use crate::reader::{self, Readout};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PUT: Counter = Counter::new("confdb.writer.put");
static BOOTSTRAP: Counter = Counter::new("confdb.writer.bootstrap");
static ROTATE: Counter = Counter::new("confdb.writer.rotate");
static AUTHENTICATION_FAILED: Counter = Counter::new("confdb.writer.authentication_failed");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&PUT);
    collector.register_counter(&BOOTSTRAP);
    collector.register_counter(&ROTATE);
    collector.register_counter(&AUTHENTICATION_FAILED);
}

///////////////////////////////////////////// credential ///////////////////////////////////////////

type HmacSha256 = Hmac<Sha256>;

/// hex(HMAC-SHA256(secret, msg)):  the proof a writer knows the db's secret without the secret
/// ever resting on a server.
pub fn credential_hmac(secret: &str, msg: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(msg.as_bytes());
    let tag = mac.finalize().into_bytes();
    let mut hex = String::with_capacity(2 * tag.len());
    for byte in tag {
        write!(hex, "{:02x}", byte).expect("unable to write to string");
    }
    hex
}

fn fresh_guid() -> Result<String, Error> {
    match one_two_eight::urandom() {
        Some(id) => Ok(one_two_eight::encode(&id)),
        None => Err(Error::system_error("could not read /dev/urandom")),
    }
}

fn credential(secret: &str) -> Result<Value, Error> {
    let guid = fresh_guid()?;
    let hmac = credential_hmac(secret, &guid);
    Ok(json!({ "guid": guid, "hmac": hmac }))
}

fn read_credential(cluster: &QuorumClient, db: &str) -> Option<Value> {
    match reader::get(cluster, db, Some(db)) {
        Ok(Readout::Record {
            value: Some(value), ..
        }) => Some(value),
        _ => None,
    }
}

fn parse_credential(value: &Value) -> Result<(String, String), Error> {
    let guid = value.get("guid").and_then(Value::as_str);
    let hmac = value.get("hmac").and_then(Value::as_str);
    match (guid, hmac) {
        (Some(guid), Some(hmac)) => Ok((guid.to_owned(), hmac.to_owned())),
        _ => Err(Error::invalid_value(
            "credential record is not a {guid, hmac} object",
        )),
    }
}

/////////////////////////////////////////////// put ////////////////////////////////////////////////

/// Authenticate against the db's credential, then run a round for (db, key, version) and return
/// a fresh read.  The returned version can exceed the requested one if a concurrent writer won;
/// Paxos guarantees whatever comes back is final.
pub fn put(
    cluster: &QuorumClient,
    db: &str,
    secret: &str,
    key: &str,
    version: u64,
    mut obj: Value,
) -> Result<Readout, Error> {
    PUT.click();
    let stored = match read_credential(cluster, db) {
        Some(stored) => stored,
        None => {
            // First contact:  install a credential.  A writer racing us may win the round
            // with its own guid; whichever Paxos chose is what we re-read and check below.
            BOOTSTRAP.click();
            let cred = credential(secret)?;
            proposer::propose(cluster, db, db, 0, Some(&cred))?;
            match read_credential(cluster, db) {
                Some(stored) => stored,
                None => {
                    return Err(Error::AuthenticationFailed {
                        core: ErrorCore::default(),
                    });
                }
            }
        }
    };
    let (guid, hmac) = parse_credential(&stored)?;
    if hmac != credential_hmac(secret, &guid) {
        AUTHENTICATION_FAILED.click();
        return Err(Error::AuthenticationFailed {
            core: ErrorCore::default(),
        });
    }
    if db == key {
        // Rotating the credential:  the caller's value is the new secret.
        ROTATE.click();
        let new_secret = obj.as_str().ok_or_else(|| {
            Error::invalid_value("credential rotation takes the new secret as a JSON string")
        })?;
        obj = credential(new_secret)?;
    }
    proposer::propose(cluster, db, key, version, Some(&obj))?;
    reader::get(cluster, db, Some(key))
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_matches_rfc4231_case_two() {
        assert_eq!(
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843",
            credential_hmac("Jefe", "what do ya want for nothing?"),
        );
    }

    #[test]
    fn hmac_depends_on_both_inputs() {
        let base = credential_hmac("secret", "guid");
        assert_ne!(base, credential_hmac("secret2", "guid"));
        assert_ne!(base, credential_hmac("secret", "guid2"));
        assert_eq!(base, credential_hmac("secret", "guid"));
    }

    #[test]
    fn guids_are_uuid_shaped() {
        let guid = fresh_guid().unwrap();
        assert_eq!(36, guid.len());
        assert_ne!(guid, fresh_guid().unwrap());
    }

    #[test]
    fn credentials_verify() {
        let cred = credential("secret").unwrap();
        let (guid, hmac) = parse_credential(&cred).unwrap();
        assert_eq!(hmac, credential_hmac("secret", &guid));
        assert_ne!(hmac, credential_hmac("other", &guid));
    }
}
