//! User values travel and rest as gzip-compressed JSON.  Acceptors never look inside; only the
//! reader and writer decode.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

use confdb_pb::Error;

/// Encode a user value:  serialize as JSON, then gzip.
pub fn encode(obj: &Value) -> Result<Vec<u8>, Error> {
    let json = serde_json::to_vec(obj).map_err(|err| Error::invalid_value(err.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decode a value the acceptors handed back:  gunzip, then parse JSON.
pub fn decode(octets: &[u8]) -> Result<Value, Error> {
    let mut decoder = GzDecoder::new(octets);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|err| Error::invalid_value(format!("not gzip: {}", err)))?;
    serde_json::from_slice(&json).map_err(|err| Error::invalid_value(err.to_string()))
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
