//! ProxyService runs whole reads and writes against this server's own quorum client, so every
//! cluster member serves the same surface a local command line would.

use std::sync::Arc;

use serde_json::Value;

use confdb_pb::{
    Context, Error, GetQuery, GetRequest, GetResponse, KeyVersion, ProxyService, PutRequest,
};

use crate::quorum::QuorumClient;
use crate::reader::{self, Readout};
use crate::writer;

/////////////////////////////////////////////// Proxy //////////////////////////////////////////////

pub struct Proxy {
    cluster: Arc<QuorumClient>,
}

impl Proxy {
    pub fn new(cluster: Arc<QuorumClient>) -> Self {
        Self { cluster }
    }
}

impl ProxyService for Proxy {
    fn get(&self, _: &Context, req: GetRequest) -> Result<GetResponse, Error> {
        let key = match &req.query {
            GetQuery::All => None,
            GetQuery::Key { key } => Some(key.as_str()),
        };
        readout_to_response(reader::get(&self.cluster, &req.db, key)?)
    }

    fn put(&self, _: &Context, req: PutRequest) -> Result<GetResponse, Error> {
        let obj: Value = serde_json::from_slice(&req.value)
            .map_err(|err| Error::invalid_value(err.to_string()))?;
        readout_to_response(writer::put(
            &self.cluster,
            &req.db,
            &req.secret,
            &req.key,
            req.version,
            obj,
        )?)
    }
}

fn readout_to_response(readout: Readout) -> Result<GetResponse, Error> {
    Ok(match readout {
        Readout::Keys { db, keys } => GetResponse::Keys {
            db,
            keys: keys
                .into_iter()
                .map(|(key, version)| KeyVersion { key, version })
                .collect(),
        },
        Readout::Record {
            db,
            key,
            version: Some(version),
            value: Some(value),
        } => GetResponse::Record {
            db,
            key,
            version,
            value: serde_json::to_vec(&value)
                .map_err(|err| Error::invalid_value(err.to_string()))?,
        },
        Readout::Record { db, key, .. } => GetResponse::Missing { db, key },
    })
}
