//! Write one (db, key, version) through Paxos, reading the JSON value from stdin, and print
//! the fresh read that results.

use std::sync::Arc;

use arrrg::CommandLine;

use confdb::{writer, Peer, QuorumClient};
use confdb_pb::{AcceptorClient, IoToZ};
use confdb_rpc::{new_client, SslOptions};

#[derive(Debug, Default, Eq, PartialEq, arrrg_derive::CommandLine)]
struct Options {
    #[arrrg(nested)]
    ssl: SslOptions,
    #[arrrg(required, "Comma-separated list of every cluster member in host:port form.")]
    servers: String,
    #[arrrg(optional, "Quorum override; may raise the majority, never lower it.")]
    quorum: usize,
    #[arrrg(required, "Db to write.")]
    db: String,
    #[arrrg(required, "The db's shared secret.")]
    secret: String,
    #[arrrg(required, "Key to write.")]
    key: String,
    #[arrrg(required, "Version to write.")]
    version: u64,
}

fn main() {
    let (options, free) = Options::from_command_line("Usage: confdb-put [OPTIONS] < value.json");
    if !free.is_empty() {
        eprintln!("command takes no arguments");
        std::process::exit(1);
    }
    let input = std::io::read_to_string(std::io::stdin()).expect("could not read stdin");
    let obj: serde_json::Value = match serde_json::from_str(input.trim()) {
        Ok(obj) => obj,
        Err(err) => {
            eprintln!("value on stdin is not json: {}", err);
            std::process::exit(1);
        }
    };
    let mut peers = Vec::new();
    for server in options.servers.split(',') {
        let client = new_client(options.ssl.clone(), server);
        peers.push(Peer::new(server, Arc::new(AcceptorClient::new(client))));
    }
    let cluster = QuorumClient::new(peers, options.quorum);
    let readout = writer::put(
        &cluster,
        &options.db,
        &options.secret,
        &options.key,
        options.version,
        obj,
    )
    .as_z()
    .pretty_unwrap();
    println!(
        "{}",
        serde_json::to_string_pretty(&readout.to_json()).expect("readout is always json")
    );
}
