//! Read one key (or list every key) from a ConfDB cluster and print the result as JSON.

use std::sync::Arc;

use arrrg::CommandLine;

use confdb::{reader, Peer, QuorumClient};
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
    #[arrrg(required, "Db to read.")]
    db: String,
    #[arrrg(optional, "Key to read; omit to list every key.")]
    key: Option<String>,
}

fn main() {
    let (options, free) = Options::from_command_line("Usage: confdb-get [OPTIONS]");
    if !free.is_empty() {
        eprintln!("command takes no arguments");
        std::process::exit(1);
    }
    let mut peers = Vec::new();
    for server in options.servers.split(',') {
        let client = new_client(options.ssl.clone(), server);
        peers.push(Peer::new(server, Arc::new(AcceptorClient::new(client))));
    }
    let cluster = QuorumClient::new(peers, options.quorum);
    let readout = reader::get(&cluster, &options.db, options.key.as_deref())
        .as_z()
        .pretty_unwrap();
    println!(
        "{}",
        serde_json::to_string_pretty(&readout.to_json()).expect("readout is always json")
    );
}
