//! Serve one ConfDB cluster member:  the acceptor for this node's stores and a proxy that runs
//! whole reads and writes against the cluster.

use std::fs::File;
use std::sync::Arc;
use std::time::SystemTime;

use arrrg::CommandLine;
use biometrics::{Collector, PlainTextEmitter};
use indicio::{clue, stdio::StdioEmitter, ALWAYS, INFO};

use confdb::{Acceptor, Peer, Proxy, QuorumClient};
use confdb_pb::{AcceptorClient, AcceptorServer, IoToZ, ProxyServer, ServiceRegistry};
use confdb_rpc::{new_client, Server, ServerOptions, SslOptions};

#[derive(Debug, Default, Eq, PartialEq, arrrg_derive::CommandLine)]
struct Options {
    #[arrrg(nested)]
    ssl: SslOptions,
    #[arrrg(nested)]
    server: ServerOptions,
    #[arrrg(required, "Directory under which per-db stores live.")]
    data: String,
    #[arrrg(required, "Comma-separated list of every cluster member in host:port form.")]
    servers: String,
    #[arrrg(optional, "Quorum override; may raise the majority, never lower it.")]
    quorum: usize,
}

fn main() {
    minimal_signals::block();
    let (options, free) = Options::from_command_line("Usage: confdb-server [OPTIONS]");
    if !free.is_empty() {
        eprintln!("command takes no arguments");
        std::process::exit(1);
    }
    // indicio
    confdb::COLLECTOR.register(Arc::new(StdioEmitter));
    confdb::COLLECTOR.set_verbosity(INFO);
    confdb_rpc::COLLECTOR.register(Arc::new(StdioEmitter));
    confdb_rpc::COLLECTOR.set_verbosity(INFO);
    clue!(confdb::COLLECTOR, ALWAYS, {
        new_process: std::env::args().map(String::from).collect::<Vec<_>>(),
    });
    // biometrics
    std::thread::spawn(|| {
        let collector = Collector::new();
        confdb::register_biometrics(&collector);
        confdb_rpc::register_biometrics(&collector);
        let fout = File::create("/dev/stdout").unwrap();
        let mut emit = PlainTextEmitter::new(fout);
        loop {
            let now = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .expect("clock should never fail")
                .as_millis()
                .try_into()
                .expect("millis since epoch should fit u64");
            if let Err(e) = collector.emit(&mut emit, now) {
                eprintln!("collector error: {}", e);
            }
            std::thread::sleep(std::time::Duration::from_millis(249));
        }
    });
    // the cluster as this node sees it
    let mut peers = Vec::new();
    for server in options.servers.split(',') {
        let client = new_client(options.ssl.clone(), server);
        peers.push(Peer::new(server, Arc::new(AcceptorClient::new(client))));
    }
    let cluster = Arc::new(QuorumClient::new(peers, options.quorum));
    // services
    let mut services = ServiceRegistry::new();
    services.register("AcceptorService", AcceptorServer::wrap(Acceptor::new(&options.data)));
    services.register("ProxyService", ProxyServer::wrap(Proxy::new(cluster)));
    // server
    let server = Server::new(options.ssl, options.server, services);
    let _ = std::thread::spawn(move || {
        loop {
            let signal_set = minimal_signals::SignalSet::new().fill();
            let signal = minimal_signals::wait(signal_set);
            if signal != Some(minimal_signals::SIGCHLD) {
                break;
            }
        }
        clue!(confdb::COLLECTOR, ALWAYS, {
            goodbye: std::env::args().map(String::from).collect::<Vec<_>>(),
        });
        std::process::exit(0);
    });
    server.serve().as_z().pretty_unwrap();
}
