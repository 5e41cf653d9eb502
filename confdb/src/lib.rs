#![doc = include_str!("../README.md")]

use biometrics::Collector;
use tatl::HeyListen;

pub mod acceptor;
pub mod proposer;
pub mod proxy;
pub mod quorum;
pub mod reader;
pub mod store;
pub mod value;
pub mod writer;

pub use acceptor::Acceptor;
pub use proxy::Proxy;
pub use quorum::{Peer, QuorumClient};
pub use reader::Readout;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    acceptor::register_biometrics(collector);
    proposer::register_biometrics(collector);
    quorum::register_biometrics(collector);
    reader::register_biometrics(collector);
    store::register_biometrics(collector);
    writer::register_biometrics(collector);
}

/// Register the monitors for this crate.
pub fn register_monitors(hey_listen: &mut HeyListen) {
    store::register_monitors(hey_listen);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();
