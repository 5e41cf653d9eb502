use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use biometrics::{Collector, Counter};
use boring::ssl::{SslConnector, SslFiletype, SslMethod};
use buffertk::{stack_pack, Unpackable};
use zerror_core::ErrorCore;

use confdb_pb::{Envelope, Error, Invoked, Reply, Status, Verdict, MAX_MESSAGE_SIZE};

use super::channel::{hostname_or_ip, Channel};
use super::SslOptions;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// How long one call may sit on the wire.  A peer that blows this deadline counts as failed for
/// quorum purposes; Paxos repairs whatever it half-did.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CONNECT: Counter = Counter::new("confdb.rpc.client.connect");
static CONNECT_ERROR: Counter = Counter::new("confdb.rpc.client.connect.error");
static CALL: Counter = Counter::new("confdb.rpc.client.call");
static KILL_CHANNEL: Counter = Counter::new("confdb.rpc.client.channel.kill");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&CONNECT);
    collector.register_counter(&CONNECT_ERROR);
    collector.register_counter(&CALL);
    collector.register_counter(&KILL_CHANNEL);
}

////////////////////////////////////////////// Client //////////////////////////////////////////////

/// A client for one host.  The channel is established lazily and carries one call at a time;
/// concurrency across hosts comes from holding one client per host.
struct Client {
    options: SslOptions,
    connect: String,
    tickets: AtomicU64,
    channel: Mutex<Option<Channel>>,
}

impl Client {
    fn establish(&self) -> Result<Channel, Error> {
        let mut builder = SslConnector::builder(SslMethod::tls()).map_err(|err| {
            Error::EncryptionMisconfiguration {
                core: ErrorCore::default(),
                what: format!("could not build connector builder: {}", err),
            }
        })?;
        builder
            .set_ca_file(&self.options.ca_file)
            .map_err(|err| Error::EncryptionMisconfiguration {
                core: ErrorCore::default(),
                what: format!("invalid CA file: {}", err),
            })?;
        builder
            .set_private_key_file(&self.options.private_key_file, SslFiletype::PEM)
            .map_err(|err| Error::EncryptionMisconfiguration {
                core: ErrorCore::default(),
                what: format!("invalid private key: {}", err),
            })?;
        builder
            .set_certificate_file(&self.options.certificate_file, SslFiletype::PEM)
            .map_err(|err| Error::EncryptionMisconfiguration {
                core: ErrorCore::default(),
                what: format!("invalid certificate: {}", err),
            })?;
        let connector = builder.build();
        let stream = TcpStream::connect(&self.connect).map_err(|err| {
            CONNECT_ERROR.click();
            Error::transport_failure(format!("{}: {}", self.connect, err))
        })?;
        stream.set_read_timeout(Some(CALL_TIMEOUT))?;
        stream.set_write_timeout(Some(CALL_TIMEOUT))?;
        let stream = connector
            .connect(hostname_or_ip(&self.connect), stream)
            .map_err(|err| {
                CONNECT_ERROR.click();
                Error::transport_failure(format!("{}: {}", self.connect, err))
            })?;
        CONNECT.click();
        Channel::new(stream)
    }

    fn exchange(chan: &mut Channel, ticket: u64, env_buf: &[u8]) -> Status {
        chan.send(env_buf)?;
        let buf = match chan.recv()? {
            Some(buf) => buf,
            None => {
                return Err(Error::transport_failure("connection closed mid-call"));
            }
        };
        let reply = Reply::unpack(&buf)?.0;
        if reply.ticket != ticket {
            return Err(Error::logic_error(format!(
                "reply ticket {} for call ticket {}",
                reply.ticket, ticket
            )));
        }
        match reply.verdict {
            Verdict::Returned { body } => Ok(Invoked::Returned(body)),
            Verdict::Faulted { error } => Ok(Invoked::Faulted(error)),
            Verdict::Undelivered { error } => Err(error),
            Verdict::Dropped => Err(Error::logic_error("server dropped the call")),
        }
    }
}

impl confdb_pb::Client for Client {
    fn call(&self, service: &str, method: &str, body: &[u8]) -> Status {
        CALL.click();
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(Error::too_large(body.len()));
        }
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let env = Envelope {
            ticket,
            service,
            method,
            body,
        };
        let env_buf = stack_pack(env).to_vec();
        let mut guard = self.channel.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.establish()?);
        }
        // One call at a time per channel; the mutex held across the call is the serialization.
        let chan = guard.as_mut().unwrap();
        let status = Self::exchange(chan, ticket, &env_buf);
        if status.is_err() {
            KILL_CHANNEL.click();
            *guard = None;
        }
        status
    }
}

/// Create a new client for the host at `connect` from the ssl options.
pub fn new_client(
    options: SslOptions,
    connect: impl Into<String>,
) -> Arc<dyn confdb_pb::Client + Send + Sync> {
    Arc::new(Client {
        options,
        connect: connect.into(),
        tickets: AtomicU64::new(1),
        channel: Mutex::new(None),
    })
}
