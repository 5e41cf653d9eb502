use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use biometrics::{Collector, Counter};
use boring::nid::Nid;
use boring::ssl::{SslAcceptor, SslFiletype, SslMethod, SslStream, SslVerifyMode};
use buffertk::{stack_pack, Unpackable};
use indicio::{clue, ERROR, INFO};

use confdb_pb::{Context, Envelope, Error, Invoked, Reply, ServiceRegistry, Verdict};

use super::channel::Channel;
use super::{SslOptions, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static DO_ACCEPT: Counter = Counter::new("confdb.rpc.server.accept");
static ACCEPT_ERROR: Counter = Counter::new("confdb.rpc.server.accept.error");
static HANDLE_RPC: Counter = Counter::new("confdb.rpc.server.handle_rpc");
static HANDLE_RPC_FAILED: Counter = Counter::new("confdb.rpc.server.handle_rpc.error");
static NO_PEER_SUBJECT: Counter = Counter::new("confdb.rpc.server.no_peer_subject");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&DO_ACCEPT);
    collector.register_counter(&ACCEPT_ERROR);
    collector.register_counter(&HANDLE_RPC);
    collector.register_counter(&HANDLE_RPC_FAILED);
    collector.register_counter(&NO_PEER_SUBJECT);
}

/////////////////////////////////////////// ServerOptions //////////////////////////////////////////

/// RPC Server options.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "binaries", derive(arrrg_derive::CommandLine))]
pub struct ServerOptions {
    /// Bind-to this host:port.
    #[cfg_attr(feature = "binaries", arrrg(required, "Host to bind to in host:port format."))]
    pub bind_to: String,
}

impl ServerOptions {
    /// Set the bind_to host.
    pub fn with_bind_to(mut self, bind_to: &str) -> Self {
        bind_to.clone_into(&mut self.bind_to);
        self
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_to: "UNSET".to_string(),
        }
    }
}

impl SslOptions {
    /// Build the SSL acceptor or die trying.  The acceptor demands a peer certificate signed by
    /// the CA, so every connection arrives with a verified identity.
    pub fn must_build_acceptor(&self) -> SslAcceptor {
        let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls()).unwrap();
        acceptor.set_ca_file(&self.ca_file).expect("invalid ca file");
        acceptor
            .set_private_key_file(&self.private_key_file, SslFiletype::PEM)
            .expect("invalid private key");
        acceptor
            .set_certificate_file(&self.certificate_file, SslFiletype::PEM)
            .expect("invalid certificate");
        acceptor.check_private_key().expect("invalid private key");
        acceptor.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        acceptor.build()
    }
}

////////////////////////////////////////////// Server //////////////////////////////////////////////

/// An RPC Server hosts multiple service instances so they may be called.
pub struct Server {
    ssl: SslOptions,
    options: ServerOptions,
    services: Arc<ServiceRegistry>,
}

impl Server {
    /// Create a new server from the options and service registry.
    pub fn new(ssl: SslOptions, options: ServerOptions, services: ServiceRegistry) -> Self {
        Self {
            ssl,
            options,
            services: Arc::new(services),
        }
    }

    /// Serve the server forever.
    pub fn serve(&self) -> Result<(), Error> {
        let acceptor = Arc::new(self.ssl.must_build_acceptor());
        let listener = TcpListener::bind(&self.options.bind_to)
            .map_err(|err| Error::transport_failure(err.to_string()))?;
        clue!(COLLECTOR, INFO, {
            serve: {
                bind_to: &self.options.bind_to,
            },
        });
        'listening: loop {
            let (stream, _) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(err) => {
                    ACCEPT_ERROR.click();
                    clue!(COLLECTOR, ERROR, {
                        accept: {
                            error: err.to_string(),
                        },
                    });
                    continue 'listening;
                }
            };
            let stream = match acceptor.accept(stream) {
                Ok(stream) => stream,
                Err(err) => {
                    ACCEPT_ERROR.click();
                    clue!(COLLECTOR, ERROR, {
                        accept: {
                            tls_error: err.to_string(),
                        },
                    });
                    continue 'listening;
                }
            };
            DO_ACCEPT.click();
            let ctx = Context::default().with_subject(peer_subject(&stream));
            if ctx.subject().is_none() {
                NO_PEER_SUBJECT.click();
            }
            let channel = match Channel::new(stream) {
                Ok(channel) => channel,
                Err(err) => {
                    ACCEPT_ERROR.click();
                    clue!(COLLECTOR, ERROR, {
                        accept: {
                            channel_error: err.to_string(),
                        },
                    });
                    continue 'listening;
                }
            };
            let services = Arc::clone(&self.services);
            std::thread::spawn(move || {
                serve_channel(services, ctx, channel);
            });
        }
    }
}

fn serve_channel(services: Arc<ServiceRegistry>, ctx: Context, mut chan: Channel) {
    loop {
        let msg = match chan.recv() {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                break;
            }
            Err(err) => {
                clue!(COLLECTOR, ERROR, {
                    recv: {
                        error: err.to_string(),
                    },
                });
                break;
            }
        };
        if let Err(err) = handle_rpc(&services, &ctx, &mut chan, &msg) {
            HANDLE_RPC_FAILED.click();
            clue!(COLLECTOR, ERROR, {
                rpc: {
                    error: err.to_string(),
                },
            });
            break;
        }
    }
}

fn handle_rpc(
    services: &ServiceRegistry,
    ctx: &Context,
    chan: &mut Channel,
    msg: &[u8],
) -> Result<(), Error> {
    HANDLE_RPC.click();
    let env = Envelope::unpack(msg)?.0;
    let verdict = match services.dispatch(ctx, env.service, env.method, env.body) {
        Ok(Invoked::Returned(body)) => Verdict::Returned { body },
        Ok(Invoked::Faulted(error)) => Verdict::Faulted { error },
        Err(error) => Verdict::Undelivered { error },
    };
    let reply = Reply {
        ticket: env.ticket,
        verdict,
    };
    chan.send(&stack_pack(reply).to_vec())
}

/// The common name of the peer certificate's subject, or empty when there isn't one.  The
/// acceptor treats an empty subject as unauthenticated.
fn peer_subject(stream: &SslStream<TcpStream>) -> String {
    let cert = match stream.ssl().peer_certificate() {
        Some(cert) => cert,
        None => {
            return String::new();
        }
    };
    let subject = cert.subject_name();
    for entry in subject.entries_by_nid(Nid::COMMONNAME) {
        if let Ok(cn) = entry.data().as_utf8() {
            return cn.to_string();
        }
    }
    String::new()
}
