#![doc = include_str!("../README.md")]

use prototk_derive::Message;
use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// Hard ceiling on any single framed message, request or reply alike.  User values come in well
/// under this once gzip is done with them.
pub const MAX_MESSAGE_SIZE: usize = 1usize << 20;

/// An acceptor rejects proposal seqs further than this many seconds from its own clock.  This is
/// a liveness guard, not a safety requirement.
pub const MAX_CLOCK_SKEW_SECS: u64 = 10;

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// ConfDB error.  One enum for every crate in the workspace so that service errors serialize
/// across the wire unchanged.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The zero value the wire format demands of every enum.  Nothing constructs this on
    /// purpose.
    #[prototk(507904, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// A message refused to pack or unpack.
    #[prototk(507905, message)]
    SerializationError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        err: prototk::Error,
        #[prototk(3, string)]
        context: String,
    },
    /// No registered service answers to the requested name.
    #[prototk(507906, message)]
    UnknownService {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        name: String,
    },
    /// The service exists but has no such method.
    #[prototk(507907, message)]
    UnknownMethod {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        name: String,
    },
    /// A message blew past MAX_MESSAGE_SIZE.
    #[prototk(507908, message)]
    RequestTooLarge {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, uint64)]
        size: u64,
    },
    /// The connection gave out underneath a call.
    #[prototk(507909, message)]
    TransportFailure {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    /// TLS material would not load or validate.
    #[prototk(507910, message)]
    EncryptionMisconfiguration {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    /// An I/O call against the operating system failed.
    #[prototk(507911, message)]
    SystemError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    /// The store's log could not be replayed.
    #[prototk(507912, message)]
    Corruption {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    /// A logic error in the implementation.
    #[prototk(507913, message)]
    LogicError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    /// Another process holds the store's lockfile.
    #[prototk(507914, message)]
    LockNotObtained {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        path: String,
    },
    /// A read addressed a db whose store file does not exist.
    #[prototk(507915, message)]
    NotInitialized {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        db: String,
    },
    /// A Paxos call arrived without an authenticated peer identity.
    #[prototk(507916, message)]
    TlsAuthFailed {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// A proposal seq was further than MAX_CLOCK_SKEW_SECS from the acceptor's clock.
    #[prototk(507917, message)]
    ClocksOutOfSync {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, uint64)]
        seq: u64,
        #[prototk(3, uint64)]
        now: u64,
    },
    /// A promise or accept lost to a higher proposal seq.
    #[prototk(507918, message)]
    StaleProposalSeq {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        key: String,
        #[prototk(3, uint64)]
        version: u64,
        #[prototk(4, uint64)]
        seq: u64,
    },
    /// Fewer than a quorum of peers answered.  The message names each failing peer.
    #[prototk(507919, message)]
    QuorumNotReached {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    /// The writer's secret does not match the db's credential record.
    #[prototk(507920, message)]
    AuthenticationFailed {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// A user value or credential record could not be decoded.
    #[prototk(507921, message)]
    InvalidValue {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
}

impl Error {
    pub fn unknown_service(name: impl Into<String>) -> Self {
        Self::UnknownService {
            core: ErrorCore::default(),
            name: name.into(),
        }
    }

    pub fn unknown_method(name: impl Into<String>) -> Self {
        Self::UnknownMethod {
            core: ErrorCore::default(),
            name: name.into(),
        }
    }

    pub fn too_large(size: usize) -> Self {
        Self::RequestTooLarge {
            core: ErrorCore::default(),
            size: size as u64,
        }
    }

    pub fn transport_failure(what: impl Into<String>) -> Self {
        Self::TransportFailure {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn system_error(what: impl Into<String>) -> Self {
        Self::SystemError {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn logic_error(what: impl Into<String>) -> Self {
        Self::LogicError {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }

    pub fn invalid_value(what: impl Into<String>) -> Self {
        Self::InvalidValue {
            core: ErrorCore::default(),
            what: what.into(),
        }
    }
}

impl Default for Error {
    fn default() -> Error {
        Error::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<buffertk::Error> for Error {
    fn from(err: buffertk::Error) -> Error {
        Error::SerializationError {
            core: ErrorCore::default(),
            err: err.into(),
            context: "unframing with buffertk".to_string(),
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(err: prototk::Error) -> Error {
        Error::SerializationError {
            core: ErrorCore::default(),
            err,
            context: "decoding with prototk".to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::SystemError {
            core: ErrorCore::default(),
            what: format!("{}", err),
        }
    }
}

iotoz! {Error}

////////////////////////////////////////////// Context /////////////////////////////////////////////

/// A context passed by the RPC server into a service.  The subject is the peer certificate's
/// common name, captured by the transport; an empty subject means the transport could not
/// establish who the peer is.
#[derive(Clone, Debug, Default)]
pub struct Context {
    subject: String,
}

impl Context {
    /// The authenticated peer identity, if there is one.
    pub fn subject(&self) -> Option<&str> {
        if self.subject.is_empty() {
            None
        } else {
            Some(&self.subject)
        }
    }

    /// Extend the context with the authenticated peer identity.
    ///
    /// This makes a copy.
    pub fn with_subject(&self, subject: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.subject = subject.into();
        ctx
    }
}

////////////////////////////////////////////// Invoked /////////////////////////////////////////////

/// How a raw invocation came out, once it reached the service at all:  either the method
/// returned (and here is its packed return value), or the method produced its own error (and
/// here is that error, packed).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Invoked {
    /// The method's packed return value.
    Returned(Vec<u8>),
    /// The method's packed error.
    Faulted(Vec<u8>),
}

/// The raw calling convention:  Err means the machinery underneath gave out before the method
/// could answer; Ok carries the method's own outcome.
pub type Status = Result<Invoked, Error>;

////////////////////////////////////////////// Dispatch ////////////////////////////////////////////

/// Anything that can field a raw method call.  The `service!` macro turns a typed
/// implementation into one of these; the RPC server routes to them by service name.
pub trait Dispatch {
    /// Field one call.
    fn dispatch(&self, ctx: &Context, method: &str, body: &[u8]) -> Status;
}

////////////////////////////////////////////// Client //////////////////////////////////////////////

/// The raw client side:  hand a (service, method, packed request) to some transport and get a
/// [Status] back.  Typed clients generated by `service!` wrap one of these.
pub trait Client {
    /// Make one call.
    fn call(&self, service: &str, method: &str, body: &[u8]) -> Status;
}

////////////////////////////////////////////// Preamble ////////////////////////////////////////////

/// Sits in front of every message on a channel or in a store log:  how long the message is and
/// what it should sum to.  The preamble itself is prefixed by its length in a single varint
/// byte.
#[derive(Clone, Debug, Default, Message)]
pub struct Preamble {
    /// Length of the message that follows.
    #[prototk(1, uint64)]
    pub length: u64,
    /// crc32c of the message that follows.
    #[prototk(2, fixed32)]
    pub checksum: u32,
}

impl Preamble {
    /// The preamble that must precede `msg`.
    pub fn for_message(msg: &[u8]) -> Self {
        Self {
            length: msg.len() as u64,
            checksum: crc32c::crc32c(msg),
        }
    }

    /// Whether `msg` is the message this preamble was computed over.
    pub fn verifies(&self, msg: &[u8]) -> bool {
        msg.len() as u64 == self.length && crc32c::crc32c(msg) == self.checksum
    }
}

////////////////////////////////////////////// Envelope ////////////////////////////////////////////

/// What a client wraps around one invocation.  The ticket comes back on the [Reply] so the
/// caller can pair them up.
#[derive(Clone, Debug, Default, Message)]
pub struct Envelope<'a> {
    /// Ticket tying the eventual reply to this invocation.
    #[prototk(1, uint64)]
    pub ticket: u64,
    /// The service being addressed.
    #[prototk(2, string)]
    pub service: &'a str,
    /// The method being invoked.
    #[prototk(3, string)]
    pub method: &'a str,
    /// The packed request message.
    #[prototk(4, bytes)]
    pub body: &'a [u8],
}

////////////////////////////////////////////// Verdict /////////////////////////////////////////////

/// The server's answer to one [Envelope], in one of four shapes.
#[derive(Clone, Debug, Default, Message)]
pub enum Verdict {
    /// The server produced no answer at all.  Seeing this on the wire is a bug.
    #[prototk(1, message)]
    #[default]
    Dropped,
    /// The machinery failed before the method could answer.
    #[prototk(2, message)]
    Undelivered {
        #[prototk(1, message)]
        error: Error,
    },
    /// The method returned.
    #[prototk(3, message)]
    Returned {
        #[prototk(1, bytes)]
        body: Vec<u8>,
    },
    /// The method produced its own error.
    #[prototk(4, message)]
    Faulted {
        #[prototk(1, bytes)]
        error: Vec<u8>,
    },
}

//////////////////////////////////////////////// Reply /////////////////////////////////////////////

/// What a server sends back for one [Envelope].
#[derive(Clone, Debug, Default, Message)]
pub struct Reply {
    /// The ticket from the originating envelope.
    #[prototk(1, uint64)]
    pub ticket: u64,
    /// How the invocation came out.
    #[prototk(2, message)]
    pub verdict: Verdict,
}

///////////////////////////////////////////// The Macro ////////////////////////////////////////////

/// Declare a service:  a trait for implementations, a typed client that speaks the trait over
/// any [Client], and a server wrapper that turns any implementation into a [Dispatch].
///
/// The client and the real service implement the same trait, so anything written against the
/// trait runs identically over the network or wired straight to an in-process implementation.
#[macro_export]
macro_rules! service {
    {
        trait $service:ident;
        client $client:ident;
        server $server:ident;

        $(fn $method:ident($req:ty) -> $resp:ty;)+
    } => {
        /// Service trait declared by service!.
        pub trait $service: Send + Sync + 'static {
            $(
                /// Method declared by service!.
                fn $method(&self, ctx: &$crate::Context, req: $req) -> Result<$resp, $crate::Error>;
            )+
        }

        /// Typed client declared by service!.
        pub struct $client(std::sync::Arc<dyn $crate::Client + Send + Sync + 'static>);

        impl $client {
            /// Wrap a raw transport in the typed interface.
            pub fn new(transport: std::sync::Arc<dyn $crate::Client + Send + Sync + 'static>) -> Self {
                Self(transport)
            }
        }

        impl $service for $client {
            $(
                fn $method(&self, _: &$crate::Context, req: $req) -> Result<$resp, $crate::Error> {
                    let packed = ::buffertk::stack_pack(req).to_vec();
                    match self.0.call(stringify!($service), stringify!($method), &packed)? {
                        $crate::Invoked::Returned(body) => {
                            Ok(<$resp as ::buffertk::Unpackable>::unpack(&body)?.0)
                        }
                        $crate::Invoked::Faulted(error) => {
                            Err(<$crate::Error as ::buffertk::Unpackable>::unpack(&error)?.0)
                        }
                    }
                }
            )+
        }

        /// Server wrapper declared by service!.
        pub struct $server<S: $service>(S);

        impl<S: $service> $server<S> {
            /// Wrap an implementation for registration.
            pub fn wrap(implementation: S) -> Self {
                Self(implementation)
            }
        }

        impl<S: $service> $crate::Dispatch for $server<S> {
            fn dispatch(&self, ctx: &$crate::Context, method: &str, body: &[u8]) -> $crate::Status {
                $(
                    if method == stringify!($method) {
                        let req = <$req as ::buffertk::Unpackable>::unpack(body)?.0;
                        return Ok(match self.0.$method(ctx, req) {
                            Ok(resp) => {
                                $crate::Invoked::Returned(::buffertk::stack_pack(resp).to_vec())
                            }
                            Err(err) => {
                                $crate::Invoked::Faulted(::buffertk::stack_pack(err).to_vec())
                            }
                        });
                    }
                )+
                Err($crate::Error::unknown_method(method))
            }
        }
    };
}

////////////////////////////////////////// ServiceRegistry /////////////////////////////////////////

/// Routes raw calls to the service that owns them.
pub struct ServiceRegistry {
    routes: std::collections::HashMap<&'static str, Box<dyn Dispatch + Send + Sync + 'static>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            routes: std::collections::HashMap::new(),
        }
    }

    /// Add a service under `name`.  Registration happens once at startup, so a duplicate name
    /// is a programming error and panics.
    pub fn register<D: Dispatch + Send + Sync + 'static>(&mut self, name: &'static str, service: D) {
        if self.routes.insert(name, Box::new(service)).is_some() {
            panic!("two services registered as {}", name);
        }
    }

    /// Route one call to whichever service claims it.
    pub fn dispatch(&self, ctx: &Context, service: &str, method: &str, body: &[u8]) -> Status {
        match self.routes.get(service) {
            Some(route) => route.dispatch(ctx, method, body),
            None => Err(Error::unknown_service(service)),
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//////////////////////////////////////////// KeyVersion ////////////////////////////////////////////

/// A (key, version) pair, as returned by db-wide listings.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct KeyVersion {
    #[prototk(1, string)]
    pub key: String,
    #[prototk(2, uint64)]
    pub version: u64,
}

///////////////////////////////////////////// ReadQuery ////////////////////////////////////////////

/// What a read_server call addresses within a db.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub enum ReadQuery {
    /// List every finalized (key, version) in the db.
    #[prototk(1, message)]
    #[default]
    All,
    /// The most recent finalized version of one key.
    #[prototk(2, message)]
    Key {
        #[prototk(1, string)]
        key: String,
    },
    /// The value of one exact (key, version).
    #[prototk(3, message)]
    Exact {
        #[prototk(1, string)]
        key: String,
        #[prototk(2, uint64)]
        version: u64,
    },
}

////////////////////////////////////////// ReadServerRequest ///////////////////////////////////////

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct ReadServerRequest {
    #[prototk(1, string)]
    pub db: String,
    #[prototk(2, message)]
    pub query: ReadQuery,
}

///////////////////////////////////////// ReadServerResponse ///////////////////////////////////////

/// A read_server reply.  Replies compare for equality; the reader treats a key as finalized only
/// when every replica returns the identical reply.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub enum ReadServerResponse {
    /// No finalized record matched.
    #[prototk(1, message)]
    #[default]
    Empty,
    /// The db's finalized (key, version) pairs.
    #[prototk(2, message)]
    Keys {
        #[prototk(1, message)]
        pairs: Vec<KeyVersion>,
    },
    /// One record.  The value is returned still compressed.
    #[prototk(3, message)]
    Record {
        #[prototk(1, uint64)]
        version: u64,
        #[prototk(2, bytes)]
        value: Vec<u8>,
    },
}

//////////////////////////////////////////// PaxosPhase ////////////////////////////////////////////

/// The two phases of the Paxos endpoint, distinguished by whether a value body is present.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub enum PaxosPhase {
    /// Phase 1: block stale proposers and learn the most recently accepted value.
    #[prototk(1, message)]
    #[default]
    Promise,
    /// Phase 2: accept the supplied value.
    #[prototk(2, message)]
    Accept {
        #[prototk(1, bytes)]
        value: Vec<u8>,
    },
}

//////////////////////////////////////////// PaxosRequest //////////////////////////////////////////

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PaxosRequest {
    #[prototk(1, string)]
    pub db: String,
    #[prototk(2, string)]
    pub key: String,
    #[prototk(3, uint64)]
    pub version: u64,
    #[prototk(4, uint64)]
    pub seq: u64,
    #[prototk(5, message)]
    pub phase: PaxosPhase,
}

/////////////////////////////////////////// PaxosResponse //////////////////////////////////////////

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub enum PaxosResponse {
    /// The accept was applied.
    #[prototk(1, message)]
    #[default]
    Accepted,
    /// The promise was granted.  The value is empty iff accepted_seq is zero.
    #[prototk(2, message)]
    Promised {
        #[prototk(1, uint64)]
        accepted_seq: u64,
        #[prototk(2, bytes)]
        value: Vec<u8>,
    },
}

///////////////////////////////////////////// Acceptor /////////////////////////////////////////////

// AcceptorService is the per-server half of the protocol:  read finalized state and run one
// promise/accept transition per call.  All consensus decisions happen by quorums of these calls.
service! {
    trait AcceptorService;
    client AcceptorClient;
    server AcceptorServer;

    fn read_server(ReadServerRequest) -> ReadServerResponse;
    fn paxos(PaxosRequest) -> PaxosResponse;
}

///////////////////////////////////////////// GetRequest ///////////////////////////////////////////

/// What a proxied get addresses within a db.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub enum GetQuery {
    /// Merge the finalized key listing across the quorum.
    #[prototk(1, message)]
    #[default]
    All,
    /// Read one key through the reconciling read protocol.
    #[prototk(2, message)]
    Key {
        #[prototk(1, string)]
        key: String,
    },
}

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct GetRequest {
    #[prototk(1, string)]
    pub db: String,
    #[prototk(2, message)]
    pub query: GetQuery,
}

//////////////////////////////////////////// GetResponse ///////////////////////////////////////////

/// Reader output.  Values here are uncompressed JSON text.
#[derive(Clone, Debug, Eq, Message, PartialEq)]
pub enum GetResponse {
    /// The key has no finalized record.
    #[prototk(1, message)]
    Missing {
        #[prototk(1, string)]
        db: String,
        #[prototk(2, string)]
        key: String,
    },
    /// The db's keys, each at its highest finalized version.
    #[prototk(2, message)]
    Keys {
        #[prototk(1, string)]
        db: String,
        #[prototk(2, message)]
        keys: Vec<KeyVersion>,
    },
    /// The finalized record for the key.
    #[prototk(3, message)]
    Record {
        #[prototk(1, string)]
        db: String,
        #[prototk(2, string)]
        key: String,
        #[prototk(3, uint64)]
        version: u64,
        #[prototk(4, bytes)]
        value: Vec<u8>,
    },
}

impl Default for GetResponse {
    fn default() -> Self {
        GetResponse::Missing {
            db: String::new(),
            key: String::new(),
        }
    }
}

///////////////////////////////////////////// PutRequest ///////////////////////////////////////////

#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PutRequest {
    #[prototk(1, string)]
    pub db: String,
    #[prototk(2, string)]
    pub secret: String,
    #[prototk(3, string)]
    pub key: String,
    #[prototk(4, uint64)]
    pub version: u64,
    /// The value to write, as JSON text.
    #[prototk(5, bytes)]
    pub value: Vec<u8>,
}

/////////////////////////////////////////////// Proxy //////////////////////////////////////////////

// ProxyService lets any cluster member run the whole read or write protocol on a caller's
// behalf, so every node serves the same surface.
service! {
    trait ProxyService;
    client ProxyClient;
    server ProxyServer;

    fn get(GetRequest) -> GetResponse;
    fn put(PutRequest) -> GetResponse;
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
