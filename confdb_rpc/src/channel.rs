use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

use biometrics::{Collector, Counter};
use boring::ssl::SslStream;
use buffertk::{stack_pack, v64, Packable, Unpackable};

use confdb_pb::{Error, Preamble, MAX_MESSAGE_SIZE};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static NEW_CHANNEL: Counter = Counter::new("confdb.rpc.channel.new");
static SEND: Counter = Counter::new("confdb.rpc.channel.send");
static RECV: Counter = Counter::new("confdb.rpc.channel.recv");
static CRC_MISMATCH: Counter = Counter::new("confdb.rpc.channel.crc_mismatch");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&NEW_CHANNEL);
    collector.register_counter(&SEND);
    collector.register_counter(&RECV);
    collector.register_counter(&CRC_MISMATCH);
}

////////////////////////////////////////////// Channel /////////////////////////////////////////////

/// A channel is a bidirectional wrapper around an ssl stream/socket.  Each message travels as a
/// one-byte varint giving the [Preamble]'s length, the preamble, and the message bytes the
/// preamble sums.
pub struct Channel {
    stream: SslStream<TcpStream>,
}

impl Channel {
    /// Create a new Channel from an established SSL-wrapped TcpStream.
    pub fn new(stream: SslStream<TcpStream>) -> Result<Self, Error> {
        NEW_CHANNEL.click();
        stream.get_ref().set_nodelay(true)?;
        Ok(Channel { stream })
    }

    /// The underlying stream, for interrogating the TLS session.
    pub fn stream(&self) -> &SslStream<TcpStream> {
        &self.stream
    }

    /// Send one message on this channel.
    pub fn send(&mut self, msg: &[u8]) -> Result<(), Error> {
        SEND.click();
        if msg.len() > MAX_MESSAGE_SIZE {
            return Err(Error::too_large(msg.len()));
        }
        let pre = Preamble::for_message(msg);
        let pre_sz: v64 = pre.pack_sz().into();
        // A preamble is two small fields; its length always fits one varint byte.
        assert!(pre.pack_sz() < 128);
        let header = stack_pack(pre_sz).pack(pre).to_vec();
        self.stream.write_all(&header).map_err(transport)?;
        self.stream.write_all(msg).map_err(transport)?;
        self.stream.flush().map_err(transport)?;
        Ok(())
    }

    /// Receive one message from this channel.  Returns None when the peer has shut the
    /// connection down cleanly between messages.
    pub fn recv(&mut self) -> Result<Option<Vec<u8>>, Error> {
        RECV.click();
        let mut pre_sz = [0u8; 1];
        match self.stream.read_exact(&mut pre_sz) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(err) => {
                return Err(transport(err));
            }
        }
        if pre_sz[0] >= 128 {
            return Err(Error::transport_failure("preamble length does not fit one varint byte"));
        }
        let mut pre_buf = vec![0u8; pre_sz[0] as usize];
        self.stream.read_exact(&mut pre_buf).map_err(transport)?;
        let pre = Preamble::unpack(&pre_buf)?.0;
        if pre.length as usize > MAX_MESSAGE_SIZE {
            return Err(Error::too_large(pre.length as usize));
        }
        let mut msg = vec![0u8; pre.length as usize];
        self.stream.read_exact(&mut msg).map_err(transport)?;
        if !pre.verifies(&msg) {
            CRC_MISMATCH.click();
            return Err(Error::transport_failure("checksum mismatch on framed message"));
        }
        Ok(Some(msg))
    }
}

fn transport(err: std::io::Error) -> Error {
    Error::transport_failure(err.to_string())
}

//////////////////////////////////////////// hostname //////////////////////////////////////////////

/// Get the hostname for a connect string, inferring if a port can be stripped.
pub fn hostname_or_ip(connect: &str) -> &str {
    fn strip_port(connect: &str) -> &str {
        if let Some((host, _)) = connect.rsplit_once(':') {
            host
        } else {
            connect
        }
    }
    if connect.starts_with('[') {
        let stripped = strip_port(connect);
        if stripped.ends_with(']') {
            &stripped[1..stripped.len() - 1]
        } else {
            connect
        }
    } else {
        strip_port(connect)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_strips_port() {
        assert_eq!("example.org", hostname_or_ip("example.org:2077"));
        assert_eq!("127.0.0.1", hostname_or_ip("127.0.0.1:2077"));
        assert_eq!("example.org", hostname_or_ip("example.org"));
    }

    #[test]
    fn hostname_handles_brackets() {
        assert_eq!("::1", hostname_or_ip("[::1]:2077"));
    }
}
