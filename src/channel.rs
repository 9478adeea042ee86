// Copyright 2016 Mozilla Foundation
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The framed message channel to one peer (daemon or build host).

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace, warn};
use retry::{delay::Fixed, retry};

use crate::errors::*;
use crate::protocol::{Message, PROTOCOL_VERSION};

/// Frames larger than this are not messages, they are garbage.
const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Read timeout used when the caller asked for a non-blocking drain;
/// `set_read_timeout` rejects a zero duration.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// An ordered, message-framed, bidirectional byte stream to one peer.
/// At most one outbound message is in flight at a time; reads block up to
/// the caller-supplied timeout.
pub trait Channel: Send {
    fn send_msg(&mut self, msg: &Message) -> Result<()>;

    /// Read the next message, waiting up to `timeout`. `None` means the
    /// wait expired or the peer is gone; the two are indistinguishable to
    /// callers, which treat both as a dead channel.
    fn get_msg(&mut self, timeout: Duration) -> Option<Message>;

    /// Peer host name, for log lines.
    fn peer_name(&self) -> &str;

    /// Effective protocol version negotiated with the peer.
    fn protocol(&self) -> u32;
}

/// A TCP connection speaking the framed protocol: a big-endian `u32` length
/// prefix followed by a bincode-encoded [`Message`].
pub struct ServerConnection {
    /// Used to adjust socket timeouts; reader and writer are clones of it.
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    peer: String,
    protocol: u32,
    /// Latched once a frame was torn mid-read; the stream is unusable then.
    dead: bool,
}

impl ServerConnection {
    /// Wrap `stream`, exchanging protocol versions with the peer. Both
    /// sides write first, so the handshake cannot deadlock.
    pub fn new(stream: TcpStream, peer: String) -> io::Result<ServerConnection> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;

        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, PROTOCOL_VERSION);
        (&stream).write_all(&buf)?;
        (&stream).read_exact(&mut buf)?;
        let peer_protocol = BigEndian::read_u32(&buf);
        let protocol = peer_protocol.min(PROTOCOL_VERSION);
        trace!("connected to {} speaking protocol {}", peer, protocol);

        stream.set_read_timeout(None)?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream.try_clone()?);
        Ok(ServerConnection {
            stream,
            reader,
            writer,
            peer,
            protocol,
            dead: false,
        })
    }

    fn read_one_message(&mut self) -> io::Result<Message> {
        let mut bytes = [0; 4];
        self.reader.read_exact(&mut bytes)?;
        let len = BigEndian::read_u32(&bytes);
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("oversized frame of {} bytes", len),
            ));
        }
        let mut data = vec![0; len as usize];
        self.reader.read_exact(&mut data)?;
        bincode::deserialize(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Channel for ServerConnection {
    fn send_msg(&mut self, msg: &Message) -> Result<()> {
        let data = bincode::serialize(msg)?;
        let mut len = [0; 4];
        BigEndian::write_u32(&mut len, data.len() as u32);
        self.writer
            .write_all(&len)
            .and_then(|()| self.writer.write_all(&data))
            .and_then(|()| self.writer.flush())
            .with_context(|| format!("sending {} to {}", msg.tag(), self.peer))?;
        Ok(())
    }

    fn get_msg(&mut self, timeout: Duration) -> Option<Message> {
        if self.dead {
            return None;
        }
        let timeout = timeout.max(DRAIN_POLL);
        if self.stream.set_read_timeout(Some(timeout)).is_err() {
            self.dead = true;
            return None;
        }
        match self.read_one_message() {
            Ok(msg) => Some(msg),
            Err(e) => {
                // A timeout may have split a frame; nothing sensible can be
                // read from this stream any more.
                debug!("read from {} failed: {}", self.peer, e);
                self.dead = true;
                None
            }
        }
    }

    fn peer_name(&self) -> &str {
        &self.peer
    }

    fn protocol(&self) -> u32 {
        self.protocol
    }
}

/// Establish a channel to `host:port` within `timeout`.
pub fn connect_to_host(host: &str, port: u16, timeout: Duration) -> io::Result<ServerConnection> {
    trace!("connect_to_host({}:{})", host, port);
    let mut last_err = io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("no addresses resolved for {}", host),
    );
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return ServerConnection::new(stream, host.to_owned()),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Establish a channel to the local daemon listening on `port`.
///
/// The daemon may be restarting; retry the connect a few times before
/// giving up.
pub fn connect_to_daemon(port: u16) -> io::Result<ServerConnection> {
    trace!("connect_to_daemon({})", port);
    match retry(Fixed::from_millis(500).take(10), || {
        connect_to_host("127.0.0.1", port, Duration::from_secs(1))
    }) {
        Ok(conn) => Ok(conn),
        Err(e) => {
            warn!("could not reach the local daemon on port {}: {}", port, e);
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection to the local daemon timed out",
            ))
        }
    }
}
