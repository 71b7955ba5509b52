//! Channel-multiplexed datagram transport
//!
//! [`TransportHost`] and [`TransportPeer`] describe the transport the client runs on:
//! one host polled for events, one peer per connection attempt, numbered channels
//! with per-packet reliability. [`UdpHost`] implements them over a single UDP socket.
//!
//! Datagram format (6-byte header):
//! - kind: 1 byte
//! - channel: 1 byte
//! - sequence: 4 bytes (big-endian, per channel, reliable packets only)
//!
//! A connected link pings the server every 500 ms. The link is dropped with
//! [`TransportEvent::Disconnect`] when nothing arrives from the server for 5 s, or
//! when a reliable packet is still unacknowledged after 25 retransmissions.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::protocol::Delivery;

use super::error::NetworkError;

/// Datagram header size in bytes
pub const DATAGRAM_HEADER_SIZE: usize = 6;

/// Largest payload carried in one datagram
pub const MAX_PAYLOAD_SIZE: usize = 1400;

/// Interval between retransmissions of unacknowledged packets
const RESEND_INTERVAL: Duration = Duration::from_millis(200);

/// Retransmissions of one packet before the link is considered lost
const MAX_RESENDS: u32 = 25;

/// Interval between keepalive pings on a connected link
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// Silence from the server after which the link is considered lost
const PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// How far ahead of the next expected sequence a reliable packet may be held
const RECEIVE_WINDOW: u32 = 256;

/// Server host name and port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Events produced by [`TransportHost::service`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The remote end accepted the connection
    Connect,
    /// The remote end closed the connection
    Disconnect,
    /// A packet arrived on `channel`
    Receive { channel: u8, data: Vec<u8> },
}

/// One connection to a remote host
pub trait TransportPeer: Send {
    /// Queue a packet on a channel
    fn send(&mut self, channel: u8, data: &[u8], delivery: Delivery) -> Result<(), NetworkError>;

    /// Drop the connection without waiting for the remote end
    fn disconnect_now(&mut self);
}

/// The local endpoint, polled for events
pub trait TransportHost: Send + 'static {
    type Peer: TransportPeer + 'static;

    /// Start connecting to `address`; completion is reported as [`TransportEvent::Connect`]
    fn connect(
        &mut self,
        address: &ServerAddress,
        channel_count: usize,
    ) -> Result<Self::Peer, NetworkError>;

    /// Poll for the next event without blocking
    fn service(&mut self) -> Result<Option<TransportEvent>, NetworkError>;

    /// Push out anything still queued
    fn flush(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum DatagramKind {
    Connect = 1,
    Accept = 2,
    Disconnect = 3,
    Reliable = 4,
    Unreliable = 5,
    Ack = 6,
    Ping = 7,
}

impl TryFrom<u8> for DatagramKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Connect),
            2 => Ok(Self::Accept),
            3 => Ok(Self::Disconnect),
            4 => Ok(Self::Reliable),
            5 => Ok(Self::Unreliable),
            6 => Ok(Self::Ack),
            7 => Ok(Self::Ping),
            _ => Err(()),
        }
    }
}

fn encode_datagram(kind: DatagramKind, channel: u8, sequence: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DATAGRAM_HEADER_SIZE + payload.len());
    buf.push(kind as u8);
    buf.push(channel);
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn decode_datagram(data: &[u8]) -> Option<(DatagramKind, u8, u32, &[u8])> {
    if data.len() < DATAGRAM_HEADER_SIZE {
        return None;
    }
    let kind = DatagramKind::try_from(data[0]).ok()?;
    let sequence = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
    Some((kind, data[1], sequence, &data[DATAGRAM_HEADER_SIZE..]))
}

/// Send a datagram; a full socket buffer counts as loss
fn send_datagram(socket: &UdpSocket, addr: SocketAddr, data: &[u8]) -> Result<(), NetworkError> {
    match socket.send_to(data, addr) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::WouldBlock => {
            trace!("Socket buffer full, dropping {} bytes", data.len());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

struct PendingPacket {
    datagram: Vec<u8>,
    sent_at: Instant,
    resends: u32,
}

/// Per-connection state shared by the host and its peer handle
struct Link {
    remote: SocketAddr,
    channel_count: u8,
    connected: bool,
    open: bool,
    connect_sent_at: Instant,
    last_received: Instant,
    ping_sent_at: Instant,
    next_send_sequence: HashMap<u8, u32>,
    next_recv_sequence: HashMap<u8, u32>,
    /// Reliable packets that arrived ahead of a gap
    held: HashMap<(u8, u32), Vec<u8>>,
    /// Reliable packets awaiting acknowledgement
    pending: BTreeMap<(u8, u32), PendingPacket>,
}

impl Link {
    fn new(remote: SocketAddr, channel_count: u8) -> Self {
        Self {
            remote,
            channel_count,
            connected: false,
            open: true,
            connect_sent_at: Instant::now(),
            last_received: Instant::now(),
            ping_sent_at: Instant::now(),
            next_send_sequence: HashMap::new(),
            next_recv_sequence: HashMap::new(),
            held: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }
}

/// UDP implementation of [`TransportHost`]
pub struct UdpHost {
    socket: Arc<UdpSocket>,
    link: Option<Arc<Mutex<Link>>>,
    events: VecDeque<TransportEvent>,
    recv_buf: Vec<u8>,
    peer_timeout: Duration,
}

impl UdpHost {
    /// Bind to a local address in non-blocking mode
    pub fn bind(addr: &str) -> Result<Self, NetworkError> {
        let parsed_addr: SocketAddr = addr
            .parse()
            .map_err(|_| NetworkError::Resolve(addr.to_string()))?;

        let domain = if parsed_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&parsed_addr.into())?;

        let socket: UdpSocket = socket.into();
        info!("UDP transport bound to {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            link: None,
            events: VecDeque::new(),
            // One spare byte so a truncated datagram shows up as oversized
            recv_buf: vec![0u8; DATAGRAM_HEADER_SIZE + MAX_PAYLOAD_SIZE + 1],
            peer_timeout: PEER_TIMEOUT,
        })
    }

    /// Bind to an ephemeral IPv4 port
    pub fn new() -> Result<Self, NetworkError> {
        Self::bind("0.0.0.0:0")
    }

    /// Get the local address
    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.socket.local_addr()?)
    }

    fn resolve(&self, address: &ServerAddress) -> Result<SocketAddr, NetworkError> {
        let want_v4 = self.socket.local_addr()?.is_ipv4();
        (address.host.as_str(), address.port)
            .to_socket_addrs()
            .map_err(|_| NetworkError::Resolve(address.to_string()))?
            .find(|addr| addr.is_ipv4() == want_v4)
            .ok_or_else(|| NetworkError::Resolve(address.to_string()))
    }

    /// Retransmit, ping and check that the server is still there
    fn resend_overdue(&mut self) -> Result<(), NetworkError> {
        let Some(link_ref) = self.link.clone() else {
            return Ok(());
        };
        let mut link = link_ref.lock();
        if !link.open {
            return Ok(());
        }

        if !link.connected {
            if link.connect_sent_at.elapsed() >= RESEND_INTERVAL {
                let datagram = encode_datagram(DatagramKind::Connect, link.channel_count, 0, &[]);
                send_datagram(&self.socket, link.remote, &datagram)?;
                link.connect_sent_at = Instant::now();
            }
            return Ok(());
        }

        if link.last_received.elapsed() >= self.peer_timeout {
            warn!(
                "Nothing heard from {} for {:?}, dropping link",
                link.remote, self.peer_timeout
            );
            drop(link);
            self.lose_link();
            return Ok(());
        }

        let remote = link.remote;
        let mut exhausted = None;
        for (key, packet) in link.pending.iter_mut() {
            if packet.sent_at.elapsed() < RESEND_INTERVAL {
                continue;
            }
            if packet.resends >= MAX_RESENDS {
                exhausted = Some(*key);
                break;
            }
            send_datagram(&self.socket, remote, &packet.datagram)?;
            packet.sent_at = Instant::now();
            packet.resends += 1;
        }
        if let Some((channel, sequence)) = exhausted {
            warn!(
                "Packet {} on channel {} never acknowledged by {}, dropping link",
                sequence, channel, remote
            );
            drop(link);
            self.lose_link();
            return Ok(());
        }

        if link.ping_sent_at.elapsed() >= KEEPALIVE_INTERVAL {
            let ping = encode_datagram(DatagramKind::Ping, 0, 0, &[]);
            send_datagram(&self.socket, remote, &ping)?;
            link.ping_sent_at = Instant::now();
        }
        Ok(())
    }

    /// Close the current link and report the disconnect
    fn lose_link(&mut self) {
        if let Some(link) = self.link.take() {
            let mut link = link.lock();
            link.open = false;
            link.connected = false;
            link.pending.clear();
            link.held.clear();
        }
        self.events.push_back(TransportEvent::Disconnect);
    }

    fn handle_datagram(&mut self, from: SocketAddr, len: usize) -> Result<(), NetworkError> {
        let Some(link_ref) = self.link.clone() else {
            return Ok(());
        };
        let mut link = link_ref.lock();
        if from != link.remote || !link.open {
            trace!("Ignoring datagram from {}", from);
            return Ok(());
        }

        let Some((kind, channel, sequence, payload)) = decode_datagram(&self.recv_buf[..len])
        else {
            debug!("Dropping malformed datagram ({} bytes)", len);
            return Ok(());
        };
        link.last_received = Instant::now();

        match kind {
            DatagramKind::Accept => {
                if !link.connected {
                    link.connected = true;
                    self.events.push_back(TransportEvent::Connect);
                }
            }
            DatagramKind::Disconnect => {
                drop(link);
                self.lose_link();
            }
            DatagramKind::Ack => {
                link.pending.remove(&(channel, sequence));
            }
            DatagramKind::Unreliable if link.connected => {
                self.events.push_back(TransportEvent::Receive {
                    channel,
                    data: payload.to_vec(),
                });
            }
            DatagramKind::Reliable if link.connected => {
                let expected = *link.next_recv_sequence.get(&channel).unwrap_or(&0);
                let ahead = sequence.wrapping_sub(expected) as i32;
                if ahead >= RECEIVE_WINDOW as i32 {
                    // Unacknowledged, so the server sends it again later
                    trace!(
                        "Reliable packet {} on channel {} outside window",
                        sequence,
                        channel
                    );
                    return Ok(());
                }

                let ack = encode_datagram(DatagramKind::Ack, channel, sequence, &[]);
                send_datagram(&self.socket, from, &ack)?;
                if ahead == 0 {
                    self.events.push_back(TransportEvent::Receive {
                        channel,
                        data: payload.to_vec(),
                    });
                    let mut next = expected.wrapping_add(1);
                    while let Some(data) = link.held.remove(&(channel, next)) {
                        self.events
                            .push_back(TransportEvent::Receive { channel, data });
                        next = next.wrapping_add(1);
                    }
                    link.next_recv_sequence.insert(channel, next);
                } else if ahead > 0 {
                    link.held.insert((channel, sequence), payload.to_vec());
                } else {
                    trace!("Duplicate reliable packet {} on channel {}", sequence, channel);
                }
            }
            DatagramKind::Ping => {}
            _ => trace!("Ignoring {:?} datagram", kind),
        }
        Ok(())
    }
}

impl TransportHost for UdpHost {
    type Peer = UdpPeer;

    fn connect(
        &mut self,
        address: &ServerAddress,
        channel_count: usize,
    ) -> Result<UdpPeer, NetworkError> {
        let remote = self.resolve(address)?;
        let channel_count = channel_count.min(u8::MAX as usize) as u8;

        let link = Arc::new(Mutex::new(Link::new(remote, channel_count)));
        let datagram = encode_datagram(DatagramKind::Connect, channel_count, 0, &[]);
        send_datagram(&self.socket, remote, &datagram)?;
        info!("Connecting to {} ({})", address, remote);

        self.link = Some(link.clone());
        self.events.clear();

        Ok(UdpPeer {
            socket: self.socket.clone(),
            link,
        })
    }

    fn service(&mut self) -> Result<Option<TransportEvent>, NetworkError> {
        self.resend_overdue()?;

        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((len, from)) if len > DATAGRAM_HEADER_SIZE + MAX_PAYLOAD_SIZE => {
                    warn!("Dropping oversized datagram from {} ({}+ bytes)", from, len);
                }
                Ok((len, from)) => self.handle_datagram(from, len)?,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                // ICMP port unreachable surfaces here on some platforms
                Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                    trace!("Connection reset reported by socket");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(self.events.pop_front())
    }

    fn flush(&mut self) {
        if let Err(e) = self.resend_overdue() {
            warn!("Flush failed: {}", e);
        }
    }
}

/// Peer handle returned by [`UdpHost::connect`]
pub struct UdpPeer {
    socket: Arc<UdpSocket>,
    link: Arc<Mutex<Link>>,
}

impl TransportPeer for UdpPeer {
    fn send(&mut self, channel: u8, data: &[u8], delivery: Delivery) -> Result<(), NetworkError> {
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(NetworkError::PacketTooLarge(data.len()));
        }

        let mut link = self.link.lock();
        if !link.open || !link.connected {
            return Err(NetworkError::PeerGone);
        }

        let datagram = match delivery {
            Delivery::Unreliable => encode_datagram(DatagramKind::Unreliable, channel, 0, data),
            Delivery::Reliable => {
                let counter = link.next_send_sequence.entry(channel).or_insert(0);
                let sequence = *counter;
                *counter = counter.wrapping_add(1);

                let datagram = encode_datagram(DatagramKind::Reliable, channel, sequence, data);
                link.pending.insert(
                    (channel, sequence),
                    PendingPacket {
                        datagram: datagram.clone(),
                        sent_at: Instant::now(),
                        resends: 0,
                    },
                );
                datagram
            }
        };

        send_datagram(&self.socket, link.remote, &datagram)
    }

    fn disconnect_now(&mut self) {
        let mut link = self.link.lock();
        if !link.open {
            return;
        }
        link.open = false;
        link.connected = false;
        link.pending.clear();

        let datagram = encode_datagram(DatagramKind::Disconnect, 0, 0, &[]);
        if let Err(e) = send_datagram(&self.socket, link.remote, &datagram) {
            warn!("Failed to send disconnect to {}: {}", link.remote, e);
        }
        debug!("Disconnected from {}", link.remote);
    }
}
