//! Network module for the voice client
//!
//! Handles the channel transport, session encryption and the connection state machine.

mod client;
mod error;
mod session;
mod transport;

pub use client::{
    Client, ClientEvent, ClientEvents, ClientOptions, ConnectionState, CHALLENGE_SIZE,
};
pub use error::{ClientError, CryptoError, NetworkError};
pub use session::{Session, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use transport::{
    ServerAddress, TransportEvent, TransportHost, TransportPeer, UdpHost, UdpPeer,
    MAX_PAYLOAD_SIZE,
};

/// Client running over the UDP transport
pub type UdpClient<E> = Client<UdpHost, E>;
