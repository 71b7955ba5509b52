//! voxlink - Encrypted real-time voice chat client engine
//!
//! This library connects to a voice server over a channel-multiplexed transport,
//! authenticates with an RSA/AES-GCM handshake, exchanges control events and
//! streams Opus voice in both directions with jitter-buffered playback.

pub mod audio;
pub mod config;
pub mod handler;
pub mod network;
pub mod protocol;
pub mod timer;

pub use audio::{RemoteUser, Transmitter};
pub use config::ClientConfig;
pub use handler::{EventHandler, RoomHandler, RoomMessage};
pub use network::{Client, ClientEvent, ClientOptions, ConnectionState, UdpClient};
pub use protocol::{ChannelId, ServerEvent};
pub use timer::Timer;
