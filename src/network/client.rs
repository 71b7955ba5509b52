//! Connection state machine
//!
//! A [`Client`] owns one transport host and at most one peer. A background thread
//! polls the transport, runs the key exchange and hands decrypted traffic to an
//! [`EventHandler`]. State changes the application must react to are delivered as
//! [`ClientEvent`]s on a channel instead of being called on the network thread.
//!
//! Handshake on the auth channel:
//! 1. server sends its RSA public key
//! 2. client replies with the session key wrapped with that key, then its random
//!    challenge encrypted with the session key
//! 3. server echoes the challenge back encrypted; a match means Connected

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::DEFAULT_TIMEOUT;
use crate::handler::EventHandler;
use crate::protocol::{
    AudioFrame, ChannelId, Delivery, Envelope, ProtocolError, ServerEvent, CHANNEL_COUNT,
};
use crate::timer::Timer;

use super::error::{ClientError, NetworkError};
use super::session::Session;
use super::transport::{ServerAddress, TransportEvent, TransportHost, TransportPeer};

/// Size of the handshake challenge in bytes
pub const CHALLENGE_SIZE: usize = 32;

/// Sleep between polls while a connection is live
const ACTIVE_POLL: Duration = Duration::from_micros(400);

/// Sleep between polls while idle
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Waiting for the transport to accept
    Connecting,
    /// Transport is up, key exchange in progress
    Authenticating,
    Connected,
    /// No answer within the timeout
    TimedOut,
}

impl ConnectionState {
    /// Whether a peer is open in this state
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Authenticating | Self::Connected
        )
    }
}

/// Notifications for the owner of a [`Client`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// Handshake completed
    Connected,
    /// Connection closed by either side or after a protocol failure
    Disconnected,
    /// The server did not answer in time
    ConnectionTimeout,
}

/// Receiving end of a client's notifications
pub type ClientEvents = mpsc::UnboundedReceiver<ClientEvent>;

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub address: ServerAddress,
    /// Time allowed in Connecting and Authenticating
    pub timeout: Duration,
}

impl ClientOptions {
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// State guarded by the client lock
struct Core<H: TransportHost, E> {
    host: H,
    peer: Option<H::Peer>,
    session: Option<Session>,
    state: ConnectionState,
    challenge: [u8; CHALLENGE_SIZE],
    timer: Timer,
    options: ClientOptions,
    handler: E,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl<H: TransportHost, E: EventHandler> Core<H, E> {
    fn notify(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            trace!("Client event receiver dropped");
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        debug!("Connection state: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.timer.restart();
    }

    /// Drop peer and session and move to a closed state
    fn teardown(&mut self, next: ConnectionState) {
        let had_session = matches!(
            self.state,
            ConnectionState::Authenticating | ConnectionState::Connected
        );
        self.peer = None;
        self.session = None;
        self.set_state(next);
        if had_session {
            self.handler.reset();
        }
    }

    /// Close the peer from our side and report a disconnect
    fn close(&mut self) {
        if let Some(peer) = self.peer.as_mut() {
            peer.disconnect_now();
        }
        self.host.flush();
        self.teardown(ConnectionState::Disconnected);
        self.notify(ClientEvent::Disconnected);
    }

    /// Force a disconnect and return the error that caused it
    fn fail(&mut self, error: impl Into<ClientError>) -> Result<(), ClientError> {
        let error = error.into();
        warn!("Closing connection: {}", error);
        self.close();
        Err(error)
    }

    fn connect(&mut self) -> Result<(), ClientError> {
        if self.state.is_live() {
            self.disconnect()?;
        }

        let peer = self.host.connect(&self.options.address, CHANNEL_COUNT)?;
        self.peer = Some(peer);
        self.session = None;
        OsRng.fill_bytes(&mut self.challenge);
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to {}", self.options.address);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ClientError> {
        if self.peer.is_none() || !self.state.is_live() {
            return Err(ClientError::AlreadyDisconnected);
        }
        info!("Disconnecting from {}", self.options.address);
        self.close();
        Ok(())
    }

    /// Encrypt and send; caller has checked the state
    fn send_encrypted(
        &mut self,
        channel: ChannelId,
        plaintext: &[u8],
        delivery: Delivery,
    ) -> Result<(), ClientError> {
        let (Some(session), Some(peer)) = (self.session.as_ref(), self.peer.as_mut()) else {
            return Err(ClientError::NotConnected);
        };
        let data = session.encrypt(plaintext)?;
        peer.send(channel.as_u8(), &data, delivery)?;
        Ok(())
    }

    fn send(&mut self, channel: ChannelId, event: &str, data: Value) -> Result<(), ClientError> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        // Auth is handshake-only and audio has its own path
        if channel != ChannelId::Control {
            return Err(ClientError::ReservedChannel(channel));
        }

        let bytes = Envelope::new(event, data).encode()?;
        self.send_encrypted(channel, &bytes, Delivery::Reliable)?;
        trace!("Sent {} on {:?}", event, channel);
        Ok(())
    }

    fn send_audio(&mut self, opus: &[u8]) -> Result<(), ClientError> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.send_encrypted(ChannelId::AudioUplink, opus, Delivery::Unreliable)
    }

    /// One poll of the transport
    fn poll(&mut self) -> Result<(), ClientError> {
        if self.peer.is_none() {
            return Ok(());
        }

        match self.host.service()? {
            Some(TransportEvent::Connect) => {
                if self.state == ConnectionState::Connecting {
                    self.session = None;
                    self.set_state(ConnectionState::Authenticating);
                    info!("Transport connected, authenticating");
                }
                Ok(())
            }
            Some(TransportEvent::Disconnect) => {
                info!("Server closed the connection");
                self.teardown(ConnectionState::Disconnected);
                self.notify(ClientEvent::Disconnected);
                Ok(())
            }
            Some(TransportEvent::Receive { channel, data }) => {
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Authenticating
                ) {
                    self.timer.restart();
                }
                self.receive(channel, &data)
            }
            None => {
                self.check_timeout();
                Ok(())
            }
        }
    }

    fn check_timeout(&mut self) {
        let waiting = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Authenticating
        );
        if !waiting || self.timer.elapsed() < self.options.timeout {
            return;
        }

        warn!(
            "No answer from {} after {} ms",
            self.options.address,
            self.timer.elapsed_ms()
        );
        if let Some(peer) = self.peer.as_mut() {
            peer.disconnect_now();
        }
        self.teardown(ConnectionState::TimedOut);
        self.notify(ClientEvent::ConnectionTimeout);
    }

    fn receive(&mut self, channel: u8, data: &[u8]) -> Result<(), ClientError> {
        let channel = ChannelId::try_from(channel)?;
        match (self.state, channel) {
            (ConnectionState::Authenticating, ChannelId::Auth) => self.handshake(data),
            (ConnectionState::Connected, _) => self.dispatch(channel, data),
            (state, channel) => {
                trace!("Ignoring {:?} packet in state {:?}", channel, state);
                Ok(())
            }
        }
    }

    fn handshake(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let Some(session) = self.session.as_ref() else {
            return self.start_session(data);
        };

        let echoed = session.decrypt(data);
        match echoed {
            Ok(echo) if echo == self.challenge => {
                self.set_state(ConnectionState::Connected);
                info!("Connected to {}", self.options.address);
                self.notify(ClientEvent::Connected);
                Ok(())
            }
            Ok(_) => self.fail(ClientError::HandshakeFailed),
            Err(e) => self.fail(e),
        }
    }

    /// Answer the server's public key with our session key and challenge
    fn start_session(&mut self, public_key: &[u8]) -> Result<(), ClientError> {
        let prepared = Session::new(public_key).and_then(|session| {
            let wrapped = session.encrypted_session_key()?;
            let challenge = session.encrypt(&self.challenge)?;
            Ok((session, wrapped, challenge))
        });
        let (session, wrapped, challenge) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return self.fail(e),
        };

        let auth = ChannelId::Auth.as_u8();
        let sent = match self.peer.as_mut() {
            Some(peer) => peer
                .send(auth, &wrapped, Delivery::Reliable)
                .and_then(|_| peer.send(auth, &challenge, Delivery::Reliable)),
            None => Err(NetworkError::PeerGone),
        };
        if let Err(e) = sent {
            return self.fail(e);
        }

        self.session = Some(session);
        debug!("Session key sent, waiting for challenge echo");
        Ok(())
    }

    /// Route traffic received while connected
    fn dispatch(&mut self, channel: ChannelId, data: &[u8]) -> Result<(), ClientError> {
        let Some(session) = self.session.as_ref() else {
            return Err(ClientError::NotConnected);
        };
        let decrypted = session.decrypt(data);

        match channel {
            ChannelId::AudioDownlink => {
                let frame = match decrypted {
                    Ok(plain) => AudioFrame::parse(&plain),
                    Err(e) => {
                        trace!("Dropping audio packet: {}", e);
                        return Ok(());
                    }
                };
                match frame {
                    Ok(frame) => {
                        self.handler
                            .audio(frame.user_id, frame.sequence, &frame.payload)
                    }
                    Err(e) => trace!("Dropping audio packet: {}", e),
                }
                Ok(())
            }
            ChannelId::Control => {
                let plain = match decrypted {
                    Ok(plain) => plain,
                    Err(e) => return self.fail(e),
                };
                match ServerEvent::decode(&plain) {
                    Ok(event) => {
                        trace!("Received {}", event.name());
                        self.handler.handle_event(event)?;
                        Ok(())
                    }
                    Err(e @ ProtocolError::Decode(_)) => self.fail(e),
                    Err(e) => Err(e.into()),
                }
            }
            ChannelId::Auth | ChannelId::AudioUplink => {
                trace!("Ignoring packet on {:?} while connected", channel);
                Ok(())
            }
        }
    }
}

/// Network client for one server
pub struct Client<H: TransportHost, E: EventHandler> {
    core: Arc<Mutex<Core<H, E>>>,
    running: Arc<AtomicBool>,
    polling: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl<H: TransportHost, E: EventHandler> Client<H, E> {
    /// Create a client and start its network thread
    ///
    /// The client starts Disconnected; call [`Client::connect`] to begin. Call
    /// [`Client::destroy`] (or drop the client) to stop the thread.
    pub fn new(
        host: H,
        options: ClientOptions,
        handler: E,
    ) -> Result<(Self, ClientEvents), ClientError> {
        let (events, rx) = mpsc::unbounded_channel();
        let core = Arc::new(Mutex::new(Core {
            host,
            peer: None,
            session: None,
            state: ConnectionState::Disconnected,
            challenge: [0u8; CHALLENGE_SIZE],
            timer: Timer::new(),
            options,
            handler,
            events,
        }));

        let running = Arc::new(AtomicBool::new(true));
        let polling = Arc::new(AtomicBool::new(true));

        let thread_core = core.clone();
        let thread_running = running.clone();
        let thread_polling = polling.clone();
        let handle = thread::Builder::new()
            .name("network".to_string())
            .spawn(move || run(thread_core, thread_running, thread_polling))
            .map_err(NetworkError::from)?;

        let client = Self {
            core,
            running,
            polling,
            handle: Some(handle),
        };
        Ok((client, rx))
    }

    /// Open a new connection, closing any current one first
    pub fn connect(&self) -> Result<(), ClientError> {
        self.core.lock().connect()
    }

    /// Send a control event; only allowed on non-audio channels once connected
    pub fn send(&self, channel: ChannelId, event: &str, data: Value) -> Result<(), ClientError> {
        self.core.lock().send(channel, event, data)
    }

    /// Send one encoded voice frame
    pub fn send_audio(&self, opus: &[u8]) -> Result<(), ClientError> {
        self.core.lock().send_audio(opus)
    }

    /// Close the current connection
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.core.lock().disconnect()
    }

    pub fn state(&self) -> ConnectionState {
        self.core.lock().state
    }

    pub fn has_peer(&self) -> bool {
        self.core.lock().peer.is_some()
    }

    pub fn has_session(&self) -> bool {
        self.core.lock().session.is_some()
    }

    /// Pause or resume the network thread's polling
    pub fn set_polling(&self, polling: bool) {
        self.polling.store(polling, Ordering::SeqCst);
    }

    /// Run one poll iteration on the calling thread
    ///
    /// Protocol errors that do not end the connection, such as an unknown event
    /// name, are returned here.
    pub fn loop_once(&self) -> Result<(), ClientError> {
        self.core.lock().poll()
    }

    /// Stop the network thread, disconnecting first if needed
    pub fn destroy(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return;
        };

        {
            let mut core = self.core.lock();
            if core.state.is_live() {
                if let Err(e) = core.disconnect() {
                    debug!("Disconnect on shutdown: {}", e);
                }
            }
        }

        if handle.join().is_err() {
            warn!("Network thread panicked");
        }
        debug!("Network thread stopped");
    }
}

impl<H: TransportHost, E: EventHandler> Drop for Client<H, E> {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn run<H: TransportHost, E: EventHandler>(
    core: Arc<Mutex<Core<H, E>>>,
    running: Arc<AtomicBool>,
    polling: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        let active = polling.load(Ordering::SeqCst) && {
            let core = core.lock();
            core.peer.is_some() && core.state.is_live()
        };

        if !active {
            thread::sleep(IDLE_POLL);
            continue;
        }

        // Guard released before sleeping
        let result = core.lock().poll();
        if let Err(e) = result {
            warn!("Network error: {}", e);
        }
        thread::sleep(ACTIVE_POLL);
    }
}
