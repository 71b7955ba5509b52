//! Shared fixtures for integration tests
//!
//! A scripted in-memory transport, a recording event handler and a minimal
//! server side of the key exchange.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Oaep, RsaPrivateKey};
use sha1::Sha1;

use voxlink::handler::EventHandler;
use voxlink::network::{
    Client, ClientEvents, ClientOptions, NetworkError, ServerAddress, Session, TransportEvent,
    TransportHost, TransportPeer, KEY_SIZE,
};
use voxlink::protocol::{ChannelId, Delivery, ProtocolError, ServerEvent};

/// A packet the client handed to the transport
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub channel: u8,
    pub data: Vec<u8>,
    pub delivery: Delivery,
}

/// Everything the mock transport saw, plus events queued for the client
#[derive(Default)]
pub struct MockNet {
    pub incoming: VecDeque<TransportEvent>,
    pub sent: Vec<SentPacket>,
    pub connects: usize,
    pub disconnects: usize,
    pub flushes: usize,
    pub fail_connect: bool,
}

impl MockNet {
    pub fn sent_on(&self, channel: ChannelId) -> Vec<SentPacket> {
        self.sent
            .iter()
            .filter(|p| p.channel == channel.as_u8())
            .cloned()
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct MockHost(pub Arc<Mutex<MockNet>>);

pub struct MockPeer(Arc<Mutex<MockNet>>);

impl TransportHost for MockHost {
    type Peer = MockPeer;

    fn connect(
        &mut self,
        address: &ServerAddress,
        _channel_count: usize,
    ) -> Result<MockPeer, NetworkError> {
        let mut net = self.0.lock();
        if net.fail_connect {
            return Err(NetworkError::Resolve(address.to_string()));
        }
        net.connects += 1;
        Ok(MockPeer(self.0.clone()))
    }

    fn service(&mut self) -> Result<Option<TransportEvent>, NetworkError> {
        Ok(self.0.lock().incoming.pop_front())
    }

    fn flush(&mut self) {
        self.0.lock().flushes += 1;
    }
}

impl TransportPeer for MockPeer {
    fn send(&mut self, channel: u8, data: &[u8], delivery: Delivery) -> Result<(), NetworkError> {
        self.0.lock().sent.push(SentPacket {
            channel,
            data: data.to_vec(),
            delivery,
        });
        Ok(())
    }

    fn disconnect_now(&mut self) {
        self.0.lock().disconnects += 1;
    }
}

/// What the client delivered to its handler
#[derive(Default)]
pub struct Recorded {
    pub events: Vec<ServerEvent>,
    pub audio: Vec<(u16, u16, Vec<u8>)>,
    pub resets: usize,
}

#[derive(Clone, Default)]
pub struct RecordingHandler(pub Arc<Mutex<Recorded>>);

impl EventHandler for RecordingHandler {
    fn handle_event(&mut self, event: ServerEvent) -> Result<(), ProtocolError> {
        self.0.lock().events.push(event);
        Ok(())
    }

    fn audio(&mut self, user_id: u16, sequence: u16, opus: &[u8]) {
        self.0.lock().audio.push((user_id, sequence, opus.to_vec()));
    }

    fn reset(&mut self) {
        self.0.lock().resets += 1;
    }
}

/// Server side of the key exchange
pub struct TestServer {
    private_key: RsaPrivateKey,
    public_der: Vec<u8>,
    session: Option<Session>,
}

fn server_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("Failed to generate RSA key")
    })
}

impl TestServer {
    pub fn new() -> Self {
        let private_key = server_key().clone();
        let public_der = private_key
            .to_public_key()
            .to_public_key_der()
            .expect("Failed to encode public key")
            .as_bytes()
            .to_vec();
        Self {
            private_key,
            public_der,
            session: None,
        }
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_der
    }

    /// Unwrap the session key the client sent and return the decrypted challenge
    pub fn accept(&mut self, wrapped_key: &[u8], encrypted_challenge: &[u8]) -> Vec<u8> {
        let key = self
            .private_key
            .decrypt(Oaep::new::<Sha1>(), wrapped_key)
            .expect("Failed to unwrap session key");
        let key: [u8; KEY_SIZE] = key.try_into().expect("Session key has the wrong size");

        let session = Session::from_key(key, &self.public_der).expect("Failed to build session");
        let challenge = session
            .decrypt(encrypted_challenge)
            .expect("Failed to decrypt challenge");
        self.session = Some(session);
        challenge
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        self.session
            .as_ref()
            .expect("Handshake not accepted")
            .encrypt(plaintext)
            .expect("Encryption failed")
    }

    pub fn decrypt(&self, data: &[u8]) -> Vec<u8> {
        self.session
            .as_ref()
            .expect("Handshake not accepted")
            .decrypt(data)
            .expect("Decryption failed")
    }
}

pub type TestClient = Client<MockHost, RecordingHandler>;

pub struct Harness {
    pub client: TestClient,
    pub events: ClientEvents,
    pub net: Arc<Mutex<MockNet>>,
    pub recorded: Arc<Mutex<Recorded>>,
    pub server: TestServer,
}

impl Harness {
    /// A client whose background polling is paused, driven with `loop_once`
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_millis(5000))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let host = MockHost::default();
        let net = host.0.clone();
        let handler = RecordingHandler::default();
        let recorded = handler.0.clone();

        let options = ClientOptions {
            address: ServerAddress::new("127.0.0.1", 4000),
            timeout,
        };
        let (client, events) = Client::new(host, options, handler).expect("Failed to create client");
        client.set_polling(false);

        Self {
            client,
            events,
            net,
            recorded,
            server: TestServer::new(),
        }
    }

    pub fn push(&self, event: TransportEvent) {
        self.net.lock().incoming.push_back(event);
    }

    pub fn push_data(&self, channel: ChannelId, data: Vec<u8>) {
        self.push(TransportEvent::Receive {
            channel: channel.as_u8(),
            data,
        });
    }

    /// Drive the client from Disconnected to Authenticating with the key sent
    ///
    /// Returns the challenge the client generated.
    pub fn start_handshake(&mut self) -> Vec<u8> {
        self.client.connect().expect("connect failed");
        self.push(TransportEvent::Connect);
        self.client.loop_once().expect("loop failed");

        let public_key = self.server.public_key().to_vec();
        self.push_data(ChannelId::Auth, public_key);
        self.client.loop_once().expect("loop failed");

        let auth = self.net.lock().sent_on(ChannelId::Auth);
        assert_eq!(auth.len(), 2, "expected wrapped key and challenge");
        self.server.accept(&auth[0].data, &auth[1].data)
    }

    /// Complete the handshake and drain the Connected notification
    pub fn connect(&mut self) {
        let challenge = self.start_handshake();
        let echo = self.server.encrypt(&challenge);
        self.push_data(ChannelId::Auth, echo);
        self.client.loop_once().expect("loop failed");
        assert_eq!(self.events.try_recv().ok(), Some(voxlink::ClientEvent::Connected));
    }

    /// Notifications received so far
    pub fn drain_events(&mut self) -> Vec<voxlink::ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
