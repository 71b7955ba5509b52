//! Connection state machine tests
//!
//! The client runs on the scripted transport from `common`, with background
//! polling paused so each test drives it one `loop_once` at a time.

mod common;

use std::thread;
use std::time::Duration;

use serde_json::json;

use common::{Harness, MockHost, RecordingHandler, TestServer};
use voxlink::network::{
    Client, ClientError, ClientOptions, ConnectionState, CryptoError, ServerAddress,
    TransportEvent, CHALLENGE_SIZE,
};
use voxlink::protocol::{
    AudioFrame, ChannelId, Delivery, Envelope, ProtocolError, ServerEvent, UserInfo,
};
use voxlink::ClientEvent;

/// Test: A new client is idle
/// Given a freshly created client
/// Then it is Disconnected with no peer and no session
#[test]
fn test_initial_state() {
    let h = Harness::new();
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert!(!h.client.has_peer());
    assert!(!h.client.has_session());
}

/// Test: connect opens a peer
/// When connect is called
/// Then the client is Connecting with a peer and no session
#[test]
fn test_connect_opens_peer() {
    let h = Harness::new();
    h.client.connect().expect("connect failed");

    assert_eq!(h.client.state(), ConnectionState::Connecting);
    assert!(h.client.has_peer());
    assert!(!h.client.has_session());
    assert_eq!(h.net.lock().connects, 1);
}

/// Test: Transport failure on connect
/// Given a transport that cannot reach the server
/// Then connect fails and the client stays Disconnected
#[test]
fn test_connect_failure_leaves_client_idle() {
    let h = Harness::new();
    h.net.lock().fail_connect = true;

    assert!(matches!(h.client.connect(), Err(ClientError::Transport(_))));
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert!(!h.client.has_peer());
}

/// Test: Transport accept starts authentication
#[test]
fn test_transport_connect_starts_authentication() {
    let h = Harness::new();
    h.client.connect().unwrap();
    h.push(TransportEvent::Connect);
    h.client.loop_once().unwrap();

    assert_eq!(h.client.state(), ConnectionState::Authenticating);
    assert!(!h.client.has_session());
}

/// Test: Key exchange
/// Given the client is Authenticating
/// When the server sends its public key
/// Then the client answers with the wrapped key followed by its encrypted challenge
#[test]
fn test_public_key_answered_with_key_and_challenge() {
    let mut h = Harness::new();
    let challenge = h.start_handshake();

    assert_eq!(challenge.len(), CHALLENGE_SIZE);
    assert!(h.client.has_session());
    assert_eq!(h.client.state(), ConnectionState::Authenticating);

    let auth = h.net.lock().sent_on(ChannelId::Auth);
    assert!(auth.iter().all(|p| p.delivery == Delivery::Reliable));
    // RSA-1024 ciphertext
    assert_eq!(auth[0].data.len(), 128);
}

/// Test: Each connection uses a new challenge
#[test]
fn test_challenge_is_fresh_per_connection() {
    let mut first = Harness::new();
    let mut second = Harness::new();
    assert_ne!(first.start_handshake(), second.start_handshake());
}

/// Test: Handshake success
/// When the server echoes the challenge
/// Then the client is Connected and reports it
#[test]
fn test_echoed_challenge_connects() {
    let mut h = Harness::new();
    h.connect();

    assert_eq!(h.client.state(), ConnectionState::Connected);
    assert!(h.client.has_session());
    assert!(h.drain_events().is_empty());
}

/// Test: Handshake failure
/// When the server returns a different value
/// Then the client disconnects and reports an ordinary disconnect
#[test]
fn test_wrong_challenge_forces_disconnect() {
    let mut h = Harness::new();
    h.start_handshake();

    let wrong = h.server.encrypt(&[0u8; CHALLENGE_SIZE]);
    h.push_data(ChannelId::Auth, wrong);
    assert!(matches!(
        h.client.loop_once(),
        Err(ClientError::HandshakeFailed)
    ));

    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert!(!h.client.has_peer());
    assert!(!h.client.has_session());
    assert_eq!(h.net.lock().disconnects, 1);
    assert_eq!(h.drain_events(), vec![ClientEvent::Disconnected]);
}

/// Test: Undecryptable challenge echo also fails the handshake
#[test]
fn test_garbage_echo_forces_disconnect() {
    let mut h = Harness::new();
    h.start_handshake();

    h.push_data(ChannelId::Auth, vec![7u8; 60]);
    assert!(matches!(
        h.client.loop_once(),
        Err(ClientError::Crypto(CryptoError::Decrypt))
    ));
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert_eq!(h.drain_events(), vec![ClientEvent::Disconnected]);
}

/// Test: Invalid server key fails the handshake
#[test]
fn test_invalid_public_key_forces_disconnect() {
    let mut h = Harness::new();
    h.client.connect().unwrap();
    h.push(TransportEvent::Connect);
    h.client.loop_once().unwrap();

    h.push_data(ChannelId::Auth, b"not a key".to_vec());
    assert!(matches!(
        h.client.loop_once(),
        Err(ClientError::Crypto(CryptoError::InvalidPublicKey(_)))
    ));
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert_eq!(h.drain_events(), vec![ClientEvent::Disconnected]);
}

/// Test: Sending requires a connection
/// Given the client is not Connected
/// Then send and send_audio fail and nothing reaches the transport
#[test]
fn test_send_requires_connection() {
    let mut h = Harness::new();
    assert!(matches!(
        h.client.send(ChannelId::Control, "message", json!({"text": "hi"})),
        Err(ClientError::NotConnected)
    ));
    assert!(matches!(
        h.client.send_audio(b"opus"),
        Err(ClientError::NotConnected)
    ));

    // Still not connected mid-handshake
    h.start_handshake();
    let sent_before = h.net.lock().sent.len();
    assert!(matches!(
        h.client.send_audio(b"opus"),
        Err(ClientError::NotConnected)
    ));
    assert_eq!(h.net.lock().sent.len(), sent_before);
}

/// Test: Disconnecting twice
/// Given the client is Disconnected
/// Then disconnect fails with already disconnected
#[test]
fn test_disconnect_when_disconnected() {
    let h = Harness::new();
    assert!(matches!(
        h.client.disconnect(),
        Err(ClientError::AlreadyDisconnected)
    ));
}

/// Test: Disconnect tears everything down
#[test]
fn test_disconnect_clears_connection() {
    let mut h = Harness::new();
    h.connect();

    h.client.disconnect().expect("disconnect failed");
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert!(!h.client.has_peer());
    assert!(!h.client.has_session());

    let net = h.net.lock();
    assert_eq!(net.disconnects, 1);
    assert!(net.flushes >= 1);
    drop(net);

    assert_eq!(h.drain_events(), vec![ClientEvent::Disconnected]);
    assert_eq!(h.recorded.lock().resets, 1);
    assert!(matches!(
        h.client.disconnect(),
        Err(ClientError::AlreadyDisconnected)
    ));
}

/// Test: Reconnect while live
/// Given a client in Connecting, Authenticating or Connected
/// When connect is called again
/// Then exactly one disconnect happens before the new attempt
#[test]
fn test_reconnect_disconnects_exactly_once() {
    // Connecting
    let mut h = Harness::new();
    h.client.connect().unwrap();
    h.client.connect().unwrap();
    assert_eq!(h.client.state(), ConnectionState::Connecting);
    assert_eq!(h.net.lock().connects, 2);
    assert_eq!(h.net.lock().disconnects, 1);
    assert_eq!(h.drain_events(), vec![ClientEvent::Disconnected]);

    // Authenticating
    let mut h = Harness::new();
    h.start_handshake();
    h.client.connect().unwrap();
    assert_eq!(h.client.state(), ConnectionState::Connecting);
    assert!(!h.client.has_session());
    assert_eq!(h.net.lock().disconnects, 1);
    assert_eq!(h.drain_events(), vec![ClientEvent::Disconnected]);

    // Connected
    let mut h = Harness::new();
    h.connect();
    h.client.connect().unwrap();
    assert_eq!(h.client.state(), ConnectionState::Connecting);
    assert_eq!(h.net.lock().disconnects, 1);
    assert_eq!(h.drain_events(), vec![ClientEvent::Disconnected]);
}

/// Test: Server-side disconnect
#[test]
fn test_transport_disconnect() {
    let mut h = Harness::new();
    h.connect();

    h.push(TransportEvent::Disconnect);
    h.client.loop_once().unwrap();

    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert!(!h.client.has_peer());
    assert!(!h.client.has_session());
    assert_eq!(h.drain_events(), vec![ClientEvent::Disconnected]);
    assert_eq!(h.recorded.lock().resets, 1);
}

/// Test: Connection timeout
/// Given a client stuck in Connecting
/// When no transport event arrives within the timeout
/// Then it moves to TimedOut, drops the peer and reports a timeout
#[test]
fn test_connecting_times_out() {
    let mut h = Harness::with_timeout(Duration::from_millis(50));
    h.client.connect().unwrap();

    h.client.loop_once().unwrap();
    assert_eq!(h.client.state(), ConnectionState::Connecting);

    thread::sleep(Duration::from_millis(70));
    h.client.loop_once().unwrap();

    assert_eq!(h.client.state(), ConnectionState::TimedOut);
    assert!(!h.client.has_peer());
    assert!(!h.client.has_session());
    assert_eq!(h.drain_events(), vec![ClientEvent::ConnectionTimeout]);

    // A timed out client is not connected
    assert!(matches!(
        h.client.disconnect(),
        Err(ClientError::AlreadyDisconnected)
    ));
}

/// Test: Authentication also times out
#[test]
fn test_authenticating_times_out() {
    let mut h = Harness::with_timeout(Duration::from_millis(50));
    h.start_handshake();

    thread::sleep(Duration::from_millis(70));
    h.client.loop_once().unwrap();

    assert_eq!(h.client.state(), ConnectionState::TimedOut);
    assert_eq!(h.drain_events(), vec![ClientEvent::ConnectionTimeout]);
}

/// Test: Activity keeps the attempt alive
/// Given a client in Connecting
/// When an event arrives before the timeout
/// Then the timeout restarts from that event
#[test]
fn test_event_before_timeout_keeps_connection() {
    let mut h = Harness::with_timeout(Duration::from_millis(150));
    h.client.connect().unwrap();

    thread::sleep(Duration::from_millis(100));
    h.push(TransportEvent::Connect);
    h.client.loop_once().unwrap();

    thread::sleep(Duration::from_millis(100));
    h.client.loop_once().unwrap();

    assert_eq!(h.client.state(), ConnectionState::Authenticating);
    assert!(h.drain_events().is_empty());
}

/// Test: A connected client never times out
#[test]
fn test_connected_does_not_time_out() {
    let mut h = Harness::with_timeout(Duration::from_millis(30));
    h.connect();

    thread::sleep(Duration::from_millis(50));
    h.client.loop_once().unwrap();
    assert_eq!(h.client.state(), ConnectionState::Connected);
}

/// Test: Control events go out encrypted and reliable
#[test]
fn test_send_control_event() {
    let mut h = Harness::new();
    h.connect();

    h.client
        .send(ChannelId::Control, "join", json!({"name": "alice"}))
        .expect("send failed");

    let sent = h.net.lock().sent_on(ChannelId::Control);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].delivery, Delivery::Reliable);

    let envelope = Envelope::decode(&h.server.decrypt(&sent[0].data)).unwrap();
    assert_eq!(envelope.event, "join");
    assert_eq!(envelope.data, json!({"name": "alice"}));
}

/// Test: Null payload is sent as an empty map
#[test]
fn test_send_without_data() {
    let mut h = Harness::new();
    h.connect();

    h.client
        .send(ChannelId::Control, "ping", serde_json::Value::Null)
        .unwrap();
    let sent = h.net.lock().sent_on(ChannelId::Control);
    let envelope = Envelope::decode(&h.server.decrypt(&sent[0].data)).unwrap();
    assert_eq!(envelope.data, json!({}));
}

/// Test: Auth and audio channels are refused for control events
#[test]
fn test_send_on_reserved_channel_refused() {
    let mut h = Harness::new();
    h.connect();
    let auth_sent = h.net.lock().sent_on(ChannelId::Auth).len();

    for channel in [
        ChannelId::Auth,
        ChannelId::AudioUplink,
        ChannelId::AudioDownlink,
    ] {
        assert!(matches!(
            h.client.send(channel, "message", json!({})),
            Err(ClientError::ReservedChannel(c)) if c == channel
        ));
    }
    assert!(h.net.lock().sent_on(ChannelId::AudioUplink).is_empty());
    assert_eq!(h.net.lock().sent_on(ChannelId::Auth).len(), auth_sent);
    assert_eq!(h.client.state(), ConnectionState::Connected);
}

/// Test: Voice frames go out encrypted and unreliable
#[test]
fn test_send_audio() {
    let mut h = Harness::new();
    h.connect();

    h.client.send_audio(b"opus frame").expect("send_audio failed");

    let sent = h.net.lock().sent_on(ChannelId::AudioUplink);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].delivery, Delivery::Unreliable);
    assert_eq!(h.server.decrypt(&sent[0].data), b"opus frame");
}

/// Test: Control events reach the handler
#[test]
fn test_control_event_dispatched() {
    let mut h = Harness::new();
    h.connect();

    let event = ServerEvent::UserJoined(UserInfo {
        id: 3,
        name: "bob".to_string(),
    });
    let data = h.server.encrypt(&event.to_envelope().encode().unwrap());
    h.push_data(ChannelId::Control, data);
    h.client.loop_once().expect("dispatch failed");

    assert_eq!(h.recorded.lock().events, vec![event]);
}

/// Test: Control events are delivered in order
#[test]
fn test_control_events_in_order() {
    let mut h = Harness::new();
    h.connect();

    let events: Vec<ServerEvent> = (0..5)
        .map(|i| ServerEvent::Message {
            from: 1,
            text: format!("message {}", i),
        })
        .collect();
    for event in &events {
        let data = h.server.encrypt(&event.to_envelope().encode().unwrap());
        h.push_data(ChannelId::Control, data);
    }
    for _ in 0..events.len() {
        h.client.loop_once().unwrap();
    }

    assert_eq!(h.recorded.lock().events, events);
}

/// Test: Unknown control event
/// When the server sends an event the client does not know
/// Then the error is returned and the connection stays up
#[test]
fn test_unknown_event_is_error() {
    let mut h = Harness::new();
    h.connect();

    let data = h
        .server
        .encrypt(&Envelope::new("teleport", json!({})).encode().unwrap());
    h.push_data(ChannelId::Control, data);

    match h.client.loop_once() {
        Err(ClientError::Protocol(ProtocolError::UnknownEvent(name))) => {
            assert_eq!(name, "teleport")
        }
        other => panic!("Expected unknown event error, got {:?}", other),
    }
    assert_eq!(h.client.state(), ConnectionState::Connected);
    assert!(h.recorded.lock().events.is_empty());
}

/// Test: Tampered control traffic
/// When a control packet fails to decrypt
/// Then the client disconnects
#[test]
fn test_control_decrypt_failure_disconnects() {
    let mut h = Harness::new();
    h.connect();

    let mut data = h
        .server
        .encrypt(&Envelope::new("message", json!({})).encode().unwrap());
    let last = data.len() - 1;
    data[last] ^= 0xFF;
    h.push_data(ChannelId::Control, data);

    assert!(matches!(
        h.client.loop_once(),
        Err(ClientError::Crypto(CryptoError::Decrypt))
    ));
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert_eq!(h.drain_events(), vec![ClientEvent::Disconnected]);
}

/// Test: Undecodable control payload disconnects
#[test]
fn test_control_decode_failure_disconnects() {
    let mut h = Harness::new();
    h.connect();

    let data = h.server.encrypt(&[0xC1]);
    h.push_data(ChannelId::Control, data);

    assert!(matches!(
        h.client.loop_once(),
        Err(ClientError::Protocol(ProtocolError::Decode(_)))
    ));
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
}

/// Test: Downlink audio is routed with its header
#[test]
fn test_audio_routed_to_handler() {
    let mut h = Harness::new();
    h.connect();

    let frame = AudioFrame::new(7, 42, b"abc".to_vec());
    let data = h.server.encrypt(&frame.to_bytes());
    h.push_data(ChannelId::AudioDownlink, data);
    h.client.loop_once().unwrap();

    assert_eq!(h.recorded.lock().audio, vec![(7, 42, b"abc".to_vec())]);
}

/// Test: Bad audio is dropped
/// When an audio packet fails to decrypt or is too short
/// Then it is dropped and the connection stays up
#[test]
fn test_bad_audio_dropped() {
    let mut h = Harness::new();
    h.connect();

    h.push_data(ChannelId::AudioDownlink, vec![1u8; 40]);
    h.client.loop_once().expect("bad audio should not be an error");

    let short = h.server.encrypt(&[0, 1]);
    h.push_data(ChannelId::AudioDownlink, short);
    h.client.loop_once().expect("short audio should not be an error");

    assert_eq!(h.client.state(), ConnectionState::Connected);
    assert!(h.recorded.lock().audio.is_empty());
    assert!(h.drain_events().is_empty());
}

/// Test: Unknown channel number
#[test]
fn test_unknown_channel_is_error() {
    let mut h = Harness::new();
    h.connect();

    h.push(TransportEvent::Receive {
        channel: 9,
        data: vec![1, 2, 3],
    });
    assert!(matches!(
        h.client.loop_once(),
        Err(ClientError::Protocol(ProtocolError::UnknownChannel(9)))
    ));
    assert_eq!(h.client.state(), ConnectionState::Connected);
}

/// Test: destroy disconnects and is idempotent
#[test]
fn test_destroy() {
    let mut h = Harness::new();
    h.connect();

    h.client.destroy();
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert_eq!(h.net.lock().disconnects, 1);
    assert_eq!(h.drain_events(), vec![ClientEvent::Disconnected]);

    h.client.destroy();
    assert_eq!(h.net.lock().disconnects, 1);
}

/// Test: The network thread drives the handshake
/// Given polling enabled
/// When the server completes the key exchange
/// Then Connected is delivered on the event channel
#[tokio::test]
async fn test_background_thread_connects() {
    let host = MockHost::default();
    let net = host.0.clone();
    let options = ClientOptions::new(ServerAddress::new("127.0.0.1", 4000));
    let (mut client, mut events) = Client::new(host, options, RecordingHandler::default())
        .expect("Failed to create client");
    let mut server = TestServer::new();

    client.connect().unwrap();
    {
        let mut net = net.lock();
        net.incoming.push_back(TransportEvent::Connect);
        net.incoming.push_back(TransportEvent::Receive {
            channel: ChannelId::Auth.as_u8(),
            data: server.public_key().to_vec(),
        });
    }

    let auth = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let auth = net.lock().sent_on(ChannelId::Auth);
            if auth.len() == 2 {
                return auth;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Client never answered the public key");

    let challenge = server.accept(&auth[0].data, &auth[1].data);
    net.lock().incoming.push_back(TransportEvent::Receive {
        channel: ChannelId::Auth.as_u8(),
        data: server.encrypt(&challenge),
    });

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("No client event");
    assert_eq!(event, Some(ClientEvent::Connected));
    assert_eq!(client.state(), ConnectionState::Connected);

    client.destroy();
    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("No client event");
    assert_eq!(event, Some(ClientEvent::Disconnected));
}
