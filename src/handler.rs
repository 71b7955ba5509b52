//! Dispatch of decoded server traffic
//!
//! [`crate::network::Client`] hands every control event and every downlink audio
//! frame to an [`EventHandler`]. [`RoomHandler`] is the stock implementation: it
//! keeps one [`RemoteUser`] per participant and forwards room activity to the
//! application over a channel.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::audio::{AudioError, RemoteUser};
use crate::protocol::{ProtocolError, ServerEvent, UserInfo};

/// Receives what the server sends once the session is established
///
/// Called on the network thread with the client lock held, so implementations must
/// not call back into the client.
pub trait EventHandler: Send + 'static {
    /// Handle one control event
    fn handle_event(&mut self, event: ServerEvent) -> Result<(), ProtocolError>;

    /// Handle one downlink audio frame
    fn audio(&mut self, user_id: u16, sequence: u16, opus: &[u8]);

    /// The connection dropped; forget all per-connection state
    fn reset(&mut self) {}
}

/// Room activity reported to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomMessage {
    Joined(UserInfo),
    Left { id: u16, name: Option<String> },
    Chat { from: u16, name: Option<String>, text: String },
}

/// Opens the playback pipeline for a participant
pub type UserFactory = Box<dyn FnMut(u16, &str) -> Result<RemoteUser, AudioError> + Send>;

/// Tracks participants and plays their audio
pub struct RoomHandler {
    users: HashMap<u16, RemoteUser>,
    factory: UserFactory,
    messages: mpsc::UnboundedSender<RoomMessage>,
}

impl RoomHandler {
    /// Create a handler and the receiver for its [`RoomMessage`]s
    pub fn new(factory: UserFactory) -> (Self, mpsc::UnboundedReceiver<RoomMessage>) {
        let (messages, rx) = mpsc::unbounded_channel();
        let handler = Self {
            users: HashMap::new(),
            factory,
            messages,
        };
        (handler, rx)
    }

    /// Number of participants with an open playback pipeline
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn has_user(&self, id: u16) -> bool {
        self.users.contains_key(&id)
    }

    fn display_name(&self, id: u16) -> Option<String> {
        self.users.get(&id).map(|user| user.display_name().to_string())
    }

    fn notify(&self, message: RoomMessage) {
        if self.messages.send(message).is_err() {
            trace!("Room message receiver dropped");
        }
    }

    fn add_user(&mut self, info: &UserInfo) {
        // Replaced entries are destroyed on drop
        self.users.remove(&info.id);

        match (self.factory)(info.id, &info.name) {
            Ok(user) => {
                self.users.insert(info.id, user);
            }
            Err(e) => warn!("Could not open playback for {} ({}): {}", info.name, info.id, e),
        }
    }

    fn remove_user(&mut self, id: u16) -> Option<String> {
        let mut user = self.users.remove(&id)?;
        user.destroy();
        Some(user.display_name().to_string())
    }
}

impl EventHandler for RoomHandler {
    fn handle_event(&mut self, event: ServerEvent) -> Result<(), ProtocolError> {
        match event {
            ServerEvent::UserJoined(info) => {
                info!("{} joined (id {})", info.name, info.id);
                self.add_user(&info);
                self.notify(RoomMessage::Joined(info));
            }
            ServerEvent::UserLeft { id } => {
                let name = self.remove_user(id);
                if name.is_none() {
                    debug!("Unknown user {} left", id);
                }
                info!("User {} left", id);
                self.notify(RoomMessage::Left { id, name });
            }
            ServerEvent::UserList(users) => {
                self.reset();
                info!("Room has {} participants", users.len());
                for info in users {
                    self.add_user(&info);
                    self.notify(RoomMessage::Joined(info));
                }
            }
            ServerEvent::Message { from, text } => {
                let name = self.display_name(from);
                self.notify(RoomMessage::Chat { from, name, text });
            }
        }
        Ok(())
    }

    fn audio(&mut self, user_id: u16, sequence: u16, opus: &[u8]) {
        match self.users.get(&user_id) {
            Some(user) => user.put_packet(opus),
            None => trace!("Audio {} for unknown user {}", sequence, user_id),
        }
    }

    fn reset(&mut self) {
        if !self.users.is_empty() {
            debug!("Closing playback for {} users", self.users.len());
        }
        for (_, mut user) in self.users.drain() {
            user.destroy();
        }
    }
}

impl Drop for RoomHandler {
    fn drop(&mut self) {
        self.reset();
    }
}
