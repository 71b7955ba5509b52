//! Wire protocol definitions
//!
//! Channel layout, the downlink audio header and the control event envelope.

mod channel;
mod error;
mod event;
mod packet;

pub use channel::{ChannelId, Delivery, CHANNEL_COUNT};
pub use error::ProtocolError;
pub use event::{Envelope, ServerEvent, UserInfo};
pub use packet::{AudioFrame, AUDIO_HEADER_SIZE};
