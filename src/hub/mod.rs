//! Per-session change notifications over the push channel.

mod error;
mod message;
mod notification;
mod transport;

pub use error::HubError;
pub use message::{ClientMessage, ServerMessage};
pub use notification::{NotificationHub, SubscribeOutcome};
pub use transport::{ChannelTransport, Transport};
