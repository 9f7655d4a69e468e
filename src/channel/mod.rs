pub mod client;
pub mod message;

pub use client::{ChannelEvent, PushChannel, PushChannelConfig};
pub use message::{ChannelStatus, ProgressMessage};
