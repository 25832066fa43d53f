mod channel;
pub mod protocol;

pub use channel::{ChannelEvent, ConnectionState, OffloadChannel};
