// ABOUTME: Wire protocol layer
// ABOUTME: Message codec and the TCP client connection

pub mod client;
pub mod messages;

pub use client::{ClientConnection, MessageReceiver};
pub use messages::{
    BaseMessage, CodecHeader, Hello, MessageType, ServerSettings, StreamTags, Time, Tv,
    TypedMessage, WireChunk,
};
