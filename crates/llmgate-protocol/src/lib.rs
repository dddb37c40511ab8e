pub mod chat;
pub mod sse;

pub use chat::{
    CanonicalChunk, CanonicalRequest, CanonicalResponse, Choice, Message, Role, Usage,
};
pub use sse::{SseEvent, SseParser};
