pub mod http;
pub mod http_streams;
pub mod sse;
pub mod stdio;

pub use http::{HttpTransport, RoutingScheme};
pub use http_streams::{HttpStreamsTransport, StreamsRouting, SESSION_HEADER};
pub use sse::{SseRouting, SseTransport};
pub use stdio::LineStreamTransport;
