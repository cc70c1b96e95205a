pub mod sse;
pub mod websocket;

pub use sse::subscribe as sse_subscribe;
pub use websocket::ws_handler;
