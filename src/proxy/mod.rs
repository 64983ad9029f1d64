pub mod cors;
pub mod forwarder;
pub mod websocket;

pub use cors::{CorsDecision, CorsFilter};
pub use forwarder::HttpForwarder;
pub use websocket::{is_websocket_request, WebSocketRelay};
