//! WebSocket layer: session state machine, server upgrade, client connector.

pub mod connector;
pub mod session;
pub mod upgrade;

pub use connector::WebSocketConnector;
pub use session::{FrameOutcome, Message, SessionConfig, SessionEvent, SessionState, WebSocketSession};
pub use upgrade::{accept_websocket, complete_handshake, read_handshake_request, reject_handshake};
