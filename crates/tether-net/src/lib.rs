//! # tether-net
//!
//! Connection plumbing for tether: blocking endpoints with timeouts, a
//! readiness multiplexer that lets few threads serve many sockets, a table of
//! postponed sessions that survive reconnects, and WebSocket sessions on top.
//!
//! # Architecture overview
//!
//! ```text
//!   WebSocketSession ── frames ──▶ Endpoint ── bytes ──▶ TcpStream
//!                                     │   ▲                 (or SecureTransport)
//!                         multiplexed │   │ completions
//!                                     ▼   │
//!                                   SelectIo threads (mio)
//! ```
//!
//! - **`endpoint`** – [`Endpoint`]: reads/writes with timeouts, close,
//!   postpone/resume, use marking.
//! - **`select`** – [`SelectIo`]: multiplexer threads performing reads for
//!   registered endpoints, or running watch callbacks.
//! - **`sessions`** – [`SessionTable`]: postponed endpoints by session id.
//! - **`websocket`** – [`WebSocketSession`], server upgrade, client connector.
//! - **`cancel`**, **`logger`**, **`secure`** – small collaborators shared by
//!   the server and client crates.

pub mod cancel;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod logger;
pub mod secure;
pub mod select;
pub mod sessions;
pub mod websocket;

pub use cancel::CancelToken;
pub use context::NetContext;
pub use endpoint::{DetachedSocket, Endpoint, EndpointConfig, EndpointState};
pub use error::NetError;
pub use logger::{ConnectionLogger, TracingLogger};
pub use secure::{Role, SecureTransport, SecureUpgrade};
pub use select::{SelectConfig, SelectHandle, SelectIo, WatchCallback};
pub use sessions::SessionTable;
pub use websocket::{
    accept_websocket, FrameOutcome, Message, SessionConfig, SessionEvent, SessionState,
    WebSocketConnector, WebSocketSession,
};
