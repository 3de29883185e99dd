//! Application layer: connection handlers.
//!
//! - **`handler`** – the [`handler::ConnectionHandler`] and
//!   [`handler::HandlerFactory`] abstractions the listener and worker pool
//!   are written against.
//! - **`echo`** – the WebSocket echo handler served by the `tether-server`
//!   binary, including keep-alive pings and session resumption.

pub mod echo;
pub mod handler;
