//! Infrastructure layer: sockets, threads and files.
//!
//! - **`network`** – the connection listener, the worker pool running
//!   handlers and the [`network::server::Server`] aggregate.
//! - **`storage`** – TOML configuration for the `tether-server` binary.

pub mod network;
pub mod storage;
