//! Network infrastructure.
//!
//! - **`listener`** – binds factory ports and accepts connections on a
//!   dedicated thread.
//! - **`worker_pool`** – bounded, growable set of threads running handlers.
//! - **`server`** – groups listeners so they start and stop together.

pub mod listener;
pub mod server;
pub mod worker_pool;
