//! Network Module
//!
//! TCP server and client handling.
//!
//! ## Architecture
//! - Single acceptor thread, polling a shutdown flag
//! - One thread per connection, capped by `max_connections`
//! - Requests routed through the store and cluster APIs

mod connection;
mod server;

pub use connection::Connection;
pub use server::Server;
