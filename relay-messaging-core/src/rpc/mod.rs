//! Request/reply over the broker.
//!
//! The client publishes a request carrying `reply_to` (its private,
//! broker-named queue) and a fresh `correlation_id`; the server answers on
//! `reply_to` with the same `correlation_id`.

mod client;
mod server;

pub use client::RpcClient;
pub use server::{RpcServer, RpcServerBuilder};
