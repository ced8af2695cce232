//! RPC server
//!
//! This module exposes the orchestration controller over TCP. Requests and
//! responses are JSON objects, one per line.

mod protocol;
mod server;

pub use protocol::{ErrorBody, Outcome, Request, Response, RpcHandler};
pub use server::{parse_bind_address, RpcServer, ServerConfig, DEFAULT_BIND_ADDRESS};
