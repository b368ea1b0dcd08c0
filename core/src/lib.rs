//! Core library for cap-grpc: compiles proto descriptors, builds a dynamic
//! dispatch table over them, and serves configurable mock (or proxied) gRPC
//! responses driven by a YAML configuration file.
//!
//! See `server.rs` for the top-level entry point ([`MockGrpcServer`]).

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod logs;
pub mod mock;
pub mod pipeline;
pub mod proto;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod template;

pub use config::Config;
pub use error::{MockServerError, Result};
pub use server::MockGrpcServer;
