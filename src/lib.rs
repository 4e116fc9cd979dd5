//! relaygate - streaming inference gateway
//!
//! Forwards content-generation calls to an upstream backend and re-emits a
//! single SSE protocol to clients, with heartbeats for backends that cannot
//! stream and exactly one usage record per request.

pub mod config;
pub mod credentials;
pub mod error;
pub mod proxy;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};
