//! quoterelay library
//!
//! Relay between document uploads and an asynchronous analysis workflow:
//! an ingress side that forwards file batches to an external processor,
//! an egress side that receives the processor's callback, an in-memory
//! result store, and the polling endpoints that tie them together.

pub mod cli;
pub mod client;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod receiver;
pub mod relay;
pub mod server;
pub mod store;
