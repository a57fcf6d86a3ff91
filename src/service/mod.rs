//! # Service Layer
//!
//! Client and server façades over the protocol layer.
//!
//! ## Components
//! - **Client**: connect (directly or by name), log in, issue requests
//! - **Server**: accept loop, per-connection handshake, read loop feeding the pool
//! - **Pool**: bounded backlog drained by a fixed set of workers
//! - **Worker**: login gating and prefix routing for one work item
//! - **Login**: pluggable login/registration policy
//!
//! ## Backpressure
//! Inbound messages never block a connection's read loop: when the backlog
//! is full the message is dropped and logged.

pub mod client;
pub mod login;
pub mod peer;
pub mod pool;
pub mod server;
pub mod worker;

pub use client::Client;
pub use login::{LoginOutcome, LoginPolicy, StaticLogin};
pub use peer::Peer;
pub use pool::{DispatchPool, PoolStats, WorkHandler, WorkItem};
pub use server::Server;
pub use worker::Router;
