//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, metrics, and timing.
//!
//! This module provides reusable utilities used throughout the protocol implementation.
//!
//! ## Components
//! - **Crypto**: XChaCha20-Poly1305 AEAD encryption under the session key
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Async timeout wrappers
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Memory zeroing for sensitive data (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
