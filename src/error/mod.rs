//! The unified error handling system for the application.
//!
//! Stores, configuration and startup paths return [`ProxyError`]; the
//! upstream client reports [`NetworkError`]. The request orchestrator never
//! surfaces either directly: it folds every failure into a closed
//! `ProxyOutcome`, which is the only place HTTP statuses and error codes live.

// 1. Core Types
pub use network::NetworkError;
pub use types::ProxyError;

/// A unified `Result` type for the entire application.
///
/// All functions that can fail should return this type.
pub type Result<T> = std::result::Result<T, ProxyError>;

// 2. Module declarations
pub mod macros;
pub mod network;
pub mod types;
