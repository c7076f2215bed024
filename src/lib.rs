//! # Completion Proxy Library
//!
//! 计费补全 API 前的准入控制与响应缓存代理核心库

pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod server;
pub mod statistics;
pub mod utils;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{ProxyError, Result};
