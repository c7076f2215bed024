//! # 通用工具模块

pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};
