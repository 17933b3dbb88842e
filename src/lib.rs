#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod board;
pub mod comments;
pub mod config;
pub mod data;
pub mod gateway;
pub mod logging;
pub mod preferences;
pub mod session;
pub mod storage;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
