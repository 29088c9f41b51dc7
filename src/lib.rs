#[cfg(feature = "python")]
pub mod bindings;
pub mod config;
pub mod error;
pub mod local;
pub mod monitor;
pub mod output;
pub mod processing;
pub mod utils;
