pub mod adb;
pub mod config;

pub use adb::{AdbEngine, AdbError, AdbResult};
pub use config::AdbConfig;
