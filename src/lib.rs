pub mod app;
pub mod calendar;
pub mod cli;
pub mod config;
pub mod identity;
pub mod remote;
pub mod storage;
pub mod store;

pub use calendar::DayKey;
pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use store::{BackendMode, MessageStore, StoreError};
