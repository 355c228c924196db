//! Core service discovery contract
//!
//! This library provides:
//! - The `Registry` and `Watcher` traits implemented by every backend
//! - Service and endpoint descriptions exchanged with callers
//! - A close-once watch channel shared by backends
//! - An in-memory registry backend

pub mod error;
pub mod memory;
pub mod options;
pub mod registry;
pub mod service;
pub mod watch;

pub use error::{RegistryError, Result};
pub use memory::MemoryRegistry;
pub use options::{Options, RegisterOptions, WatchOptions, DEFAULT_TIMEOUT};
pub use registry::Registry;
pub use service::{Endpoint, Service};
pub use watch::{Action, ChannelWatcher, WatchResult, WatchSender, WatchState, Watcher};
