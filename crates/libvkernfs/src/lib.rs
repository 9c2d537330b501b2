//! Emulation engine for vkernfs.
//!
//! This crate contains everything the daemon needs to present a per-container
//! view of selected `/proc` and `/sys` files: the IO abstraction, the
//! namespace-enter executor, the mountinfo parser and classifier, the
//! container state store, the resource handler registry and the FUSE server
//! pool. The `vkernfsd` binary only adds the CLI, logging wiring and the
//! helper re-exec entry point.
pub mod error;
pub mod fusefs;
pub mod handlers;
pub mod ipc;
pub mod mount;
pub mod nsenter;
pub mod process;
pub mod state;
pub mod sysio;

pub use error::VkernError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, VkernError>;
