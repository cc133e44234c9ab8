//! Backends for the local namespace.
//!
//! [`LocalBackend`] is the OS boundary; [`DiskBackend`] implements it on
//! top of `std::fs` with `notify` watcher threads.

mod local;
mod watcher;

pub use local::{DiskBackend, LocalBackend, LocalFile};
pub use watcher::{ChangeSink, ExternalChange};

pub(crate) use watcher::EchoFilter;
