//! Reactive configuration generator for Docker hosts.
//!
//! The [`registry::Registry`] mirrors the daemon's running containers into a
//! snapshot store and announces changes; the [`generator::Generator`]
//! re-renders templates against that snapshot, writes the files whose
//! content changed, and restarts the services depending on them.

pub mod cli;
pub mod config;
pub mod error;
pub mod generator;
pub mod mapping;
pub mod registry;
pub mod runtime;
pub mod serializer;
pub mod store;
pub mod template;
#[cfg(test)]
mod testing;
pub mod types;
pub mod watcher;
