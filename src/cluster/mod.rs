//! Cluster Coordination Module
//!
//! The coordinator side of the search cluster. Worker processes connect over
//! TCP, announce the chunk files they hold on disk and are told which chunks to
//! keep resident in memory. Search clients (TCP or HTTP) submit a query that is
//! fanned out to every worker; the first FOUND wins.
//!
//! ## Concurrency model
//! All cluster state (connected workers, pending searches) lives inside one
//! `Registry` task. Sessions, heartbeat timers and HTTP handlers never touch
//! that state; they talk to the registry through a `ClusterHandle`, which
//! only sends `RegistryEvent`s and awaits replies.
//!
//! ## Submodules
//! - **`registry`**: the single-writer event loop and its handle.
//! - **`search`**: fan-out, fan-in, early abort and request expiry.
//! - **`placement`**: which chunks each worker must load or unload on join and on loss.
//! - **`session`**: per-connection tasks (handshake, reader, writer, heartbeat) and the TCP client path.
//! - **`handlers`** / **`protocol`**: the HTTP surface and its DTOs.
//! - **`types`**: identifiers, handles and registry events.

pub mod handlers;
pub mod placement;
pub mod protocol;
pub mod registry;
pub mod search;
pub mod session;
pub mod types;

pub use registry::{ClusterHandle, Registry};
pub use types::{SearchOutcome, WorkerId};

#[cfg(test)]
mod tests;
