//! Worker Agent Module
//!
//! Runs inside every worker process. A worker owns a directory of chunk files on
//! local disk, keeps a subset of them resident in memory as directed by the
//! coordinator, and answers line searches against that resident subset.
//!
//! ## Lifecycle
//! 1. **Enumerate**: list chunk candidates in `<data-dir>/node_<id>`.
//! 2. **Handshake**: send the id, read `OKY`/`DUP`, send the `--`-joined chunk list.
//! 3. **Command loop**: react to HBT, SRH, LOD, ULD, ABT and EXT until the
//!    coordinator disconnects or orders an exit.
//!
//! ## Submodules
//! - **`dataset`**: chunk enumeration, loading from disk, the resident dataset and the scan.
//! - **`agent`**: connection handling and command dispatch.
//! - **`types`**: status and shutdown values.

pub mod agent;
pub mod dataset;
pub mod types;

pub use agent::WorkerAgent;
pub use types::{Shutdown, WorkerStatus};
