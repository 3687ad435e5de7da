//! Distributed Line Search Cluster Library
//!
//! A coordinator and a set of worker processes that together answer one
//! question: does any line of the corpus equal this query exactly? The corpus
//! is split into chunk files spread over the workers' disks; the coordinator
//! decides which worker keeps which chunk in memory and fans every query out
//! to all of them.
//!
//! ## Architecture Modules
//! - **`cluster`**: The coordinator. Worker sessions with heartbeat failure
//!   detection, the registry owning all cluster state, chunk placement, search
//!   fan-out and the HTTP/TCP client surfaces.
//! - **`worker`**: The worker process. Loads and unloads chunks on command and
//!   scans resident chunks, honouring aborts.
//! - **`wire`**: The line-oriented text protocol both sides speak.
//! - **`config`**: Command-line configuration for both binaries.

pub mod cluster;
pub mod config;
pub mod wire;
pub mod worker;
