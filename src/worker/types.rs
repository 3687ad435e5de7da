/// Whether the worker is currently scanning for at least one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Free,
    Busy,
}

/// Why the command loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The coordinator sent EXT.
    Exit,
    /// The coordinator closed the connection or the read side failed.
    Disconnected,
}

/// Result of scanning the resident dataset for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Found { chunk: String, line: usize },
    NotFound,
    /// An abort arrived while the scan was running; nothing is reported.
    Aborted,
}
